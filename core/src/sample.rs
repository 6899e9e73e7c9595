//! Continuous ADC capture into a circular DMA buffer.
//!
//! The converter runs free and raises a data-ready request for every conversion. The DMA
//! channel moves each result into [`SampleBuffer`] and fires its transfer-complete
//! interrupt once all slots are written. [`SamplePipeline::on_transfer_complete`] is that
//! interrupt handler: it acknowledges the interrupt, publishes the newest conversion into
//! the [`LatestSampleSlot`] and re-arms the same transfer so capture never stalls.
//!
//! Application code only ever sees the slot, through a [`SampleReader`].

use core::fmt;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

pub const SAMPLE_BUFFER_LEN: usize = 32;

/// Largest value a 12-bit conversion can produce.
pub const MAX_RAW: u16 = 4095;

/// One conversion result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RawSample(pub u16);

impl fmt::Display for RawSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Destination memory of the DMA transfer.
///
/// Each slot is an atomic so that the hardware (or its emulation) can write while the CPU
/// reads without a data race; `AtomicU16` has the same layout as `u16`.
#[derive(Debug)]
pub struct SampleBuffer([AtomicU16; SAMPLE_BUFFER_LEN]);

impl SampleBuffer {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU16 = AtomicU16::new(0);
        Self([ZERO; SAMPLE_BUFFER_LEN])
    }

    pub const fn len(&self) -> usize {
        SAMPLE_BUFFER_LEN
    }

    /// Start address to program into a DMA memory address register.
    pub fn as_mut_ptr(&self) -> *mut u16 {
        self.0.as_ptr().cast::<u16>().cast_mut()
    }

    /// Store one conversion. Used by software emulations of the transfer engine.
    pub fn write(&self, index: usize, value: u16) {
        self.0[index].store(value, Ordering::Relaxed);
    }

    pub fn read(&self, index: usize) -> RawSample {
        RawSample(self.0[index].load(Ordering::Relaxed))
    }

    fn newest(&self) -> u16 {
        self.0[SAMPLE_BUFFER_LEN - 1].load(Ordering::Relaxed)
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Most recent conversion of the last completed refill.
///
/// A single word-sized atomic: the interrupt stores, the application loads, and neither
/// side can observe half of an update.
#[derive(Debug)]
pub struct LatestSampleSlot(AtomicU32);

impl LatestSampleSlot {
    const EMPTY: u32 = u32::MAX;

    pub const fn new() -> Self {
        Self(AtomicU32::new(Self::EMPTY))
    }

    fn publish(&self, value: u16) {
        self.0.store(u32::from(value), Ordering::Release);
    }

    /// `None` until the buffer has been filled completely once.
    pub fn latest(&self) -> Option<RawSample> {
        u16::try_from(self.0.load(Ordering::Acquire))
            .ok()
            .map(RawSample)
    }
}

impl Default for LatestSampleSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Application-side handle on the pipeline output.
#[derive(Clone, Copy)]
pub struct SampleReader {
    slot: &'static LatestSampleSlot,
}

impl SampleReader {
    pub const fn new(slot: &'static LatestSampleSlot) -> Self {
        Self { slot }
    }

    pub fn latest_sample(&self) -> Option<RawSample> {
        self.slot.latest()
    }
}

/// The DMA channel that moves conversions from the converter into memory.
pub trait DmaChannel {
    type Error: fmt::Debug;

    /// Start a transfer of `buffer.len()` conversions into `buffer`, paced by the
    /// converter's data-ready request, raising the transfer-complete interrupt at the end.
    fn arm(&mut self, buffer: &'static SampleBuffer) -> Result<(), Self::Error>;

    /// Acknowledge the transfer-complete interrupt.
    fn clear_interrupt(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    /// The DMA channel refused the initial transfer, the hardware is misconfigured.
    Arm,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Arm => write!(f, "failed to arm the ADC DMA transfer"),
        }
    }
}

impl core::error::Error for PipelineError {}

pub struct SamplePipeline<D> {
    dma: D,
    buffer: &'static SampleBuffer,
    slot: &'static LatestSampleSlot,
    refills: u32,
    rearm_failures: u32,
}

impl<D: DmaChannel> SamplePipeline<D> {
    /// Arm the first transfer. Conversions start flowing as soon as this returns.
    pub fn start(
        mut dma: D,
        buffer: &'static SampleBuffer,
        slot: &'static LatestSampleSlot,
    ) -> Result<Self, PipelineError> {
        dma.arm(buffer).map_err(|e| {
            log::error!("Could not arm the ADC DMA transfer: {e:?}");
            PipelineError::Arm
        })?;

        Ok(Self {
            dma,
            buffer,
            slot,
            refills: 0,
            rearm_failures: 0,
        })
    }

    pub fn reader(&self) -> SampleReader {
        SampleReader::new(self.slot)
    }

    /// Transfer-complete interrupt handler.
    ///
    /// Runs in interrupt context: no blocking, no allocation, no logging.
    pub fn on_transfer_complete(&mut self) {
        // Acknowledge first, otherwise the handler fires again on return
        self.dma.clear_interrupt();

        self.slot.publish(self.buffer.newest());

        if self.dma.arm(self.buffer).is_err() {
            self.rearm_failures = self.rearm_failures.wrapping_add(1);
        }
        self.refills = self.refills.wrapping_add(1);
    }

    pub fn refills(&self) -> u32 {
        self.refills
    }

    /// Number of times re-arming failed inside the interrupt. Non-zero means capture
    /// has stalled.
    pub fn rearm_failures(&self) -> u32 {
        self.rearm_failures
    }

    pub fn dma(&self) -> &D {
        &self.dma
    }

    pub fn dma_mut(&mut self) -> &mut D {
        &mut self.dma
    }
}
