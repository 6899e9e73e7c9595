//! Software stand-in for the analog front end: a converter paced by a timer and a DMA
//! engine that writes every conversion into the sample buffer.
//!
//! The emulation runs on its own thread, which plays the role of the interrupt context:
//! it calls the transfer-complete handler after every full buffer, just as the hardware
//! would.

use std::{
    io,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tablelink_core::sample::{DmaChannel, SampleBuffer, SamplePipeline, MAX_RAW};

/// The voltage on the analog pin, as the converter would read it.
#[derive(Debug, Clone, Default)]
pub struct AnalogInput(Arc<AtomicU16>);

impl AnalogInput {
    pub fn new(level: u16) -> Self {
        let input = Self::default();
        input.set(level);
        input
    }

    /// Levels above the converter range are clipped.
    pub fn set(&self, level: u16) {
        self.0.store(level.min(MAX_RAW), Ordering::Relaxed);
    }

    pub fn convert(&self) -> u16 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferActive;

#[derive(Debug, Default)]
pub struct EmulatedDma {
    transfer: Option<&'static SampleBuffer>,
    irq_pending: bool,
}

impl EmulatedDma {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    /// Fill the armed buffer with one conversion every `pace`, then raise the interrupt.
    /// Returns false if nothing was armed.
    pub fn run_transfer(&mut self, input: &AnalogInput, pace: Duration) -> bool {
        let Some(buffer) = self.transfer.take() else {
            return false;
        };

        for index in 0..buffer.len() {
            if !pace.is_zero() {
                thread::sleep(pace);
            }
            buffer.write(index, input.convert());
        }

        self.irq_pending = true;
        true
    }
}

impl DmaChannel for EmulatedDma {
    type Error = TransferActive;

    fn arm(&mut self, buffer: &'static SampleBuffer) -> Result<(), Self::Error> {
        if self.transfer.is_some() {
            return Err(TransferActive);
        }
        self.transfer = Some(buffer);
        Ok(())
    }

    fn clear_interrupt(&mut self) {
        self.irq_pending = false;
    }
}

/// Run the converter and DMA engine on a dedicated thread.
pub fn spawn(
    mut pipeline: SamplePipeline<EmulatedDma>,
    input: AnalogInput,
    pace: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("adc-dma".into())
        .spawn(move || loop {
            if !pipeline.dma_mut().run_transfer(&input, pace) {
                log::error!(
                    "ADC capture stalled after {} refills ({} re-arm failures)",
                    pipeline.refills(),
                    pipeline.rearm_failures()
                );
                break;
            }

            if pipeline.dma().irq_pending() {
                pipeline.on_transfer_complete();
            }
        })
}
