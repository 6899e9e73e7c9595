//! Turns the latest ADC sample into a table height command when the button is pressed.

use core::fmt::{self, Write};

use crate::{
    sample::{RawSample, MAX_RAW},
    Timestamp,
};

/// Lowest height a table accepts.
pub const MIN_HEIGHT_MM: u16 = 680;
/// Travel between the lowest and highest position.
pub const HEIGHT_RANGE_MM: u16 = 660;
pub const MAX_HEIGHT_MM: u16 = MIN_HEIGHT_MM + HEIGHT_RANGE_MM;

pub const DEFAULT_DEBOUNCE: Timestamp = Timestamp::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Millimeters(pub u16);

/// Decimal rendering of a height. Four digits cover the whole range.
pub type HeightPayload = heapless::String<4>;

impl Millimeters {
    /// Linear map of `[0, MAX_RAW]` onto `[MIN_HEIGHT_MM, MAX_HEIGHT_MM]`, rounding half up.
    /// Samples above `MAX_RAW` saturate.
    pub fn from_raw(raw: RawSample) -> Self {
        let raw = u32::from(raw.0.min(MAX_RAW));
        let max = u32::from(MAX_RAW);
        let offset = (2 * raw * u32::from(HEIGHT_RANGE_MM) + max) / (2 * max);

        // offset <= HEIGHT_RANGE_MM, so this always fits
        Self(MIN_HEIGHT_MM + offset as u16)
    }

    pub fn to_payload(self) -> HeightPayload {
        let mut s = HeightPayload::new();
        // Cannot fail, the value is at most MAX_HEIGHT_MM
        let _ = write!(s, "{}", self.0);
        s
    }
}

impl fmt::Display for Millimeters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}mm", self.0)
    }
}

/// What a button edge resulted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    Published(Millimeters),
    /// The edge came too soon after the previous accepted one.
    Debounced,
    /// No table is bound, there is nobody to send the height to.
    Unbound,
    /// The ADC has not completed its first fill yet.
    NoSample,
    PublishFailed,
}

/// Drops edges that arrive within `window` of the last accepted edge.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Timestamp,
    last_edge: Option<Timestamp>,
}

impl Debouncer {
    pub const fn new(window: Timestamp) -> Self {
        Self {
            window,
            last_edge: None,
        }
    }

    pub fn accept(&mut self, now: Timestamp) -> bool {
        match self.last_edge {
            Some(last) if now - last < self.window => false,
            _ => {
                self.last_edge = Some(now);
                true
            }
        }
    }
}
