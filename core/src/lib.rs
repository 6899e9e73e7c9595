#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(feature = "config")]
pub mod config;
pub mod bridge;
pub mod node;
pub mod router;
pub mod sample;
pub mod session;
pub mod topics;
pub mod transport;

use core::ops::{Add, Sub};

pub use node::{Board, ConnectionState, FailurePolicy, Node, NodeConfig, NodeError};
pub use sample::{RawSample, SampleReader};
pub use transport::{AckError, AckResult, ConnectionStatus, QoS, Transport};

pub const DEVICE_ID_LEN: usize = 32;

/// Identifier the node announces itself with. Doubles as the MQTT client id.
pub type DeviceId = heapless::String<DEVICE_ID_LEN>;

/// Time since boot with millisecond resolution.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    millis: u64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp::from_millis(0);

    pub const fn from_millis(value: u64) -> Self {
        Self { millis: value }
    }

    pub const fn from_secs(value: u64) -> Self {
        Self::from_millis(value.saturating_mul(1000))
    }

    pub const fn as_millis(&self) -> u64 {
        self.millis
    }

    pub const fn as_secs(&self) -> u64 {
        self.millis / 1000
    }
}

impl Add for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Self) -> Self::Output {
        Self::from_millis(self.millis.saturating_add(rhs.millis))
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    /// Clamps at zero.
    fn sub(self, rhs: Self) -> Self::Output {
        Self::from_millis(self.millis.saturating_sub(rhs.millis))
    }
}
