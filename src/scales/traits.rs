//! Shared scale abstractions: the error type and the reading sink every
//! acquisition path delivers into.

use crate::ble::BleError;
use crate::types::ScaleReading;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use std::sync::Arc;

pub type ReadingChannel = Channel<CriticalSectionRawMutex, ScaleReading, 10>;

#[derive(Debug)]
pub enum ScaleError {
    /// GATT mode was requested without a scale address
    MissingAddress,
    InvalidConfig(String),
    Ble(BleError),
}

impl std::fmt::Display for ScaleError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ScaleError::MissingAddress => {
                write!(f, "Address must be provided when not using advertisement mode")
            }
            ScaleError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            ScaleError::Ble(e) => write!(f, "BLE error: {}", e),
        }
    }
}

impl std::error::Error for ScaleError {}

impl From<BleError> for ScaleError {
    fn from(error: BleError) -> Self {
        ScaleError::Ble(error)
    }
}

/// Destination for accepted readings.
///
/// Errors returned here are logged by the caller of `deliver`; they never
/// interrupt acquisition.
pub trait ReadingSink {
    fn deliver(&self, reading: ScaleReading) -> anyhow::Result<()>;
}

impl<F> ReadingSink for F
where
    F: Fn(ScaleReading) -> anyhow::Result<()>,
{
    fn deliver(&self, reading: ScaleReading) -> anyhow::Result<()> {
        self(reading)
    }
}

/// Forwards readings into a bounded channel for a consumer task
#[derive(Clone)]
pub struct ChannelSink {
    channel: Arc<ReadingChannel>,
}

impl ChannelSink {
    pub fn new(channel: Arc<ReadingChannel>) -> Self {
        Self { channel }
    }
}

impl ReadingSink for ChannelSink {
    fn deliver(&self, reading: ScaleReading) -> anyhow::Result<()> {
        self.channel
            .try_send(reading)
            .map_err(|_| anyhow::anyhow!("reading channel full"))
    }
}
