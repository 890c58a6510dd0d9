//! Transport capabilities consumed by the scale driver.
//!
//! The BLE stack itself lives outside this crate. A platform backend exposes
//! the operations of [`BleTransport`] and posts everything it receives
//! (advertisements, notifications, link loss) into a [`BleEventChannel`],
//! which the driver drains in delivery order.

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel, mutex::Mutex};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

pub use uuid::Uuid;

pub const EVENT_QUEUE_DEPTH: usize = 32;

pub type BleEventChannel = Channel<CriticalSectionRawMutex, BleEvent, EVENT_QUEUE_DEPTH>;

#[derive(Debug, Clone, PartialEq)]
pub enum BleError {
    ScanFailed(String),
    ConnectionFailed(String),
    WriteFailed(String),
    ReadFailed(String),
    SubscribeFailed(String),
    NotConnected,
}

impl std::fmt::Display for BleError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BleError::ScanFailed(msg) => write!(f, "Scan failed: {}", msg),
            BleError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            BleError::WriteFailed(msg) => write!(f, "Characteristic write failed: {}", msg),
            BleError::ReadFailed(msg) => write!(f, "Characteristic read failed: {}", msg),
            BleError::SubscribeFailed(msg) => {
                write!(f, "Notification subscription failed: {}", msg)
            }
            BleError::NotConnected => write!(f, "Not connected"),
        }
    }
}

impl std::error::Error for BleError {}

/// One received advertisement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub manufacturer_data: Vec<(u16, Vec<u8>)>,
    pub service_uuids: Vec<Uuid>,
}

impl Advertisement {
    /// Non-empty ManufacturerData payload for the given company id
    pub fn manufacturer_payload(&self, company_id: u16) -> Option<&[u8]> {
        self.manufacturer_data
            .iter()
            .find(|(id, data)| *id == company_id && !data.is_empty())
            .map(|(_, data)| data.as_slice())
    }

    pub fn has_service(&self, uuid: &Uuid) -> bool {
        self.service_uuids.contains(uuid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
    Advertisement(Advertisement),
    Notification {
        address: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Disconnected {
        address: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanningMode {
    #[default]
    Active,
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }
}

/// Advertisement-data matcher for backends that refuse passive scans
/// without at least one pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrPattern {
    pub start_position: u8,
    pub ad_data_type: u8,
    pub content: Vec<u8>,
}

const AD_TYPE_FLAGS: u8 = 0x01;

/// Scanner arguments, resolved once for the target platform and handed to
/// the transport on every scan start.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanStrategy {
    pub mode: ScanningMode,
    pub adapter: Option<String>,
    pub or_patterns: Vec<OrPattern>,
    pub use_bdaddr: bool,
}

impl ScanStrategy {
    pub fn resolve(mode: ScanningMode, adapter: Option<&str>, platform: Platform) -> Self {
        let mut strategy = ScanStrategy {
            mode,
            ..Default::default()
        };

        match platform {
            Platform::Linux => {
                // Only Linux supports multiple adapters
                strategy.adapter = adapter.map(str::to_string);
                if mode == ScanningMode::Passive {
                    // Matches every device advertising any of the common flag sets
                    strategy.or_patterns = [0x02, 0x06, 0x1A]
                        .into_iter()
                        .map(|flags| OrPattern {
                            start_position: 0,
                            ad_data_type: AD_TYPE_FLAGS,
                            content: vec![flags],
                        })
                        .collect();
                }
            }
            Platform::MacOs => {
                strategy.use_bdaddr = true;
            }
            Platform::Other => {}
        }

        debug!("Resolved scan strategy: {:?}", strategy);
        strategy
    }
}

/// Capabilities a BLE backend must provide
#[allow(async_fn_in_trait)]
pub trait BleTransport {
    type Connection: Clone;

    /// Channel the backend posts advertisements, notifications and disconnects into
    fn events(&self) -> &BleEventChannel;

    async fn start_scan(&self, strategy: &ScanStrategy) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    async fn connect(&self, address: &str) -> Result<Self::Connection, BleError>;

    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), BleError>;

    async fn write_characteristic(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError>;

    async fn read_characteristic(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BleError>;

    async fn subscribe(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<(), BleError>;

    async fn unsubscribe(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<(), BleError>;
}

/// Serialises scan start/stop for one transport
pub struct Scanner<'a, T: BleTransport> {
    transport: &'a T,
    strategy: ScanStrategy,
    scanning: Mutex<CriticalSectionRawMutex, bool>,
}

impl<'a, T: BleTransport> Scanner<'a, T> {
    pub fn new(transport: &'a T, strategy: ScanStrategy) -> Self {
        Self {
            transport,
            strategy,
            scanning: Mutex::new(false),
        }
    }

    pub async fn start(&self) -> Result<(), BleError> {
        let mut scanning = self.scanning.lock().await;
        if *scanning {
            return Ok(());
        }
        self.transport.start_scan(&self.strategy).await?;
        *scanning = true;
        info!("BLE scan started ({:?})", self.strategy.mode);
        Ok(())
    }

    pub async fn stop(&self) {
        let mut scanning = self.scanning.lock().await;
        if !*scanning {
            return;
        }
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan cleanly: {}", e);
        }
        *scanning = false;
        info!("BLE scan stopped");
    }

    pub async fn is_scanning(&self) -> bool {
        *self.scanning.lock().await
    }
}
