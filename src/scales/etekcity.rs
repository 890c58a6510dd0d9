// etekcity.rs - GATT connection session for Etekcity body-composition scales
// Turns advertisements, notifications and link loss into a stream of stable readings

use crate::ble::{Advertisement, BleError, BleEvent, BleTransport, Uuid};
use crate::protocol::{
    decode_notification, normalize_mac, to_hex, unit_update_command, HW_REVISION_CHAR_UUID,
    SW_REVISION_CHAR_UUID, UNIT_COMMAND_CHAR_UUID, WEIGHT_CHAR_UUID,
};
use crate::scales::traits::{ReadingSink, ScaleError};
use crate::types::{ScaleReading, WeightUnit, IMPEDANCE_KEY, WEIGHT_KEY};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, mutex::Mutex};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

struct SessionState<C> {
    status: ConnectionStatus,
    connection: Option<C>,
    /// Name and address the scale advertised with on the current connection
    device_name: String,
    device_address: String,
    /// Desired unit, or the unit adopted from the first reading
    display_unit: Option<WeightUnit>,
    unit_change_pending: bool,
    hw_version: Option<String>,
    sw_version: Option<String>,
    /// Bumped on every connect attempt, link loss and stop. An attempt only
    /// touches the state while the epoch it started with is still current.
    epoch: u64,
}

impl<C> SessionState<C> {
    /// Back to Disconnected after a failed attempt; the next advertisement retries
    fn reset(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.connection = None;
        self.unit_change_pending |= self.display_unit.is_some();
    }

    /// Drop whatever attempt or connection is current; returns the connection
    fn invalidate(&mut self) -> Option<C> {
        self.epoch = self.epoch.wrapping_add(1);
        self.status = ConnectionStatus::Disconnected;
        self.connection.take()
    }
}

pub struct ConnectionSession<T: BleTransport, S: ReadingSink> {
    address: String,
    transport: Arc<T>,
    sink: S,
    state: Mutex<CriticalSectionRawMutex, SessionState<T::Connection>>,
}

impl<T: BleTransport, S: ReadingSink> ConnectionSession<T, S> {
    pub fn new(
        address: &str,
        transport: Arc<T>,
        display_unit: Option<WeightUnit>,
        sink: S,
    ) -> Result<Self, ScaleError> {
        let address = normalize_mac(address.trim());
        if address.is_empty() {
            return Err(ScaleError::MissingAddress);
        }

        let state = SessionState {
            status: ConnectionStatus::Disconnected,
            connection: None,
            device_name: address.clone(),
            device_address: address.clone(),
            display_unit,
            unit_change_pending: display_unit.is_some(),
            hw_version: None,
            sw_version: None,
            epoch: 0,
        };

        Ok(Self {
            address,
            transport,
            sink,
            state: Mutex::new(state),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn matches(&self, address: &str) -> bool {
        normalize_mac(address) == self.address
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    pub async fn hw_version(&self) -> Option<String> {
        self.state.lock().await.hw_version.clone()
    }

    pub async fn sw_version(&self) -> Option<String> {
        self.state.lock().await.sw_version.clone()
    }

    pub async fn display_unit(&self) -> Option<WeightUnit> {
        self.state.lock().await.display_unit
    }

    pub async fn unit_change_pending(&self) -> bool {
        self.state.lock().await.unit_change_pending
    }

    /// Ask for a different display unit; written on the next connect
    pub async fn set_display_unit(&self, unit: WeightUnit) {
        let mut state = self.state.lock().await;
        state.display_unit = Some(unit);
        state.unit_change_pending = true;
        info!("Display unit {:?} requested for {}", unit, self.address);
    }

    pub async fn handle_event(&self, event: &BleEvent) {
        match event {
            BleEvent::Advertisement(adv) => self.handle_advertisement(adv).await,
            BleEvent::Notification {
                address,
                characteristic,
                value,
            } => self.handle_notification(address, *characteristic, value).await,
            BleEvent::Disconnected { address } => self.handle_disconnect(address).await,
        }
    }

    /// Connect and configure the scale if this advertisement is ours and no
    /// connection exists or is in progress
    pub async fn handle_advertisement(&self, adv: &Advertisement) {
        if !self.matches(&adv.address) {
            return;
        }

        let epoch = {
            let mut state = self.state.lock().await;
            if state.status != ConnectionStatus::Disconnected {
                return;
            }
            state.status = ConnectionStatus::Connecting;
            state.epoch = state.epoch.wrapping_add(1);
            state.epoch
        };

        info!("Connecting to scale {}", self.address);
        let connection = match self.transport.connect(&adv.address).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Could not connect to scale {}: {}", self.address, e);
                let mut state = self.state.lock().await;
                if state.epoch == epoch {
                    state.reset();
                }
                return;
            }
        };

        let current = {
            let mut state = self.state.lock().await;
            let current = state.epoch == epoch;
            if current {
                state.status = ConnectionStatus::Connected;
                state.connection = Some(connection.clone());
                state.device_name = adv.name.clone().unwrap_or_else(|| adv.address.clone());
                state.device_address = adv.address.clone();
            }
            current
        };
        if !current {
            debug!("Connect attempt to {} superseded, releasing it", self.address);
            self.release(&connection).await;
            return;
        }
        debug!("Connected to scale: {}", self.address);

        if let Err(e) = self.configure(&connection).await {
            error!("Failed to set up scale {}: {}", self.address, e);
            self.release(&connection).await;
            let mut state = self.state.lock().await;
            if state.epoch == epoch {
                state.reset();
            }
        }
    }

    async fn release(&self, connection: &T::Connection) {
        if let Err(e) = self.transport.disconnect(connection).await {
            warn!("Failed to release connection to {}: {}", self.address, e);
        }
    }

    async fn configure(&self, connection: &T::Connection) -> Result<(), BleError> {
        let (pending, unit) = {
            let state = self.state.lock().await;
            (state.unit_change_pending, state.display_unit)
        };

        if let (true, Some(unit)) = (pending, unit) {
            let command = unit_update_command(unit);
            self.transport
                .write_characteristic(connection, UNIT_COMMAND_CHAR_UUID, &command)
                .await?;
            debug!("Trying to update display unit to {:?} (buffer: {})", unit, to_hex(&command));
            self.state.lock().await.unit_change_pending = false;
        }

        self.transport.subscribe(connection, WEIGHT_CHAR_UUID).await?;

        if self.state.lock().await.hw_version.is_none() {
            let hw = self.read_string(connection, HW_REVISION_CHAR_UUID).await?;
            self.state.lock().await.hw_version = Some(hw);
        }
        let sw = self.read_string(connection, SW_REVISION_CHAR_UUID).await?;

        let mut state = self.state.lock().await;
        state.sw_version = Some(sw);
        info!(
            "Scale {} ready (HW {}, SW {})",
            self.address,
            state.hw_version.as_deref().unwrap_or(""),
            state.sw_version.as_deref().unwrap_or("")
        );
        Ok(())
    }

    async fn read_string(
        &self,
        connection: &T::Connection,
        characteristic: Uuid,
    ) -> Result<String, BleError> {
        let raw = self.transport.read_characteristic(connection, characteristic).await?;
        Ok(String::from_utf8_lossy(&raw).trim_end_matches('\0').to_string())
    }

    /// Decode a weight notification and hand the reading to the sink
    pub async fn handle_notification(&self, address: &str, characteristic: Uuid, value: &[u8]) {
        if characteristic != WEIGHT_CHAR_UUID || !self.matches(address) {
            return;
        }
        let Some(sample) = decode_notification(value) else {
            return;
        };
        let Some(device_unit) = sample.display_unit.and_then(WeightUnit::from_byte) else {
            debug!("Dropping reading with unknown display unit {:?}", sample.display_unit);
            return;
        };

        let mut state = self.state.lock().await;
        match state.display_unit {
            None => {
                state.display_unit = Some(device_unit);
                state.unit_change_pending = false;
            }
            Some(desired) => state.unit_change_pending = device_unit != desired,
        }

        let mut measurements = BTreeMap::new();
        if let Some(weight) = sample.weight_kg {
            measurements.insert(WEIGHT_KEY.to_string(), weight);
        }
        if let Some(impedance) = sample.impedance_ohm {
            measurements.insert(IMPEDANCE_KEY.to_string(), f64::from(impedance));
        }

        let reading = ScaleReading {
            name: state.device_name.clone(),
            address: state.device_address.clone(),
            hw_version: state.hw_version.clone().unwrap_or_default(),
            sw_version: state.sw_version.clone().unwrap_or_default(),
            display_unit: device_unit,
            measurements,
        };
        drop(state);

        debug!("Received stable weight notification from {}: {:?}", address, reading.measurements);
        if let Err(e) = self.sink.deliver(reading) {
            error!("Reading callback failed: {:?}", e);
        }
    }

    pub async fn handle_disconnect(&self, address: &str) {
        if !self.matches(address) {
            return;
        }
        let mut state = self.state.lock().await;
        if state.status == ConnectionStatus::Connected {
            state.invalidate();
            info!("Scale {} disconnected", self.address);
        }
    }

    /// Unsubscribe and drop the connection, if any
    pub async fn stop(&self) {
        let connection = self.state.lock().await.invalidate();

        if let Some(connection) = connection {
            if let Err(e) = self.transport.unsubscribe(&connection, WEIGHT_CHAR_UUID).await {
                warn!("Failed to unsubscribe from {}: {}", self.address, e);
            }
            if let Err(e) = self.transport.disconnect(&connection).await {
                warn!("Failed to disconnect from {}: {}", self.address, e);
            }
            info!("Scale {} session stopped", self.address);
        }
    }
}
