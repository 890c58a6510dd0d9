//! In-memory BLE transport.
//!
//! Replays scripted events and records every call the driver makes, so the
//! session, listener and facade can run on a host without a radio.

use crate::ble::{
    Advertisement, BleError, BleEvent, BleEventChannel, BleTransport, ScanStrategy, Uuid,
};
use crate::protocol::{
    HW_REVISION_CHAR_UUID, MANUFACTURER_ID, SW_REVISION_CHAR_UUID, WEIGHT_CHAR_UUID,
};
use crate::types::WeightUnit;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex as BlockingMutex};
use log::debug;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedConnection {
    pub id: u32,
    pub address: String,
}

/// Kind of transport operation, used to inject failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartScan,
    StopScan,
    Connect,
    Disconnect,
    Write,
    Read,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    StartScan(ScanStrategy),
    StopScan,
    Connect(String),
    Disconnect(u32),
    Write { characteristic: Uuid, value: Vec<u8> },
    Read(Uuid),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
}

impl TransportCall {
    pub fn operation(&self) -> Operation {
        match self {
            TransportCall::StartScan(_) => Operation::StartScan,
            TransportCall::StopScan => Operation::StopScan,
            TransportCall::Connect(_) => Operation::Connect,
            TransportCall::Disconnect(_) => Operation::Disconnect,
            TransportCall::Write { .. } => Operation::Write,
            TransportCall::Read(_) => Operation::Read,
            TransportCall::Subscribe(_) => Operation::Subscribe,
            TransportCall::Unsubscribe(_) => Operation::Unsubscribe,
        }
    }
}

pub struct SimulatedTransport {
    events: BleEventChannel,
    calls: BlockingMutex<CriticalSectionRawMutex, RefCell<Vec<TransportCall>>>,
    failures: BlockingMutex<CriticalSectionRawMutex, RefCell<Vec<Operation>>>,
    read_values: BlockingMutex<CriticalSectionRawMutex, RefCell<HashMap<Uuid, Vec<u8>>>>,
    held: BlockingMutex<CriticalSectionRawMutex, RefCell<Vec<Operation>>>,
    next_connection: AtomicU32,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        let mut read_values = HashMap::new();
        read_values.insert(HW_REVISION_CHAR_UUID, b"1.0".to_vec());
        read_values.insert(SW_REVISION_CHAR_UUID, b"1.0.0".to_vec());

        Self {
            events: BleEventChannel::new(),
            calls: BlockingMutex::new(RefCell::new(Vec::new())),
            failures: BlockingMutex::new(RefCell::new(Vec::new())),
            read_values: BlockingMutex::new(RefCell::new(read_values)),
            held: BlockingMutex::new(RefCell::new(Vec::new())),
            next_connection: AtomicU32::new(1),
        }
    }

    /// Queue an event as if the radio had delivered it
    pub async fn push_event(&self, event: BleEvent) {
        self.events.send(event).await;
    }

    /// Non-blocking variant of [`push_event`](Self::push_event); false when the queue is full
    pub fn try_push_event(&self, event: BleEvent) -> bool {
        self.events.try_send(event).is_ok()
    }

    /// Make the next call of `operation` fail. Repeated calls stack.
    pub fn fail_next(&self, operation: Operation) {
        self.failures.lock(|f| f.borrow_mut().push(operation));
    }

    pub fn set_read_value(&self, characteristic: Uuid, value: &[u8]) {
        self.read_values
            .lock(|v| v.borrow_mut().insert(characteristic, value.to_vec()));
    }

    /// Park every call of `operation` after it is recorded, until
    /// [`release`](Self::release). An injected failure still applies once released.
    pub fn hold(&self, operation: Operation) {
        self.held.lock(|h| {
            let mut held = h.borrow_mut();
            if !held.contains(&operation) {
                held.push(operation);
            }
        });
    }

    pub fn release(&self, operation: Operation) {
        self.held.lock(|h| h.borrow_mut().retain(|&op| op != operation));
    }

    fn is_held(&self, operation: Operation) -> bool {
        self.held.lock(|h| h.borrow().contains(&operation))
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock(|c| c.borrow().clone())
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.calls
            .lock(|c| c.borrow().iter().filter(|call| call.operation() == operation).count())
    }

    pub fn clear_calls(&self) {
        self.calls.lock(|c| c.borrow_mut().clear());
    }

    /// Log the call, wait while its operation is held, and report whether
    /// it should fail
    async fn record(&self, call: TransportCall) -> bool {
        let operation = call.operation();
        debug!("Simulated transport: {:?}", call);
        self.calls.lock(|c| c.borrow_mut().push(call));
        let fail = self.failures.lock(|f| {
            let mut failures = f.borrow_mut();
            match failures.iter().position(|&op| op == operation) {
                Some(index) => {
                    failures.remove(index);
                    true
                }
                None => false,
            }
        });
        while self.is_held(operation) {
            yield_now().await;
        }
        fail
    }
}

impl BleTransport for SimulatedTransport {
    type Connection = SimulatedConnection;

    fn events(&self) -> &BleEventChannel {
        &self.events
    }

    async fn start_scan(&self, strategy: &ScanStrategy) -> Result<(), BleError> {
        if self.record(TransportCall::StartScan(strategy.clone())).await {
            return Err(BleError::ScanFailed("simulated failure".to_string()));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if self.record(TransportCall::StopScan).await {
            return Err(BleError::ScanFailed("simulated failure".to_string()));
        }
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<SimulatedConnection, BleError> {
        if self.record(TransportCall::Connect(address.to_string())).await {
            return Err(BleError::ConnectionFailed(format!("{} did not respond", address)));
        }
        Ok(SimulatedConnection {
            id: self.next_connection.fetch_add(1, Ordering::SeqCst),
            address: address.to_string(),
        })
    }

    async fn disconnect(&self, connection: &SimulatedConnection) -> Result<(), BleError> {
        if self.record(TransportCall::Disconnect(connection.id)).await {
            return Err(BleError::NotConnected);
        }
        Ok(())
    }

    async fn write_characteristic(
        &self,
        _connection: &SimulatedConnection,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let call = TransportCall::Write {
            characteristic,
            value: value.to_vec(),
        };
        if self.record(call).await {
            return Err(BleError::WriteFailed(characteristic.to_string()));
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        _connection: &SimulatedConnection,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BleError> {
        if self.record(TransportCall::Read(characteristic)).await {
            return Err(BleError::ReadFailed(characteristic.to_string()));
        }
        self.read_values
            .lock(|v| v.borrow().get(&characteristic).cloned())
            .ok_or_else(|| BleError::ReadFailed(format!("{} not readable", characteristic)))
    }

    async fn subscribe(
        &self,
        _connection: &SimulatedConnection,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        if self.record(TransportCall::Subscribe(characteristic)).await {
            return Err(BleError::SubscribeFailed(characteristic.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        _connection: &SimulatedConnection,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        if self.record(TransportCall::Unsubscribe(characteristic)).await {
            return Err(BleError::SubscribeFailed(characteristic.to_string()));
        }
        Ok(())
    }
}

/// 22-byte weight notification as sent on the weight characteristic
pub fn notification_frame(grams: u32, impedance: Option<u16>, unit: WeightUnit) -> Vec<u8> {
    let mut frame = vec![
        0xA5, 0x02, 0x00, 0x10, 0x00, 0x00, 0x01, 0x61, 0xA1, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
    ];
    frame[10..13].copy_from_slice(&grams.to_le_bytes()[..3]);
    if let Some(impedance) = impedance {
        frame[13..15].copy_from_slice(&impedance.to_le_bytes());
        frame[20] = 1;
    }
    frame[21] = unit.as_byte();
    frame
}

/// 20-byte ManufacturerData payload broadcast by the scale
pub fn advertisement_frame(mac: [u8; 6], grams: u32, impedance: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(20);
    frame.push(0x01);
    frame.extend(mac.iter().rev());
    frame.extend_from_slice(&[0xC0, 0xA8, 0x01]);
    frame.extend_from_slice(&grams.to_le_bytes()[..3]);
    frame.extend_from_slice(&impedance.to_le_bytes());
    frame.extend_from_slice(&[0x01, 0x01, 0x02, 0x03, 0x00]);
    frame
}

/// Advertisement carrying `payload` under the scale's company id
pub fn scale_advertisement(address: &str, payload: Vec<u8>) -> Advertisement {
    Advertisement {
        address: address.to_string(),
        name: Some("Etekcity Fitness Scale".to_string()),
        rssi: Some(-58),
        manufacturer_data: vec![(MANUFACTURER_ID, payload)],
        service_uuids: Vec::new(),
    }
}

pub fn weight_notification(address: &str, frame: Vec<u8>) -> BleEvent {
    BleEvent::Notification {
        address: address.to_string(),
        characteristic: WEIGHT_CHAR_UUID,
        value: frame,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_advertisement, decode_notification};
    use embassy_futures::block_on;

    #[test]
    fn test_frames_decode() {
        let frame = notification_frame(70_500, Some(480), WeightUnit::Lb);
        let sample = decode_notification(&frame).unwrap();
        assert_eq!(sample.weight_kg, Some(70.5));
        assert_eq!(sample.impedance_ohm, Some(480));
        assert_eq!(sample.display_unit, Some(1));

        let mac = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let sample = decode_advertisement(&advertisement_frame(mac, 66_000, 0)).unwrap();
        assert_eq!(sample.weight_kg, Some(66.0));
        assert_eq!(sample.impedance_ohm, None);
        assert_eq!(sample.mac_in_frame.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_injected_failure_hits_once() {
        let transport = SimulatedTransport::new();
        transport.fail_next(Operation::Connect);

        assert!(block_on(transport.connect("AA:BB:CC:DD:EE:FF")).is_err());
        let connection = block_on(transport.connect("AA:BB:CC:DD:EE:FF")).unwrap();
        assert_eq!(connection.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(transport.count(Operation::Connect), 2);
    }

    #[test]
    fn test_reads_configured_values() {
        let transport = SimulatedTransport::new();
        transport.set_read_value(SW_REVISION_CHAR_UUID, b"2.1");
        let connection = block_on(transport.connect("AA:BB:CC:DD:EE:FF")).unwrap();

        assert_eq!(
            block_on(transport.read_characteristic(&connection, SW_REVISION_CHAR_UUID)).unwrap(),
            b"2.1".to_vec()
        );
        assert!(block_on(transport.read_characteristic(&connection, WEIGHT_CHAR_UUID)).is_err());
    }

    #[test]
    fn test_held_operation_waits_for_release() {
        use embassy_futures::{join::join, yield_now};

        let transport = SimulatedTransport::new();
        transport.hold(Operation::Connect);

        let (connection, _) = block_on(join(transport.connect("AA:BB:CC:DD:EE:FF"), async {
            for _ in 0..3 {
                yield_now().await;
            }
            assert_eq!(transport.count(Operation::Connect), 1);
            transport.release(Operation::Connect);
        }));
        assert!(connection.is_ok());
    }

    #[test]
    fn test_events_are_queued_in_order() {
        let transport = SimulatedTransport::new();
        assert!(transport.try_push_event(BleEvent::Disconnected {
            address: "A".to_string()
        }));
        block_on(transport.push_event(BleEvent::Disconnected {
            address: "B".to_string()
        }));

        let first = transport.events().try_receive().unwrap();
        assert_eq!(first, BleEvent::Disconnected { address: "A".to_string() });
    }
}
