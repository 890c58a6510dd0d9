// advertisement.rs - Connectionless weight readings from ManufacturerData broadcasts
//
// The scale keeps broadcasting its current weight while someone stands on it.
// A reading only counts once it has settled: either impedance shows up, or the
// same quantized weight repeats enough times in a row.

use crate::ble::{Advertisement, BleEvent, BleTransport, ScanStrategy, Scanner};
use crate::protocol::{
    decode_advertisement, normalize_mac, to_hex, ADV_SERVICE_UUID, MANUFACTURER_ID,
};
use crate::scales::traits::ScaleError;
use crate::system::config::StabilizerTuning;
use crate::types::AdvReading;
use embassy_futures::select::select;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
use embassy_time::Instant;
use log::{debug, error};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
struct StabilizerState {
    last_seen_q: Option<f64>,
    repeat_count: u32,
    last_emit_q: Option<f64>,
    last_emit_at: Option<Instant>,
}

fn quantize(weight: f64, step: f64) -> f64 {
    ((weight / step).round() * step * 1000.0).round() / 1000.0
}

/// Per-address repeat counting and emission rate limiting
pub struct AdvertisementStabilizer {
    tuning: StabilizerTuning,
    devices: HashMap<String, StabilizerState>,
}

impl AdvertisementStabilizer {
    pub fn new(tuning: StabilizerTuning) -> Self {
        Self {
            tuning,
            devices: HashMap::new(),
        }
    }

    pub fn tuning(&self) -> &StabilizerTuning {
        &self.tuning
    }

    /// Feed one weight sample. Returns `Some(stable)` when the sample should
    /// be emitted, `None` when it is suppressed.
    pub fn observe(
        &mut self,
        address: &str,
        weight_kg: f64,
        has_impedance: bool,
        now: Instant,
    ) -> Option<bool> {
        let tuning = &self.tuning;
        let half_step = tuning.weight_epsilon_kg / 2.0;
        let q = quantize(weight_kg, tuning.weight_epsilon_kg);

        let state = self.devices.entry(address.to_string()).or_default();

        match state.last_seen_q {
            Some(last) if (q - last).abs() <= half_step => state.repeat_count += 1,
            _ => {
                state.last_seen_q = Some(q);
                state.repeat_count = 1;
            }
        }

        let stable = has_impedance || state.repeat_count >= tuning.stable_repeats;

        // No prior emission counts as the interval having passed
        let elapsed = state
            .last_emit_at
            .map_or(true, |at| now.saturating_duration_since(at) >= tuning.min_emit_interval());

        let emit = match state.last_emit_q {
            None => stable || (tuning.emit_transients && elapsed),
            Some(last) if stable => (q - last).abs() > half_step || elapsed,
            Some(last) => {
                tuning.emit_transients && elapsed && (q - last).abs() >= tuning.min_delta_kg
            }
        };

        if !emit {
            return None;
        }

        state.last_emit_q = Some(q);
        state.last_emit_at = Some(now);
        Some(stable)
    }
}

/// Filters scale advertisements and runs them through the stabilizer
pub struct AdvertisementListener {
    stabilizer: AdvertisementStabilizer,
    address_filter: Option<String>,
    require_service: bool,
}

impl AdvertisementListener {
    pub fn new(tuning: StabilizerTuning, address_filter: Option<&str>) -> Self {
        let address_filter = address_filter
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(normalize_mac);

        Self {
            require_service: tuning.require_service,
            stabilizer: AdvertisementStabilizer::new(tuning),
            address_filter,
        }
    }

    fn accepts(&self, address: &str, mac_in_frame: Option<&str>) -> bool {
        let Some(filter) = &self.address_filter else {
            return true;
        };
        normalize_mac(address) == *filter
            || mac_in_frame.is_some_and(|mac| normalize_mac(mac) == *filter)
    }

    pub fn handle_advertisement(
        &mut self,
        adv: &Advertisement,
        now: Instant,
    ) -> Option<AdvReading> {
        let payload = adv.manufacturer_payload(MANUFACTURER_ID)?;
        if self.require_service && !adv.has_service(&ADV_SERVICE_UUID) {
            return None;
        }

        let sample = decode_advertisement(payload)?;
        if !self.accepts(&adv.address, sample.mac_in_frame.as_deref()) {
            return None;
        }
        let weight_kg = sample.weight_kg?;

        let address = if adv.address.is_empty() {
            sample
                .mac_in_frame
                .as_ref()
                .map(|mac| mac.to_string())
                .unwrap_or_default()
        } else {
            adv.address.clone()
        };

        let stable = self
            .stabilizer
            .observe(&address, weight_kg, sample.impedance_ohm.is_some(), now)?;

        Some(AdvReading {
            address,
            mac_in_frame: sample.mac_in_frame,
            rssi: adv.rssi,
            weight_kg,
            impedance_ohm: sample.impedance_ohm,
            stable,
            timestamp: now,
            raw_hex: to_hex(payload),
        })
    }

    /// Scan and emit readings until `cancel` fires. The scan is released on
    /// every exit path after it was acquired.
    pub async fn run<T, F>(
        &mut self,
        transport: &T,
        strategy: ScanStrategy,
        cancel: &Signal<CriticalSectionRawMutex, ()>,
        mut on_reading: F,
    ) -> Result<(), ScaleError>
    where
        T: BleTransport,
        F: FnMut(AdvReading) -> anyhow::Result<()>,
    {
        let scanner = Scanner::new(transport, strategy);
        scanner.start().await?;

        let tuning = self.stabilizer.tuning();
        debug!(
            "Advertisement listener started (require_service={}, address_filter={:?}, \
             epsilon={:.3}, stable_repeats={}, emit_transients={}, min_emit_interval_s={:.2})",
            self.require_service,
            self.address_filter,
            tuning.weight_epsilon_kg,
            tuning.stable_repeats,
            tuning.emit_transients,
            tuning.min_emit_interval_s
        );

        let pump = async {
            loop {
                let BleEvent::Advertisement(adv) = transport.events().receive().await else {
                    continue;
                };
                if let Some(reading) = self.handle_advertisement(&adv, Instant::now()) {
                    if let Err(e) = on_reading(reading) {
                        error!("on_reading callback failed: {:?}", e);
                    }
                }
            }
        };

        select(pump, cancel.wait()).await;

        scanner.stop().await;
        debug!("Advertisement listener stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{ScanningMode, Uuid};
    use crate::simulated::{
        advertisement_frame, scale_advertisement, Operation, SimulatedTransport, TransportCall,
    };
    use embassy_futures::block_on;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";
    const MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

    fn at(millis: u64) -> Instant {
        Instant::from_millis(millis)
    }

    #[test]
    fn test_quantize() {
        assert_eq!(quantize(70.0, 0.02), 70.0);
        assert_eq!(quantize(70.009, 0.02), 70.0);
        assert_eq!(quantize(70.011, 0.02), 70.02);
        assert_eq!(quantize(69.995, 0.02), 70.0);
    }

    #[test]
    fn test_stable_exactly_on_tenth_repeat() {
        let mut stabilizer = AdvertisementStabilizer::new(StabilizerTuning::default());
        for i in 0..9 {
            assert_eq!(stabilizer.observe(ADDR, 70.0, false, at(i * 100)), None);
        }
        assert_eq!(stabilizer.observe(ADDR, 70.0, false, at(900)), Some(true));
    }

    #[test]
    fn test_nine_repeats_never_stable() {
        let mut stabilizer = AdvertisementStabilizer::new(StabilizerTuning::default());
        for round in 0..3 {
            for i in 0..9 {
                let weight = 70.0 + round as f64;
                let now = at(round * 10_000 + i * 100);
                assert_eq!(stabilizer.observe(ADDR, weight, false, now), None);
            }
        }
    }

    #[test]
    fn test_jitter_within_epsilon_counts_as_repeat() {
        let mut stabilizer = AdvertisementStabilizer::new(StabilizerTuning::default());
        let weights = [70.0, 70.004, 69.996, 70.0, 70.003, 69.999, 70.0, 70.002, 70.0];
        for (i, &w) in weights.iter().enumerate() {
            assert_eq!(stabilizer.observe(ADDR, w, false, at(i as u64 * 100)), None);
        }
        assert_eq!(stabilizer.observe(ADDR, 70.001, false, at(1_000)), Some(true));
    }

    #[test]
    fn test_impedance_is_immediately_stable() {
        let mut stabilizer = AdvertisementStabilizer::new(StabilizerTuning::default());
        assert_eq!(stabilizer.observe(ADDR, 70.0, true, at(0)), Some(true));
    }

    #[test]
    fn test_stable_value_not_repeated_until_change_or_interval() {
        let mut stabilizer = AdvertisementStabilizer::new(StabilizerTuning::default());
        assert_eq!(stabilizer.observe(ADDR, 70.0, true, at(0)), Some(true));
        assert_eq!(stabilizer.observe(ADDR, 70.0, true, at(300)), None);
        assert_eq!(stabilizer.observe(ADDR, 70.005, true, at(600)), None);
        // changed by more than half a step
        assert_eq!(stabilizer.observe(ADDR, 70.5, true, at(700)), Some(true));
        assert_eq!(stabilizer.observe(ADDR, 70.5, true, at(1_200)), None);
        // cooldown over
        assert_eq!(stabilizer.observe(ADDR, 70.5, true, at(1_700)), Some(true));
    }

    #[test]
    fn test_transients_rate_limited_and_thresholded() {
        let tuning = StabilizerTuning {
            emit_transients: true,
            ..Default::default()
        };
        let mut stabilizer = AdvertisementStabilizer::new(tuning);

        assert_eq!(stabilizer.observe(ADDR, 50.0, false, at(0)), Some(false));
        assert_eq!(stabilizer.observe(ADDR, 60.0, false, at(500)), None);
        assert_eq!(stabilizer.observe(ADDR, 65.0, false, at(1_500)), Some(false));
        assert_eq!(stabilizer.observe(ADDR, 65.005, false, at(3_000)), None);
        assert_eq!(stabilizer.observe(ADDR, 65.04, false, at(3_100)), Some(false));
    }

    #[test]
    fn test_transients_suppressed_by_default() {
        let mut stabilizer = AdvertisementStabilizer::new(StabilizerTuning::default());
        assert_eq!(stabilizer.observe(ADDR, 50.0, false, at(0)), None);
        assert_eq!(stabilizer.observe(ADDR, 60.0, false, at(5_000)), None);
    }

    #[test]
    fn test_state_is_per_address() {
        let tuning = StabilizerTuning {
            stable_repeats: 2,
            ..Default::default()
        };
        let mut stabilizer = AdvertisementStabilizer::new(tuning);
        assert_eq!(stabilizer.observe(ADDR, 70.0, false, at(0)), None);
        assert_eq!(stabilizer.observe("11:22:33:44:55:66", 70.0, false, at(10)), None);
        assert_eq!(stabilizer.observe(ADDR, 70.0, false, at(20)), Some(true));
    }

    #[test]
    fn test_listener_emits_reading() {
        let mut listener = AdvertisementListener::new(StabilizerTuning::default(), None);
        let adv = scale_advertisement(ADDR, advertisement_frame(MAC, 66_000, 300));

        let reading = listener.handle_advertisement(&adv, at(0)).unwrap();
        assert_eq!(reading.address, ADDR);
        assert_eq!(reading.mac_in_frame.as_deref(), Some(ADDR));
        assert_eq!(reading.weight_kg, 66.0);
        assert_eq!(reading.impedance_ohm, Some(300));
        assert!(reading.stable);
        assert_eq!(reading.rssi, Some(-58));
        assert_eq!(reading.raw_hex, "01ffeeddccbbaac0a801d001012c010101020300");
    }

    #[test]
    fn test_listener_requires_manufacturer_payload() {
        let mut listener = AdvertisementListener::new(StabilizerTuning::default(), None);

        let mut adv = scale_advertisement(ADDR, advertisement_frame(MAC, 66_000, 300));
        adv.manufacturer_data = vec![(0x004C, advertisement_frame(MAC, 66_000, 300))];
        assert!(listener.handle_advertisement(&adv, at(0)).is_none());

        let adv = scale_advertisement(ADDR, Vec::new());
        assert!(listener.handle_advertisement(&adv, at(0)).is_none());

        let adv = scale_advertisement(ADDR, advertisement_frame(MAC, 0, 300));
        assert!(listener.handle_advertisement(&adv, at(0)).is_none());
    }

    #[test]
    fn test_listener_require_service() {
        let tuning = StabilizerTuning {
            require_service: true,
            ..Default::default()
        };
        let mut listener = AdvertisementListener::new(tuning, None);

        let mut adv = scale_advertisement(ADDR, advertisement_frame(MAC, 66_000, 300));
        assert!(listener.handle_advertisement(&adv, at(0)).is_none());

        adv.service_uuids.push(Uuid::from_u128(0x0000_FFD0_0000_1000_8000_00805F9B34FB));
        assert!(listener.handle_advertisement(&adv, at(0)).is_some());
    }

    #[test]
    fn test_address_filter_matches_transport_or_frame_mac() {
        let mut listener =
            AdvertisementListener::new(StabilizerTuning::default(), Some("aa-bb-cc-dd-ee-ff"));

        // transport address differs (e.g. a CoreBluetooth UUID), frame MAC matches
        let adv = scale_advertisement("5B1C0E3A-0000-1111", advertisement_frame(MAC, 66_000, 300));
        assert!(listener.handle_advertisement(&adv, at(0)).is_some());

        let other = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let adv = scale_advertisement("11:22:33:44:55:66", advertisement_frame(other, 66_000, 300));
        assert!(listener.handle_advertisement(&adv, at(0)).is_none());

        let adv = scale_advertisement("aa:bb:cc:dd:ee:ff", advertisement_frame(other, 66_000, 300));
        assert!(listener.handle_advertisement(&adv, at(0)).is_some());
    }

    #[test]
    fn test_listener_falls_back_to_frame_mac_as_address() {
        let mut listener = AdvertisementListener::new(StabilizerTuning::default(), None);
        let adv = scale_advertisement("", advertisement_frame(MAC, 66_000, 300));
        let reading = listener.handle_advertisement(&adv, at(0)).unwrap();
        assert_eq!(reading.address, ADDR);
    }

    #[test]
    fn test_run_releases_scan_on_cancel() {
        let transport = SimulatedTransport::new();
        let cancel = Signal::new();
        let mut listener = AdvertisementListener::new(StabilizerTuning::default(), None);
        let strategy = ScanStrategy {
            mode: ScanningMode::Passive,
            ..Default::default()
        };

        assert!(transport.try_push_event(BleEvent::Advertisement(scale_advertisement(
            ADDR,
            advertisement_frame(MAC, 66_000, 300)
        ))));
        assert!(transport.try_push_event(BleEvent::Disconnected { address: ADDR.to_string() }));
        cancel.signal(());

        let mut readings = Vec::new();
        let result = block_on(listener.run(&transport, strategy.clone(), &cancel, |r| {
            readings.push(r);
            Ok(())
        }));

        assert!(result.is_ok());
        assert_eq!(readings.len(), 1);
        assert_eq!(
            transport.calls(),
            vec![TransportCall::StartScan(strategy), TransportCall::StopScan]
        );
    }

    #[test]
    fn test_run_reports_scan_failure() {
        let transport = SimulatedTransport::new();
        transport.fail_next(Operation::StartScan);
        let cancel = Signal::new();
        let mut listener = AdvertisementListener::new(StabilizerTuning::default(), None);

        let strategy = ScanStrategy::default();
        let result = block_on(listener.run(&transport, strategy, &cancel, |_| Ok(())));

        assert!(matches!(result, Err(ScaleError::Ble(_))));
        assert_eq!(transport.count(Operation::StopScan), 0);
    }

    #[test]
    fn test_callback_errors_are_logged() {
        let transport = SimulatedTransport::new();
        let cancel = Signal::new();
        let tuning = StabilizerTuning {
            min_emit_interval_s: 0.0,
            ..Default::default()
        };
        let mut listener = AdvertisementListener::new(tuning, None);

        for grams in [66_000, 67_000] {
            transport.try_push_event(BleEvent::Advertisement(scale_advertisement(
                ADDR,
                advertisement_frame(MAC, grams, 300),
            )));
        }
        cancel.signal(());

        let mut calls = 0;
        block_on(listener.run(&transport, ScanStrategy::default(), &cancel, |_| {
            calls += 1;
            anyhow::bail!("sink closed")
        }))
        .unwrap();

        assert_eq!(calls, 2);
    }
}
