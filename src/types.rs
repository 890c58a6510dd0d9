use embassy_time::Instant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const WEIGHT_KEY: &str = "weight";
pub const IMPEDANCE_KEY: &str = "impedance";

/// Length of a colon-separated MAC string, e.g. `AA:BB:CC:DD:EE:FF`
pub const MAC_STRING_LEN: usize = 17;

pub type MacString = heapless::String<MAC_STRING_LEN>;

/// Display unit as reported by (and written to) the scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum WeightUnit {
    #[default]
    Kg = 0,
    Lb = 1,
    St = 2,
}

impl WeightUnit {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(WeightUnit::Kg),
            1 => Some(WeightUnit::Lb),
            2 => Some(WeightUnit::St),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    /// Row index into the per-sex coefficient tables
    pub fn index(self) -> usize {
        match self {
            Sex::Male => 0,
            Sex::Female => 1,
        }
    }
}

/// Raw fields decoded from a single GATT or advertisement frame.
/// Zero weight and zero impedance are reported by the scale as "no value"
/// and are therefore `None` here.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSample {
    pub weight_kg: Option<f64>,
    pub impedance_ohm: Option<u16>,
    pub display_unit: Option<u8>,
    pub mac_in_frame: Option<MacString>,
}

/// Reading delivered to the caller, one per accepted measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleReading {
    pub name: String,
    pub address: String,
    pub hw_version: String,
    pub sw_version: String,
    pub display_unit: WeightUnit,
    pub measurements: BTreeMap<String, f64>,
}

impl ScaleReading {
    pub fn weight_kg(&self) -> Option<f64> {
        self.measurements.get(WEIGHT_KEY).copied()
    }

    pub fn impedance_ohm(&self) -> Option<u16> {
        self.measurements.get(IMPEDANCE_KEY).map(|&z| z as u16)
    }
}

/// Weight sample that passed the advertisement stability gate
#[derive(Debug, Clone, PartialEq)]
pub struct AdvReading {
    pub address: String,
    pub mac_in_frame: Option<MacString>,
    pub rssi: Option<i16>,
    pub weight_kg: f64,
    pub impedance_ohm: Option<u16>,
    pub stable: bool,
    pub timestamp: Instant,
    pub raw_hex: String,
}

impl AdvReading {
    pub const DEVICE_NAME: &'static str = "Etekcity Scale (ADV)";

    /// Canonical reading for the advertisement path. Hardware and software
    /// revisions are not broadcast, so both stay empty.
    pub fn to_scale_reading(&self, display_unit: WeightUnit) -> ScaleReading {
        let address = if self.address.is_empty() {
            self.mac_in_frame
                .as_ref()
                .map(|mac| mac.to_string())
                .unwrap_or_default()
        } else {
            self.address.clone()
        };

        let mut measurements = BTreeMap::new();
        measurements.insert(WEIGHT_KEY.to_string(), self.weight_kg);
        if let Some(impedance) = self.impedance_ohm.filter(|&z| z > 0) {
            measurements.insert(IMPEDANCE_KEY.to_string(), f64::from(impedance));
        }

        ScaleReading {
            name: Self::DEVICE_NAME.to_string(),
            address,
            hw_version: String::new(),
            sw_version: String::new(),
            display_unit,
            measurements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_unit_bytes() {
        assert_eq!(WeightUnit::from_byte(1), Some(WeightUnit::Lb));
        assert_eq!(WeightUnit::from_byte(3), None);
        assert_eq!(WeightUnit::St.as_byte(), 2);
    }

    #[test]
    fn test_adv_reading_builds_measurements() {
        let mut mac = MacString::new();
        mac.push_str("AA:BB:CC:DD:EE:FF").unwrap();
        let reading = AdvReading {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            mac_in_frame: Some(mac),
            rssi: Some(-60),
            weight_kg: 70.123,
            impedance_ohm: Some(500),
            stable: true,
            timestamp: Instant::from_millis(0),
            raw_hex: "aaaa".to_string(),
        };

        let data = reading.to_scale_reading(WeightUnit::Kg);
        assert_eq!(data.weight_kg(), Some(70.123));
        assert_eq!(data.impedance_ohm(), Some(500));
        assert_eq!(data.display_unit, WeightUnit::Kg);
        assert_eq!(data.name, AdvReading::DEVICE_NAME);
        assert!(data.hw_version.is_empty());
    }

    #[test]
    fn test_adv_reading_falls_back_to_frame_mac() {
        let mut mac = MacString::new();
        mac.push_str("11:22:33:44:55:66").unwrap();
        let reading = AdvReading {
            address: String::new(),
            mac_in_frame: Some(mac),
            rssi: None,
            weight_kg: 10.0,
            impedance_ohm: Some(0),
            stable: false,
            timestamp: Instant::from_millis(0),
            raw_hex: String::new(),
        };

        let data = reading.to_scale_reading(WeightUnit::Lb);
        assert_eq!(data.address, "11:22:33:44:55:66");
        assert!(!data.measurements.contains_key(IMPEDANCE_KEY));
    }
}
