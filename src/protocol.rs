use crate::types::{MacString, ParsedSample, WeightUnit};
use core::fmt::Write;
use log::debug;
use uuid::Uuid;

pub const WEIGHT_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_FFF1_0000_1000_8000_00805F9B34FB);
pub const UNIT_COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_FFF2_0000_1000_8000_00805F9B34FB);
pub const HW_REVISION_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_2A27_0000_1000_8000_00805F9B34FB);
pub const SW_REVISION_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_2A28_0000_1000_8000_00805F9B34FB);

/// Etekcity / VeSync company identifier in ManufacturerData
pub const MANUFACTURER_ID: u16 = 0x06D0;
/// Service some firmwares list in their advertisements
pub const ADV_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_FFD0_0000_1000_8000_00805F9B34FB);

pub const NOTIFICATION_FRAME_LEN: usize = 22;
pub const ADVERTISEMENT_FRAME_LEN: usize = 20;

const NOTIFICATION_HEADER: [u8; 2] = [0xA5, 0x02];
const NOTIFICATION_TYPE: [u8; 2] = [0x10, 0x00];
const NOTIFICATION_MEASUREMENT: [u8; 4] = [0x01, 0x61, 0xA1, 0x00];

// Byte 5 carries (43 - unit), byte 10 the unit itself; the template is the kg form
const UNIT_UPDATE_COMMAND: [u8; 11] = [
    0xA5, 0x22, 0x01, 0x05, 0x00, 0x2B, 0x06, 0x00, 0xA0, 0x01, 0x00,
];

fn le_u24(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], 0])
}

fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Decode a weight notification from the GATT weight characteristic.
///
/// Frame layout (22 bytes):
/// `[0..2]` A5 02, `[3..5]` 10 00, `[6..10]` 01 61 A1 00,
/// `[10..13]` weight in grams (LE24), `[13..15]` impedance (LE16),
/// `[19]` stable flag, `[20]` impedance valid, `[21]` display unit.
pub fn decode_notification(data: &[u8]) -> Option<ParsedSample> {
    if data.len() != NOTIFICATION_FRAME_LEN
        || data[19] != 1
        || data[0..2] != NOTIFICATION_HEADER
        || data[3..5] != NOTIFICATION_TYPE
        || data[6..10] != NOTIFICATION_MEASUREMENT
    {
        debug!("Ignoring notification frame: {}", to_hex(data));
        return None;
    }

    let grams = le_u24(data, 10);
    let impedance = le_u16(data, 13);

    Some(ParsedSample {
        weight_kg: (grams > 0).then(|| round_to(f64::from(grams) / 1000.0, 2)),
        impedance_ohm: (data[20] == 1 && impedance != 0).then_some(impedance),
        display_unit: Some(data[21]),
        mac_in_frame: None,
    })
}

/// Decode the 20-byte ManufacturerData payload broadcast under company id 0x06D0.
///
/// `[0]` 0x01, `[1..7]` reversed MAC, `[7..10]` C0 A8 01,
/// `[10..13]` weight in grams (LE24), `[13..15]` impedance (LE16), `[15..20]` flags.
pub fn decode_advertisement(data: &[u8]) -> Option<ParsedSample> {
    if data.len() != ADVERTISEMENT_FRAME_LEN || data[0] != 0x01 {
        debug!("Ignoring advertisement payload: {}", to_hex(data));
        return None;
    }

    let mut mac = [0u8; 6];
    mac.copy_from_slice(&data[1..7]);
    mac.reverse();

    let grams = le_u24(data, 10);
    let impedance = le_u16(data, 13);

    Some(ParsedSample {
        weight_kg: (grams > 0).then(|| round_to(f64::from(grams) / 1000.0, 3)),
        impedance_ohm: (impedance != 0).then_some(impedance),
        display_unit: None,
        mac_in_frame: format_mac(&mac),
    })
}

/// Command asking the scale to switch its display unit
pub fn unit_update_command(unit: WeightUnit) -> [u8; 11] {
    let mut command = UNIT_UPDATE_COMMAND;
    command[5] = 43 - unit.as_byte();
    command[10] = unit.as_byte();
    command
}

pub fn format_mac(bytes: &[u8; 6]) -> Option<MacString> {
    let mut out = MacString::new();
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(':').ok()?;
        }
        write!(out, "{:02X}", byte).ok()?;
    }
    Some(out)
}

/// Unify `-` and `.` separators to `:` and uppercase, so addresses from
/// different platforms compare equal.
pub fn normalize_mac(address: &str) -> String {
    address.replace(['-', '.'], ":").to_uppercase()
}

pub fn to_hex(data: &[u8]) -> String {
    data.iter().fold(String::with_capacity(data.len() * 2), |mut out, byte| {
        let _ = write!(out, "{:02x}", byte);
        out
    })
}
