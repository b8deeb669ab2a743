//! Heart Rate and Battery characteristic decoding
//!
//! Heart Rate Measurement (`0x2A37`) layout:
//!
//! ```text
//! byte 0      flags
//!   bit 0     value format: 0 = u8 at offset 1, 1 = u16 little-endian at offset 1
//!   bit 1     sensor contact detected (meaningful only when bit 2 is set)
//!   bit 2     sensor contact feature supported
//! byte 1..    heart-rate value, then optional fields this driver ignores
//! ```
//!
//! Battery Level (`0x2A19`) is a single unsigned byte, 0-100.

use crate::error::{HramError, Result};
use crate::model::HeartRateSample;

const FLAG_VALUE_FORMAT_U16: u8 = 0x01;
const FLAG_SENSOR_CONTACT_DETECTED: u8 = 0x02;
const FLAG_SENSOR_CONTACT_SUPPORTED: u8 = 0x04;

const OFFSET_FLAGS: usize = 0;
const OFFSET_HEART_RATE_VALUE: usize = 1;

/// Decode a Heart Rate Measurement notification
///
/// Sensors that do not advertise the contact feature are reported as in
/// contact, so their readings are never hidden.
pub fn parse_heart_rate(data: &[u8]) -> Result<HeartRateSample> {
    let flags = *data.get(OFFSET_FLAGS).ok_or_else(|| {
        HramError::malformed("heart_rate_measurement", "empty payload")
    })?;

    let bpm = if flags & FLAG_VALUE_FORMAT_U16 == 0 {
        let value = data.get(OFFSET_HEART_RATE_VALUE).ok_or_else(|| {
            HramError::malformed(
                "heart_rate_measurement",
                format!("u8 format needs 2 bytes, got {}", data.len()),
            )
        })?;
        u16::from(*value)
    } else {
        let value = data
            .get(OFFSET_HEART_RATE_VALUE..OFFSET_HEART_RATE_VALUE + 2)
            .ok_or_else(|| {
                HramError::malformed(
                    "heart_rate_measurement",
                    format!("u16 format needs 3 bytes, got {}", data.len()),
                )
            })?;
        u16::from_le_bytes([value[0], value[1]])
    };

    let sensor_contact_supported = flags & FLAG_SENSOR_CONTACT_SUPPORTED != 0;
    let contact_detected = if sensor_contact_supported {
        flags & FLAG_SENSOR_CONTACT_DETECTED != 0
    } else {
        true
    };

    Ok(HeartRateSample {
        bpm,
        sensor_contact_supported,
        contact_detected,
    })
}

/// Decode a Battery Level payload
pub fn parse_battery_level(data: &[u8]) -> Result<u8> {
    data.first()
        .copied()
        .ok_or_else(|| HramError::malformed("battery_level", "empty payload"))
}

/// Decode a Manufacturer Name String payload
///
/// Some sensors pad the string with NUL bytes; those are dropped.
pub fn parse_manufacturer_name(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}
