//! GATT identifiers used by the driver
//!
//! Bluetooth SIG assigned numbers are 16-bit values placed inside the
//! Bluetooth base UUID `0000xxxx-0000-1000-8000-00805f9b34fb`.

use uuid::Uuid;

/// Bluetooth base UUID with the 16-bit slot zeroed
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a SIG 16-bit assigned number to a full UUID
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Heart Rate service (`heart_rate`)
pub const HEART_RATE_SERVICE: Uuid = sig_uuid(0x180D);
/// Heart Rate Measurement characteristic (`heart_rate_measurement`)
pub const HEART_RATE_MEASUREMENT: Uuid = sig_uuid(0x2A37);
/// Battery service (`battery_service`)
pub const BATTERY_SERVICE: Uuid = sig_uuid(0x180F);
/// Battery Level characteristic (`battery_level`)
pub const BATTERY_LEVEL: Uuid = sig_uuid(0x2A19);
/// Device Information service (`device_information`)
pub const DEVICE_INFORMATION_SERVICE: Uuid = sig_uuid(0x180A);
/// Manufacturer Name String characteristic (`manufacturer_name_string`)
pub const MANUFACTURER_NAME: Uuid = sig_uuid(0x2A29);

const SERVICES: &[(&str, Uuid)] = &[
    ("heart_rate", HEART_RATE_SERVICE),
    ("battery_service", BATTERY_SERVICE),
    ("device_information", DEVICE_INFORMATION_SERVICE),
];

const CHARACTERISTICS: &[(&str, Uuid)] = &[
    ("heart_rate_measurement", HEART_RATE_MEASUREMENT),
    ("battery_level", BATTERY_LEVEL),
    ("manufacturer_name_string", MANUFACTURER_NAME),
];

/// Resolve a SIG service name to its UUID
pub fn service(name: &str) -> Option<Uuid> {
    lookup(SERVICES, name)
}

/// Resolve a SIG characteristic name to its UUID
pub fn characteristic(name: &str) -> Option<Uuid> {
    lookup(CHARACTERISTICS, name)
}

fn lookup(table: &[(&str, Uuid)], name: &str) -> Option<Uuid> {
    table
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, uuid)| *uuid)
}

/// A characteristic addressed by its owning service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    /// Owning service UUID
    pub service: Uuid,
    /// Characteristic UUID
    pub characteristic: Uuid,
    /// SIG name, used in logs and errors
    pub name: &'static str,
}

/// Heart-rate measurement notifications
pub const HEART_RATE_CHAR: CharacteristicRef = CharacteristicRef {
    service: HEART_RATE_SERVICE,
    characteristic: HEART_RATE_MEASUREMENT,
    name: "heart_rate_measurement",
};

/// Battery level, readable and notifying
pub const BATTERY_LEVEL_CHAR: CharacteristicRef = CharacteristicRef {
    service: BATTERY_SERVICE,
    characteristic: BATTERY_LEVEL,
    name: "battery_level",
};

/// Manufacturer name from Device Information
pub const MANUFACTURER_NAME_CHAR: CharacteristicRef = CharacteristicRef {
    service: DEVICE_INFORMATION_SERVICE,
    characteristic: MANUFACTURER_NAME,
    name: "manufacturer_name_string",
};

impl std::fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.characteristic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_uuid_expansion() {
        assert_eq!(
            HEART_RATE_SERVICE.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            HEART_RATE_MEASUREMENT.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(BATTERY_LEVEL.to_string(), "00002a19-0000-1000-8000-00805f9b34fb");
        assert_eq!(
            MANUFACTURER_NAME.to_string(),
            "00002a29-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_name_lookup() {
        assert_eq!(service("heart_rate"), Some(HEART_RATE_SERVICE));
        assert_eq!(service("device_information"), Some(DEVICE_INFORMATION_SERVICE));
        assert_eq!(characteristic("battery_level"), Some(BATTERY_LEVEL));
        assert_eq!(service("cycling_power"), None);
        assert_eq!(characteristic("heart_rate"), None);
    }
}
