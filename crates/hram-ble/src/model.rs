//! Domain values shared by every component
//!
//! All of these are plain immutable values. The only stateful objects in
//! the driver are the peripheral handles behind [`crate::platform`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque platform address of a peripheral
///
/// A MAC address on Linux and Windows, a CoreBluetooth UUID on macOS. It is
/// the join key between scan results, connections and reconnections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    /// Wrap a platform address
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the address string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One advertisement seen during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertiser address
    pub identifier: Identifier,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Received signal strength in dBm, if the platform reports it
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Create an advertisement without signal strength
    pub fn new(identifier: impl Into<Identifier>, name: Option<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name,
            rssi: None,
        }
    }
}

/// A heart-rate sensor as presented to the application
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    /// Display name
    pub name: String,
    /// Platform address
    pub identifier: Identifier,
    /// Manufacturer name from Device Information, when it could be read
    pub manufacturer: Option<String>,
}

impl Device {
    /// Build a device from a scan result
    ///
    /// Advertisements without a local name get an empty display name.
    pub fn from_advertisement(advertisement: &Advertisement) -> Self {
        Self {
            name: advertisement.name.clone().unwrap_or_default(),
            identifier: advertisement.identifier.clone(),
            manufacturer: None,
        }
    }
}

/// Sub-phase of an in-progress connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectingPhase {
    /// Establishing the radio link
    Link,
    /// Discovering GATT services
    Services,
    /// Enabling notifications
    Observes,
}

/// Link state of one peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// No link
    Disconnected,
    /// Connection handshake in progress
    Connecting(ConnectingPhase),
    /// Link up and usable
    Connected,
    /// Link being torn down
    Disconnecting,
}

impl LinkState {
    /// True only for a fully established link
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }

    /// True while the link is up or still being set up
    ///
    /// Every connecting sub-phase counts, so a link is never taken for
    /// dropped in the middle of a handshake.
    pub fn is_connecting_or_connected(&self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Connecting(_))
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting(ConnectingPhase::Link) => write!(f, "connecting"),
            LinkState::Connecting(ConnectingPhase::Services) => write!(f, "connecting (services)"),
            LinkState::Connecting(ConnectingPhase::Observes) => write!(f, "connecting (observes)"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Decoded heart-rate measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Beats per minute
    pub bpm: u16,
    /// The sensor reports whether it touches skin
    pub sensor_contact_supported: bool,
    /// Skin contact currently detected
    pub contact_detected: bool,
}

/// Unified record published to the application
///
/// [`Notification::EMPTY`] means "no information yet" (or link lost), never
/// "zero heart rate".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Latest heart-rate sample
    pub heart_rate: Option<HeartRateSample>,
    /// Latest battery level in percent
    pub battery_level: u8,
    /// Whether the link was up when this was produced
    pub is_connected: bool,
    /// Milliseconds since the producing stream started
    pub elapsed_time_ms: u64,
}

impl Notification {
    /// Initial value and link-lost marker
    pub const EMPTY: Notification = Notification {
        heart_rate: None,
        battery_level: 0,
        is_connected: false,
        elapsed_time_ms: 0,
    };

    /// True when this is [`Notification::EMPTY`]
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::EMPTY
    }
}
