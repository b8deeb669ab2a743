//! Supervised BLE Heart Rate client
//!
//! This crate finds Bluetooth Low Energy heart-rate sensors, connects to one,
//! keeps the link alive across drops, and publishes decoded heart-rate and
//! battery readings as a single stream.
//!
//! # Architecture
//!
//! The driver is layered bottom-up:
//!
//! 1. **Platform** - [`Central`] and [`Peripheral`] traits over the radio
//!    stack, with an in-memory [`sim`] backend and an optional btleplug one
//! 2. **Protocol** - GATT identifiers ([`gatt`]) and payload decoding
//!    ([`decoder`])
//! 3. **Link control** - [`Scanner`], [`Connector`] and [`ConnectionTracker`]
//! 4. **Supervision** - [`ConnectionManager`] runs one connect/reconnect
//!    session at a time with a bounded retry budget
//! 5. **Data** - [`DataCombiner`] merges heart rate, battery and link state
//!    into [`Notification`]s
//! 6. **Facade** - [`DeviceRepository`] exposes scan/connect/listen with
//!    observer callbacks
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use hram_ble::{DeviceRepository, HramConfig, SimCentral};
//!
//! #[tokio::main]
//! async fn main() {
//!     let central = Arc::new(SimCentral::new());
//!     let sensor = central.add_sensor("C0:FF:EE:00:00:01", Some("Strap"));
//!     sensor.spawn_heartbeat(std::time::Duration::from_secs(1));
//!
//!     let repository = DeviceRepository::new(central, &HramConfig::default());
//!     let mut notifications = repository.listen();
//!     repository.connect(&device, observer);
//!
//!     while let Some(notification) = notifications.next().await {
//!         println!("{:?}", notification.heart_rate);
//!     }
//! }
//! ```
//!
//! # Features
//!
//! - `platform` - btleplug adapter backend (requires `libdbus-1-dev` on Linux)
//!
//! # Reconnection
//!
//! A session that loses its link waits for the tracker: the link must stay
//! down for the debounce window (500ms by default) with the radio on. The
//! session then scans for the same identifier and connects again. Failed
//! attempts are retried up to 3 times per session, 2s apart.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod model;

// Protocol
pub mod decoder;
pub mod gatt;

// Platform abstraction
pub mod platform;
pub mod sim;

// Link control
pub mod connector;
pub mod scanner;
pub mod slot;
pub mod tracker;

// Supervision and data
pub mod combiner;
pub mod manager;
pub mod repository;

// Re-exports for convenience
pub use config::{HramConfig, HramConfigBuilder, ReconnectConfig, ScanConfig, TrackerConfig};
pub use error::{HramError, Result};
pub use model::{
    Advertisement, ConnectingPhase, Device, HeartRateSample, Identifier, LinkState, Notification,
};

pub use decoder::{parse_battery_level, parse_heart_rate, parse_manufacturer_name};
pub use gatt::CharacteristicRef;

pub use platform::{Central, Peripheral, PeripheralHandle};
#[cfg(feature = "platform")]
pub use platform::{BtleplugCentral, BtleplugPeripheral};
pub use sim::{SimCentral, SimPeripheral, SimStats};

pub use connector::Connector;
pub use scanner::Scanner;
pub use tracker::ConnectionTracker;

pub use combiner::{DataCombiner, NotificationStream};
pub use manager::{ConnectionManager, DeviceStream};
pub use repository::{ConnectObserver, DeviceRepository, ScanObserver};

// Timing constants re-exports
pub use config::{
    DEFAULT_DEBOUNCE_MS, DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RETRY_DELAY_MS,
    DEFAULT_SCAN_DURATION_MS,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
