//! Radio abstraction the driver is written against
//!
//! Two traits separate the driver from the Bluetooth stack:
//!
//! - [`Central`] - the local adapter: radio power, advertisements, and a
//!   factory turning an advertisement into a [`Peripheral`]
//! - [`Peripheral`] - one remote device: link control, link state, and
//!   characteristic access
//!
//! Implementations:
//!
//! - [`crate::sim::SimCentral`] - in-memory simulation, always available
//! - [`btleplug::BtleplugCentral`] - real adapters (requires `platform` feature)
//!
//! # Feature Requirements
//!
//! - `platform`: Requires BlueZ development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev
//!   ```

#[cfg(feature = "platform")]
pub mod btleplug;

#[cfg(feature = "platform")]
pub use self::btleplug::{BtleplugCentral, BtleplugPeripheral};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Result;
use crate::gatt::CharacteristicRef;
use crate::model::{Advertisement, Identifier, LinkState};

/// Shared handle to a peripheral
pub type PeripheralHandle = Arc<dyn Peripheral>;

/// Stream of raw characteristic values
pub type CharacteristicStream = BoxStream<'static, Result<Bytes>>;

/// Stream of advertisements from an active scan
///
/// Dropping the stream stops the scan.
pub type AdvertisementStream = BoxStream<'static, Result<Advertisement>>;

/// One remote BLE peripheral
#[async_trait]
pub trait Peripheral: Send + Sync + fmt::Debug {
    /// Platform address
    fn identifier(&self) -> &Identifier;

    /// Name reported by the peripheral, if known
    fn name(&self) -> Option<String>;

    /// Observe link state; the current value is available immediately
    fn state(&self) -> watch::Receiver<LinkState>;

    /// Open the link and discover services
    async fn connect(&self) -> Result<()>;

    /// Close the link
    async fn disconnect(&self) -> Result<()>;

    /// Read a characteristic value once
    async fn read(&self, characteristic: CharacteristicRef) -> Result<Bytes>;

    /// Subscribe to characteristic notifications
    ///
    /// The stream ends when the link goes down.
    async fn observe(&self, characteristic: CharacteristicRef) -> Result<CharacteristicStream>;
}

/// The local Bluetooth adapter
#[async_trait]
pub trait Central: Send + Sync {
    /// Observe radio power; `true` while the radio is on
    fn radio(&self) -> watch::Receiver<bool>;

    /// Start a scan for peripherals advertising `service`
    async fn advertisements(&self, service: Uuid) -> Result<AdvertisementStream>;

    /// Build a peripheral handle for a discovered advertisement
    async fn peripheral(&self, advertisement: &Advertisement) -> Result<PeripheralHandle>;
}
