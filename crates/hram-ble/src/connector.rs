//! Link establishment and the connected-peripheral cell
//!
//! The connector is the only writer of the connected-peripheral value.
//! Everything downstream (the data combiner, UI observers) reads it through
//! [`Connector::connected`].
//!
//! A peripheral whose connect is still running is held aside until it is
//! published. If the caller is cancelled mid-connect, the next
//! [`Connector::disconnect`] closes it.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::decoder::parse_manufacturer_name;
use crate::error::{HramError, Result};
use crate::gatt::MANUFACTURER_NAME_CHAR;
use crate::model::{Advertisement, Device};
use crate::platform::{Central, PeripheralHandle};

/// Opens and closes links
pub struct Connector {
    central: Arc<dyn Central>,
    connected: watch::Sender<Option<PeripheralHandle>>,
    // Link being opened, not yet published
    pending: Mutex<Option<PeripheralHandle>>,
}

impl Connector {
    /// Create a connector on `central`
    pub fn new(central: Arc<dyn Central>) -> Self {
        Self {
            central,
            connected: watch::Sender::new(None),
            pending: Mutex::new(None),
        }
    }

    /// Connect to the advertiser and publish it as the connected peripheral
    ///
    /// Platform failures are reported as [`HramError::NotConnected`] so the
    /// connection manager retries them. Missing capabilities stay fatal.
    pub async fn connect(&self, advertisement: &Advertisement) -> Result<PeripheralHandle> {
        info!("Connecting to {}", advertisement.identifier);
        let peripheral = self
            .central
            .peripheral(advertisement)
            .await
            .map_err(as_link_failure)?;

        let stale = self.pending.lock().replace(peripheral.clone());
        if let Some(stale) = stale {
            close_abandoned(stale).await;
        }
        if let Err(e) = peripheral.connect().await {
            self.pending.lock().take();
            warn!("Connection to {} failed: {}", advertisement.identifier, e);
            if let Err(cleanup) = peripheral.disconnect().await {
                debug!("Cleanup after failed connect: {}", cleanup);
            }
            return Err(as_link_failure(e));
        }

        info!("Connected to {}", advertisement.identifier);
        self.pending.lock().take();
        self.connected.send_replace(Some(peripheral.clone()));
        Ok(peripheral)
    }

    /// Close the current link and any interrupted connect; always succeeds
    pub async fn disconnect(&self) {
        let abandoned = self.pending.lock().take();
        if let Some(peripheral) = abandoned {
            close_abandoned(peripheral).await;
        }

        let current = self.connected.borrow().clone();
        if let Some(peripheral) = current {
            debug!("Disconnecting {}", peripheral.identifier());
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect of {} failed: {}", peripheral.identifier(), e);
            }
        }
        self.connected.send_if_modified(|value| value.take().is_some());
    }

    /// Observe the connected peripheral
    pub fn connected(&self) -> watch::Receiver<Option<PeripheralHandle>> {
        self.connected.subscribe()
    }

    /// The connected peripheral right now
    pub fn current(&self) -> Option<PeripheralHandle> {
        self.connected.borrow().clone()
    }

    /// Describe a connected peripheral
    ///
    /// The manufacturer name is optional: sensors without Device
    /// Information still produce a device.
    pub async fn device_info(&self, peripheral: &PeripheralHandle) -> Device {
        let identifier = peripheral.identifier().clone();
        let manufacturer = match peripheral.read(MANUFACTURER_NAME_CHAR).await {
            Ok(value) => Some(parse_manufacturer_name(&value)),
            Err(e) => {
                warn!("Manufacturer name of {} unavailable: {}", identifier, e);
                None
            }
        };
        Device {
            name: peripheral
                .name()
                .unwrap_or_else(|| identifier.to_string()),
            identifier,
            manufacturer,
        }
    }
}

async fn close_abandoned(peripheral: PeripheralHandle) {
    info!("Closing interrupted connection to {}", peripheral.identifier());
    if let Err(e) = peripheral.disconnect().await {
        warn!("Disconnect of {} failed: {}", peripheral.identifier(), e);
    }
}

fn as_link_failure(err: HramError) -> HramError {
    match err {
        HramError::NotConnected(_) | HramError::DeviceNotConnected(_) => err,
        err if err.is_fatal() => err,
        other => HramError::NotConnected(other.to_string()),
    }
}
