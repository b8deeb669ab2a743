//! Application-facing device repository
//!
//! Wraps the connection manager and data combiner behind callback-style
//! operations. Background work runs as tokio tasks owned by the repository;
//! starting a new scan or connection cancels the previous one.

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::combiner::{DataCombiner, NotificationStream};
use crate::config::HramConfig;
use crate::error::HramError;
use crate::manager::ConnectionManager;
use crate::model::{Device, Identifier};
use crate::platform::Central;

/// Receives scan progress
pub trait ScanObserver: Send + Sync {
    /// The scan started
    fn on_init(&self) {}

    /// The deduplicated device list grew
    fn on_update(&self, devices: &[Device]);

    /// The scan window elapsed or the scan failed
    fn on_complete(&self) {}

    /// The scan failed
    fn on_error(&self, _error: &HramError) {}
}

/// Receives connection progress
pub trait ConnectObserver: Send + Sync {
    /// A connection session is about to start
    fn on_init_connection(&self) {}

    /// The first connection of the session succeeded
    fn on_connected(&self, device: &Device);

    /// The session ended with an error
    fn on_error(&self, _error: &HramError) {}
}

/// Scan, connect and stream heart-rate data
pub struct DeviceRepository {
    manager: Arc<ConnectionManager>,
    combiner: DataCombiner,
    scan_duration: Duration,
    scanned: Arc<Mutex<Vec<Device>>>,
    scan_job: Mutex<Option<JoinHandle<()>>>,
    connection_job: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceRepository {
    /// Create a repository on `central`
    pub fn new(central: Arc<dyn Central>, config: &HramConfig) -> Self {
        Self {
            manager: Arc::new(ConnectionManager::new(central, config)),
            combiner: DataCombiner::new(),
            scan_duration: config.scan.duration,
            scanned: Arc::new(Mutex::new(Vec::new())),
            scan_job: Mutex::new(None),
            connection_job: Mutex::new(None),
        }
    }

    /// The underlying connection manager
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Scan for heart-rate sensors for the configured duration
    ///
    /// `on_update` receives the full list each time a new identifier shows
    /// up. A running scan is cancelled first.
    pub fn scan(&self, observer: Arc<dyn ScanObserver>) {
        self.cancel_scanning();
        self.scanned.lock().clear();

        let mut advertisements = self.manager.scan_hr_devices();
        let scanned = self.scanned.clone();
        let duration = self.scan_duration;
        observer.on_init();
        info!("Scanning for heart-rate sensors for {:?}", duration);

        let job = tokio::spawn(async move {
            let collect = async {
                let mut seen: HashSet<Identifier> = HashSet::new();
                while let Some(advertisement) = advertisements.next().await {
                    match advertisement {
                        Ok(advertisement) => {
                            if !seen.insert(advertisement.identifier.clone()) {
                                continue;
                            }
                            debug!("Found {}", advertisement.identifier);
                            let devices = {
                                let mut scanned = scanned.lock();
                                scanned.push(Device::from_advertisement(&advertisement));
                                scanned.clone()
                            };
                            observer.on_update(&devices);
                        }
                        Err(e) => {
                            warn!("Scan failed: {}", e);
                            observer.on_error(&e);
                            return;
                        }
                    }
                }
            };
            if tokio::time::timeout(duration, collect).await.is_err() {
                debug!("Scan window elapsed");
            }
            observer.on_complete();
        });
        *self.scan_job.lock() = Some(job);
    }

    /// Stop a running scan without completing it
    pub fn cancel_scanning(&self) {
        if let Some(job) = self.scan_job.lock().take() {
            job.abort();
        }
    }

    /// Devices found by the last scan, in discovery order
    pub fn scanned_devices(&self) -> Vec<Device> {
        self.scanned.lock().clone()
    }

    /// Connect to `device` and keep it connected
    ///
    /// Only the identifier is used, so a device from an earlier run works
    /// without scanning. Stops any scan and replaces any running session.
    pub fn connect(&self, device: &Device, observer: Arc<dyn ConnectObserver>) {
        self.cancel_scanning();
        self.cancel_connection();
        observer.on_init_connection();

        let manager = self.manager.clone();
        let identifier = device.identifier.clone();
        let job = tokio::spawn(async move {
            let mut devices = manager.connect_to_device(identifier.clone()).await;
            let mut first = true;
            while let Some(result) = devices.next().await {
                match result {
                    Ok(device) if first => {
                        first = false;
                        observer.on_connected(&device);
                    }
                    Ok(device) => info!("Reconnected to {}", device.identifier),
                    Err(e) => {
                        error!("Connection to {} ended: {}", identifier, e);
                        observer.on_error(&e);
                    }
                }
            }
            debug!("Connection session for {} finished", identifier);
        });
        *self.connection_job.lock() = Some(job);
    }

    /// Stop reconnecting and close the link
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
        self.cancel_connection();
    }

    /// Heart-rate data from whichever device is connected
    pub fn listen(&self) -> NotificationStream {
        self.combiner.listen(self.manager.on_connected())
    }

    /// Cancel all background work and close the link
    pub async fn release(&self) {
        self.cancel_scanning();
        self.disconnect().await;
    }

    fn cancel_connection(&self) {
        if let Some(job) = self.connection_job.lock().take() {
            job.abort();
        }
    }
}

impl Drop for DeviceRepository {
    fn drop(&mut self) {
        self.cancel_scanning();
        self.cancel_connection();
    }
}
