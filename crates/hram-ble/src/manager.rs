//! Connection manager
//!
//! Runs one connection session at a time. A session connects to a device by
//! identifier, then keeps it connected:
//!
//! ```text
//!  connect_to_device ──► attempt ──ok──► emit Device ──► wait for tracker
//!                          ▲   │                              │
//!                          │   └─reconnectable, budget left   │ link lost
//!                          │       (sleep retry_delay) ──┐    │
//!                          └─────────────────────────────┴────┘
//! ```
//!
//! Each attempt stops the tracker, closes any old link, scans for the
//! identifier, connects, restarts the tracker and reads device info. The retry
//! budget covers the whole session unless
//! [`ReconnectConfig::replenish_after_success`] is set. A stop request ends
//! the session without an error.

use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HramConfig;
use crate::config::ReconnectConfig;
use crate::connector::Connector;
use crate::error::{HramError, Result};
use crate::model::{Advertisement, Device, Identifier};
use crate::platform::{AdvertisementStream, Central, PeripheralHandle};
use crate::scanner::Scanner;
use crate::tracker::ConnectionTracker;

const SESSION_CHANNEL_CAPACITY: usize = 8;

struct Session {
    id: u64,
    task: JoinHandle<()>,
}

struct ManagerInner {
    scanner: Scanner,
    connector: Connector,
    tracker: ConnectionTracker,
    reconnect: ReconnectConfig,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
    // Cleanup started by a dropped DeviceStream
    teardown: Mutex<Option<JoinHandle<()>>>,
}

/// Coordinates scanning, connecting and reconnecting
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager on `central`
    pub fn new(central: Arc<dyn Central>, config: &HramConfig) -> Self {
        let tracker = ConnectionTracker::new(central.radio(), &config.tracker);
        Self {
            inner: Arc::new(ManagerInner {
                scanner: Scanner::new(central.clone()),
                connector: Connector::new(central),
                tracker,
                reconnect: config.reconnect.clone(),
                session: Mutex::new(None),
                next_session: AtomicU64::new(1),
                teardown: Mutex::new(None),
            }),
        }
    }

    /// Advertisements from heart-rate sensors
    pub fn scan_hr_devices(&self) -> AdvertisementStream {
        self.inner.scanner.discover()
    }

    /// Observe the connected peripheral
    pub fn on_connected(&self) -> watch::Receiver<Option<PeripheralHandle>> {
        self.inner.connector.connected()
    }

    /// Observe radio power
    pub fn radio(&self) -> watch::Receiver<bool> {
        self.inner.tracker.radio()
    }

    /// The link tracker for this manager
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.inner.tracker
    }

    /// Start a session for `identifier`, replacing any running one
    ///
    /// The returned stream yields the device after every successful
    /// (re)connection and ends when the session ends. A terminal failure is
    /// yielded as the last item. Dropping the stream ends the session and
    /// closes its link.
    pub async fn connect_to_device(&self, identifier: impl Into<Identifier>) -> DeviceStream {
        let identifier = identifier.into();
        self.inner.finish_teardown().await;
        self.inner.end_session().await;
        self.inner.tracker.reset();

        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        info!(session = id, "Starting connection session for {}", identifier);
        let task = tokio::spawn(supervise(self.inner.clone(), identifier, tx));
        *self.inner.session.lock() = Some(Session { id, task });

        DeviceStream {
            rx,
            inner: self.inner.clone(),
            session: id,
        }
    }

    /// Stop reconnecting and close the link
    pub async fn disconnect(&self) {
        info!("Disconnect requested");
        self.inner.tracker.request_stop();
        self.inner.finish_teardown().await;
        self.inner.end_session().await;
        self.inner.connector.disconnect().await;
        self.inner.tracker.stop_tracking();
    }

    /// True while a session is running
    pub fn is_session_active(&self) -> bool {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|session| !session.task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.inner.session.lock().take() {
            session.task.abort();
        }
        self.inner.tracker.stop_tracking();
    }
}

impl ManagerInner {
    async fn end_session(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            debug!(session = session.id, "Ending connection session");
            session.task.abort();
            let _ = session.task.await;
        }
    }

    async fn finish_teardown(&self) {
        let teardown = self.teardown.lock().take();
        if let Some(teardown) = teardown {
            let _ = teardown.await;
        }
    }

    async fn attempt(&self, identifier: &Identifier) -> Result<Device> {
        self.tracker.stop_tracking();
        self.connector.disconnect().await;

        let advertisement: Advertisement = self
            .scanner
            .discover_identifier(identifier, self.reconnect.scan_timeout)
            .await?;
        let peripheral = self.connector.connect(&advertisement).await?;
        self.tracker.start_tracking(peripheral.clone());

        Ok(self.connector.device_info(&peripheral).await)
    }
}

async fn supervise(
    inner: Arc<ManagerInner>,
    identifier: Identifier,
    tx: mpsc::Sender<Result<Device>>,
) {
    let max_attempts = inner.reconnect.max_attempts;
    let mut retries_left = max_attempts;
    let mut wait_for_tracker = false;

    loop {
        if wait_for_tracker {
            match inner.tracker.next_reconnect_request().await {
                Ok(()) => info!("Reconnecting to {}", identifier),
                Err(HramError::DisconnectRequested) => {
                    info!("Session for {} stopped on request", identifier);
                    break;
                }
                Err(e) => {
                    error!("Session for {} cannot reconnect: {}", identifier, e);
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }

        match inner.attempt(&identifier).await {
            Ok(device) => {
                if inner.reconnect.replenish_after_success {
                    retries_left = max_attempts;
                }
                wait_for_tracker = true;
                if tx.send(Ok(device)).await.is_err() {
                    debug!("Session for {} has no listener", identifier);
                    break;
                }
            }
            Err(e) if e.is_reconnectable() && retries_left > 0 => {
                retries_left -= 1;
                warn!(
                    error_code = e.error_code(),
                    "Connecting to {} failed: {}, retrying in {:?} ({} left)",
                    identifier,
                    e,
                    inner.reconnect.retry_delay,
                    retries_left
                );
                wait_for_tracker = false;
                tokio::time::sleep(inner.reconnect.retry_delay).await;
            }
            Err(e) => {
                error!(
                    error_code = e.error_code(),
                    "Connecting to {} failed: {}", identifier, e
                );
                inner.tracker.stop_tracking();
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

/// Devices produced by one connection session
///
/// Dropping the stream ends the session and closes its link.
pub struct DeviceStream {
    rx: mpsc::Receiver<Result<Device>>,
    inner: Arc<ManagerInner>,
    session: u64,
}

impl DeviceStream {
    /// Next device, or `None` once the session ended
    pub async fn recv(&mut self) -> Option<Result<Device>> {
        self.rx.recv().await
    }
}

impl Stream for DeviceStream {
    type Item = Result<Device>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        let mut current = self.inner.session.lock();
        if current.as_ref().map(|s| s.id) != Some(self.session) {
            return;
        }
        let Some(session) = current.take() else {
            return;
        };
        drop(current);

        session.task.abort();
        let inner = self.inner.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            inner.tracker.stop_tracking();
            return;
        };
        debug!(session = session.id, "Connection session dropped");
        let teardown = runtime.spawn(async move {
            let _ = session.task.await;
            inner.tracker.stop_tracking();
            inner.connector.disconnect().await;
        });
        *self.inner.teardown.lock() = Some(teardown);
    }
}
