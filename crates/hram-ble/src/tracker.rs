//! Link tracking and reconnect signalling
//!
//! The tracker watches the link of the currently connected peripheral and
//! raises one reconnect request when the link has stayed down for the
//! debounce window while the radio is on. Its keep-connection signal is a
//! single conflated slot:
//!
//! - `true` - the link dropped, reconnect
//! - `false` - the user asked to stop
//!
//! A newer value overwrites an unconsumed older one, so a stop request always
//! wins over a pending reconnect.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::error::{HramError, Result};
use crate::model::Identifier;
use crate::platform::PeripheralHandle;
use crate::slot::Slot;

/// Watches one link at a time and signals when it should be re-established
pub struct ConnectionTracker {
    radio: watch::Receiver<bool>,
    keep_connection: Arc<Slot<bool>>,
    debounce: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionTracker {
    /// Create a tracker fed by the adapter's radio state
    pub fn new(radio: watch::Receiver<bool>, config: &TrackerConfig) -> Self {
        Self {
            radio,
            keep_connection: Arc::new(Slot::new()),
            debounce: config.debounce,
            task: Mutex::new(None),
        }
    }

    /// Current radio power
    pub fn is_radio_on(&self) -> bool {
        *self.radio.borrow()
    }

    /// Observe radio power
    pub fn radio(&self) -> watch::Receiver<bool> {
        self.radio.clone()
    }

    /// Start watching `peripheral`, replacing any previous watch
    pub fn start_tracking(&self, peripheral: PeripheralHandle) {
        let identifier = peripheral.identifier().clone();
        let task = tokio::spawn(track_link(
            peripheral,
            self.radio.clone(),
            self.keep_connection.clone(),
            self.debounce,
        ));
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        debug!("Tracking link to {}", identifier);
    }

    /// Stop watching; a request already raised stays pending
    pub fn stop_tracking(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// True while a watch is running and has not fired yet
    pub fn is_tracking(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Ask the session to stop instead of reconnecting
    pub fn request_stop(&self) {
        debug!("Keep-connection cleared");
        self.keep_connection.send(false);
    }

    /// Drop any pending signal
    pub fn reset(&self) {
        self.keep_connection.clear();
    }

    /// Wait until the session should reconnect
    ///
    /// Returns once a reconnect was requested and the radio is on. Fails with
    /// [`HramError::DisconnectRequested`] once a stop was requested, including
    /// one raised while waiting for the radio.
    pub async fn next_reconnect_request(&self) -> Result<()> {
        if !self.keep_connection.recv().await {
            return Err(HramError::DisconnectRequested);
        }

        let mut radio = self.radio.clone();
        if radio.has_changed().is_err() {
            return Err(radio_closed());
        }
        loop {
            if *radio.borrow_and_update() {
                return Ok(());
            }
            debug!("Reconnect pending until the radio is back on");
            tokio::select! {
                changed = radio.changed() => {
                    if changed.is_err() {
                        return Err(radio_closed());
                    }
                }
                keep = self.keep_connection.recv() => {
                    if !keep {
                        return Err(HramError::DisconnectRequested);
                    }
                }
            }
        }
    }
}

fn radio_closed() -> HramError {
    HramError::UnmetRequirement("radio state no longer reported".to_string())
}

impl Drop for ConnectionTracker {
    fn drop(&mut self) {
        self.stop_tracking();
    }
}

async fn track_link(
    peripheral: PeripheralHandle,
    mut radio: watch::Receiver<bool>,
    keep_connection: Arc<Slot<bool>>,
    debounce: Duration,
) {
    let identifier: Identifier = peripheral.identifier().clone();
    let mut state = peripheral.state();
    let mut state_closed = false;
    // Deadline of a disconnect still inside the debounce window
    let mut deadline: Option<Instant> = None;
    let mut settled = false;

    loop {
        let link = *state.borrow_and_update();
        let down = state_closed || !link.is_connecting_or_connected();

        if down {
            if !settled && deadline.is_none() {
                debug!("Link to {} is {}, waiting {:?}", identifier, link, debounce);
                deadline = Some(Instant::now() + debounce);
            }
        } else {
            deadline = None;
            settled = false;
        }

        let radio_on = *radio.borrow_and_update();
        if settled && radio_on {
            info!("Link to {} lost, requesting reconnect", identifier);
            keep_connection.send(true);
            return;
        }

        let wake_at = deadline;
        let debounce_elapsed = async move {
            match wake_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            changed = state.changed(), if !state_closed => {
                if changed.is_err() {
                    debug!("Link state of {} no longer reported", identifier);
                    state_closed = true;
                }
            }
            changed = radio.changed() => {
                if changed.is_err() {
                    warn!("Radio state no longer reported, tracking of {} stops", identifier);
                    keep_connection.send(true);
                    return;
                }
            }
            _ = debounce_elapsed => {
                deadline = None;
                settled = true;
                if !radio_on {
                    debug!("Link to {} is down while the radio is off", identifier);
                }
            }
        }
    }
}
