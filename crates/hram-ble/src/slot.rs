//! Single-slot signal cell
//!
//! Holds at most one pending value. Sending overwrites a value nobody has
//! consumed yet; receiving takes the value out.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Latest-value-wins cell with one consumer
#[derive(Debug, Default)]
pub struct Slot<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Slot<T> {
    /// Create an empty slot
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Store a value, returning the unconsumed one it replaced
    pub fn send(&self, value: T) -> Option<T> {
        let replaced = self.value.lock().replace(value);
        self.notify.notify_one();
        replaced
    }

    /// Take the pending value without waiting
    pub fn take(&self) -> Option<T> {
        self.value.lock().take()
    }

    /// Drop any pending value
    pub fn clear(&self) {
        self.value.lock().take();
    }

    /// Check for a pending value
    pub fn is_pending(&self) -> bool {
        self.value.lock().is_some()
    }

    /// Wait for and take the next value
    ///
    /// Cancel safe: a value is only removed by the poll that returns it.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(value) = self.take() {
                return value;
            }
            self.notify.notified().await;
        }
    }
}
