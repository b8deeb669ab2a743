//! In-memory radio simulation
//!
//! [`SimCentral`] and [`SimPeripheral`] implement the platform traits
//! without hardware. Tests and the CLI `--simulate` mode drive them by
//! dropping links, toggling the radio, and pushing characteristic values.
//!
//! Simulated time runs on the tokio clock, so paused-clock tests
//! stay deterministic.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::{HramError, Result};
use crate::gatt::{self, CharacteristicRef};
use crate::model::{Advertisement, ConnectingPhase, Identifier, LinkState};
use crate::platform::{AdvertisementStream, Central, CharacteristicStream, Peripheral, PeripheralHandle};

/// Interval between repeated advertisements of one sensor
pub const DEFAULT_ADVERTISING_INTERVAL: Duration = Duration::from_millis(100);

/// Counters shared by a central and its peripherals
#[derive(Debug, Default)]
pub struct SimStats {
    scans: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    open_links: AtomicUsize,
    max_open_links: AtomicUsize,
}

impl SimStats {
    /// Scans started
    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Connect calls across all peripherals, failed ones included
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Disconnect calls across all peripherals
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Links currently open
    pub fn open_links(&self) -> usize {
        self.open_links.load(Ordering::SeqCst)
    }

    /// Highest number of links open at the same time
    pub fn max_open_links(&self) -> usize {
        self.max_open_links.load(Ordering::SeqCst)
    }

    fn link_opened(&self) {
        let open = self.open_links.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_links.fetch_max(open, Ordering::SeqCst);
    }

    fn link_closed(&self) {
        let _ = self
            .open_links
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| open.checked_sub(1));
    }
}

/// Simulated adapter
pub struct SimCentral {
    radio: watch::Sender<bool>,
    sensors: Arc<Mutex<Vec<Arc<SimPeripheral>>>>,
    stats: Arc<SimStats>,
    interval: Duration,
    fail_scans: Mutex<Option<String>>,
}

impl fmt::Debug for SimCentral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCentral")
            .field("radio", &*self.radio.borrow())
            .field("sensors", &self.sensors.lock().len())
            .finish()
    }
}

impl Default for SimCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCentral {
    /// Powered-on adapter with no sensors in range
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_ADVERTISING_INTERVAL)
    }

    /// Adapter whose sensors repeat their advertisement every `interval`
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            radio: watch::Sender::new(true),
            sensors: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(SimStats::default()),
            interval,
            fail_scans: Mutex::new(None),
        }
    }

    /// Put a heart-rate sensor in range, advertising
    pub fn add_sensor(&self, identifier: impl Into<Identifier>, name: Option<&str>) -> Arc<SimPeripheral> {
        let sensor = Arc::new(SimPeripheral::new(
            identifier.into(),
            name.map(str::to_string),
            self.radio.subscribe(),
            self.stats.clone(),
        ));
        self.sensors.lock().push(sensor.clone());
        sensor
    }

    /// Look up a sensor by address
    pub fn sensor(&self, identifier: &Identifier) -> Option<Arc<SimPeripheral>> {
        self.sensors
            .lock()
            .iter()
            .find(|sensor| sensor.identifier == *identifier)
            .cloned()
    }

    /// Power the radio on or off
    ///
    /// Turning the radio off drops every open link.
    pub fn set_radio(&self, on: bool) {
        debug!("Simulated radio {}", if on { "on" } else { "off" });
        self.radio.send_replace(on);
        if !on {
            for sensor in self.sensors.lock().iter() {
                sensor.drop_link();
            }
        }
    }

    /// Make every following scan fail with an unmet requirement
    pub fn fail_scans(&self, reason: Option<&str>) {
        *self.fail_scans.lock() = reason.map(str::to_string);
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<SimStats> {
        self.stats.clone()
    }

    fn visible(&self, service: Uuid) -> Vec<Advertisement> {
        if !*self.radio.borrow() {
            return Vec::new();
        }
        visible(&self.sensors.lock(), service)
    }
}

fn visible(sensors: &[Arc<SimPeripheral>], service: Uuid) -> Vec<Advertisement> {
    sensors
        .iter()
        .filter(|sensor| sensor.is_advertising() && sensor.services.contains(&service))
        .map(|sensor| sensor.advertisement())
        .collect()
}

#[async_trait]
impl Central for SimCentral {
    fn radio(&self) -> watch::Receiver<bool> {
        self.radio.subscribe()
    }

    async fn advertisements(&self, service: Uuid) -> Result<AdvertisementStream> {
        if let Some(reason) = self.fail_scans.lock().clone() {
            return Err(HramError::UnmetRequirement(reason));
        }
        self.stats.scans.fetch_add(1, Ordering::SeqCst);

        let sensors = self.sensors.clone();
        let radio = self.radio.subscribe();
        let interval = self.interval;

        let rounds = stream::unfold(VecDeque::new(), move |mut pending| {
            let sensors = sensors.clone();
            let radio = radio.clone();
            async move {
                loop {
                    if let Some(advertisement) = pending.pop_front() {
                        return Some((Ok(advertisement), pending));
                    }
                    tokio::time::sleep(interval).await;
                    if *radio.borrow() {
                        pending.extend(visible(&sensors.lock(), service));
                    }
                }
            }
        });

        // First round goes out immediately
        let initial = stream::iter(self.visible(service).into_iter().map(Ok));
        Ok(initial.chain(rounds).boxed())
    }

    async fn peripheral(&self, advertisement: &Advertisement) -> Result<PeripheralHandle> {
        let sensor: PeripheralHandle = self.sensor(&advertisement.identifier).ok_or_else(|| {
            HramError::DeviceNotConnected(format!("{} is not in range", advertisement.identifier))
        })?;
        Ok(sensor)
    }
}

/// Simulated heart-rate sensor
pub struct SimPeripheral {
    identifier: Identifier,
    name: Option<String>,
    services: Vec<Uuid>,
    manufacturer: Mutex<Option<String>>,
    radio: watch::Receiver<bool>,
    state: watch::Sender<LinkState>,
    linked: AtomicBool,
    advertising: AtomicBool,
    connect_failures: AtomicU32,
    connect_delay: Mutex<Duration>,
    battery: Mutex<Bytes>,
    notifications: broadcast::Sender<(Uuid, Bytes)>,
    stats: Arc<SimStats>,
}

impl fmt::Debug for SimPeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimPeripheral")
            .field("identifier", &self.identifier)
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SimPeripheral {
    fn new(
        identifier: Identifier,
        name: Option<String>,
        radio: watch::Receiver<bool>,
        stats: Arc<SimStats>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            identifier,
            name,
            services: vec![
                gatt::HEART_RATE_SERVICE,
                gatt::BATTERY_SERVICE,
                gatt::DEVICE_INFORMATION_SERVICE,
            ],
            manufacturer: Mutex::new(None),
            radio,
            state: watch::Sender::new(LinkState::Disconnected),
            linked: AtomicBool::new(false),
            advertising: AtomicBool::new(true),
            connect_failures: AtomicU32::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            battery: Mutex::new(Bytes::from_static(&[100])),
            notifications,
            stats,
        }
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            identifier: self.identifier.clone(),
            name: self.name.clone(),
            rssi: Some(-60),
        }
    }

    /// Whether scans currently see this sensor
    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    /// Start or stop advertising
    pub fn set_advertising(&self, advertising: bool) {
        self.advertising.store(advertising, Ordering::SeqCst);
    }

    /// Expose a Device Information manufacturer name
    pub fn set_manufacturer(&self, manufacturer: Option<&str>) {
        *self.manufacturer.lock() = manufacturer.map(str::to_string);
    }

    /// Fail the next `count` connect calls
    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Time spent in each connecting phase
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Current link state
    pub fn link_state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Force a link state without touching link accounting
    ///
    /// Used to reproduce flapping links and stray state reports.
    pub fn set_link_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    /// Lose the link as if the sensor went out of range
    pub fn drop_link(&self) {
        if self.linked.swap(false, Ordering::SeqCst) {
            debug!("Simulated link lost: {}", self.identifier);
            self.stats.link_closed();
        }
        self.state.send_replace(LinkState::Disconnected);
    }

    /// Send a raw heart-rate measurement notification
    pub fn push_heart_rate_raw(&self, payload: impl Into<Bytes>) {
        let _ = self
            .notifications
            .send((gatt::HEART_RATE_MEASUREMENT, payload.into()));
    }

    /// Send a u8-format heart-rate measurement with contact detected
    pub fn push_heart_rate(&self, bpm: u8) {
        self.push_heart_rate_raw(vec![0x06, bpm]);
    }

    /// Update the battery level and notify it
    pub fn push_battery(&self, level: u8) {
        let payload = Bytes::from(vec![level]);
        *self.battery.lock() = payload.clone();
        let _ = self.notifications.send((gatt::BATTERY_LEVEL, payload));
    }

    /// Emit a heart-rate sample every `interval` while the link is up
    ///
    /// The rate sweeps between 60 and 90 bpm.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let sensor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut step: u8 = 0;
            loop {
                ticker.tick().await;
                if sensor.link_state().is_connected() {
                    let offset = if step < 30 { step } else { 60 - step };
                    sensor.push_heart_rate(60 + offset);
                    step = (step + 1) % 60;
                }
            }
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.link_state().is_connected() {
            Ok(())
        } else {
            Err(HramError::NotConnected(self.identifier.to_string()))
        }
    }

    fn exposes(&self, characteristic: CharacteristicRef) -> Result<()> {
        if self.services.contains(&characteristic.service) {
            Ok(())
        } else {
            Err(HramError::CharacteristicNotFound(characteristic.characteristic))
        }
    }
}

#[async_trait]
impl Peripheral for SimPeripheral {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    async fn connect(&self) -> Result<()> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        if !*self.radio.borrow() {
            return Err(HramError::NotConnected("radio is off".to_string()));
        }
        if self.link_state().is_connected() {
            return Ok(());
        }

        let delay = *self.connect_delay.lock();
        self.state
            .send_replace(LinkState::Connecting(ConnectingPhase::Link));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            self.state.send_replace(LinkState::Disconnected);
            return Err(HramError::NotConnected(format!(
                "{} refused the connection",
                self.identifier
            )));
        }

        self.state
            .send_replace(LinkState::Connecting(ConnectingPhase::Services));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !self.linked.swap(true, Ordering::SeqCst) {
            self.stats.link_opened();
        }
        self.state.send_replace(LinkState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.link_state() != LinkState::Disconnected {
            self.state.send_replace(LinkState::Disconnecting);
        }
        self.drop_link();
        Ok(())
    }

    async fn read(&self, characteristic: CharacteristicRef) -> Result<Bytes> {
        self.ensure_connected()?;
        self.exposes(characteristic)?;
        match characteristic.characteristic {
            gatt::BATTERY_LEVEL => Ok(self.battery.lock().clone()),
            gatt::MANUFACTURER_NAME => self
                .manufacturer
                .lock()
                .as_ref()
                .map(|name| Bytes::from(name.clone().into_bytes()))
                .ok_or(HramError::CharacteristicNotFound(characteristic.characteristic)),
            other => Err(HramError::CharacteristicNotFound(other)),
        }
    }

    async fn observe(&self, characteristic: CharacteristicRef) -> Result<CharacteristicStream> {
        self.ensure_connected()?;
        self.exposes(characteristic)?;

        let uuid = characteristic.characteristic;
        let receiver = self.notifications.subscribe();
        let state = self.state.subscribe();

        let values = stream::unfold((receiver, state), move |(mut receiver, mut state)| async move {
            loop {
                if !state.borrow_and_update().is_connected() {
                    return None;
                }
                tokio::select! {
                    changed = state.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                    received = receiver.recv() => match received {
                        Ok((from, value)) if from == uuid => {
                            return Some((Ok(value), (receiver, state)));
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                }
            }
        });

        Ok(values.boxed())
    }
}
