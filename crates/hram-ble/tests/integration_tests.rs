//! Integration tests for the heart-rate driver
//!
//! These tests verify end-to-end behavior through the public API:
//! - Scan, connect and stream through the device repository
//! - Reconnection after link loss, radio power cycles and user disconnects
//! - Degraded sensors (no battery service, failing notification streams)
//! - Configuration driving supervision timing

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use hram_ble::gatt::{BATTERY_SERVICE, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
use hram_ble::platform::{AdvertisementStream, CharacteristicStream};
use hram_ble::{
    Advertisement, Central, CharacteristicRef, ConnectObserver, ConnectionManager, DataCombiner,
    Device, DeviceRepository, HramConfig, HramConfigBuilder, HramError, Identifier, LinkState,
    Notification, Peripheral, PeripheralHandle, ScanObserver, SimCentral, VERSION,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

// ============================================================================
// Mock Infrastructure for Integration Testing
// ============================================================================

/// Sensor exposing only the Heart Rate service, fed from a channel
#[derive(Debug)]
struct HeartRateOnlyStrap {
    identifier: Identifier,
    state: watch::Sender<LinkState>,
    values: Mutex<Option<mpsc::UnboundedReceiver<hram_ble::Result<Bytes>>>>,
}

impl HeartRateOnlyStrap {
    fn new(identifier: &str) -> (Arc<Self>, mpsc::UnboundedSender<hram_ble::Result<Bytes>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let strap = Arc::new(Self {
            identifier: Identifier::from(identifier),
            state: watch::Sender::new(LinkState::Disconnected),
            values: Mutex::new(Some(rx)),
        });
        (strap, tx)
    }
}

#[async_trait]
impl Peripheral for HeartRateOnlyStrap {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    fn name(&self) -> Option<String> {
        Some("Legacy Strap".to_string())
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    async fn connect(&self) -> hram_ble::Result<()> {
        self.state.send_replace(LinkState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> hram_ble::Result<()> {
        self.state.send_replace(LinkState::Disconnected);
        Ok(())
    }

    async fn read(&self, characteristic: CharacteristicRef) -> hram_ble::Result<Bytes> {
        Err(HramError::CharacteristicNotFound(characteristic.characteristic))
    }

    async fn observe(
        &self,
        characteristic: CharacteristicRef,
    ) -> hram_ble::Result<CharacteristicStream> {
        if characteristic.service == BATTERY_SERVICE {
            return Err(HramError::CharacteristicNotFound(characteristic.characteristic));
        }
        assert_eq!(characteristic.characteristic, HEART_RATE_MEASUREMENT);
        let rx = self
            .values
            .lock()
            .take()
            .ok_or_else(|| HramError::Transport("already observed".to_string()))?;
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        })
        .boxed())
    }
}

/// Central that always advertises one fixed peripheral
struct FixedCentral {
    radio: watch::Sender<bool>,
    peripheral: PeripheralHandle,
}

#[async_trait]
impl Central for FixedCentral {
    fn radio(&self) -> watch::Receiver<bool> {
        self.radio.subscribe()
    }

    async fn advertisements(&self, service: uuid::Uuid) -> hram_ble::Result<AdvertisementStream> {
        assert_eq!(service, HEART_RATE_SERVICE);
        let advertisement = Advertisement::new(self.peripheral.identifier().clone(), None);
        Ok(stream::iter(vec![Ok(advertisement)])
            .chain(stream::pending())
            .boxed())
    }

    async fn peripheral(&self, _advertisement: &Advertisement) -> hram_ble::Result<PeripheralHandle> {
        Ok(self.peripheral.clone())
    }
}

#[derive(Default)]
struct ScanLog {
    latest: Mutex<Vec<Device>>,
    completed: Mutex<bool>,
}

impl ScanObserver for ScanLog {
    fn on_update(&self, devices: &[Device]) {
        *self.latest.lock() = devices.to_vec();
    }

    fn on_complete(&self) {
        *self.completed.lock() = true;
    }
}

#[derive(Default)]
struct ConnectLog {
    connected: Mutex<Vec<Device>>,
    errors: Mutex<Vec<&'static str>>,
}

impl ConnectObserver for ConnectLog {
    fn on_connected(&self, device: &Device) {
        self.connected.lock().push(device.clone());
    }

    fn on_error(&self, error: &HramError) {
        self.errors.lock().push(error.error_code());
    }
}

async fn next_populated(notifications: &mut hram_ble::NotificationStream) -> Notification {
    loop {
        let notification = tokio::time::timeout(Duration::from_secs(30), notifications.next())
            .await
            .expect("timed out waiting for a notification")
            .expect("notification stream ended");
        if !notification.is_empty() {
            return notification;
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hram_ble=debug")
        .with_test_writer()
        .try_init();
}

// ============================================================================
// End-to-End Session Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scan_connect_and_stream() {
    let central = Arc::new(SimCentral::new());
    let strap = central.add_sensor("C0:FF:EE:00:00:01", Some("Polar H10"));
    strap.set_manufacturer(Some("Polar Electro Oy"));
    central.add_sensor("C0:FF:EE:00:00:02", Some("Wahoo TICKR"));

    let repository = DeviceRepository::new(central.clone(), &HramConfig::default());
    let scan = Arc::new(ScanLog::default());
    repository.scan(scan.clone());
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(*scan.completed.lock());
    let found = scan.latest.lock().clone();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].name, "Polar H10");

    let mut notifications = repository.listen();
    let connect = Arc::new(ConnectLog::default());
    repository.connect(&found[0], connect.clone());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let connected = connect.connected.lock().clone();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].manufacturer.as_deref(), Some("Polar Electro Oy"));

    strap.push_battery(87);
    strap.push_heart_rate_raw(vec![0x07, 0x4C, 0x00]);
    let notification = next_populated(&mut notifications).await;
    let sample = notification.heart_rate.unwrap();
    assert_eq!(sample.bpm, 76);
    assert!(sample.sensor_contact_supported);
    assert_eq!(notification.battery_level, 87);

    repository.release().await;
    assert_eq!(central.stats().open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_and_recovery() {
    init_tracing();
    let central = Arc::new(SimCentral::new());
    let strap = central.add_sensor("AA", Some("Strap"));
    let repository = DeviceRepository::new(central.clone(), &HramConfig::default());
    let mut notifications = repository.listen();

    let connect = Arc::new(ConnectLog::default());
    repository.connect(
        &Device::from_advertisement(&Advertisement::new("AA", None)),
        connect.clone(),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    strap.push_heart_rate(70);
    assert_eq!(next_populated(&mut notifications).await.heart_rate.unwrap().bpm, 70);

    strap.drop_link();
    let lost = notifications.next().await.unwrap();
    assert!(lost.is_empty());

    // Debounce, scan and reconnect on the same identifier
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(strap.link_state(), LinkState::Connected);
    strap.push_heart_rate(72);
    assert_eq!(next_populated(&mut notifications).await.heart_rate.unwrap().bpm, 72);

    assert_eq!(connect.connected.lock().len(), 1);
    assert_eq!(central.stats().max_open_links(), 1);
    assert!(connect.errors.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_radio_power_cycle() {
    init_tracing();
    let central = Arc::new(SimCentral::new());
    let strap = central.add_sensor("AA", None);
    let manager = ConnectionManager::new(central.clone(), &HramConfig::default());

    let mut devices = manager.connect_to_device("AA").await;
    devices.next().await.unwrap().unwrap();

    central.set_radio(false);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(central.stats().connects(), 1);
    assert_eq!(strap.link_state(), LinkState::Disconnected);

    central.set_radio(true);
    let device = tokio::time::timeout(Duration::from_secs(5), devices.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(device.identifier.as_str(), "AA");
    assert_eq!(central.stats().connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_retry_delay() {
    let central = Arc::new(SimCentral::new());
    let strap = central.add_sensor("AA", None);
    strap.fail_next_connects(100);
    let manager = ConnectionManager::new(central.clone(), &HramConfig::default());

    let mut devices = manager.connect_to_device("AA").await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(central.stats().connects(), 1);

    manager.disconnect().await;
    assert!(devices.next().await.is_none());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(central.stats().connects(), 1);
    assert_eq!(central.stats().open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_flapping_link_does_not_reconnect() {
    let central = Arc::new(SimCentral::new());
    let strap = central.add_sensor("AA", None);
    let manager = ConnectionManager::new(central.clone(), &HramConfig::default());
    let mut notifications = DataCombiner::new().listen(manager.on_connected());

    let mut devices = manager.connect_to_device("AA").await;
    devices.next().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    strap.push_heart_rate(70);
    assert_eq!(next_populated(&mut notifications).await.heart_rate.unwrap().bpm, 70);

    for _ in 0..5 {
        strap.set_link_state(LinkState::Disconnected);
        tokio::time::sleep(Duration::from_millis(100)).await;
        strap.set_link_state(LinkState::Connected);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(central.stats().connects(), 1);

    // Data keeps flowing on the link that came back
    strap.push_heart_rate(80);
    let notification = next_populated(&mut notifications).await;
    assert_eq!(notification.heart_rate.unwrap().bpm, 80);
    assert!(notification.is_connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_connect_closes_link() {
    let central = Arc::new(SimCentral::new());
    let strap = central.add_sensor("AA", None);
    strap.set_connect_delay(Duration::from_secs(1));
    let repository = DeviceRepository::new(central.clone(), &HramConfig::default());

    repository.connect(
        &Device::from_advertisement(&Advertisement::new("AA", None)),
        Arc::new(ConnectLog::default()),
    );
    tokio::time::sleep(Duration::from_millis(1500)).await;
    repository.disconnect().await;

    assert_eq!(strap.link_state(), LinkState::Disconnected);
    assert_eq!(central.stats().open_links(), 0);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(central.stats().connects(), 1);
    assert_eq!(central.stats().open_links(), 0);
}

// ============================================================================
// Degraded Sensor Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_sensor_without_battery_service() {
    let (strap, values) = HeartRateOnlyStrap::new("LEGACY");
    let central = Arc::new(FixedCentral {
        radio: watch::Sender::new(true),
        peripheral: strap.clone(),
    });
    let manager = ConnectionManager::new(central, &HramConfig::default());
    let mut notifications = DataCombiner::new().listen(manager.on_connected());

    let mut devices = manager.connect_to_device("LEGACY").await;
    let device = devices.next().await.unwrap().unwrap();
    assert_eq!(device.name, "Legacy Strap");
    assert_eq!(device.manufacturer, None);

    tokio::time::sleep(Duration::from_millis(10)).await;
    values.send(Ok(Bytes::from_static(&[0x00, 58]))).unwrap();
    let notification = next_populated(&mut notifications).await;
    assert_eq!(notification.heart_rate.unwrap().bpm, 58);
    assert_eq!(notification.battery_level, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_idles_until_switch() {
    let (strap, values) = HeartRateOnlyStrap::new("LEGACY");
    let connected: watch::Sender<Option<PeripheralHandle>> = watch::Sender::new(None);
    strap.connect().await.unwrap();
    let mut notifications = DataCombiner::new().listen(connected.subscribe());
    assert!(notifications.next().await.unwrap().is_empty());

    connected.send_replace(Some(strap.clone()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    values.send(Ok(Bytes::from_static(&[0x00, 61]))).unwrap();
    assert_eq!(next_populated(&mut notifications).await.heart_rate.unwrap().bpm, 61);

    values
        .send(Err(HramError::Transport("GATT error 133".to_string())))
        .unwrap();
    assert!(notifications.next().await.unwrap().is_empty());

    // Later values on the failed stream are not combined
    let _ = values.send(Ok(Bytes::from_static(&[0x00, 62])));
    tokio::time::sleep(Duration::from_millis(10)).await;
    let pending = tokio::time::timeout(Duration::from_millis(100), notifications.next()).await;
    assert!(pending.is_err());
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_config_controls_retry_timing() {
    let config = HramConfig::from_json_str(
        r#"{ "reconnect": { "max_attempts": 2, "retry_delay": "100ms", "scan_timeout": "1s" } }"#,
    )
    .unwrap();
    let central = Arc::new(SimCentral::new());
    let strap = central.add_sensor("AA", None);
    strap.fail_next_connects(5);
    let manager = ConnectionManager::new(central.clone(), &config);

    let started = tokio::time::Instant::now();
    let mut devices = manager.connect_to_device("AA").await;
    let err = devices.next().await.unwrap().unwrap_err();
    assert!(err.is_reconnectable());
    assert_eq!(central.stats().connects(), 3);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_short_debounce_reconnects_sooner() {
    let config = HramConfigBuilder::new()
        .debounce(Duration::from_millis(50))
        .build();
    let central = Arc::new(SimCentral::new());
    let strap = central.add_sensor("AA", None);
    let manager = ConnectionManager::new(central.clone(), &config);

    let mut devices = manager.connect_to_device("AA").await;
    devices.next().await.unwrap().unwrap();

    strap.drop_link();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(central.stats().connects(), 2);
}

#[test]
fn test_version() {
    assert!(!VERSION.is_empty());
}
