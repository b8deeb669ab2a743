//! Data combiner
//!
//! Turns the connected-peripheral cell into one stream of [`Notification`]s.
//! Whenever the cell changes, the sources of the previous peripheral are
//! dropped and the new one's are opened:
//!
//! - heart rate: measurement notifications, decoded
//! - battery: one read, then battery notifications
//! - link state
//!
//! Sources are opened while the link is `Connected` and reopened when the
//! same peripheral's link comes back.
//!
//! A populated notification goes out on every source change once both a
//! heart-rate sample and a battery level are known. While the link is not
//! connected only [`Notification::EMPTY`] is produced, and consecutive
//! EMPTYs are collapsed.

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::decoder::{parse_battery_level, parse_heart_rate};
use crate::error::{HramError, Result};
use crate::gatt::{BATTERY_LEVEL_CHAR, HEART_RATE_CHAR};
use crate::model::{HeartRateSample, LinkState, Notification};
use crate::platform::PeripheralHandle;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 32;

/// Builds notification streams
#[derive(Debug, Clone)]
pub struct DataCombiner {
    origin: Instant,
}

impl Default for DataCombiner {
    fn default() -> Self {
        Self::new()
    }
}

impl DataCombiner {
    /// Combiner whose timestamps count from now
    pub fn new() -> Self {
        Self::with_origin(Instant::now())
    }

    /// Combiner whose timestamps count from `origin`
    pub fn with_origin(origin: Instant) -> Self {
        Self { origin }
    }

    /// Notifications for whatever peripheral `connected` holds
    ///
    /// The first item is always [`Notification::EMPTY`].
    pub fn listen(
        &self,
        connected: watch::Receiver<Option<PeripheralHandle>>,
    ) -> NotificationStream {
        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let task = tokio::spawn(follow_connected(connected, self.origin, Emitter::new(tx)));
        NotificationStream { rx, task }
    }
}

/// Stream returned by [`DataCombiner::listen`]
///
/// Dropping it releases all characteristic subscriptions.
pub struct NotificationStream {
    rx: mpsc::Receiver<Notification>,
    task: JoinHandle<()>,
}

impl NotificationStream {
    /// Next notification, or `None` once the connector is gone
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Stream for NotificationStream {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Emitter {
    tx: mpsc::Sender<Notification>,
    last_empty: bool,
}

impl Emitter {
    fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self {
            tx,
            last_empty: false,
        }
    }

    /// Returns false once nobody listens
    async fn emit(&mut self, notification: Notification) -> bool {
        let empty = notification.is_empty();
        if empty && self.last_empty {
            return true;
        }
        self.last_empty = empty;
        self.tx.send(notification).await.is_ok()
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn follow_connected(
    mut connected: watch::Receiver<Option<PeripheralHandle>>,
    origin: Instant,
    mut emitter: Emitter,
) {
    if !emitter.emit(Notification::EMPTY).await {
        return;
    }

    loop {
        let current = connected.borrow_and_update().clone();
        let Some(peripheral) = current else {
            if !emitter.emit(Notification::EMPTY).await || connected.changed().await.is_err() {
                break;
            }
            continue;
        };
        debug!("Combining data from {}", peripheral.identifier());

        let switched = tokio::select! {
            biased;
            changed = connected.changed() => Some(changed.is_ok()),
            _ = combine(peripheral, origin, &mut emitter) => None,
        };
        match switched {
            Some(true) => continue,
            Some(false) => break,
            // Sources ended; idle until the next peripheral
            None => {
                if emitter.is_closed() || connected.changed().await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Data combiner stopped");
}

/// Combine the sources of one peripheral until a transport failure
///
/// Sources are opened each time the link reaches `Connected` and dropped when
/// it leaves it, so a link that comes back on the same handle keeps
/// producing data.
async fn combine(peripheral: PeripheralHandle, origin: Instant, emitter: &mut Emitter) {
    let mut state = peripheral.state();
    loop {
        if !wait_connected(&mut state, emitter).await {
            return;
        }
        match stream_sources(&peripheral, &mut state, origin, emitter).await {
            Ended::LinkDown => debug!("Link to {} down, pausing sources", peripheral.identifier()),
            Ended::Failed => return,
        }
    }
}

enum Ended {
    LinkDown,
    Failed,
}

/// Emit EMPTY until the link is connected; false once it never will be
async fn wait_connected(state: &mut watch::Receiver<LinkState>, emitter: &mut Emitter) -> bool {
    loop {
        if state.borrow_and_update().is_connected() {
            return true;
        }
        if !emitter.emit(Notification::EMPTY).await || state.changed().await.is_err() {
            return false;
        }
    }
}

async fn stream_sources(
    peripheral: &PeripheralHandle,
    state: &mut watch::Receiver<LinkState>,
    origin: Instant,
    emitter: &mut Emitter,
) -> Ended {
    let identifier = peripheral.identifier().clone();

    let mut heart_rate = match peripheral.observe(HEART_RATE_CHAR).await {
        Ok(values) => values,
        Err(_) if link_down(state) => return Ended::LinkDown,
        Err(e) => {
            warn!("Heart rate of {} unavailable: {}", identifier, e);
            emitter.emit(Notification::EMPTY).await;
            return Ended::Failed;
        }
    };
    let mut battery = battery_values(peripheral.clone()).await;

    let mut sample: Option<HeartRateSample> = None;
    let mut battery_level: Option<u8> = None;
    let mut battery_open = true;

    loop {
        // Link first, then battery, so a fresh level is in place before the
        // heart-rate sample that follows it
        tokio::select! {
            biased;
            changed = state.changed() => {
                if changed.is_err() {
                    debug!("Link state of {} no longer reported", identifier);
                    emitter.emit(Notification::EMPTY).await;
                    return Ended::Failed;
                }
                if link_down(state) {
                    emitter.emit(Notification::EMPTY).await;
                    return Ended::LinkDown;
                }
                continue;
            }
            value = battery.next(), if battery_open => match value {
                Some(Ok(payload)) => match parse_battery_level(&payload) {
                    Ok(level) => battery_level = Some(level),
                    Err(e) => {
                        warn!("Dropping battery level from {}: {}", identifier, e);
                        continue;
                    }
                },
                Some(Err(HramError::CharacteristicNotFound(_))) => {
                    debug!("{} has no battery service", identifier);
                    battery_level.get_or_insert(0);
                }
                Some(Err(_)) | None if link_down(state) => {
                    emitter.emit(Notification::EMPTY).await;
                    return Ended::LinkDown;
                }
                Some(Err(e)) => {
                    warn!("Battery stream of {} failed: {}", identifier, e);
                    emitter.emit(Notification::EMPTY).await;
                    return Ended::Failed;
                }
                None => battery_open = false,
            },
            value = heart_rate.next() => match value {
                Some(Ok(payload)) => match parse_heart_rate(&payload) {
                    Ok(decoded) => sample = Some(decoded),
                    Err(e) => {
                        warn!("Dropping heart rate sample from {}: {}", identifier, e);
                        continue;
                    }
                },
                _ if link_down(state) => {
                    emitter.emit(Notification::EMPTY).await;
                    return Ended::LinkDown;
                }
                Some(Err(e)) => {
                    warn!("Heart rate stream of {} failed: {}", identifier, e);
                    emitter.emit(Notification::EMPTY).await;
                    return Ended::Failed;
                }
                None => {
                    debug!("Heart rate stream of {} ended", identifier);
                    emitter.emit(Notification::EMPTY).await;
                    return Ended::Failed;
                }
            },
        }

        if let Some(notification) = snapshot(LinkState::Connected, sample, battery_level, origin) {
            if !emitter.emit(notification).await {
                return Ended::Failed;
            }
        }
    }
}

/// One battery read followed by battery notifications
async fn battery_values(peripheral: PeripheralHandle) -> BoxStream<'static, Result<bytes::Bytes>> {
    let notifications = match peripheral.observe(BATTERY_LEVEL_CHAR).await {
        Ok(values) => values,
        Err(e) => {
            debug!(
                "Battery notifications of {} unavailable: {}",
                peripheral.identifier(),
                e
            );
            stream::empty().boxed()
        }
    };
    let initial = stream::once(async move { peripheral.read(BATTERY_LEVEL_CHAR).await });
    initial.chain(notifications).boxed()
}

fn link_down(state: &watch::Receiver<LinkState>) -> bool {
    !state.borrow().is_connected()
}

fn snapshot(
    link: LinkState,
    sample: Option<HeartRateSample>,
    battery_level: Option<u8>,
    origin: Instant,
) -> Option<Notification> {
    if !link.is_connected() {
        return Some(Notification::EMPTY);
    }
    let (sample, battery_level) = (sample?, battery_level?);
    Some(Notification {
        heart_rate: Some(sample),
        battery_level,
        is_connected: true,
        elapsed_time_ms: origin.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Peripheral;
    use crate::sim::{SimCentral, SimPeripheral};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        _central: SimCentral,
        sensor: Arc<SimPeripheral>,
        connected: watch::Sender<Option<PeripheralHandle>>,
    }

    async fn fixture() -> Fixture {
        let central = SimCentral::new();
        let sensor = central.add_sensor("AA", Some("Strap"));
        sensor.connect().await.unwrap();
        Fixture {
            _central: central,
            sensor,
            connected: watch::Sender::new(None),
        }
    }

    async fn next(stream: &mut NotificationStream) -> Notification {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("notification")
            .expect("stream open")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_item_is_empty() {
        let fixture = fixture().await;
        let mut stream = DataCombiner::new().listen(fixture.connected.subscribe());
        assert!(next(&mut stream).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_combines_heart_rate_and_battery() {
        let fixture = fixture().await;
        fixture.sensor.push_battery(87);
        let combiner = DataCombiner::new();
        let mut stream = combiner.listen(fixture.connected.subscribe());
        assert!(next(&mut stream).await.is_empty());

        fixture.connected.send_replace(Some(fixture.sensor.clone()));
        settle().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        fixture.sensor.push_heart_rate_raw(vec![0x00, 75]);

        let notification = next(&mut stream).await;
        let sample = notification.heart_rate.unwrap();
        assert_eq!(sample.bpm, 75);
        assert!(sample.contact_detected);
        assert_eq!(notification.battery_level, 87);
        assert!(notification.is_connected);
        assert!(notification.elapsed_time_ms >= 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_change_republishes() {
        let fixture = fixture().await;
        let mut stream = DataCombiner::new().listen(fixture.connected.subscribe());
        next(&mut stream).await;

        fixture.connected.send_replace(Some(fixture.sensor.clone()));
        settle().await;
        fixture.sensor.push_heart_rate(80);
        assert_eq!(next(&mut stream).await.battery_level, 100);

        fixture.sensor.push_battery(55);
        let notification = next(&mut stream).await;
        assert_eq!(notification.battery_level, 55);
        assert_eq!(notification.heart_rate.unwrap().bpm, 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_sample_is_dropped() {
        let fixture = fixture().await;
        let mut stream = DataCombiner::new().listen(fixture.connected.subscribe());
        next(&mut stream).await;

        fixture.connected.send_replace(Some(fixture.sensor.clone()));
        settle().await;
        fixture.sensor.push_heart_rate_raw(vec![0x01, 0x4C]);
        fixture.sensor.push_heart_rate(64);

        let notification = next(&mut stream).await;
        assert_eq!(notification.heart_rate.unwrap().bpm, 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_emits_single_empty() {
        let fixture = fixture().await;
        let mut stream = DataCombiner::new().listen(fixture.connected.subscribe());
        next(&mut stream).await;

        fixture.connected.send_replace(Some(fixture.sensor.clone()));
        settle().await;
        fixture.sensor.push_heart_rate(70);
        assert!(next(&mut stream).await.is_connected);

        fixture.sensor.drop_link();
        assert!(next(&mut stream).await.is_empty());

        // Reconnected and republished by the connector
        fixture.sensor.connect().await.unwrap();
        fixture.connected.send_replace(Some(fixture.sensor.clone()));
        settle().await;
        fixture.sensor.push_heart_rate(71);
        let notification = next(&mut stream).await;
        assert_eq!(notification.heart_rate.unwrap().bpm, 71);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_reopen_after_flap() {
        let fixture = fixture().await;
        let mut stream = DataCombiner::new().listen(fixture.connected.subscribe());
        next(&mut stream).await;

        fixture.connected.send_replace(Some(fixture.sensor.clone()));
        settle().await;
        fixture.sensor.push_heart_rate(70);
        assert_eq!(next(&mut stream).await.heart_rate.unwrap().bpm, 70);

        // Same handle, no switch in the connected cell
        fixture.sensor.set_link_state(LinkState::Disconnected);
        assert!(next(&mut stream).await.is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.sensor.set_link_state(LinkState::Connected);
        tokio::time::sleep(Duration::from_secs(2)).await;

        fixture.sensor.push_heart_rate(80);
        let notification = next(&mut stream).await;
        assert_eq!(notification.heart_rate.unwrap().bpm, 80);
        assert!(notification.is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_before_heart_rate_is_used() {
        let fixture = fixture().await;
        let mut stream = DataCombiner::new().listen(fixture.connected.subscribe());
        next(&mut stream).await;

        fixture.connected.send_replace(Some(fixture.sensor.clone()));
        settle().await;
        fixture.sensor.push_battery(87);
        fixture.sensor.push_heart_rate(75);

        let notification = next(&mut stream).await;
        assert_eq!(notification.battery_level, 87);
        assert_eq!(notification.heart_rate.unwrap().bpm, 75);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_peripherals() {
        let central = SimCentral::new();
        let first = central.add_sensor("AA", None);
        let second = central.add_sensor("BB", None);
        first.connect().await.unwrap();
        second.connect().await.unwrap();
        second.push_battery(30);

        let connected: watch::Sender<Option<PeripheralHandle>> = watch::Sender::new(None);
        let mut stream = DataCombiner::new().listen(connected.subscribe());
        next(&mut stream).await;

        connected.send_replace(Some(first.clone()));
        settle().await;
        first.push_heart_rate(90);
        assert_eq!(next(&mut stream).await.heart_rate.unwrap().bpm, 90);

        connected.send_replace(Some(second.clone()));
        settle().await;
        first.push_heart_rate(91);
        second.push_heart_rate(60);
        let notification = next(&mut stream).await;
        assert_eq!(notification.heart_rate.unwrap().bpm, 60);
        assert_eq!(notification.battery_level, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_cell_yields_empty_once() {
        let fixture = fixture().await;
        let mut stream = DataCombiner::new().listen(fixture.connected.subscribe());
        next(&mut stream).await;

        fixture.connected.send_replace(Some(fixture.sensor.clone()));
        settle().await;
        fixture.sensor.push_heart_rate(70);
        next(&mut stream).await;

        fixture.connected.send_replace(None);
        assert!(next(&mut stream).await.is_empty());
        fixture.connected.send_replace(None);
        settle().await;
        assert!(stream.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_ends_with_connector() {
        let fixture = fixture().await;
        let mut stream = DataCombiner::new().listen(fixture.connected.subscribe());
        next(&mut stream).await;
        drop(fixture);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_requires_both_values() {
        let origin = Instant::now();
        let sample = HeartRateSample {
            bpm: 70,
            sensor_contact_supported: false,
            contact_detected: true,
        };
        assert!(snapshot(LinkState::Connected, Some(sample), None, origin).is_none());
        assert!(snapshot(LinkState::Connected, None, Some(50), origin).is_none());
        assert!(snapshot(LinkState::Disconnected, Some(sample), Some(50), origin)
            .unwrap()
            .is_empty());
        let populated = snapshot(LinkState::Connected, Some(sample), Some(50), origin).unwrap();
        assert_eq!(populated.battery_level, 50);
    }
}
