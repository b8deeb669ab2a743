//! btleplug backend
//!
//! Maps the driver's [`Central`] and [`Peripheral`] traits onto btleplug's
//! cross-platform adapter API (BlueZ, CoreBluetooth, WinRT).
//!
//! # Example
//!
//! ```ignore
//! use hram_ble::platform::BtleplugCentral;
//!
//! let central = BtleplugCentral::first_adapter().await?;
//! ```

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central as _, CentralEvent, CentralState, Characteristic, Manager as _,
    Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AdvertisementStream, Central, CharacteristicStream, Peripheral, PeripheralHandle};
use crate::error::{HramError, Result};
use crate::gatt::CharacteristicRef;
use crate::model::{Advertisement, ConnectingPhase, Identifier, LinkState};

/// Adapter-backed [`Central`]
pub struct BtleplugCentral {
    adapter: Adapter,
    radio: watch::Receiver<bool>,
    known: Arc<Mutex<HashMap<Identifier, PeripheralId>>>,
    events_task: JoinHandle<()>,
}

impl BtleplugCentral {
    /// Use the first adapter the platform reports
    pub async fn first_adapter() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| HramError::UnmetRequirement("no bluetooth adapter found".to_string()))?;
        Self::new(adapter).await
    }

    /// Wrap an adapter
    pub async fn new(adapter: Adapter) -> Result<Self> {
        let powered = match adapter.adapter_state().await {
            Ok(state) => matches!(state, CentralState::PoweredOn),
            Err(e) => {
                warn!("Adapter state unavailable, assuming powered on: {}", e);
                true
            }
        };
        let (radio_tx, radio) = watch::channel(powered);

        let mut events = adapter.events().await?;
        let events_task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::StateUpdate(state) = event {
                    let powered = matches!(state, CentralState::PoweredOn);
                    debug!("Adapter state changed: {:?}", state);
                    radio_tx.send_replace(powered);
                }
            }
            debug!("Adapter event stream ended");
        });

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using bluetooth adapter {}", info);
        }

        Ok(Self {
            adapter,
            radio,
            known: Arc::new(Mutex::new(HashMap::new())),
            events_task,
        })
    }

    async fn resolve(&self, identifier: &Identifier) -> Result<btleplug::platform::Peripheral> {
        let known = self.known.lock().get(identifier).cloned();
        if let Some(id) = known {
            return Ok(self.adapter.peripheral(&id).await?);
        }

        // Not seen in this process; the platform may still have it cached
        for peripheral in self.adapter.peripherals().await? {
            if identifier_for(&peripheral.id(), peripheral.address()) == *identifier {
                self.known.lock().insert(identifier.clone(), peripheral.id());
                return Ok(peripheral);
            }
        }

        Err(HramError::DeviceNotConnected(format!(
            "{} is not known to the adapter",
            identifier
        )))
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.events_task.abort();
    }
}

fn identifier_for(id: &PeripheralId, address: BDAddr) -> Identifier {
    if address == BDAddr::default() {
        // CoreBluetooth hides addresses behind per-host UUIDs
        Identifier::new(format!("{:?}", id))
    } else {
        Identifier::new(address.to_string())
    }
}

#[async_trait]
impl Central for BtleplugCentral {
    fn radio(&self) -> watch::Receiver<bool> {
        self.radio.clone()
    }

    async fn advertisements(&self, service: Uuid) -> Result<AdvertisementStream> {
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await?;
        debug!("Scan started for service {}", service);

        let guard = ScanGuard {
            adapter: self.adapter.clone(),
        };
        let adapter = self.adapter.clone();
        let known = self.known.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let known = known.clone();
            let _scan = &guard;
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(e) => return Some(Err(HramError::from(e))),
                };
                let properties = match peripheral.properties().await {
                    Ok(Some(properties)) => properties,
                    Ok(None) => return None,
                    Err(e) => return Some(Err(HramError::from(e))),
                };
                // Platforms that ignore the scan filter still report advertised services
                if !properties.services.is_empty() && !properties.services.contains(&service) {
                    return None;
                }

                let identifier = identifier_for(&id, properties.address);
                known.lock().insert(identifier.clone(), id);
                Some(Ok(Advertisement {
                    identifier,
                    name: properties.local_name,
                    rssi: properties.rssi,
                }))
            }
        });

        Ok(stream.boxed())
    }

    async fn peripheral(&self, advertisement: &Advertisement) -> Result<PeripheralHandle> {
        let peripheral = self.resolve(&advertisement.identifier).await?;
        let handle = BtleplugPeripheral::new(
            self.adapter.clone(),
            peripheral,
            advertisement.identifier.clone(),
            advertisement.name.clone(),
        )
        .await?;
        Ok(Arc::new(handle))
    }
}

/// Stops the adapter scan when the advertisement stream is dropped
struct ScanGuard {
    adapter: Adapter,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let adapter = self.adapter.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    debug!("Failed to stop scan: {}", e);
                }
            });
        }
    }
}

/// Adapter-backed [`Peripheral`]
pub struct BtleplugPeripheral {
    peripheral: btleplug::platform::Peripheral,
    identifier: Identifier,
    name: Option<String>,
    state: Arc<watch::Sender<LinkState>>,
    events_task: JoinHandle<()>,
}

impl BtleplugPeripheral {
    async fn new(
        adapter: Adapter,
        peripheral: btleplug::platform::Peripheral,
        identifier: Identifier,
        name: Option<String>,
    ) -> Result<Self> {
        let initial = if peripheral.is_connected().await? {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        let state = Arc::new(watch::Sender::new(initial));

        let mut events = adapter.events().await?;
        let id = peripheral.id();
        let device = peripheral.clone();
        let link = state.clone();
        let events_task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDisconnected(other) if other == id => {
                        link.send_replace(LinkState::Disconnected);
                    }
                    CentralEvent::DeviceConnected(other) if other == id => {
                        // connect() drives its own phases; only unsolicited links land here
                        if link.send_if_modified(begin_rediscovery) {
                            rediscover(&device, &link).await;
                        }
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            peripheral,
            identifier,
            name,
            state,
            events_task,
        })
    }

    fn find(&self, characteristic: CharacteristicRef) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid == characteristic.characteristic && c.service_uuid == characteristic.service
            })
            .ok_or(HramError::CharacteristicNotFound(characteristic.characteristic))
    }
}

/// Finish a link the platform re-established on its own
async fn rediscover(peripheral: &btleplug::platform::Peripheral, link: &watch::Sender<LinkState>) {
    let discovered = match peripheral.discover_services().await {
        Ok(()) => {
            debug!("Services rediscovered on {:?}", peripheral.id());
            true
        }
        Err(e) => {
            warn!("Service discovery after reconnect failed: {}", e);
            false
        }
    };
    link.send_if_modified(|state| finish_rediscovery(state, discovered));
}

fn begin_rediscovery(state: &mut LinkState) -> bool {
    if *state != LinkState::Disconnected {
        return false;
    }
    *state = LinkState::Connecting(ConnectingPhase::Services);
    true
}

// A disconnect may have moved the link on meanwhile
fn finish_rediscovery(state: &mut LinkState, discovered: bool) -> bool {
    if *state != LinkState::Connecting(ConnectingPhase::Services) {
        return false;
    }
    *state = if discovered {
        LinkState::Connected
    } else {
        LinkState::Disconnected
    };
    true
}

impl fmt::Debug for BtleplugPeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleplugPeripheral")
            .field("identifier", &self.identifier)
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Drop for BtleplugPeripheral {
    fn drop(&mut self) {
        self.events_task.abort();
    }
}

#[async_trait]
impl Peripheral for BtleplugPeripheral {
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
        self.state
            .send_replace(LinkState::Connecting(ConnectingPhase::Link));
        if let Err(e) = self.peripheral.connect().await {
            self.state.send_replace(LinkState::Disconnected);
            return Err(e.into());
        }

        self.state
            .send_replace(LinkState::Connecting(ConnectingPhase::Services));
        if let Err(e) = self.peripheral.discover_services().await {
            self.state.send_replace(LinkState::Disconnecting);
            let _ = self.peripheral.disconnect().await;
            self.state.send_replace(LinkState::Disconnected);
            return Err(e.into());
        }

        self.state.send_replace(LinkState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.send_replace(LinkState::Disconnecting);
        let result = self.peripheral.disconnect().await;
        self.state.send_replace(LinkState::Disconnected);
        Ok(result?)
    }

    async fn read(&self, characteristic: CharacteristicRef) -> Result<Bytes> {
        let target = self.find(characteristic)?;
        let value = self.peripheral.read(&target).await?;
        Ok(Bytes::from(value))
    }

    async fn observe(&self, characteristic: CharacteristicRef) -> Result<CharacteristicStream> {
        let target = self.find(characteristic)?;
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&target).await?;
        debug!("Subscribed to {} on {}", characteristic, self.identifier);

        let uuid = target.uuid;
        let mut state = self.state.subscribe();
        let values = notifications
            .filter(move |notification| futures::future::ready(notification.uuid == uuid))
            .map(|notification| Ok(Bytes::from(notification.value)));

        // End the stream with the link
        let link_down = async move {
            while state.borrow_and_update().is_connecting_or_connected() {
                if state.changed().await.is_err() {
                    break;
                }
            }
        };

        Ok(values.take_until(Box::pin(link_down)).boxed())
    }
}
