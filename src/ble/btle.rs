//! btleplug backed BLE central
//!
//! Uses the first adapter reported by the platform manager. Discovered
//! peripherals are remembered by address so [`BleCentral::connect`] can reach
//! them again from a plain [`DeviceDescriptor`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use uuid::Uuid;

use crate::ble::guard::LinkGuard;
use crate::ble::traits::{
    AdvertisementStream, BleCentral, BlePeripheral, CharacteristicInfo, DeviceDescriptor,
    ServiceInfo,
};
use crate::config::GattProfile;
use crate::error::{BridgeError, Result};
use crate::transport::ChunkStream;

type PeripheralCache = Arc<Mutex<HashMap<String, Peripheral>>>;

fn adapter_error(context: &str, err: btleplug::Error) -> BridgeError {
    BridgeError::AdapterUnavailable(format!("{context}: {err}"))
}

fn link_error(context: &str, err: btleplug::Error) -> BridgeError {
    BridgeError::TransportClosed(format!("{context}: {err}"))
}

/// Identifier used as [`DeviceDescriptor::address`]
///
/// The hardware address where the platform exposes one, the platform
/// peripheral id otherwise (macOS reports an all-zero address).
fn address_of(peripheral: &Peripheral, reported: btleplug::api::BDAddr) -> String {
    if reported.into_inner() == [0u8; 6] {
        format!("{:?}", peripheral.id())
    } else {
        reported.to_string()
    }
}

/// Describe a peripheral if it advertises a name
async fn describe(peripheral: &Peripheral) -> Option<DeviceDescriptor> {
    let props = peripheral.properties().await.ok()??;
    let name = props.local_name?;
    Some(DeviceDescriptor {
        name,
        address: address_of(peripheral, props.address),
    })
}

/// BLE central on the first system adapter
pub struct BtleCentral {
    adapter: Adapter,
    known: PeripheralCache,
}

impl BtleCentral {
    /// Open the first Bluetooth adapter on the system.
    pub async fn first_adapter() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| adapter_error("bluetooth manager", e))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| adapter_error("listing adapters", e))?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::AdapterUnavailable("no bluetooth adapters found".into()))?;

        Ok(Self {
            adapter,
            known: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn lookup(&self, device: &DeviceDescriptor) -> Result<Peripheral> {
        self.known
            .lock()
            .ok()
            .and_then(|known| known.get(&device.address).cloned())
            .ok_or_else(|| {
                BridgeError::AdapterUnavailable(format!(
                    "device {} [{}] has not been seen by this adapter",
                    device.name, device.address
                ))
            })
    }
}

#[async_trait]
impl BleCentral for BtleCentral {
    async fn start_scan(&self) -> Result<AdvertisementStream> {
        // Subscribe to events before scanning so no discovery is missed
        let events = self
            .adapter
            .events()
            .await
            .map_err(|e| adapter_error("adapter events", e))?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| adapter_error("start scan", e))?;

        // Peripherals the platform already knows about come first
        let cached = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| adapter_error("listing peripherals", e))?;

        let adapter = self.adapter.clone();
        let discovered = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        adapter.peripheral(&id).await.ok()
                    }
                    _ => None,
                }
            }
        });

        let known = self.known.clone();
        let devices = stream::iter(cached)
            .chain(discovered)
            .filter_map(move |peripheral| {
                let known = known.clone();
                async move {
                    let device = describe(&peripheral).await?;
                    if let Ok(mut known) = known.lock() {
                        known.insert(device.address.clone(), peripheral);
                    }
                    Some(device)
                }
            });

        Ok(devices.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| adapter_error("stop scan", e))
    }

    async fn connect(
        &self,
        device: &DeviceDescriptor,
        profile: &GattProfile,
    ) -> Result<Box<dyn BlePeripheral>> {
        // Armed before the link exists so an abandoned connect still disconnects
        let guard = LinkGuard::new(self.lookup(device)?, release_link);

        debug!("BLE: connecting to {} [{}]", device.name, device.address);
        guard
            .link()
            .connect()
            .await
            .map_err(|e| adapter_error("connect", e))?;

        let (notify, write) = match resolve_characteristics(guard.link(), profile).await {
            Ok(chars) => chars,
            Err(e) => {
                let peripheral = guard.disarm();
                if let Err(err) = peripheral.disconnect().await {
                    warn!("BLE: disconnect after failed discovery: {}", err);
                }
                return Err(e);
            }
        };

        let write_type = if write.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        Ok(Box::new(BtlePeripheral {
            adapter: self.adapter.clone(),
            peripheral: guard.disarm(),
            notify,
            write,
            write_type,
        }))
    }

    async fn services(&self, device: &DeviceDescriptor) -> Result<Vec<ServiceInfo>> {
        let guard = LinkGuard::new(self.lookup(device)?, release_link);

        guard
            .link()
            .connect()
            .await
            .map_err(|e| adapter_error("connect", e))?;
        let discovered = guard.link().discover_services().await;

        let peripheral = guard.disarm();
        let services = peripheral
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        properties: format!("{:?}", c.properties),
                    })
                    .collect(),
            })
            .collect();

        if let Err(err) = peripheral.disconnect().await {
            warn!("BLE: disconnect after inspection: {}", err);
        }
        discovered.map_err(|e| link_error("service discovery", e))?;

        Ok(services)
    }
}

/// Background disconnect for a link whose setup was abandoned
fn release_link(peripheral: Peripheral) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Err(err) = peripheral.disconnect().await {
            debug!("BLE: disconnect of abandoned link: {}", err);
        }
    })
}

/// Discover services and pick out the profile's notify and write characteristics
async fn resolve_characteristics(
    peripheral: &Peripheral,
    profile: &GattProfile,
) -> Result<(Characteristic, Characteristic)> {
    peripheral
        .discover_services()
        .await
        .map_err(|e| link_error("service discovery", e))?;

    let characteristics = peripheral.characteristics();
    let find = |uuid: Uuid| {
        characteristics
            .iter()
            .find(|c| c.uuid == uuid && profile.service.map_or(true, |s| c.service_uuid == s))
            .cloned()
            .ok_or(BridgeError::CharacteristicNotFound(uuid))
    };

    Ok((find(profile.notify)?, find(profile.write)?))
}

/// Connected btleplug peripheral
struct BtlePeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
    notify: Characteristic,
    write: Characteristic,
    write_type: WriteType,
}

#[async_trait]
impl BlePeripheral for BtlePeripheral {
    async fn subscribe(&self) -> Result<ChunkStream> {
        // Open the notification stream before enabling notifications
        let notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| link_error("notification stream", e))?;
        let events = self
            .adapter
            .events()
            .await
            .map_err(|e| adapter_error("adapter events", e))?;
        self.peripheral
            .subscribe(&self.notify)
            .await
            .map_err(|e| link_error("subscribe", e))?;

        let uuid = self.notify.uuid;
        let data = notifications
            .filter_map(move |n| async move { (n.uuid == uuid).then(|| Ok(n.value)) })
            .chain(stream::once(async {
                Err(BridgeError::TransportClosed("notification stream ended".into()))
            }));

        // The notification stream does not end on every platform when the
        // link drops, so watch the adapter for our disconnect as well
        let id = self.peripheral.id();
        let lost = events.filter_map(move |event| {
            let id = id.clone();
            async move {
                match event {
                    CentralEvent::DeviceDisconnected(gone) if gone == id => Some(Err(
                        BridgeError::TransportClosed("peripheral disconnected".into()),
                    )),
                    _ => None,
                }
            }
        });

        Ok(stream::select(data, lost).boxed())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.peripheral
            .unsubscribe(&self.notify)
            .await
            .map_err(|e| link_error("unsubscribe", e))
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.write, data, self.write_type)
            .await
            .map_err(|e| link_error("characteristic write", e))
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| link_error("disconnect", e))
    }
}
