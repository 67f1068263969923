//! BLE capability traits for abstraction and testability
//!
//! These traits describe the narrow slice of a BLE central the bridge needs,
//! allowing the btleplug backed implementation to be swapped with a mock for
//! testing.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::config::GattProfile;
use crate::error::Result;
use crate::transport::ChunkStream;

/// A named peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    /// Advertised local name
    pub name: String,
    /// Opaque identifier used to connect
    pub address: String,
}

/// Stream of named devices in the order the adapter reports them
///
/// A device may appear more than once (advertisement updates).
pub type AdvertisementStream = BoxStream<'static, DeviceDescriptor>;

/// GATT service summary used by `inspect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// GATT characteristic summary used by `inspect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    /// Human readable property flags (read, write, notify, ...)
    pub properties: String,
}

/// The scanning and connecting half of a BLE stack
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Start scanning and stream named devices as they are discovered
    ///
    /// Fails with `AdapterUnavailable` if the stack cannot scan.
    async fn start_scan(&self) -> Result<AdvertisementStream>;

    /// Stop a scan started with [`BleCentral::start_scan`]
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a previously discovered device and resolve the profile's characteristics
    async fn connect(
        &self,
        device: &DeviceDescriptor,
        profile: &GattProfile,
    ) -> Result<Box<dyn BlePeripheral>>;

    /// Connect, enumerate the device's services, then disconnect
    async fn services(&self, device: &DeviceDescriptor) -> Result<Vec<ServiceInfo>>;
}

/// A connected peripheral with its notify and write characteristics resolved
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Subscribe to the notify characteristic
    ///
    /// Each notification is one chunk. A link loss surfaces as an error item.
    async fn subscribe(&self) -> Result<ChunkStream>;

    /// Unsubscribe from the notify characteristic
    async fn unsubscribe(&self) -> Result<()>;

    /// Write one segment to the write characteristic
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Drop the connection
    async fn disconnect(&self) -> Result<()>;
}
