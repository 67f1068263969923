//! BLE side of the bridge
//!
//! Wraps a connected peripheral: the read stream is the notify
//! characteristic, writes go to the write characteristic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::ble::{BleCentral, BlePeripheral, DeviceDescriptor};
use crate::config::GattProfile;
use crate::error::{BridgeError, Result};
use crate::transport::{ChunkStream, Side, Transport};

/// Connection to one peripheral, owned by a single bridge session
pub struct BleNotifySource {
    device: DeviceDescriptor,
    peripheral: Arc<dyn BlePeripheral>,
    /// Largest segment handed to one characteristic write
    max_write_len: usize,
    stream_taken: AtomicBool,
    subscribed: AtomicBool,
    closed: AtomicBool,
}

impl BleNotifySource {
    /// Wrap an already connected peripheral.
    pub fn new(
        device: DeviceDescriptor,
        peripheral: Box<dyn BlePeripheral>,
        max_write_len: usize,
    ) -> Self {
        Self {
            device,
            peripheral: Arc::from(peripheral),
            max_write_len: max_write_len.max(1),
            stream_taken: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Connect to `device` through `central` and wrap the result.
    pub async fn connect(
        central: &dyn BleCentral,
        device: &DeviceDescriptor,
        profile: &GattProfile,
        max_write_len: usize,
    ) -> Result<Self> {
        let peripheral = central.connect(device, profile).await?;
        debug!("BLE: connected to {} [{}]", device.name, device.address);
        Ok(Self::new(device.clone(), peripheral, max_write_len))
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::TransportClosed(format!("connection to {} is closed", self.device.name))
    }
}

#[async_trait]
impl Transport for BleNotifySource {
    fn side(&self) -> Side {
        Side::Ble
    }

    async fn read_stream(&self) -> Result<ChunkStream> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if self.stream_taken.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::TransportClosed(
                "notification stream already taken".into(),
            ));
        }

        let stream = self.peripheral.subscribe().await?;
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(stream)
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        for segment in data.chunks(self.max_write_len) {
            if self.is_closed() {
                return Err(self.closed_error());
            }
            self.peripheral.write(segment).await?;
        }
        Ok(data.len())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut result = Ok(());
        if self.subscribed.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.peripheral.unsubscribe().await {
                warn!("BLE: unsubscribe from {} failed: {}", self.device.name, e);
                result = Err(e);
            }
        }
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("BLE: disconnect from {} failed: {}", self.device.name, e);
            result = result.and(Err(e));
        }

        debug!("BLE: released {} [{}]", self.device.name, self.device.address);
        result
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for BleNotifySource {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropped without close (cancelled while connecting); release in the background
        let peripheral = self.peripheral.clone();
        let subscribed = self.subscribed.swap(false, Ordering::SeqCst);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if subscribed {
                    let _ = peripheral.unsubscribe().await;
                }
                let _ = peripheral.disconnect().await;
            });
        }
    }
}
