//! Discovery resolver
//!
//! Turns a device name filter into a [`DeviceDescriptor`] with a bounded
//! scan. A device matches when its advertised name contains the filter; the
//! first match in discovery order wins.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, warn};
use tokio::time::Instant;

use crate::ble::{BleCentral, DeviceDescriptor};
use crate::error::{BridgeError, Result};

/// Whether an advertised name satisfies the filter.
pub fn name_matches(name: &str, filter: &str) -> bool {
    name.contains(filter)
}

/// Resolves device names to descriptors through a BLE central
pub struct DiscoveryResolver {
    central: Arc<dyn BleCentral>,
}

impl DiscoveryResolver {
    pub fn new(central: Arc<dyn BleCentral>) -> Self {
        Self { central }
    }

    /// Scan for up to `timeout` and return the first device whose name contains `name_filter`.
    ///
    /// `NotFound` is only returned once the whole timeout has elapsed, even
    /// if the adapter ends the scan early.
    pub async fn find(&self, name_filter: &str, timeout: Duration) -> Result<DeviceDescriptor> {
        let deadline = Instant::now() + timeout;
        let mut adverts = self.central.start_scan().await?;
        debug!("Discovery: scanning for \"{}\" ({:?})", name_filter, timeout);

        let search = async {
            while let Some(device) = adverts.next().await {
                if name_matches(&device.name, name_filter) {
                    return Some(device);
                }
            }
            None
        };
        let found = tokio::time::timeout_at(deadline, search).await;

        drop(adverts);
        self.stop_scan().await;

        match found {
            Ok(Some(device)) => {
                debug!("Discovery: found {} [{}]", device.name, device.address);
                Ok(device)
            }
            Ok(None) => {
                tokio::time::sleep_until(deadline).await;
                Err(not_found(name_filter, timeout))
            }
            Err(_) => Err(not_found(name_filter, timeout)),
        }
    }

    /// Scan for `timeout` and return every named device seen, in first-seen order.
    pub async fn discover_all(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        let deadline = Instant::now() + timeout;
        let mut adverts = self.central.start_scan().await?;

        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        let collect = async {
            while let Some(device) = adverts.next().await {
                if seen.insert(device.address.clone()) {
                    devices.push(device);
                }
            }
        };
        let _ = tokio::time::timeout_at(deadline, collect).await;

        drop(adverts);
        self.stop_scan().await;
        Ok(devices)
    }

    async fn stop_scan(&self) {
        if let Err(e) = self.central.stop_scan().await {
            warn!("Discovery: failed to stop scan: {}", e);
        }
    }
}

fn not_found(filter: &str, timeout: Duration) -> BridgeError {
    BridgeError::NotFound {
        filter: filter.to_string(),
        timeout,
    }
}
