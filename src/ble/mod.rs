//! Bluetooth Low Energy module
//!
//! Provides the BLE central capability used by discovery and the bridge:
//! scanning by name, connecting, subscribing to the notify characteristic
//! and writing to the write characteristic (Nordic UART Service by default).

pub mod btle;
mod guard;
pub mod traits;

pub use btle::BtleCentral;
pub use traits::{
    AdvertisementStream, BleCentral, BlePeripheral, CharacteristicInfo, DeviceDescriptor,
    ServiceInfo,
};
