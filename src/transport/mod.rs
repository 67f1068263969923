//! Transport adapters
//!
//! Both ends of the bridge are exposed through the same [`Transport`] trait so
//! the bridge engine never needs to know which side is BLE and which is wire.
//!
//! - [`BleNotifySource`] - notifications in, characteristic writes out
//! - [`SerialDuplex`] - serial reads in, serial writes out

use core::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub mod ble;
pub mod serial;

pub use ble::BleNotifySource;
pub use serial::SerialDuplex;

/// Lazy sequence of received byte-chunks
///
/// Ends (or yields an error) when the underlying link goes away.
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>>>;

/// Which side of the bridge a transport represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Ble,
    Serial,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble => f.write_str("ble"),
            Self::Serial => f.write_str("serial"),
        }
    }
}

/// Uniform byte transport used by the bridge engine
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which side of the bridge this is
    fn side(&self) -> Side;

    /// Take the inbound chunk stream
    ///
    /// The stream is not restartable; a second call fails.
    async fn read_stream(&self) -> Result<ChunkStream>;

    /// Write bytes, returning how many were accepted
    async fn write(&self, data: &[u8]) -> Result<usize>;

    /// Release the underlying handle
    ///
    /// Idempotent: closing an already closed transport is a no-op.
    async fn close(&self) -> Result<()>;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;
}
