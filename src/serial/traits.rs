//! Serial port traits for abstraction and testability
//!
//! These traits define the interface for serial port operations, allowing the
//! operating system driver to be swapped with a mock for testing.

use async_trait::async_trait;

use crate::error::Result;
use crate::transport::ChunkStream;

/// Opens serial ports
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// Open `port_name` at `baud_rate`
    ///
    /// Fails with `PortUnavailable` if the device is missing or already held.
    async fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>>;
}

/// An open serial port
#[async_trait]
pub trait SerialPort: Send + Sync {
    /// Port name as opened
    fn name(&self) -> &str;

    /// Stream of byte-chunks as they arrive from the driver
    async fn read_stream(&self) -> Result<ChunkStream>;

    /// Write bytes
    ///
    /// Returns the number of bytes the driver accepted, which may be fewer
    /// than `data.len()`.
    async fn write(&self, data: &[u8]) -> Result<usize>;

    /// Close the port and stop any reader
    async fn close(&self) -> Result<()>;
}
