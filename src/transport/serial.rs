//! Serial side of the bridge

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::error::{BridgeError, Result};
use crate::serial::{SerialBackend, SerialPort};
use crate::transport::{ChunkStream, Side, Transport};

/// Serial link owned by a single bridge session
pub struct SerialDuplex {
    port: Arc<dyn SerialPort>,
    baud_rate: u32,
    closed: AtomicBool,
}

impl SerialDuplex {
    /// Wrap an already open port.
    pub fn new(port: Box<dyn SerialPort>, baud_rate: u32) -> Self {
        Self {
            port: Arc::from(port),
            baud_rate,
            closed: AtomicBool::new(false),
        }
    }

    /// Open `port_name` through `backend`.
    ///
    /// Any failure is reported as `PortUnavailable`.
    pub async fn open(backend: &dyn SerialBackend, port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = backend
            .open(port_name, baud_rate)
            .await
            .map_err(|e| match e {
                BridgeError::PortUnavailable { .. } => e,
                other => BridgeError::port_unavailable(port_name, other),
            })?;
        debug!("Serial: {} ready at {} baud", port_name, baud_rate);
        Ok(Self::new(port, baud_rate))
    }

    pub fn port_name(&self) -> &str {
        self.port.name()
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

#[async_trait]
impl Transport for SerialDuplex {
    fn side(&self) -> Side {
        Side::Serial
    }

    async fn read_stream(&self) -> Result<ChunkStream> {
        if self.is_closed() {
            return Err(BridgeError::TransportClosed(format!(
                "serial port {} is closed",
                self.port_name()
            )));
        }
        self.port.read_stream().await
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(BridgeError::TransportClosed(format!(
                "serial port {} is closed",
                self.port_name()
            )));
        }
        self.port.write(data).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.port.close().await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SerialDuplex {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let port = self.port.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = port.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::traits::mock::MockSerialBackend;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_open_failure_is_port_unavailable() {
        let backend = MockSerialBackend::new();
        backend.fail_next_open(BridgeError::TransportClosed("no such device".into()));

        let result = SerialDuplex::open(&backend, "COM9", 115200).await;

        match result {
            Err(BridgeError::PortUnavailable { port, reason }) => {
                assert_eq!(port, "COM9");
                assert!(reason.contains("no such device"));
            }
            Err(other) => panic!("Expected PortUnavailable, got {:?}", other),
            Ok(_) => panic!("Expected PortUnavailable, got an open port"),
        }
    }

    #[tokio::test]
    async fn test_read_and_write_pass_bytes_through() {
        let backend = MockSerialBackend::new();
        let duplex = SerialDuplex::open(&backend, "/dev/ttyUSB0", 9600).await.unwrap();
        let port = backend.last_port().unwrap();
        assert_eq!(port.baud_rate(), 9600);

        port.queue_rx_data(&[0x00, 0xff, 0x0d, 0x0a]);
        let mut stream = duplex.read_stream().await.unwrap();
        assert_eq!(stream.next().await, Some(Ok(vec![0x00, 0xff, 0x0d, 0x0a])));

        assert_eq!(duplex.write(&[0xc3, 0x28]).await.unwrap(), 2);
        assert_eq!(port.get_tx_data(), vec![0xc3, 0x28]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let backend = MockSerialBackend::new();
        let duplex = SerialDuplex::open(&backend, "COM9", 115200).await.unwrap();

        duplex.close().await.unwrap();
        duplex.close().await.unwrap();

        assert_eq!(backend.last_port().unwrap().close_count(), 1);
        assert!(duplex.write(b"x").await.is_err());
    }
}
