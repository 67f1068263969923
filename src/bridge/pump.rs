//! One-direction byte pump
//!
//! Reads chunks from a source stream and writes them, unchanged, to a sink
//! transport. A pump only returns when something went wrong; stopping a
//! healthy pump is done by dropping its future.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::trace;

use crate::error::{BridgeError, Result};
use crate::transport::{ChunkStream, Side, Transport};

/// Relay direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    BleToSerial,
    SerialToBle,
}

impl Direction {
    pub fn source(self) -> Side {
        match self {
            Self::BleToSerial => Side::Ble,
            Self::SerialToBle => Side::Serial,
        }
    }

    pub fn sink(self) -> Side {
        match self {
            Self::BleToSerial => Side::Serial,
            Self::SerialToBle => Side::Ble,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source(), self.sink())
    }
}

pub struct Pump {
    direction: Direction,
    write_timeout: Duration,
    /// Bytes accepted by the sink so far
    relayed: Arc<AtomicU64>,
}

impl Pump {
    pub fn new(direction: Direction, write_timeout: Duration, relayed: Arc<AtomicU64>) -> Self {
        Self {
            direction,
            write_timeout,
            relayed,
        }
    }

    /// Relay until the source ends or fails, or a write fails.
    ///
    /// Returns the error that stopped the pump.
    pub async fn run(self, mut source: ChunkStream, sink: Arc<dyn Transport>) -> BridgeError {
        while let Some(item) = source.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => return e,
            };
            if chunk.is_empty() {
                continue;
            }

            trace!("{} {} bytes: {:02x?}", self.direction, chunk.len(), chunk);
            if let Err(e) = self.deliver(&chunk, sink.as_ref()).await {
                return e;
            }
        }

        BridgeError::TransportClosed(format!("{} stream ended", self.direction.source()))
    }

    /// Write the whole chunk, re-issuing the remainder after partial writes.
    async fn deliver(&self, chunk: &[u8], sink: &dyn Transport) -> Result<()> {
        let mut offset = 0;
        while offset < chunk.len() {
            let written = tokio::time::timeout(self.write_timeout, sink.write(&chunk[offset..]))
                .await
                .map_err(|_| BridgeError::WriteTimeout {
                    side: sink.side(),
                    timeout: self.write_timeout,
                })??;

            if written == 0 {
                return Err(BridgeError::TransportClosed(format!(
                    "{} accepted no bytes",
                    sink.side()
                )));
            }
            offset += written;
            self.relayed.fetch_add(written as u64, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::traits::mock::MockSerialBackend;
    use crate::transport::SerialDuplex;
    use futures::stream;

    fn chunks(items: Vec<Result<Vec<u8>>>) -> ChunkStream {
        stream::iter(items).boxed()
    }

    async fn serial_sink(backend: &MockSerialBackend) -> Arc<dyn Transport> {
        Arc::new(SerialDuplex::open(backend, "COM9", 115200).await.unwrap())
    }

    fn pump(counter: &Arc<AtomicU64>) -> Pump {
        Pump::new(Direction::BleToSerial, Duration::from_millis(250), counter.clone())
    }

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::BleToSerial.source(), Side::Ble);
        assert_eq!(Direction::BleToSerial.sink(), Side::Serial);
        assert_eq!(Direction::SerialToBle.to_string(), "serial->ble");
    }

    #[tokio::test]
    async fn test_partial_writes_are_completed() {
        let backend = MockSerialBackend::new();
        backend.limit_writes(3);
        let sink = serial_sink(&backend).await;
        let counter = Arc::new(AtomicU64::new(0));

        let source = chunks(vec![
            Ok(vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]),
            Ok(vec![0xff]),
            Ok(vec![0x0d, 0x0a]),
        ]);
        let error = pump(&counter).run(source, sink).await;

        assert!(matches!(error, BridgeError::TransportClosed(_)));
        assert_eq!(
            backend.last_port().unwrap().get_tx_data(),
            vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xff, 0x0d, 0x0a]
        );
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn test_empty_chunks_are_skipped() {
        let backend = MockSerialBackend::new();
        let sink = serial_sink(&backend).await;
        let counter = Arc::new(AtomicU64::new(0));

        let source = chunks(vec![Ok(vec![]), Ok(b"ok".to_vec()), Ok(vec![])]);
        pump(&counter).run(source, sink).await;

        assert_eq!(backend.last_port().unwrap().get_tx_data(), b"ok".to_vec());
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_source_error_stops_pump() {
        let backend = MockSerialBackend::new();
        let sink = serial_sink(&backend).await;
        let counter = Arc::new(AtomicU64::new(0));

        let source = chunks(vec![
            Ok(b"a".to_vec()),
            Err(BridgeError::TransportClosed("peripheral disconnected".into())),
            Ok(b"b".to_vec()),
        ]);
        let error = pump(&counter).run(source, sink).await;

        assert_eq!(
            error,
            BridgeError::TransportClosed("peripheral disconnected".into())
        );
        assert_eq!(backend.last_port().unwrap().get_tx_data(), b"a".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_sink_times_out() {
        let backend = MockSerialBackend::new();
        backend.block_writes();
        let sink = serial_sink(&backend).await;
        let counter = Arc::new(AtomicU64::new(0));

        let start = tokio::time::Instant::now();
        let error = pump(&counter)
            .run(chunks(vec![Ok(b"stuck".to_vec())]), sink)
            .await;

        assert_eq!(
            error,
            BridgeError::WriteTimeout {
                side: Side::Serial,
                timeout: Duration::from_millis(250),
            }
        );
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert!(start.elapsed() < Duration::from_millis(300));
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
