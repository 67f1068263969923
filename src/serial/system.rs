//! Operating system serial ports via the `serialport` crate
//!
//! The driver is blocking, so reads run on a dedicated thread that feeds a
//! bounded channel and writes run on the blocking pool.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::serial::{CHANNEL_DEPTH, READ_BUFFER_SIZE, READ_POLL_MS};
use crate::error::{BridgeError, Result};
use crate::serial::traits::{SerialBackend, SerialPort};
use crate::transport::ChunkStream;

type DriverPort = Box<dyn serialport::SerialPort>;

/// List the serial ports the operating system reports.
pub fn available_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| BridgeError::port_unavailable("*", e))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Serial backend using the operating system driver
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerial;

#[async_trait]
impl SerialBackend for SystemSerial {
    async fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>> {
        let name = port_name.to_string();
        let port = tokio::task::spawn_blocking(move || {
            // Also the write poll interval; writes retry until closed
            serialport::new(&name, baud_rate)
                .timeout(Duration::from_millis(READ_POLL_MS))
                .open()
        })
        .await
        .map_err(|e| BridgeError::port_unavailable(port_name, e))?
        .map_err(|e| BridgeError::port_unavailable(port_name, e))?;

        debug!("Serial: opened {} at {} baud", port_name, baud_rate);
        Ok(Box::new(SystemSerialPort::new(port_name, port)))
    }
}

/// An open operating system serial port
pub struct SystemSerialPort {
    name: String,
    /// Write half; taken on close to release the device
    writer: Arc<Mutex<Option<DriverPort>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl SystemSerialPort {
    fn new(name: &str, port: DriverPort) -> Self {
        Self {
            name: name.to_string(),
            writer: Arc::new(Mutex::new(Some(port))),
            reader: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::TransportClosed(format!("serial port {} is closed", self.name))
    }
}

/// Blocking read loop run on the reader thread
///
/// Exits when the port is closed, the driver fails or the stream is dropped.
fn read_loop(
    mut port: DriverPort,
    tx: mpsc::Sender<Result<Vec<u8>>>,
    closed: Arc<AtomicBool>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];

    while !closed.load(Ordering::SeqCst) {
        match port.read(&mut buf) {
            Ok(0) => {
                let _ = tx.blocking_send(Err(BridgeError::TransportClosed(
                    "serial port reached end of stream".into(),
                )));
                break;
            }
            Ok(n) => {
                // Blocks while the pump is busy; bounded backpressure
                if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {
                continue;
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(BridgeError::TransportClosed(format!(
                    "serial read failed: {e}"
                ))));
                break;
            }
        }
    }
}

#[async_trait]
impl SerialPort for SystemSerialPort {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_stream(&self) -> Result<ChunkStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }

        let mut reader = self
            .reader
            .lock()
            .map_err(|_| self.closed_error())?;
        if reader.is_some() {
            return Err(BridgeError::TransportClosed(format!(
                "serial port {} reader already taken",
                self.name
            )));
        }

        let port = self
            .writer
            .lock()
            .map_err(|_| self.closed_error())?
            .as_ref()
            .ok_or_else(|| self.closed_error())?
            .try_clone()
            .map_err(|e| BridgeError::TransportClosed(format!("cloning serial handle: {e}")))?;

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let closed = self.closed.clone();
        let handle = std::thread::Builder::new()
            .name(format!("serial-rx {}", self.name))
            .spawn(move || read_loop(port, tx, closed))
            .map_err(|e| BridgeError::TransportClosed(format!("spawning serial reader: {e}")))?;
        *reader = Some(handle);

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        let writer = self.writer.clone();
        let closed = self.closed.clone();
        let data = data.to_vec();
        let name = self.name.clone();

        // Stalls are bounded by the caller's write timeout; an abandoned write
        // keeps polling until the port is closed.
        tokio::task::spawn_blocking(move || {
            let mut guard = writer
                .lock()
                .map_err(|_| BridgeError::TransportClosed(format!("serial port {name} writer poisoned")))?;

            loop {
                if closed.load(Ordering::SeqCst) {
                    return Err(BridgeError::TransportClosed(format!("serial port {name} is closed")));
                }
                let port = guard
                    .as_mut()
                    .ok_or_else(|| BridgeError::TransportClosed(format!("serial port {name} is closed")))?;

                match port.write(&data) {
                    Ok(written) => return Ok(written),
                    Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {
                        continue;
                    }
                    Err(e) => {
                        return Err(BridgeError::TransportClosed(format!("serial write failed: {e}")));
                    }
                }
            }
        })
        .await
        .map_err(|e| BridgeError::TransportClosed(format!("serial write task: {e}")))?
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // A pending write holds the writer until it sees the flag, so release
        // the handle off the async workers
        let writer = self.writer.clone();
        let released = tokio::task::spawn_blocking(move || {
            if let Ok(mut writer) = writer.lock() {
                writer.take();
            }
        })
        .await;
        if released.is_err() {
            warn!("Serial: releasing {} failed", self.name);
        }

        // The reader notices the flag within one poll interval
        let reader = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(handle) = reader {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("Serial: reader thread for {} did not exit cleanly", self.name);
            }
        }

        debug!("Serial: closed {}", self.name);
        Ok(())
    }
}

impl Drop for SystemSerialPort {
    fn drop(&mut self) {
        // Let a detached reader thread exit even if close() was never awaited
        self.closed.store(true, Ordering::SeqCst);
    }
}
