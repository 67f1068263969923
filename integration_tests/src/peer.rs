//! Far end of the null-modem pair the bridge writes to.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use anyhow::Result;
use serialport::SerialPort;

/// Client for the peer side of the virtual serial link.
pub struct PeerPort {
    port: Box<dyn SerialPort>,
}

impl PeerPort {
    /// Open the peer port.
    pub fn new(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(Self { port })
    }

    /// Read and discard anything already pending.
    pub fn drain_buffer(&mut self) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::All)?;

        let mut buf = [0u8; 256];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Write bytes towards the bridge.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    /// Collect exactly `len` bytes, failing if they do not arrive within `timeout`.
    pub fn read_exact_within(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(len);
        let mut buf = [0u8; 256];
        let start = Instant::now();

        while data.len() < len && start.elapsed() < timeout {
            let want = (len - data.len()).min(buf.len());
            match self.port.read(&mut buf[..want]) {
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if data.len() < len {
            anyhow::bail!(
                "Timeout waiting for {} bytes, got {}: {:02x?}",
                len,
                data.len(),
                data
            );
        }
        Ok(data)
    }
}
