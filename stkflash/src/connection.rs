//! Exclusive, time-bounded access to an open port.
//!
//! Low-level ports only offer a per-`read` timeout. Every read here takes an
//! explicit deadline for the whole call and polls the port in short slices,
//! so a target that never answers costs at most that deadline.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::stk500::hex_dump;
use log::{debug, trace, warn};
use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

/// Longest single blocking read while waiting for a deadline.
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Upper bound on how long [`SerialConnection::drain`] may keep reading.
const MAX_DRAIN: Duration = Duration::from_millis(500);

/// One open port owned by one upload.
///
/// Closing is idempotent and the underlying device is closed exactly once,
/// either by [`close`](Self::close) or on drop.
pub struct SerialConnection<P: Port> {
    port: P,
    open: bool,
}

impl<P: Port> SerialConnection<P> {
    /// Take ownership of an open port.
    pub fn new(port: P) -> Self {
        Self { port, open: true }
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Port name.
    pub fn name(&self) -> &str {
        self.port.name()
    }

    /// Baud rate the port was opened with.
    pub fn baud_rate(&self) -> u32 {
        self.port.baud_rate()
    }

    fn port_mut(&mut self) -> Result<&mut P> {
        if self.open {
            Ok(&mut self.port)
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Drive both modem control lines.
    pub fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<()> {
        trace!("DTR={dtr} RTS={rts}");
        self.port_mut()?.set_signals(dtr, rts)
    }

    /// Write a complete frame and flush it.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        trace!("TX {}", hex_dump(data));
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    /// Read until `done` accepts the bytes collected so far or `timeout`
    /// elapses, whichever comes first. Returns everything that was read,
    /// possibly nothing.
    pub fn read_until<F>(&mut self, timeout: Duration, done: F) -> Result<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let port = self.port_mut()?;
            port.set_timeout(remaining.min(POLL_SLICE))?;
            match port.read(&mut chunk) {
                Ok(0) => thread::sleep(Duration::from_millis(1)),
                Ok(n) => {
                    collected.extend_from_slice(&chunk[..n]);
                    if done(&collected) {
                        break;
                    }
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }

        if !collected.is_empty() {
            trace!("RX {}", hex_dump(&collected));
        }
        Ok(collected)
    }

    /// Read for the whole `timeout`.
    pub fn read_for(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.read_until(timeout, |_| false)
    }

    /// Discard buffered input and anything still arriving, stopping once the
    /// line has been quiet for `quiet`. Returns the number of bytes dropped
    /// after the buffer clear.
    pub fn drain(&mut self, quiet: Duration) -> Result<usize> {
        self.port_mut()?.clear_buffers()?;

        let start = Instant::now();
        let mut dropped = 0;
        while start.elapsed() < MAX_DRAIN {
            let chunk = self.read_until(quiet, |b| !b.is_empty())?;
            if chunk.is_empty() {
                break;
            }
            dropped += chunk.len();
        }

        if dropped > 0 {
            debug!("Drained {dropped} stale byte(s)");
        }
        Ok(dropped)
    }

    /// Close the connection. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.port.close()
    }
}

impl<P: Port> Drop for SerialConnection<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close {}: {e}", self.port.name());
        }
    }
}
