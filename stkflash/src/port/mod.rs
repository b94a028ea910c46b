//! Port abstraction for serial communication with the bootloader.
//!
//! The upload logic only talks to the [`Port`] trait, so it can run against
//! the native `serialport` backend or against an in-memory simulated
//! bootloader in tests.
//!
//! ```text
//! +-------------------------+
//! |  Upload orchestrator    |
//! |  (reset, sync, program) |
//! +------------+------------+
//!              |
//!              v
//! +------------+------------+
//! |    SerialConnection     |   timed reads, lifecycle
//! +------------+------------+
//!              |
//!              v
//! +------------+------------+     +-------------------+
//! |       Port trait        | <-- |    PortOpener     |
//! +------------+------------+     +-------------------+
//!              |
//!              v
//! +------------+------------+
//! |  NativePort (serialport)|
//! +-------------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use stkflash::port::Port;
//!
//! fn pulse_reset<P: Port>(port: &mut P) -> stkflash::Result<()> {
//!     port.set_signals(true, true)?;
//!     std::thread::sleep(std::time::Duration::from_millis(50));
//!     port.set_signals(false, false)
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
///
/// AVR bootloaders always run 8N1 without flow control, so only the name,
/// baud rate and the low-level read timeout are configurable.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Low-level read timeout of a single `read` call.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(10),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// An open bidirectional byte stream with two modem control lines.
///
/// `read` must return either data or an error of kind `TimedOut` /
/// `WouldBlock` once the current timeout elapses; it must never block
/// indefinitely.
pub trait Port: Read + Write + Send {
    /// Set the timeout of a single low-level read.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) line state. `true` asserts the line.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) line state. `true` asserts the line.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Set both control lines.
    fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.set_dtr(dtr)?;
        self.set_rts(rts)
    }

    /// Close the port and release the device.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;
}

/// Opens a [`Port`] on one physical device at a requested baud rate.
///
/// The orchestrator reopens the device for every baud rate / reset variant
/// combination, so it holds an opener rather than a port.
pub trait PortOpener {
    /// Port type produced by this opener.
    type Port: Port;

    /// Name of the device this opener targets.
    fn port_name(&self) -> &str;

    /// Open the device at `baud_rate`.
    ///
    /// Failures are reported as [`crate::Error::PortUnavailable`].
    fn open(&mut self, baud_rate: u32) -> Result<Self::Port>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortOpener};
