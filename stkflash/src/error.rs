//! Error types for stkflash.

use std::io;
use thiserror::Error;

/// Result type for stkflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for stkflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The serial port could not be opened.
    #[error(
        "Could not open serial port {port}: {reason}. \
         Close any other program using the port (serial monitor, another upload) and reconnect the cable."
    )]
    PortUnavailable {
        /// Port name/path.
        port: String,
        /// Reason reported by the transport.
        reason: String,
    },

    /// No serial port was found.
    #[error("No serial port found. Connect the board or pass --port")]
    DeviceNotFound,

    /// I/O or signal control attempted on a closed connection.
    #[error("Serial connection is not open")]
    NotConnected,

    /// Every baud rate / reset variant combination was tried without sync.
    #[error("{}", describe_sync_failure(attempts, *timed_out))]
    SyncFailure {
        /// Attempted combinations, e.g. `115200 baud / Standard reset`.
        attempts: Vec<String>,
        /// The overall time budget ran out before all combinations were tried.
        timed_out: bool,
    },

    /// A page write was not acknowledged by the bootloader.
    #[error("Programming page {page} failed: {reason}")]
    PageProgramFailure {
        /// Zero-based page index.
        page: usize,
        /// What went wrong.
        reason: String,
    },

    /// The firmware image is empty or unreadable.
    #[error("Malformed firmware image: {0}")]
    MalformedImage(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported board, protocol or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

fn describe_sync_failure(attempts: &[String], timed_out: bool) -> String {
    let mut msg = if timed_out {
        format!(
            "Gave up waiting for the bootloader after {} attempt(s)",
            attempts.len()
        )
    } else {
        format!(
            "Could not sync with the bootloader ({} combination(s) tried)",
            attempts.len()
        )
    };
    if !attempts.is_empty() {
        msg.push_str(": ");
        msg.push_str(&attempts.join(", "));
    }
    msg.push_str(
        ". Check the USB cable, press the board's reset button right as the upload starts, \
         power-cycle the board, or try another board profile (e.g. the old-bootloader variant).",
    );
    msg
}
