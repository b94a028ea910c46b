//! # stkflash
//!
//! A library for uploading firmware to AVR microcontroller boards through
//! their STK500v1 serial bootloader (optiboot, ATmegaBOOT), as found on the
//! Arduino Uno, Nano, Pro Mini and compatible boards.
//!
//! It provides:
//!
//! - Intel HEX parsing into a flat image
//! - DTR/RTS reset sequences for the common USB bridge wirings
//! - Bootloader synchronization with automatic re-reset
//! - Page programming with configurable acknowledgement policy
//! - An orchestrator that walks baud rates and reset variants until the
//!   bootloader answers, reporting progress through an observer
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization of board profiles and discovery results
//!
//! ## Example
//!
//! ```rust,no_run
//! use stkflash::{AvrFlasher, BoardProfile, HexImage, ParseOptions, ProgressEvent};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = HexImage::from_file("blink.ino.hex", ParseOptions::default())?;
//!     let board = BoardProfile::find("nano").ok_or("unknown board")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut flasher = AvrFlasher::open("/dev/ttyUSB0", &board)?;
//!         let report = flasher.upload(&image, &mut |e: &ProgressEvent| {
//!             println!("[{:>3}%] {}", e.percent, e.message);
//!         })?;
//!         println!("{} pages at {} baud", report.pages, report.baud_rate);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod connection;
pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod progress;
pub mod protocol;
pub mod target;

#[cfg(test)]
pub(crate) mod testing;

/// Returns `true` when the running operation should stop.
pub type InterruptChecker = Arc<dyn Fn() -> bool + Send + Sync>;

static INTERRUPT_CHECKER: OnceLock<InterruptChecker> = OnceLock::new();

/// Register a process-wide interruption checker.
///
/// Uploads consult it between sync attempts and between pages unless the
/// uploader was given its own checker. Only the first registration counts.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER.get().is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortOpener};
pub use {
    connection::SerialConnection,
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports, format_port_list},
    error::{Error, Result},
    image::{HexImage, ParseOptions},
    port::{Port, PortOpener, SerialConfig},
    progress::{ProgressEvent, Stage, UploadObserver, UploadSession},
    target::{
        BoardProfile, Protocol,
        avr::{
            AckPolicy, AvrFlasher, BootloaderInfo, ResetVariant, SyncConfig, UploadConfig,
            UploadReport,
        },
    },
};
