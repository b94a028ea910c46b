//! AVR boards with an STK500v1 serial bootloader.
//!
//! Uploading is split into four steps, each in its own module:
//!
//! - [`reset`]: pulse DTR/RTS so the board restarts into its bootloader
//! - [`sync`]: repeat `GET_SYNC` until the bootloader answers
//! - [`program`]: write the image page by page
//! - [`flasher`]: walk baud rates and reset variants and drive the others

pub mod flasher;
pub mod program;
pub mod reset;
pub mod sync;

pub use flasher::{AvrFlasher, BootloaderInfo, DEFAULT_MAX_DURATION, UploadConfig, UploadReport};
pub use program::{AckPolicy, PageProgrammer, ProgramReport, ProgramTimeouts};
pub use reset::{ResetSequence, ResetStep, ResetVariant, reset_board};
pub use sync::{SyncConfig, SyncOutcome, Synchronizer};
