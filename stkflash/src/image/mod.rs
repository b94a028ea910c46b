//! Firmware image formats.

pub mod ihex;

pub use ihex::{FLASH_ERASED, HexImage, ParseOptions, RecordType};
