//! Supported targets and board profiles.

pub mod avr;
pub mod board;

pub use board::{BoardProfile, MAX_PAGE_SIZE, Protocol, chip_name};
