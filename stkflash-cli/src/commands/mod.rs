//! Command implementations.
//!
//! Each subcommand lives in its own module; board and upload configuration
//! resolution shared by `upload` and `probe` lives in `boards` and `upload`.

pub(crate) mod boards;
pub(crate) mod completions;
pub(crate) mod info;
pub(crate) mod ports;
pub(crate) mod probe;
pub(crate) mod upload;
