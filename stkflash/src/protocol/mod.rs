//! Protocol implementations.

pub mod stk500;

// Re-export common types
pub use stk500::{Command, Reply, contains_sync_ack, hex_dump, parse_reply};
