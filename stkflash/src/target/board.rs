//! Board profiles.
//!
//! A profile names the bootloader protocol, the baud rates to try in order
//! and the flash page size of one board type.

use crate::error::{Error, Result};
use std::fmt;

/// Largest page size accepted in a profile.
pub const MAX_PAGE_SIZE: usize = 1024;

/// Bootloader protocol spoken by a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase", try_from = "String")
)]
pub enum Protocol {
    /// STK500 version 1 (optiboot, ATmegaBOOT).
    #[default]
    Stk500v1,
    /// STK500 version 2 (stk500v2 bootloader on the Mega 2560).
    Stk500v2,
}

impl Protocol {
    /// Parse a protocol name such as `stk500v1` or `arduino`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "stk500v1" | "stk500" | "arduino" => Some(Self::Stk500v1),
            "stk500v2" | "wiring" => Some(Self::Stk500v2),
            _ => None,
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = Error;

    fn try_from(name: String) -> Result<Self> {
        Self::from_name(&name).ok_or_else(|| {
            Error::Config(format!(
                "unknown bootloader protocol '{name}' (expected stk500v1 or stk500v2)"
            ))
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stk500v1 => write!(f, "stk500v1"),
            Self::Stk500v2 => write!(f, "stk500v2"),
        }
    }
}

/// Static description of one board type.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoardProfile {
    /// Short identifier, e.g. `uno`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Fully qualified board name alias, e.g. `arduino:avr:uno`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub fqbn: Option<String>,
    /// Bootloader protocol.
    #[cfg_attr(feature = "serde", serde(default))]
    pub protocol: Protocol,
    /// Baud rates to try, primary first.
    pub baud_rates: Vec<u32>,
    /// Flash page size in bytes.
    pub page_size: usize,
}

impl BoardProfile {
    /// Create an STK500v1 profile.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        baud_rates: Vec<u32>,
        page_size: usize,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            fqbn: None,
            protocol: Protocol::Stk500v1,
            baud_rates,
            page_size,
        }
    }

    #[must_use]
    fn with_fqbn(mut self, fqbn: &str) -> Self {
        self.fqbn = Some(fqbn.to_string());
        self
    }

    #[must_use]
    fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// All built-in profiles.
    pub fn builtin() -> Vec<Self> {
        vec![
            Self::new("uno", "Arduino Uno", vec![115_200], 128).with_fqbn("arduino:avr:uno"),
            Self::new("nano", "Arduino Nano", vec![115_200, 57_600], 128)
                .with_fqbn("arduino:avr:nano"),
            Self::new(
                "nano-old",
                "Arduino Nano (Old Bootloader)",
                vec![57_600],
                128,
            )
            .with_fqbn("arduino:avr:nano:cpu=atmega328old"),
            Self::new("pro-mini", "Arduino Pro Mini (ATmega328P)", vec![57_600], 128)
                .with_fqbn("arduino:avr:pro"),
            Self::new(
                "duemilanove",
                "Arduino Duemilanove/Diecimila (ATmega328P)",
                vec![57_600],
                128,
            )
            .with_fqbn("arduino:avr:diecimila"),
            Self::new("mega2560", "Arduino Mega 2560", vec![115_200], 256)
                .with_fqbn("arduino:avr:mega")
                .with_protocol(Protocol::Stk500v2),
        ]
    }

    /// Whether `query` names this board by id or fqbn, ignoring case.
    pub fn matches(&self, query: &str) -> bool {
        self.id.eq_ignore_ascii_case(query)
            || self
                .fqbn
                .as_deref()
                .is_some_and(|fqbn| fqbn.eq_ignore_ascii_case(query))
    }

    /// Look up a built-in board.
    pub fn find(query: &str) -> Option<Self> {
        Self::find_in(&Self::builtin(), query)
    }

    /// Look up a board in `boards`.
    pub fn find_in(boards: &[Self], query: &str) -> Option<Self> {
        boards.iter().find(|b| b.matches(query)).cloned()
    }

    /// Check that the profile can be uploaded to.
    pub fn validate(&self) -> Result<()> {
        if self.protocol != Protocol::Stk500v1 {
            return Err(Error::Unsupported(format!(
                "{} uses the {} bootloader protocol; only stk500v1 boards can be programmed",
                self.name, self.protocol
            )));
        }
        validate_page_size(self.page_size)?;
        if self.baud_rates.is_empty() || self.baud_rates.contains(&0) {
            return Err(Error::Config(format!(
                "board {} needs at least one non-zero baud rate",
                self.id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for BoardProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Page sizes must be non-zero, even and at most [`MAX_PAGE_SIZE`].
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if page_size == 0 || page_size % 2 != 0 || page_size > MAX_PAGE_SIZE {
        return Err(Error::Config(format!(
            "invalid page size {page_size}: must be even and between 2 and {MAX_PAGE_SIZE}"
        )));
    }
    Ok(())
}

/// Known AVR device signatures.
const SIGNATURES: &[([u8; 3], &str)] = &[
    ([0x1E, 0x93, 0x07], "ATmega8"),
    ([0x1E, 0x94, 0x06], "ATmega168"),
    ([0x1E, 0x94, 0x0B], "ATmega168P"),
    ([0x1E, 0x95, 0x14], "ATmega328"),
    ([0x1E, 0x95, 0x0F], "ATmega328P"),
    ([0x1E, 0x95, 0x16], "ATmega328PB"),
    ([0x1E, 0x95, 0x87], "ATmega32U4"),
    ([0x1E, 0x96, 0x09], "ATmega644"),
    ([0x1E, 0x97, 0x03], "ATmega1280"),
    ([0x1E, 0x97, 0x05], "ATmega1284P"),
    ([0x1E, 0x98, 0x01], "ATmega2560"),
];

/// Name of the chip with this signature.
pub fn chip_name(signature: [u8; 3]) -> Option<&'static str> {
    SIGNATURES
        .iter()
        .find(|(sig, _)| *sig == signature)
        .map(|(_, name)| *name)
}
