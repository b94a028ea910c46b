//! Reset sequencer.
//!
//! Arduino-class boards wire DTR (and on some clones RTS) through a
//! capacitor to the MCU reset pin, so toggling the modem control lines
//! restarts the chip into its bootloader. Which line is wired, and how long
//! the pulse must be, differs between boards and USB bridges; each
//! [`ResetVariant`] is one fixed line pattern.

use crate::connection::SerialConnection;
use crate::error::Result;
use crate::port::Port;
use log::debug;
use std::fmt;
use std::thread;
use std::time::Duration;

/// One level change of the control lines, held for `hold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStep {
    /// DTR level (`true` asserts).
    pub dtr: bool,
    /// RTS level (`true` asserts).
    pub rts: bool,
    /// How long to hold this level.
    pub hold: Duration,
}

const fn step(dtr: bool, rts: bool, hold_ms: u64) -> ResetStep {
    ResetStep {
        dtr,
        rts,
        hold: Duration::from_millis(hold_ms),
    }
}

/// Line pattern of one reset variant. Both lines are released after the
/// last step, then the sequencer waits `settle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSequence {
    /// Steps in order.
    pub steps: &'static [ResetStep],
    /// Wait after releasing the lines.
    pub settle: Duration,
}

const STANDARD: &[ResetStep] = &[step(false, false, 250), step(true, true, 50)];
const DTR_ONLY: &[ResetStep] = &[step(false, false, 250), step(true, false, 100)];
const RTS_ONLY: &[ResetStep] = &[step(false, false, 250), step(false, true, 100)];
const COMBINED: &[ResetStep] = &[
    step(false, false, 100),
    step(true, false, 50),
    step(true, true, 100),
];

/// Reset line pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum ResetVariant {
    /// DTR and RTS pulsed together.
    #[default]
    Standard,
    /// DTR only.
    DtrOnly,
    /// RTS only.
    RtsOnly,
    /// DTR first, RTS staggered after it.
    Combined,
}

impl ResetVariant {
    /// All variants in preference order.
    pub const ALL: [Self; 4] = [Self::Standard, Self::DtrOnly, Self::RtsOnly, Self::Combined];

    /// The line pattern of this variant.
    pub fn sequence(self) -> ResetSequence {
        match self {
            Self::Standard => ResetSequence {
                steps: STANDARD,
                settle: Duration::from_millis(100),
            },
            Self::DtrOnly => ResetSequence {
                steps: DTR_ONLY,
                settle: Duration::from_millis(200),
            },
            Self::RtsOnly => ResetSequence {
                steps: RTS_ONLY,
                settle: Duration::from_millis(200),
            },
            Self::Combined => ResetSequence {
                steps: COMBINED,
                settle: Duration::from_millis(150),
            },
        }
    }

    /// Parse a variant name such as `dtr-only`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().replace('_', "-").as_str() {
            "standard" => Some(Self::Standard),
            "dtr-only" | "dtr" => Some(Self::DtrOnly),
            "rts-only" | "rts" => Some(Self::RtsOnly),
            "combined" => Some(Self::Combined),
            _ => None,
        }
    }
}

impl fmt::Display for ResetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "Standard"),
            Self::DtrOnly => write!(f, "DTR-only"),
            Self::RtsOnly => write!(f, "RTS-only"),
            Self::Combined => write!(f, "Combined"),
        }
    }
}

/// Run the reset pattern of `variant` on `conn`.
///
/// Succeeds unless the port itself fails; whether the board actually
/// restarted is only known once the bootloader answers.
pub fn reset_board<P: Port>(conn: &mut SerialConnection<P>, variant: ResetVariant) -> Result<()> {
    debug!("Resetting board on {} ({variant})", conn.name());
    let sequence = variant.sequence();
    for step in sequence.steps {
        conn.set_signals(step.dtr, step.rts)?;
        thread::sleep(step.hold);
    }
    conn.set_signals(false, false)?;
    thread::sleep(sequence.settle);
    Ok(())
}
