//! Bootloader synchronization.
//!
//! After a reset the bootloader listens for a short window. The host keeps
//! sending `GET_SYNC` until `INSYNC OK` shows up somewhere in what came back.
//! Clone bootloaders and USB bridges often prefix the answer with noise, so
//! received bytes are accumulated and the whole buffer is scanned.

use crate::connection::SerialConnection;
use crate::error::Result;
use crate::port::Port;
use crate::progress::UploadSession;
use crate::protocol::stk500::{Command, contains_sync_ack, hex_dump, resp};
use log::{debug, trace};
use std::thread;
use std::time::Duration;

/// Bytes kept from earlier attempts while scanning for the acknowledgement.
const SYNC_BUFFER_LIMIT: usize = 256;

/// Synchronizer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Maximum number of `GET_SYNC` attempts.
    pub attempts: usize,
    /// How long to listen after each `GET_SYNC`.
    pub read_window: Duration,
    /// Pause between attempts.
    pub attempt_delay: Duration,
    /// Rerun the reset after this many unanswered attempts; `None` never.
    pub reset_every: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            attempts: 25,
            read_window: Duration::from_millis(50),
            attempt_delay: Duration::from_millis(50),
            reset_every: Some(5),
        }
    }
}

/// How synchronization ended, when it did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The bootloader answered on attempt `attempts`.
    Synced {
        /// 1-based attempt that succeeded.
        attempts: usize,
    },
    /// Every attempt went unanswered.
    Exhausted {
        /// Attempts made.
        attempts: usize,
    },
    /// The upload time budget ran out first.
    TimedOut {
        /// Attempts made.
        attempts: usize,
    },
}

impl SyncOutcome {
    /// Whether the bootloader answered.
    pub fn is_synced(self) -> bool {
        matches!(self, Self::Synced { .. })
    }
}

/// Runs the `GET_SYNC` loop on one open connection.
pub struct Synchronizer<'a, P: Port> {
    conn: &'a mut SerialConnection<P>,
    config: &'a SyncConfig,
}

impl<'a, P: Port> Synchronizer<'a, P> {
    /// Create a synchronizer.
    pub fn new(conn: &'a mut SerialConnection<P>, config: &'a SyncConfig) -> Self {
        Self { conn, config }
    }

    /// Try to synchronize.
    ///
    /// `rereset` is called every `reset_every` unanswered attempts to reset
    /// the board again. Cancellation ends the loop with
    /// [`crate::Error::Cancelled`]; an exhausted time budget with
    /// [`SyncOutcome::TimedOut`].
    pub fn run<R>(&mut self, session: &mut UploadSession<'_>, mut rereset: R) -> Result<SyncOutcome>
    where
        R: FnMut(&mut SerialConnection<P>) -> Result<()>,
    {
        let frame = Command::GetSync.build();
        let mut seen: Vec<u8> = Vec::new();

        for attempt in 1..=self.config.attempts {
            session.checkpoint()?;
            if session.expired() {
                debug!("Time budget exhausted after {} sync attempt(s)", attempt - 1);
                return Ok(SyncOutcome::TimedOut {
                    attempts: attempt - 1,
                });
            }

            if attempt > 1
                && self
                    .config
                    .reset_every
                    .is_some_and(|n| n > 0 && (attempt - 1) % n == 0)
            {
                debug!("No answer after {} attempts, resetting again", attempt - 1);
                rereset(&mut *self.conn)?;
                seen.clear();
            }

            trace!("GET_SYNC attempt {attempt}/{}", self.config.attempts);
            self.conn.write_all(&frame)?;

            // The pair may straddle the previous chunk and this one.
            let pending_insync = seen.last() == Some(&resp::INSYNC);
            let chunk = self.conn.read_until(self.config.read_window, |b| {
                contains_sync_ack(b) || (pending_insync && b.first() == Some(&resp::OK))
            })?;

            if !chunk.is_empty() {
                session.debug(format!("sync {attempt}: RX {}", hex_dump(&chunk)));
                seen.extend_from_slice(&chunk);
            }

            if contains_sync_ack(&seen) {
                debug!("Bootloader in sync after {attempt} attempt(s)");
                return Ok(SyncOutcome::Synced { attempts: attempt });
            }

            if seen.len() > SYNC_BUFFER_LIMIT {
                seen.drain(..seen.len() - SYNC_BUFFER_LIMIT);
            }

            if attempt < self.config.attempts {
                thread::sleep(self.config.attempt_delay);
            }
        }

        Ok(SyncOutcome::Exhausted {
            attempts: self.config.attempts,
        })
    }
}
