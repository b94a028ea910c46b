//! Upload progress reporting.
//!
//! An upload moves through [`Stage`]s and reports [`ProgressEvent`]s to an
//! [`UploadObserver`]. The observer also receives free-text debug lines,
//! including hex dumps of what the bootloader sent back.
//!
//! ```text
//! Connecting(0) -> Connecting(5) -> Syncing(10) -> Uploading(20..90)
//!     -> Verifying(95) -> Done(100)
//!
//! any stage --error--> Error(last percent)
//! ```

use crate::InterruptChecker;
use crate::error::{Error, Result};
use log::{debug, info};
use std::fmt;
use std::time::Instant;

/// Upload stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Stage {
    /// Opening the port and resetting the board.
    Connecting,
    /// Waiting for the bootloader to answer `GET_SYNC`.
    Syncing,
    /// Writing pages.
    Uploading,
    /// Leaving programming mode.
    Verifying,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Error,
}

impl Stage {
    /// Whether no further events follow this stage.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Syncing => "syncing",
            Self::Uploading => "uploading",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ProgressEvent {
    /// Current stage.
    pub stage: Stage,
    /// Cumulative percent, never decreasing within one upload.
    pub percent: u8,
    /// Human-readable status.
    pub message: String,
}

/// Receives progress events and debug lines from an upload.
pub trait UploadObserver {
    /// Called for every progress event.
    fn progress(&mut self, event: &ProgressEvent);

    /// Called with protocol-level debug lines.
    fn debug(&mut self, _line: &str) {}
}

impl<F> UploadObserver for F
where
    F: FnMut(&ProgressEvent),
{
    fn progress(&mut self, event: &ProgressEvent) {
        self(event);
    }
}

/// Mutable state of one upload or probe: stage, percent, page, deadline and
/// cancellation.
pub struct UploadSession<'o> {
    observer: &'o mut dyn UploadObserver,
    stage: Stage,
    percent: u8,
    page: Option<usize>,
    deadline: Instant,
    interrupt: Option<InterruptChecker>,
}

impl<'o> UploadSession<'o> {
    /// Start a session that must finish before `deadline`.
    ///
    /// Without an `interrupt` checker the process-wide one registered with
    /// [`crate::set_interrupt_checker`] is consulted.
    pub fn new(
        observer: &'o mut dyn UploadObserver,
        deadline: Instant,
        interrupt: Option<InterruptChecker>,
    ) -> Self {
        Self {
            observer,
            stage: Stage::Connecting,
            percent: 0,
            page: None,
            deadline,
            interrupt,
        }
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Current percent.
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Index of the page being written, if programming has started.
    pub fn current_page(&self) -> Option<usize> {
        self.page
    }

    /// Emit a progress event.
    ///
    /// Stage and percent only move forward; a lower value keeps the current
    /// one. Nothing is emitted once the session reached a terminal stage.
    pub fn report(&mut self, stage: Stage, percent: u8, message: impl Into<String>) {
        if self.stage.is_terminal() {
            return;
        }
        let stage = stage.max(self.stage);
        let percent = percent.min(100).max(self.percent);
        if stage != self.stage {
            info!("Stage: {stage}");
        }
        self.stage = stage;
        self.percent = percent;

        let event = ProgressEvent {
            stage,
            percent,
            message: message.into(),
        };
        debug!("[{:>3}%] {}", event.percent, event.message);
        self.observer.progress(&event);
    }

    /// Mark `page` as the page now being written.
    pub fn begin_page(&mut self, page: usize) {
        self.page = Some(page);
    }

    /// Record that page `page` of `total` has been written.
    #[allow(clippy::cast_possible_truncation)]
    pub fn page_written(&mut self, page: usize, total: usize) {
        self.page = Some(page);
        // 20..=90 over the pages; bounded by 90 so the cast cannot truncate.
        let percent = 20 + 70 * (page + 1) / total.max(1);
        self.report(
            Stage::Uploading,
            percent.min(90) as u8,
            format!("Uploaded page {}/{total}", page + 1),
        );
    }

    /// Pass a debug line to the observer.
    pub fn debug(&mut self, line: impl AsRef<str>) {
        self.observer.debug(line.as_ref());
    }

    /// Finish successfully.
    pub fn finish(&mut self, message: impl Into<String>) {
        self.report(Stage::Done, 100, message);
    }

    /// Finish with an error event carrying the last percent.
    pub fn fail(&mut self, error: &Error) {
        if self.stage.is_terminal() {
            return;
        }
        self.stage = Stage::Error;
        let event = ProgressEvent {
            stage: Stage::Error,
            percent: self.percent,
            message: error.to_string(),
        };
        self.observer.progress(&event);
    }

    /// Fail with [`Error::Cancelled`] if cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        let interrupted = match &self.interrupt {
            Some(checker) => checker(),
            None => crate::is_interrupted_requested(),
        };
        if interrupted {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Whether the overall time budget is used up.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_percent_and_stage_never_go_back() {
        let mut events = Vec::new();
        let mut observer = |e: &ProgressEvent| events.push(e.clone());
        let mut session = UploadSession::new(&mut observer, later(), None);

        session.report(Stage::Connecting, 0, "open");
        session.report(Stage::Syncing, 10, "sync");
        session.report(Stage::Connecting, 0, "reopen");
        session.finish("done");
        session.report(Stage::Uploading, 50, "late");
        drop(session);

        let percents: Vec<u8> = events.iter().map(|e| e.percent).collect();
        assert_eq!(percents, vec![0, 10, 10, 100]);
        assert_eq!(events[2].stage, Stage::Syncing);
        assert_eq!(events[2].message, "reopen");
        assert_eq!(events.last().map(|e| e.stage), Some(Stage::Done));
    }

    #[test]
    fn test_page_percentages() {
        let mut events = Vec::new();
        let mut observer = |e: &ProgressEvent| events.push(e.percent);
        let mut session = UploadSession::new(&mut observer, later(), None);
        assert_eq!(session.current_page(), None);
        for page in 0..3 {
            session.begin_page(page);
            assert_eq!(session.current_page(), Some(page));
            session.page_written(page, 3);
        }
        assert_eq!(session.current_page(), Some(2));
        drop(session);
        assert_eq!(events, vec![43, 66, 90]);
    }

    #[test]
    fn test_fail_keeps_last_percent_and_is_final() {
        let mut events = Vec::new();
        let mut observer = |e: &ProgressEvent| events.push(e.clone());
        let mut session = UploadSession::new(&mut observer, later(), None);
        session.report(Stage::Syncing, 10, "sync");
        session.fail(&Error::Cancelled);
        session.fail(&Error::Cancelled);
        session.finish("done");
        drop(session);

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].stage, Stage::Error);
        assert_eq!(events[1].percent, 10);
        assert_eq!(events[1].message, "Operation cancelled");
    }

    #[test]
    fn test_checkpoint_uses_session_checker() {
        let mut observer = |_: &ProgressEvent| {};
        let session = UploadSession::new(&mut observer, later(), Some(Arc::new(|| true)));
        assert!(matches!(session.checkpoint(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_expired() {
        let mut observer = |_: &ProgressEvent| {};
        let session = UploadSession::new(&mut observer, Instant::now(), Some(Arc::new(|| false)));
        assert!(session.expired());
        assert!(session.checkpoint().is_ok());
    }
}
