//! Upload orchestrator.
//!
//! Tries every baud rate / reset variant combination in order until the
//! bootloader answers, then programs the image over that connection.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stkflash::{AvrFlasher, BoardProfile, HexImage, ProgressEvent, UploadConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let board = BoardProfile::find("uno").ok_or("unknown board")?;
//!     let image = HexImage::from_file("blink.hex", Default::default())?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut flasher = AvrFlasher::new(
//!             stkflash::NativePortOpener::new("/dev/ttyACM0"),
//!             UploadConfig::for_board(&board)?,
//!         );
//!         let mut observer = |e: &ProgressEvent| println!("{:>3}% {}", e.percent, e.message);
//!         flasher.upload(&image, &mut observer)?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::InterruptChecker;
use crate::connection::SerialConnection;
use crate::error::{Error, Result};
use crate::image::HexImage;
use crate::port::{Port, PortOpener};
use crate::progress::{Stage, UploadObserver, UploadSession};
use crate::target::avr::program::{AckPolicy, PageProgrammer, ProgramReport, ProgramTimeouts};
use crate::target::avr::reset::{ResetVariant, reset_board};
use crate::target::avr::sync::{SyncConfig, SyncOutcome, Synchronizer};
use crate::target::board::{BoardProfile, chip_name, validate_page_size};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default wall-clock cap of one upload.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(60);

/// Quiet period that ends input draining.
const DRAIN_QUIET: Duration = Duration::from_millis(50);

/// Everything the orchestrator needs to know about the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Baud rates to try, in order.
    pub baud_rates: Vec<u32>,
    /// Reset variants to try at every baud rate, in order.
    pub reset_variants: Vec<ResetVariant>,
    /// Flash page size in bytes.
    pub page_size: usize,
    /// Synchronizer tuning.
    pub sync: SyncConfig,
    /// Reply timeouts while programming.
    pub timeouts: ProgramTimeouts,
    /// What to do with unacknowledged commands.
    pub ack_policy: AckPolicy,
    /// Wall-clock cap of one upload or probe.
    pub max_duration: Duration,
}

impl UploadConfig {
    /// Configuration for `board` with default tuning.
    ///
    /// Fails with [`Error::Unsupported`] for boards that do not speak
    /// STK500v1.
    pub fn for_board(board: &BoardProfile) -> Result<Self> {
        board.validate()?;
        Ok(Self {
            baud_rates: board.baud_rates.clone(),
            reset_variants: ResetVariant::ALL.to_vec(),
            page_size: board.page_size,
            sync: SyncConfig::default(),
            timeouts: ProgramTimeouts::default(),
            ack_policy: AckPolicy::default(),
            max_duration: DEFAULT_MAX_DURATION,
        })
    }

    /// Replace the baud rate candidates.
    #[must_use]
    pub fn with_baud_rates(mut self, baud_rates: Vec<u32>) -> Self {
        self.baud_rates = baud_rates;
        self
    }

    /// Replace the reset variants.
    #[must_use]
    pub fn with_reset_variants(mut self, variants: Vec<ResetVariant>) -> Self {
        self.reset_variants = variants;
        self
    }

    /// Set the ack policy.
    #[must_use]
    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    /// Set the synchronizer tuning.
    #[must_use]
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Set the wall-clock cap.
    #[must_use]
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.baud_rates.is_empty() || self.baud_rates.contains(&0) {
            return Err(Error::Config("no usable baud rate configured".into()));
        }
        if self.reset_variants.is_empty() {
            return Err(Error::Config("no reset variant configured".into()));
        }
        if self.sync.attempts == 0 {
            return Err(Error::Config("sync attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Summary of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Baud rate that worked.
    pub baud_rate: u32,
    /// Reset variant that worked.
    pub reset_variant: ResetVariant,
    /// `GET_SYNC` attempts on the successful connection.
    pub sync_attempts: usize,
    /// Pages written.
    pub pages: usize,
    /// Bytes of firmware.
    pub bytes: usize,
    /// Unacknowledged commands tolerated by the lenient policy.
    pub missed_acks: usize,
    /// Wall-clock time.
    pub elapsed: Duration,
}

/// What the bootloader reported about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderInfo {
    /// Device signature bytes.
    pub signature: [u8; 3],
    /// Bootloader software version `(major, minor)`.
    pub version: (u8, u8),
    /// Baud rate that worked.
    pub baud_rate: u32,
    /// Reset variant that worked.
    pub reset_variant: ResetVariant,
}

impl BootloaderInfo {
    /// Chip name for the signature, if known.
    pub fn chip_name(&self) -> Option<&'static str> {
        chip_name(self.signature)
    }
}

/// An open, synchronized connection.
struct Connected<P: Port> {
    conn: SerialConnection<P>,
    baud_rate: u32,
    variant: ResetVariant,
    sync_attempts: usize,
}

/// STK500v1 uploader over any [`PortOpener`].
pub struct AvrFlasher<O: PortOpener> {
    opener: O,
    config: UploadConfig,
    interrupt: Option<InterruptChecker>,
}

impl<O: PortOpener> AvrFlasher<O> {
    /// Create an uploader.
    pub fn new(opener: O, config: UploadConfig) -> Self {
        Self {
            opener,
            config,
            interrupt: None,
        }
    }

    /// Use `checker` instead of the process-wide interrupt checker.
    #[must_use]
    pub fn with_interrupt_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.interrupt = Some(Arc::new(checker));
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Upload `image`.
    ///
    /// Emits progress events ending in exactly one `Done` or `Error` event.
    /// The port is closed on every path before this returns.
    pub fn upload(
        &mut self,
        image: &HexImage,
        observer: &mut dyn UploadObserver,
    ) -> Result<UploadReport> {
        let start = Instant::now();
        let mut session = UploadSession::new(
            observer,
            start + self.config.max_duration,
            self.interrupt.clone(),
        );

        let result = self.run_upload(image, &mut session, start);
        match &result {
            Ok(report) => {
                info!(
                    "Uploaded {} bytes in {:.1}s",
                    report.bytes,
                    report.elapsed.as_secs_f32()
                );
                session.finish(format!("Uploaded {} bytes", report.bytes));
            },
            Err(e) => session.fail(e),
        }
        result
    }

    fn run_upload(
        &mut self,
        image: &HexImage,
        session: &mut UploadSession<'_>,
        start: Instant,
    ) -> Result<UploadReport> {
        self.config.validate()?;
        if image.is_empty() {
            return Err(Error::MalformedImage(
                "image contains no data records".into(),
            ));
        }

        let mut connected = self.connect(session)?;
        let result = self.program(&mut connected.conn, image, session);
        if let Err(e) = connected.conn.close() {
            warn!("Failed to close {}: {e}", self.opener.port_name());
        }

        let report = result?;
        Ok(UploadReport {
            baud_rate: connected.baud_rate,
            reset_variant: connected.variant,
            sync_attempts: connected.sync_attempts,
            pages: report.pages,
            bytes: image.len(),
            missed_acks: report.missed_acks,
            elapsed: start.elapsed(),
        })
    }

    fn program(
        &self,
        conn: &mut SerialConnection<O::Port>,
        image: &HexImage,
        session: &mut UploadSession<'_>,
    ) -> Result<ProgramReport> {
        let total = image.page_count(self.config.page_size);
        session.report(
            Stage::Uploading,
            20,
            format!("Uploading {} bytes in {total} pages", image.len()),
        );

        let mut programmer = PageProgrammer::new(conn, self.config.page_size)
            .with_policy(self.config.ack_policy)
            .with_timeouts(self.config.timeouts);
        programmer.enter_progmode(session)?;
        let report = programmer.program(image, session)?;

        session.report(Stage::Verifying, 95, "Leaving programming mode");
        programmer.leave_progmode(session)?;
        Ok(report)
    }

    /// Connect to the bootloader and read its signature and version.
    pub fn probe(&mut self, observer: &mut dyn UploadObserver) -> Result<BootloaderInfo> {
        let mut session = UploadSession::new(
            observer,
            Instant::now() + self.config.max_duration,
            self.interrupt.clone(),
        );

        let result = self.run_probe(&mut session);
        match &result {
            Ok(info) => session.finish(format!(
                "Bootloader v{}.{}, signature {:02X} {:02X} {:02X}",
                info.version.0, info.version.1, info.signature[0], info.signature[1], info.signature[2]
            )),
            Err(e) => session.fail(e),
        }
        result
    }

    fn run_probe(&mut self, session: &mut UploadSession<'_>) -> Result<BootloaderInfo> {
        self.config.validate()?;
        let mut connected = self.connect(session)?;

        let result = self.identify(&mut connected.conn, session);
        if let Err(e) = connected.conn.close() {
            warn!("Failed to close {}: {e}", self.opener.port_name());
        }

        let (signature, version) = result?;
        Ok(BootloaderInfo {
            signature,
            version,
            baud_rate: connected.baud_rate,
            reset_variant: connected.variant,
        })
    }

    fn identify(
        &self,
        conn: &mut SerialConnection<O::Port>,
        session: &mut UploadSession<'_>,
    ) -> Result<([u8; 3], (u8, u8))> {
        let mut programmer = PageProgrammer::new(conn, self.config.page_size)
            .with_policy(self.config.ack_policy)
            .with_timeouts(self.config.timeouts);
        let version = programmer.software_version(session)?;
        programmer.enter_progmode(session)?;
        let signature = programmer.read_signature(session)?;
        programmer.leave_progmode(session)?;
        Ok((signature, version))
    }

    /// Walk the baud rate / reset variant combinations until one syncs.
    fn connect(&mut self, session: &mut UploadSession<'_>) -> Result<Connected<O::Port>> {
        let mut tried = Vec::new();
        let bauds = self.config.baud_rates.clone();
        let variants = self.config.reset_variants.clone();

        for &baud in &bauds {
            for &variant in &variants {
                session.checkpoint()?;
                if session.expired() {
                    return Err(Error::SyncFailure {
                        attempts: tried,
                        timed_out: true,
                    });
                }

                session.report(
                    Stage::Connecting,
                    0,
                    format!("Opening {} at {baud} baud", self.opener.port_name()),
                );
                let port = self.opener.open(baud)?;
                let mut conn = SerialConnection::new(port);

                session.report(Stage::Connecting, 5, format!("Resetting board ({variant})"));
                match self.try_sync(&mut conn, variant, session) {
                    Ok(SyncOutcome::Synced { attempts }) => {
                        info!("In sync at {baud} baud using {variant} reset");
                        return Ok(Connected {
                            conn,
                            baud_rate: baud,
                            variant,
                            sync_attempts: attempts,
                        });
                    },
                    Ok(outcome) => {
                        warn!("No answer at {baud} baud with {variant} reset ({outcome:?})");
                        tried.push(format!("{baud} baud / {variant} reset"));
                        if let Err(e) = conn.close() {
                            debug!("Close after failed sync: {e}");
                        }
                    },
                    Err(e) => {
                        if let Err(close_err) = conn.close() {
                            debug!("Close after error: {close_err}");
                        }
                        return Err(e);
                    },
                }
            }
        }

        Err(Error::SyncFailure {
            attempts: tried,
            timed_out: session.expired(),
        })
    }

    fn try_sync(
        &self,
        conn: &mut SerialConnection<O::Port>,
        variant: ResetVariant,
        session: &mut UploadSession<'_>,
    ) -> Result<SyncOutcome> {
        reset_board(conn, variant)?;
        conn.drain(DRAIN_QUIET)?;

        session.report(
            Stage::Syncing,
            10,
            format!("Waiting for bootloader at {} baud", conn.baud_rate()),
        );
        let outcome = Synchronizer::new(conn, &self.config.sync).run(session, |c| {
            reset_board(c, variant)?;
            c.drain(DRAIN_QUIET).map(|_| ())
        })?;

        if outcome.is_synced() {
            // Late answers to earlier GET_SYNCs must not be read as replies.
            conn.drain(DRAIN_QUIET)?;
        }
        Ok(outcome)
    }
}

#[cfg(feature = "native")]
mod native_impl {
    use super::{AvrFlasher, Result, UploadConfig};
    use crate::port::NativePortOpener;
    use crate::target::board::BoardProfile;

    impl AvrFlasher<NativePortOpener> {
        /// Uploader for `board` on the serial device `port_name`.
        pub fn open(port_name: &str, board: &BoardProfile) -> Result<Self> {
            Ok(Self::new(
                NativePortOpener::new(port_name),
                UploadConfig::for_board(board)?,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;
    use crate::testing::{MockOpener, SimBootloader};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fast_config(baud_rates: Vec<u32>) -> UploadConfig {
        let board = BoardProfile::new("test", "Test board", baud_rates, 128);
        let mut config = UploadConfig::for_board(&board)
            .unwrap()
            .with_reset_variants(vec![ResetVariant::Standard])
            .with_sync(SyncConfig {
                attempts: 4,
                read_window: Duration::from_millis(10),
                attempt_delay: Duration::from_millis(1),
                reset_every: None,
            });
        config.timeouts = ProgramTimeouts {
            address_ack: Duration::from_millis(30),
            page_ack: Duration::from_millis(30),
            command_ack: Duration::from_millis(30),
        };
        config
    }

    fn flasher(sim: &SimBootloader, config: UploadConfig) -> AvrFlasher<MockOpener> {
        let _ = env_logger::builder().is_test(true).try_init();
        AvrFlasher::new(MockOpener::new(sim), config).with_interrupt_checker(|| false)
    }

    fn image_of(len: usize) -> HexImage {
        let mut text = String::new();
        for (i, chunk) in vec![0x5Au8; len].chunks(16).enumerate() {
            let addr = (i * 16) as u16;
            let mut sum = (chunk.len() as u8)
                .wrapping_add((addr >> 8) as u8)
                .wrapping_add(addr as u8);
            text.push_str(&format!(":{:02X}{addr:04X}00", chunk.len()));
            for b in chunk {
                text.push_str(&format!("{b:02X}"));
                sum = sum.wrapping_add(*b);
            }
            text.push_str(&format!("{:02X}\n", sum.wrapping_neg()));
        }
        text.push_str(":00000001FF\n");
        HexImage::parse(&text)
    }

    #[test]
    fn test_successful_upload() {
        let sim = SimBootloader::answering_on(2);
        let mut flasher = flasher(&sim, fast_config(vec![115_200]));
        let mut events = Vec::new();
        let mut observer = |e: &ProgressEvent| events.push(e.clone());

        let report = flasher.upload(&image_of(300), &mut observer).unwrap();

        assert_eq!(report.pages, 3);
        assert_eq!(report.bytes, 300);
        assert_eq!(report.baud_rate, 115_200);
        assert_eq!(report.sync_attempts, 2);
        assert_eq!(report.missed_acks, 0);

        let state = sim.state();
        assert!(state.entered_progmode);
        assert!(state.left_progmode);
        assert_eq!(state.pages.len(), 3);
        drop(state);
        assert_eq!(flasher.opener.log.close_count(), 1);

        let percents: Vec<u8> = events.iter().map(|e| e.percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        for expected in [0, 5, 10, 20, 90, 95, 100] {
            assert!(percents.contains(&expected), "missing {expected}%");
        }
        let last = events.last().unwrap();
        assert_eq!((last.stage, last.percent), (Stage::Done, 100));
        assert_eq!(events.iter().filter(|e| e.stage.is_terminal()).count(), 1);
    }

    #[test]
    fn test_board_answers_after_second_reset() {
        let sim = SimBootloader::default();
        sim.state().resets_needed = 2;
        let config = fast_config(vec![115_200]).with_sync(SyncConfig {
            attempts: 6,
            read_window: Duration::from_millis(10),
            attempt_delay: Duration::from_millis(1),
            reset_every: Some(2),
        });
        let mut flasher = flasher(&sim, config);

        let report = flasher
            .upload(&image_of(64), &mut |_: &ProgressEvent| {})
            .unwrap();

        assert_eq!(report.sync_attempts, 3);
        assert_eq!(report.pages, 1);
        assert_eq!(flasher.opener.log.reset_pulses(), 2);
        assert_eq!(flasher.opener.log.opens(), vec![115_200]);
        assert_eq!(flasher.opener.log.close_count(), 1);
        assert_eq!(sim.state().get_sync_count, 3);
    }

    #[test]
    fn test_falls_back_to_second_baud() {
        let sim = SimBootloader::default();
        sim.state().baud = Some(57_600);
        let mut flasher = flasher(&sim, fast_config(vec![115_200, 57_600]));
        let mut observer = |_: &ProgressEvent| {};

        let report = flasher.upload(&image_of(128), &mut observer).unwrap();

        assert_eq!(report.baud_rate, 57_600);
        assert_eq!(flasher.opener.log.opens(), vec![115_200, 57_600]);
        // The failed combination is closed before the port is reopened.
        assert_eq!(flasher.opener.log.close_count(), 2);
    }

    #[test]
    fn test_sync_failure_lists_combinations_and_closes() {
        let sim = SimBootloader::never_answering();
        let config = fast_config(vec![115_200, 57_600])
            .with_reset_variants(vec![ResetVariant::Standard, ResetVariant::DtrOnly]);
        let mut flasher = flasher(&sim, config);
        let mut events = Vec::new();
        let mut observer = |e: &ProgressEvent| events.push(e.clone());

        let err = flasher.upload(&image_of(64), &mut observer).unwrap_err();

        match &err {
            Error::SyncFailure {
                attempts,
                timed_out,
            } => {
                assert!(!timed_out);
                assert_eq!(
                    attempts,
                    &vec![
                        "115200 baud / Standard reset".to_string(),
                        "115200 baud / DTR-only reset".to_string(),
                        "57600 baud / Standard reset".to_string(),
                        "57600 baud / DTR-only reset".to_string(),
                    ]
                );
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(flasher.opener.log.close_count(), 4);
        assert_eq!(sim.state().get_sync_count, 16);

        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::Error);
        assert_eq!(last.percent, 10);
    }

    #[test]
    fn test_empty_image_touches_no_hardware() {
        let sim = SimBootloader::default();
        let mut flasher = flasher(&sim, fast_config(vec![115_200]));
        let mut observer = |_: &ProgressEvent| {};

        let err = flasher
            .upload(&HexImage::parse(":00000001FF\n"), &mut observer)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedImage(_)));
        assert!(flasher.opener.log.opens().is_empty());
    }

    #[test]
    fn test_stk500v2_board_is_unsupported() {
        let mega = BoardProfile::find("mega2560").unwrap();
        assert!(matches!(
            UploadConfig::for_board(&mega),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_invalid_page_size_is_rejected() {
        let sim = SimBootloader::default();
        let mut config = fast_config(vec![115_200]);
        config.page_size = 0;
        let mut flasher = flasher(&sim, config);
        let mut observer = |_: &ProgressEvent| {};
        assert!(flasher.upload(&image_of(16), &mut observer).is_err());
        assert!(flasher.opener.log.opens().is_empty());
    }

    #[test]
    fn test_port_unavailable_is_terminal() {
        let sim = SimBootloader::default();
        let mut flasher = flasher(&sim, fast_config(vec![115_200, 57_600]));
        flasher.opener.busy = true;
        let mut observer = |_: &ProgressEvent| {};

        let err = flasher.upload(&image_of(16), &mut observer).unwrap_err();
        assert!(matches!(err, Error::PortUnavailable { .. }));
        assert_eq!(flasher.opener.log.close_count(), 0);
    }

    #[test]
    fn test_strict_ack_failure_closes_port() {
        let sim = SimBootloader::default();
        sim.state().fail_page = Some(0);
        let config = fast_config(vec![115_200]).with_ack_policy(AckPolicy::Strict);
        let mut flasher = flasher(&sim, config);
        let mut observer = |_: &ProgressEvent| {};

        let err = flasher.upload(&image_of(300), &mut observer).unwrap_err();
        assert!(matches!(err, Error::PageProgramFailure { page: 0, .. }));
        assert_eq!(flasher.opener.log.close_count(), 1);
    }

    #[test]
    fn test_cancel_during_pages_closes_port() {
        let sim = SimBootloader::default();
        let cancel = Arc::new(AtomicBool::new(false));
        let checker = Arc::clone(&cancel);
        let mut flasher = AvrFlasher::new(MockOpener::new(&sim), fast_config(vec![115_200]))
            .with_interrupt_checker(move || checker.load(Ordering::SeqCst));
        let mut observer = |e: &ProgressEvent| {
            if e.stage == Stage::Uploading && e.percent > 20 {
                cancel.store(true, Ordering::SeqCst);
            }
        };

        let err = flasher.upload(&image_of(512), &mut observer).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(sim.state().pages.len(), 1);
        assert_eq!(flasher.opener.log.close_count(), 1);
    }

    #[test]
    fn test_expired_budget_is_timed_out_sync_failure() {
        let sim = SimBootloader::never_answering();
        let config = fast_config(vec![115_200]).with_max_duration(Duration::ZERO);
        let mut flasher = flasher(&sim, config);
        let mut observer = |_: &ProgressEvent| {};

        match flasher.upload(&image_of(16), &mut observer) {
            Err(Error::SyncFailure { timed_out, .. }) => assert!(timed_out),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(flasher.opener.log.opens().is_empty());
    }

    #[test]
    fn test_probe_reads_signature_and_version() {
        let sim = SimBootloader::default();
        let mut flasher = flasher(&sim, fast_config(vec![115_200]));
        let mut observer = |_: &ProgressEvent| {};

        let info = flasher.probe(&mut observer).unwrap();
        assert_eq!(info.signature, [0x1E, 0x95, 0x0F]);
        assert_eq!(info.chip_name(), Some("ATmega328P"));
        assert_eq!(info.version, (8, 0));
        assert!(sim.state().pages.is_empty());
        assert_eq!(flasher.opener.log.close_count(), 1);
    }
}
