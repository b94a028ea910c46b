//! Upload command implementation.

use {
    super::boards::resolve_board,
    crate::{Cli, CliError, config::Config, get_port, use_fancy_output, was_interrupted},
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::warn,
    std::{path::Path, time::Duration},
    stkflash::{
        AckPolicy, AvrFlasher, BoardProfile, HexImage, NativePortOpener, ParseOptions,
        ProgressEvent, ResetVariant, Stage, SyncConfig, UploadConfig, UploadObserver,
    },
};

/// Flags of `stkflash upload`.
#[derive(Debug, Default)]
pub(crate) struct UploadFlags {
    pub strict_ack: bool,
    pub verify_hex_checksum: bool,
    pub reset: Vec<ResetVariant>,
    pub max_duration: Option<u64>,
}

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Board defaults, then the config file, then command-line flags.
pub(crate) fn build_upload_config(
    cli: &Cli,
    config: &Config,
    board: &BoardProfile,
    flags: &UploadFlags,
) -> Result<UploadConfig> {
    let mut upload = UploadConfig::for_board(board)?;

    if !cli.baud.is_empty() {
        upload = upload.with_baud_rates(cli.baud.clone());
    } else if let Some(baud) = config.port.baud {
        upload = upload.with_baud_rates(vec![baud]);
    }

    if !flags.reset.is_empty() {
        upload = upload.with_reset_variants(flags.reset.clone());
    } else if !config.upload.reset.is_empty() {
        upload = upload.with_reset_variants(config.upload.reset.clone());
    }

    if let Some(attempts) = config.upload.sync_attempts {
        upload = upload.with_sync(SyncConfig {
            attempts,
            ..SyncConfig::default()
        });
    }

    if let Some(limit) = flags
        .max_duration
        .map(Duration::from_secs)
        .or_else(|| config.upload.max_duration())
    {
        upload = upload.with_max_duration(limit);
    }

    if flags.strict_ack || config.upload.strict_ack {
        upload = upload.with_ack_policy(AckPolicy::Strict);
    }

    Ok(upload)
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Renders upload progress on stderr: a bar on terminals, one line per
/// stage otherwise.
pub(crate) struct ProgressReporter {
    pb: ProgressBar,
    quiet: bool,
    show_debug: bool,
    last_stage: Option<Stage>,
}

impl ProgressReporter {
    pub(crate) fn new(cli: &Cli) -> Self {
        Self {
            pb: progress_bar(cli.quiet),
            quiet: cli.quiet,
            show_debug: cli.verbose >= 3,
            last_stage: None,
        }
    }
}

impl UploadObserver for ProgressReporter {
    fn progress(&mut self, event: &ProgressEvent) {
        self.pb.set_position(u64::from(event.percent));
        match event.stage {
            Stage::Done => self.pb.finish_with_message(event.message.clone()),
            Stage::Error => self.pb.abandon_with_message(event.message.clone()),
            _ => self.pb.set_message(event.message.clone()),
        }

        if self.pb.is_hidden() && !self.quiet && self.last_stage != Some(event.stage) {
            eprintln!("[{:>3}%] {}: {}", event.percent, event.stage, event.message);
        }
        self.last_stage = Some(event.stage);
    }

    fn debug(&mut self, line: &str) {
        if self.show_debug {
            self.pb
                .suspend(|| eprintln!("  {}", style(line).dim()));
        }
    }
}

/// Upload command implementation.
pub(crate) fn cmd_upload(
    cli: &Cli,
    config: &mut Config,
    file: &Path,
    flags: &UploadFlags,
) -> Result<()> {
    ensure_not_interrupted()?;

    let board = resolve_board(cli, config)?;
    let options = ParseOptions {
        verify_checksums: flags.verify_hex_checksum || config.upload.verify_hex_checksum,
    };
    let image = HexImage::from_file(file, options)
        .with_context(|| format!("Failed to load {}", file.display()))?;
    if image.is_empty() {
        anyhow::bail!("{} contains no program data", file.display());
    }

    let upload_config = build_upload_config(cli, config, &board, flags)?;

    if !cli.quiet {
        eprintln!(
            "{} {} ({} bytes, {} pages of {} bytes)",
            style("📦").cyan(),
            file.display(),
            image.len(),
            image.page_count(upload_config.page_size),
            upload_config.page_size
        );
    }

    let port = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Uploading to {} on {}",
            style("🔌").cyan(),
            style(&board).bold(),
            style(&port).green()
        );
    }

    let mut flasher = AvrFlasher::new(NativePortOpener::new(&port), upload_config);
    let mut reporter = ProgressReporter::new(cli);
    let report = flasher
        .upload(&image, &mut reporter)
        .context("Upload failed")?;

    if report.missed_acks > 0 {
        warn!(
            "{} bootloader acknowledgement(s) were missing; verify the sketch runs as expected",
            report.missed_acks
        );
    }

    if !cli.quiet {
        eprintln!(
            "\n{} Uploaded {} bytes in {} pages at {} baud ({} reset) in {:.1}s",
            style("🎉").green().bold(),
            report.bytes,
            report.pages,
            report.baud_rate,
            report.reset_variant,
            report.elapsed.as_secs_f64()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, clap::Parser};

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    fn nano() -> BoardProfile {
        BoardProfile::find("nano").unwrap()
    }

    #[test]
    fn test_build_upload_config_defaults_to_board() {
        let upload = build_upload_config(
            &cli(&["stkflash", "probe"]),
            &Config::default(),
            &nano(),
            &UploadFlags::default(),
        )
        .unwrap();
        assert_eq!(upload.baud_rates, vec![115_200, 57_600]);
        assert_eq!(upload.reset_variants, ResetVariant::ALL.to_vec());
        assert_eq!(upload.page_size, 128);
        assert_eq!(upload.ack_policy, AckPolicy::Lenient);
        assert_eq!(upload.max_duration, stkflash::target::avr::DEFAULT_MAX_DURATION);
    }

    #[test]
    fn test_build_upload_config_config_file_values() {
        let mut config = Config::default();
        config.port.baud = Some(57_600);
        config.upload.reset = vec![ResetVariant::DtrOnly];
        config.upload.sync_attempts = Some(5);
        config.upload.max_duration_secs = Some(20);
        config.upload.strict_ack = true;

        let upload = build_upload_config(
            &cli(&["stkflash", "probe"]),
            &config,
            &nano(),
            &UploadFlags::default(),
        )
        .unwrap();
        assert_eq!(upload.baud_rates, vec![57_600]);
        assert_eq!(upload.reset_variants, vec![ResetVariant::DtrOnly]);
        assert_eq!(upload.sync.attempts, 5);
        assert_eq!(upload.max_duration, Duration::from_secs(20));
        assert_eq!(upload.ack_policy, AckPolicy::Strict);
    }

    #[test]
    fn test_build_upload_config_flags_win() {
        let mut config = Config::default();
        config.port.baud = Some(57_600);
        config.upload.reset = vec![ResetVariant::DtrOnly];
        config.upload.max_duration_secs = Some(20);

        let flags = UploadFlags {
            strict_ack: true,
            reset: vec![ResetVariant::Combined],
            max_duration: Some(5),
            ..UploadFlags::default()
        };
        let upload = build_upload_config(
            &cli(&["stkflash", "--baud", "19200", "probe"]),
            &config,
            &nano(),
            &flags,
        )
        .unwrap();
        assert_eq!(upload.baud_rates, vec![19_200]);
        assert_eq!(upload.reset_variants, vec![ResetVariant::Combined]);
        assert_eq!(upload.max_duration, Duration::from_secs(5));
        assert_eq!(upload.ack_policy, AckPolicy::Strict);
    }

    #[test]
    fn test_build_upload_config_rejects_stk500v2_board() {
        let mega = BoardProfile::find("mega2560").unwrap();
        let err = build_upload_config(
            &cli(&["stkflash", "probe"]),
            &Config::default(),
            &mega,
            &UploadFlags::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<stkflash::Error>(),
            Some(stkflash::Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_reporter_tracks_stage_without_terminal() {
        let mut reporter = ProgressReporter::new(&cli(&["stkflash", "--quiet", "probe"]));
        assert!(reporter.pb.is_hidden());
        reporter.progress(&ProgressEvent {
            stage: Stage::Syncing,
            percent: 10,
            message: "Waiting for bootloader".to_string(),
        });
        assert_eq!(reporter.last_stage, Some(Stage::Syncing));
        assert_eq!(reporter.pb.position(), 10);
    }
}
