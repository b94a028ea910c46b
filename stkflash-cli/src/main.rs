//! stkflash CLI - upload firmware to Arduino-class AVR boards.
//!
//! ## Features
//!
//! - Upload Intel HEX sketches over the STK500v1 serial bootloader
//! - Automatic baud rate and reset line fallback
//! - Bootloader probing (signature, version)
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use stkflash::ResetVariant;
use thiserror::Error;

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors with a dedicated exit code.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup. Exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Stopped by the user. Exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

/// stkflash - upload firmware to AVR boards through their serial bootloader.
///
/// Environment variables:
///   STKFLASH_PORT              - Default serial port
///   STKFLASH_BOARD             - Default board id or FQBN
///   STKFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "stkflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    stkflash upload blink.ino.hex --board nano\n  \
    stkflash --port /dev/ttyUSB0 probe\n  \
    stkflash info blink.ino.hex --json")]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "STKFLASH_PORT")]
    port: Option<String>,

    /// Board id or FQBN (see `stkflash boards`).
    #[arg(short = 'B', long, global = true, env = "STKFLASH_BOARD")]
    board: Option<String>,

    /// Baud rate to try; repeat to try several in order.
    #[arg(short, long, global = true, value_delimiter = ',')]
    baud: Vec<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "STKFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// Offer all serial ports, not only recognized boards.
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Upload an Intel HEX file to the board.
    Upload {
        /// Path to the .hex file.
        file: PathBuf,

        /// Fail on the first missing bootloader acknowledgement.
        #[arg(long)]
        strict_ack: bool,

        /// Reject HEX records with a bad checksum.
        #[arg(long)]
        verify_hex_checksum: bool,

        /// Reset variant to try; repeat to try several in order.
        #[arg(long = "reset", value_name = "VARIANT", value_parser = parse_reset_variant)]
        reset: Vec<ResetVariant>,

        /// Give up after this many seconds.
        #[arg(long, value_name = "SECS")]
        max_duration: Option<u64>,
    },

    /// Read the bootloader version and device signature.
    Probe {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show information about an Intel HEX file.
    Info {
        /// Path to the .hex file.
        file: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List known board profiles.
    Boards {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected with --install if not specified).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install completions into your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parse a reset variant name such as `dtr-only`.
fn parse_reset_variant(s: &str) -> Result<ResetVariant, String> {
    ResetVariant::from_name(s).ok_or_else(|| {
        format!("unknown reset variant '{s}' (expected standard, dtr-only, rts-only or combined)")
    })
}

fn main() -> ExitCode {
    // NO_COLOR and TTY detection.
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if std::env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "stkflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    let installed = ctrlc::set_handler(|| {
        // A second Ctrl-C aborts without waiting for cleanup.
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
    });
    if let Err(e) = installed {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    stkflash::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Upload {
            file,
            strict_ack,
            verify_hex_checksum,
            reset,
            max_duration,
        } => commands::upload::cmd_upload(
            cli,
            &mut config,
            file,
            &commands::upload::UploadFlags {
                strict_ack: *strict_ack,
                verify_hex_checksum: *verify_hex_checksum,
                reset: reset.clone(),
                max_duration: *max_duration,
            },
        ),
        Commands::Probe { json } => commands::probe::cmd_probe(cli, &mut config, *json),
        Commands::Info { file, json } => commands::info::cmd_info(cli, &config, file, *json),
        Commands::Boards { json } => commands::boards::cmd_boards(&config, *json),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell, e.g. `stkflash completions bash`, or pass --install"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    let cancelled = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<stkflash::Error>(), Some(stkflash::Error::Cancelled)));
    if cancelled { 130 } else { 1 }
}

/// Get serial port from CLI args, config, or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_upload() {
        let cli = Cli::try_parse_from([
            "stkflash",
            "--port",
            "/dev/ttyUSB0",
            "--board",
            "nano",
            "upload",
            "blink.hex",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.board.as_deref(), Some("nano"));
        match cli.command {
            Commands::Upload {
                file,
                strict_ack,
                verify_hex_checksum,
                reset,
                max_duration,
            } => {
                assert_eq!(file, PathBuf::from("blink.hex"));
                assert!(!strict_ack);
                assert!(!verify_hex_checksum);
                assert!(reset.is_empty());
                assert!(max_duration.is_none());
            },
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_cli_parse_upload_with_all_options() {
        let cli = Cli::try_parse_from([
            "stkflash",
            "upload",
            "blink.hex",
            "--strict-ack",
            "--verify-hex-checksum",
            "--reset",
            "dtr-only",
            "--reset",
            "combined",
            "--max-duration",
            "30",
        ])
        .unwrap();
        match cli.command {
            Commands::Upload {
                strict_ack,
                verify_hex_checksum,
                reset,
                max_duration,
                ..
            } => {
                assert!(strict_ack);
                assert!(verify_hex_checksum);
                assert_eq!(reset, vec![ResetVariant::DtrOnly, ResetVariant::Combined]);
                assert_eq!(max_duration, Some(30));
            },
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_cli_baud_is_repeatable_and_comma_separated() {
        let cli = Cli::try_parse_from(["stkflash", "-b", "115200", "--baud", "57600", "probe"]).unwrap();
        assert_eq!(cli.baud, vec![115_200, 57_600]);

        let cli = Cli::try_parse_from(["stkflash", "probe", "--baud", "115200,57600"]).unwrap();
        assert_eq!(cli.baud, vec![115_200, 57_600]);
    }

    #[test]
    fn test_cli_parse_info_json() {
        let cli = Cli::try_parse_from(["stkflash", "info", "a.hex", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { json: true, .. }));
    }

    #[test]
    fn test_cli_parse_boards_and_list_ports() {
        let cli = Cli::try_parse_from(["stkflash", "boards"]).unwrap();
        assert!(matches!(cli.command, Commands::Boards { json: false }));
        let cli = Cli::try_parse_from(["stkflash", "list-ports", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["stkflash", "completions", "bash"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions {
                shell: Some(Shell::Bash),
                install: false
            }
        ));
    }

    #[test]
    fn test_cli_default_values() {
        let cli = Cli::try_parse_from(["stkflash", "list-ports"]).unwrap();
        assert!(cli.baud.is_empty());
        assert!(!cli.quiet);
        assert!(!cli.non_interactive);
        assert!(!cli.confirm_port);
        assert!(!cli.list_all_ports);
        assert!(cli.config_path.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "stkflash",
            "--port",
            "COM3",
            "-B",
            "arduino:avr:uno",
            "-vv",
            "--quiet",
            "--non-interactive",
            "--confirm-port",
            "--list-all-ports",
            "--config",
            "/tmp/stkflash.toml",
            "list-ports",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("COM3"));
        assert_eq!(cli.board.as_deref(), Some("arduino:avr:uno"));
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
        assert!(cli.non_interactive);
        assert!(cli.confirm_port);
        assert!(cli.list_all_ports);
        assert_eq!(cli.config_path, Some(PathBuf::from("/tmp/stkflash.toml")));
    }

    #[test]
    fn test_cli_rejects_bad_input() {
        assert!(Cli::try_parse_from(["stkflash"]).is_err());
        assert!(Cli::try_parse_from(["stkflash", "upload"]).is_err());
        assert!(Cli::try_parse_from(["stkflash", "--baud", "fast", "probe"]).is_err());
        assert!(Cli::try_parse_from(["stkflash", "upload", "a.hex", "--reset", "sideways"]).is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code(&stkflash::Error::Cancelled.into()), 130);
        let wrapped = anyhow::Error::from(stkflash::Error::Cancelled).context("Upload failed");
        assert_eq!(exit_code(&wrapped), 130);
        assert_eq!(exit_code(&stkflash::Error::DeviceNotFound.into()), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
