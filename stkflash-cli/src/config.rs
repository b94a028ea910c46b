//! Configuration file support for stkflash.
//!
//! Sources, highest priority first:
//! 1. Command-line arguments
//! 2. Environment variables (`STKFLASH_*`)
//! 3. Local config file (`./stkflash.toml`)
//! 4. Global config file (`<config dir>/stkflash/config.toml`)
//!
//! `--config PATH` replaces 3 and 4.

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use stkflash::{BoardProfile, ResetVariant};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "stkflash.toml";

/// USB VID/PID remembered as "this is a board".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// `[port]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate tried instead of the board's list.
    pub baud: Option<u32>,
    /// Extra USB devices treated as boards during port selection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// `[upload]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSection {
    /// Default board id or FQBN.
    pub board: Option<String>,
    /// Fail on the first missing acknowledgement.
    #[serde(default)]
    pub strict_ack: bool,
    /// Reject HEX records with bad checksums.
    #[serde(default)]
    pub verify_hex_checksum: bool,
    /// GET_SYNC attempts per baud rate and reset variant.
    pub sync_attempts: Option<usize>,
    /// Wall-clock cap of one upload, in seconds.
    pub max_duration_secs: Option<u64>,
    /// Reset variants to try, in order. Empty means all.
    #[serde(default)]
    pub reset: Vec<ResetVariant>,
}

impl UploadSection {
    /// `max_duration_secs` as a duration.
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Upload defaults.
    #[serde(default)]
    pub upload: UploadSection,
    /// Custom board profiles, looked up before the built-in ones.
    #[serde(default, rename = "board", skip_serializing_if = "Vec::is_empty")]
    pub boards: Vec<BoardProfile>,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (`--config`).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "stkflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge `other` over this config.
    fn merge(&mut self, other: Self) {
        if other.port.serial.is_some() {
            self.port.serial = other.port.serial;
        }
        if other.port.baud.is_some() {
            self.port.baud = other.port.baud;
        }
        for device in other.port.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }

        if other.upload.board.is_some() {
            self.upload.board = other.upload.board;
        }
        if other.upload.strict_ack {
            self.upload.strict_ack = true;
        }
        if other.upload.verify_hex_checksum {
            self.upload.verify_hex_checksum = true;
        }
        if other.upload.sync_attempts.is_some() {
            self.upload.sync_attempts = other.upload.sync_attempts;
        }
        if other.upload.max_duration_secs.is_some() {
            self.upload.max_duration_secs = other.upload.max_duration_secs;
        }
        if !other.upload.reset.is_empty() {
            self.upload.reset = other.upload.reset;
        }

        // A later file redefining a board id replaces the earlier profile.
        for board in other.boards {
            self.boards.retain(|b| !b.id.eq_ignore_ascii_case(&board.id));
            self.boards.push(board);
        }
    }

    /// Resolve a board by id or FQBN: custom profiles first, then built-in.
    pub fn find_board(&self, query: &str) -> Option<BoardProfile> {
        BoardProfile::find_in(&self.boards, query).or_else(|| BoardProfile::find(query))
    }

    /// Custom profiles followed by the built-in ones they do not shadow.
    pub fn all_boards(&self) -> Vec<BoardProfile> {
        let mut boards = self.boards.clone();
        boards.extend(
            BoardProfile::builtin()
                .into_iter()
                .filter(|b| !self.boards.iter().any(|c| c.id.eq_ignore_ascii_case(&b.id))),
        );
        boards
    }

    /// Save a USB device for future port selection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_CONFIG_FILE).exists() {
            PathBuf::from(LOCAL_CONFIG_FILE)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            PathBuf::from(LOCAL_CONFIG_FILE)
        };

        // Rewrite only the target file, not the merged view.
        let mut on_disk = Self::load_from_file(&path).unwrap_or_default();
        on_disk.port.usb_device.push(device.clone());
        fs::write(&path, toml::to_string_pretty(&on_disk)?)?;

        self.port.usb_device.push(device);
        info!("Saved USB device to {}", path.display());
        Ok(())
    }
}
