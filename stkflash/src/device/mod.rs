//! Serial port discovery.
//!
//! Arduino-class boards show up either as a native USB CDC device
//! (Arduino/Genuino VIDs) or behind a USB-to-UART bridge. Ports are
//! classified by USB VID/PID so the most likely board can be picked
//! automatically.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Kind of USB device behind a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// Arduino/Genuino board with on-board USB (16U2 or 8U2 firmware).
    Arduino,
    /// CH340/CH341, common on Nano and Pro Mini clones.
    Ch340,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232R and relatives (Duemilanove, older Nano, FTDI adapters).
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Anything else.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches every product of the
/// vendor.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x2341, &[], DeviceKind::Arduino),
    (0x2A03, &[], DeviceKind::Arduino),
    (0x1A86, &[0x7523, 0x7522, 0x5523], DeviceKind::Ch340),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6014, 0x6015], DeviceKind::Ftdi),
    (0x067B, &[0x2303, 0x23A3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a USB VID/PID.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Arduino => "Arduino",
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the kind was recognized.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Auto-detection preference, lower first.
    fn rank(self) -> u8 {
        match self {
            Self::Arduino => 0,
            Self::Ch340 | Self::Ftdi => 1,
            Self::Cp210x | Self::Prolific => 2,
            Self::Unknown => 3,
        }
    }
}

/// A discovered serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Device path or name, e.g. `/dev/ttyACM0` or `COM3`.
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB vendor id.
    pub vid: Option<u16>,
    /// USB product id.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A port without USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Whether this port is probably a board.
    pub fn is_likely_board(&self) -> bool {
        self.device.is_known()
    }
}

/// Enumerate serial ports.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|info| {
            let mut port = DetectedPort::plain(info.port_name);
            if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                port.device = DeviceKind::from_vid_pid(usb.vid, usb.pid);
                trace!(
                    "Found {} (VID {:04X}, PID {:04X}, {})",
                    port.name,
                    usb.vid,
                    usb.pid,
                    port.device.name()
                );
                port.vid = Some(usb.vid);
                port.pid = Some(usb.pid);
                port.manufacturer = usb.manufacturer;
                port.product = usb.product;
                port.serial = usb.serial_number;
            }
            port
        })
        .collect()
}

/// Enumerate serial ports (no backend compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the most likely board among `ports`: Arduino native USB first, then
/// the common bridges, then the first port at all.
pub fn pick_best_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports.iter().min_by_key(|p| p.device.rank())
}

/// Auto-detect one board port.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();
    let port = pick_best_port(&ports).ok_or(Error::DeviceNotFound)?;
    if port.device.is_known() {
        info!("Auto-detected {} port: {}", port.device.name(), port.name);
    } else {
        info!("Using first available port: {}", port.name);
    }
    Ok(port.clone())
}

/// Auto-detect one board port (no backend compiled in).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::Unsupported(
        "port discovery needs the `native` feature".to_string(),
    ))
}

/// One display line per port.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };
            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{device_info}{product_info}", port.name)
        })
        .collect()
}
