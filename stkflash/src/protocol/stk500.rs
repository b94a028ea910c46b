//! STK500v1 bootloader protocol commands and replies.
//!
//! This is the protocol spoken by optiboot and the older ATmegaBOOT
//! bootloaders found on Arduino-class boards.
//!
//! ## Frame Format
//!
//! Every command is an opcode, optional arguments and the `CRC_EOP`
//! terminator. A successful reply is framed by `INSYNC` and `OK`:
//!
//! ```text
//! host   -> | opcode | args ... | 0x20 (CRC_EOP) |
//! target <- | 0x14 (INSYNC) | payload ... | 0x10 (OK) |
//! ```
//!
//! Page writes carry the page length big-endian and a memory type byte:
//!
//! ```text
//! | 0x64 | len_hi | len_lo | 'F' | page bytes ... | 0x20 |
//! ```

use byteorder::{BigEndian, ByteOrder};
use std::fmt::Write as _;

/// Command opcodes.
pub mod cmd {
    /// Synchronize with the bootloader.
    pub const GET_SYNC: u8 = 0x30;
    /// Read a bootloader parameter.
    pub const GET_PARAMETER: u8 = 0x41;
    /// Enter programming mode.
    pub const ENTER_PROGMODE: u8 = 0x50;
    /// Leave programming mode (starts the application).
    pub const LEAVE_PROGMODE: u8 = 0x51;
    /// Load a word address for the next page operation.
    pub const LOAD_ADDRESS: u8 = 0x55;
    /// Program one page.
    pub const PROG_PAGE: u8 = 0x64;
    /// Read the three device signature bytes.
    pub const READ_SIGN: u8 = 0x75;
}

/// Reply bytes.
pub mod resp {
    /// Command accepted.
    pub const OK: u8 = 0x10;
    /// Command failed.
    pub const FAILED: u8 = 0x11;
    /// Reply start.
    pub const INSYNC: u8 = 0x14;
    /// The bootloader lost framing.
    pub const NOSYNC: u8 = 0x15;
}

/// Command terminator.
pub const CRC_EOP: u8 = 0x20;

/// Memory type marker for flash in `PROG_PAGE`.
pub const MEMTYPE_FLASH: u8 = b'F';

/// Bootloader software major version parameter.
pub const PARM_SW_MAJOR: u8 = 0x81;

/// Bootloader software minor version parameter.
pub const PARM_SW_MINOR: u8 = 0x82;

/// The acknowledgement pattern.
pub const SYNC_ACK: [u8; 2] = [resp::INSYNC, resp::OK];

/// A host-to-bootloader command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// `GET_SYNC`.
    GetSync,
    /// `GET_PARAMETER` for one parameter id.
    GetParameter(u8),
    /// `ENTER_PROGMODE`.
    EnterProgMode,
    /// `LEAVE_PROGMODE`.
    LeaveProgMode,
    /// `LOAD_ADDRESS` with a word address.
    LoadAddress(u16),
    /// `PROG_PAGE` for flash with the given (already padded) page bytes.
    ProgramPage(&'a [u8]),
    /// `READ_SIGN`.
    ReadSignature,
}

impl Command<'_> {
    /// Opcode byte.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::GetSync => cmd::GET_SYNC,
            Self::GetParameter(_) => cmd::GET_PARAMETER,
            Self::EnterProgMode => cmd::ENTER_PROGMODE,
            Self::LeaveProgMode => cmd::LEAVE_PROGMODE,
            Self::LoadAddress(_) => cmd::LOAD_ADDRESS,
            Self::ProgramPage(_) => cmd::PROG_PAGE,
            Self::ReadSignature => cmd::READ_SIGN,
        }
    }

    /// Number of payload bytes between `INSYNC` and `OK` in the reply.
    pub fn reply_len(&self) -> usize {
        match self {
            Self::GetParameter(_) => 1,
            Self::ReadSignature => 3,
            _ => 0,
        }
    }

    /// Build the wire frame.
    ///
    /// Page data longer than `u16::MAX` bytes cannot be framed; page sizes
    /// are validated long before a frame is built.
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let mut frame = vec![self.opcode()];
        match *self {
            Self::GetParameter(param) => frame.push(param),
            Self::LoadAddress(word) => {
                // Little-endian on the wire.
                frame.extend_from_slice(&word.to_le_bytes());
            },
            Self::ProgramPage(data) => {
                let mut len = [0u8; 2];
                BigEndian::write_u16(&mut len, data.len() as u16);
                frame.extend_from_slice(&len);
                frame.push(MEMTYPE_FLASH);
                frame.extend_from_slice(data);
            },
            Self::GetSync | Self::EnterProgMode | Self::LeaveProgMode | Self::ReadSignature => {},
        }
        frame.push(CRC_EOP);
        frame
    }
}

/// Classified bootloader reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `INSYNC payload OK` found; carries the payload.
    Ok(Vec<u8>),
    /// `INSYNC FAILED`.
    Failed,
    /// The bootloader answered `NOSYNC`.
    NoSync,
    /// Nothing was received.
    Missing,
    /// Bytes were received but no recognizable reply.
    Malformed(Vec<u8>),
}

impl Reply {
    /// Whether this is a positive acknowledgement.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Whether the bytes seen so far are a complete reply, positive or not.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Ok(_) | Self::Failed | Self::NoSync)
    }
}

/// Classify received bytes as a reply with `payload_len` payload bytes.
///
/// The reply may be preceded by stray bytes; the first well-formed
/// `INSYNC ... OK` frame anywhere in `data` wins. `INSYNC FAILED` only
/// counts as a failure for replies without payload, since `0x11` is a
/// valid payload byte.
pub fn parse_reply(data: &[u8], payload_len: usize) -> Reply {
    if data.is_empty() {
        return Reply::Missing;
    }

    for (i, _) in data
        .iter()
        .enumerate()
        .filter(|&(_, b)| *b == resp::INSYNC)
    {
        let ok_at = i + 1 + payload_len;
        if data.get(ok_at) == Some(&resp::OK) {
            return Reply::Ok(data[i + 1..ok_at].to_vec());
        }
        if payload_len == 0 && data.get(i + 1) == Some(&resp::FAILED) {
            return Reply::Failed;
        }
    }

    if data[0] == resp::NOSYNC {
        return Reply::NoSync;
    }
    Reply::Malformed(data.to_vec())
}

/// Check whether `data` contains the `INSYNC OK` pair anywhere.
pub fn contains_sync_ack(data: &[u8]) -> bool {
    data.windows(2).any(|w| w == SYNC_ACK)
}

/// Format bytes as space separated hex, e.g. `14 10`.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02X}");
    }
    out
}
