//! Intel HEX firmware images.
//!
//! Only data records (type `00`) contribute bytes. They are appended in file
//! order: the record address is not used for placement, so the image assumes
//! the records are contiguous and ascending, which is what AVR toolchains
//! emit for a single flash section.
//!
//! ```text
//! :10 0000 00 0C9434000C943E000C943E000C943E00 82
//!  LL AAAA TT DD..                              CC
//! ```
//!
//! Record checksums are not verified unless explicitly requested with
//! [`ParseOptions::verify_checksums`].

use crate::error::{Error, Result};
use log::debug;
use std::fs;
use std::path::Path;

/// Record start marker.
pub const START_CODE: char = ':';

/// Intel HEX record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Data record (`00`).
    Data,
    /// End of file (`01`).
    EndOfFile,
    /// Extended segment address (`02`).
    ExtendedSegmentAddress,
    /// Start segment address (`03`).
    StartSegmentAddress,
    /// Extended linear address (`04`).
    ExtendedLinearAddress,
    /// Start linear address (`05`).
    StartLinearAddress,
    /// Anything else.
    Unknown(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Data,
            0x01 => Self::EndOfFile,
            0x02 => Self::ExtendedSegmentAddress,
            0x03 => Self::StartSegmentAddress,
            0x04 => Self::ExtendedLinearAddress,
            0x05 => Self::StartLinearAddress,
            other => Self::Unknown(other),
        }
    }
}

/// Options controlling how strictly HEX text is parsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Reject records with a wrong checksum or broken hex digits instead of
    /// skipping them.
    pub verify_checksums: bool,
}

impl ParseOptions {
    /// Strict parsing: checksums are verified.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            verify_checksums: true,
        }
    }
}

/// A firmware image decoded from Intel HEX.
///
/// Built once and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HexImage {
    data: Vec<u8>,
    load_address: Option<u16>,
    records: usize,
}

/// One decoded record line.
struct Record {
    address: u16,
    kind: RecordType,
    data: Vec<u8>,
}

impl HexImage {
    /// Parse HEX text leniently (no checksum verification).
    ///
    /// Text without any data record yields an empty image rather than an
    /// error; callers must treat an empty image as unusable.
    pub fn parse(text: &str) -> Self {
        // Lenient parsing never fails.
        Self::parse_with(text, ParseOptions::default()).unwrap_or_default()
    }

    /// Parse HEX text with the given options.
    pub fn parse_with(text: &str, options: ParseOptions) -> Result<Self> {
        let mut image = Self::default();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if !line.starts_with(START_CODE) {
                continue;
            }

            let record = match parse_record(line, options.verify_checksums) {
                Ok(record) => record,
                Err(reason) if options.verify_checksums => {
                    return Err(Error::MalformedImage(format!(
                        "line {}: {reason}",
                        index + 1
                    )));
                },
                Err(reason) => {
                    debug!("Skipping HEX line {}: {reason}", index + 1);
                    continue;
                },
            };

            if record.kind == RecordType::Data {
                if image.load_address.is_none() {
                    image.load_address = Some(record.address);
                }
                image.data.extend_from_slice(&record.data);
                image.records += 1;
            }
        }

        debug!(
            "Parsed {} data record(s), {} byte(s)",
            image.records,
            image.data.len()
        );
        Ok(image)
    }

    /// Read and parse a HEX file.
    pub fn from_file<P: AsRef<Path>>(path: P, options: ParseOptions) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::parse_with(&text, options)
    }

    /// Image bytes in file order.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Address field of the first data record.
    pub fn load_address(&self) -> Option<u16> {
        self.load_address
    }

    /// Number of data records that contributed bytes.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Number of pages needed to hold the image.
    pub fn page_count(&self, page_size: usize) -> usize {
        if page_size == 0 {
            return 0;
        }
        self.data.len().div_ceil(page_size)
    }

    /// Build page `index` padded to exactly `page_size` bytes with `0xFF`.
    pub fn page(&self, index: usize, page_size: usize) -> Vec<u8> {
        let mut page = vec![FLASH_ERASED; page_size];
        let start = index.saturating_mul(page_size);
        if start < self.data.len() {
            let end = (start + page_size).min(self.data.len());
            page[..end - start].copy_from_slice(&self.data[start..end]);
        }
        page
    }
}

/// Value of an erased flash byte.
pub const FLASH_ERASED: u8 = 0xFF;

fn parse_record(line: &str, verify_checksum: bool) -> std::result::Result<Record, String> {
    let body = &line[1..];
    if body.len() < 10 {
        return Err("record too short".into());
    }

    let len = hex_byte(body, 0)? as usize;
    let address = (u16::from(hex_byte(body, 2)?) << 8) | u16::from(hex_byte(body, 4)?);
    let kind = RecordType::from(hex_byte(body, 6)?);

    let data_end = 8 + len * 2;
    if body.len() < data_end {
        return Err(format!("expected {len} data byte(s)"));
    }

    let mut data = Vec::with_capacity(len);
    for i in 0..len {
        data.push(hex_byte(body, 8 + i * 2)?);
    }

    if verify_checksum {
        let checksum = hex_byte(body, data_end).map_err(|_| "missing checksum".to_string())?;
        let sum = (0..4)
            .map(|i| hex_byte(body, i * 2))
            .chain(data.iter().copied().map(Ok))
            .try_fold(checksum, |acc, b| b.map(|b| acc.wrapping_add(b)))?;
        if sum != 0 {
            return Err(format!("checksum mismatch (sum {sum:#04x})"));
        }
    }

    Ok(Record {
        address,
        kind,
        data,
    })
}

fn hex_byte(s: &str, offset: usize) -> std::result::Result<u8, String> {
    s.get(offset..offset + 2)
        .and_then(|digits| u8::from_str_radix(digits, 16).ok())
        .ok_or_else(|| format!("invalid hex digits at column {}", offset + 2))
}
