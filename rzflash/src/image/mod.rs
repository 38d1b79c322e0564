//! Firmware image decoding.
//!
//! Images come in two formats:
//!
//! - **S-record** (`.srec`, `.mot`): Motorola hex lines with per-line checksums.
//!   Used for the Flash Writer, BL2 and FIP.
//! - **Raw binary** (`.wic`): a disk image with no framing, cut into
//!   fixed-size chunks at sequential addresses.
//!
//! Both decode into the same ordered sequence of [`Record`]s, which is what
//! the transfer engine pushes to the device.

pub mod raw;
pub mod srec;

use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::error::{DecodeError, Error, Result};

pub use srec::AddressWidth;

/// Image file format, fixed once when the image is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Motorola S-record text.
    SRecord,
    /// Raw binary / disk image.
    RawBinary,
}

impl ImageFormat {
    /// Guess a format from a file extension.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "srec" | "mot" | "s19" | "s28" | "s37" | "mhx" => Some(Self::SRecord),
            "wic" | "bin" | "img" => Some(Self::RawBinary),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SRecord => write!(f, "S-record"),
            Self::RawBinary => write!(f, "raw binary"),
        }
    }
}

/// Kind of a decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Payload to be written at `address`.
    Data,
    /// Start address without termination semantics.
    Start,
    /// Terminal record; `address` is the entry point.
    End,
    /// Free-form header.
    Header,
}

/// One addressed unit of an image.
///
/// The payload is a window into a buffer that may be shared with the other
/// records of the same image, so chunking a large raw image does not copy it.
#[derive(Debug, Clone)]
pub struct Record {
    /// Target address (or entry point for `End`).
    pub address: u32,
    /// Record kind.
    pub kind: RecordKind,
    data: Arc<Vec<u8>>,
    span: Range<usize>,
}

impl Record {
    /// Create a data record.
    pub fn data(address: u32, payload: Vec<u8>) -> Self {
        let span = 0..payload.len();
        Self {
            address,
            kind: RecordKind::Data,
            data: Arc::new(payload),
            span,
        }
    }

    /// Data record over `span` of a shared buffer.
    pub(crate) fn shared(address: u32, data: &Arc<Vec<u8>>, span: Range<usize>) -> Self {
        Self {
            address,
            kind: RecordKind::Data,
            data: Arc::clone(data),
            span,
        }
    }

    /// Create a terminal record carrying the entry address.
    pub fn end(entry: u32) -> Self {
        Self {
            kind: RecordKind::End,
            ..Self::data(entry, Vec::new())
        }
    }

    /// Bytes to write.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.span.clone()]
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.kind == other.kind
            && self.payload() == other.payload()
    }
}

impl Eq for Record {}

/// A decoded image, ready for transfer.
#[derive(Debug, Clone)]
pub struct Image {
    /// Source file.
    pub path: PathBuf,
    /// File format.
    pub format: ImageFormat,
    /// Address width of the S-record data lines (`None` for raw images).
    pub width: Option<AddressWidth>,
    /// Records in transmission order.
    pub records: Vec<Record>,
}

impl Image {
    /// Total payload size in bytes.
    pub fn payload_len(&self) -> u64 {
        self.records
            .iter()
            .map(|r| r.payload().len() as u64)
            .sum()
    }

    /// Entry point carried by the terminal record, if present.
    pub fn entry_point(&self) -> Option<u32> {
        self.records
            .last()
            .filter(|r| r.kind == RecordKind::End)
            .map(|r| r.address)
    }

    /// Data records only.
    pub fn data_records(&self) -> impl Iterator<Item = &Record> {
        self.records
            .iter()
            .filter(|r| r.kind == RecordKind::Data)
    }

    /// Lowest and highest (exclusive) data address, if the image has data.
    pub fn address_range(&self) -> Option<(u32, u64)> {
        let start = self.data_records().map(|r| r.address).min()?;
        let end = self
            .data_records()
            .map(|r| u64::from(r.address) + r.payload().len() as u64)
            .max()?;
        Some((start, end))
    }

    /// Bytes to put on the wire for one record.
    pub fn wire_bytes(&self, record: &Record) -> Vec<u8> {
        match self.format {
            ImageFormat::SRecord => {
                srec::encode_line(record, self.width.unwrap_or(AddressWidth::Bits32))
            },
            ImageFormat::RawBinary => record.payload().to_vec(),
        }
    }
}

/// Decode an image file.
///
/// `chunk_size` only applies to raw images.
pub fn decode(path: &Path, format: ImageFormat, chunk_size: usize) -> Result<Image> {
    let bytes = fs::read(path)?;
    let decoded = match format {
        ImageFormat::SRecord => srec::decode(&bytes).map(|d| (d.records, d.width)),
        ImageFormat::RawBinary => raw::decode(Arc::new(bytes), chunk_size).map(|r| (r, None)),
    };
    let (records, width) = decoded.map_err(|source| Error::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(
        "Decoded {} ({format}): {} records",
        path.display(),
        records.len()
    );

    Ok(Image {
        path: path.to_path_buf(),
        format,
        width,
        records,
    })
}

/// Decode in-memory image data.
pub fn decode_bytes(
    bytes: &[u8],
    format: ImageFormat,
    chunk_size: usize,
) -> std::result::Result<(Vec<Record>, Option<AddressWidth>), DecodeError> {
    match format {
        ImageFormat::SRecord => {
            let decoded = srec::decode(bytes)?;
            Ok((decoded.records, decoded.width))
        },
        ImageFormat::RawBinary => Ok((raw::decode(Arc::new(bytes.to_vec()), chunk_size)?, None)),
    }
}
