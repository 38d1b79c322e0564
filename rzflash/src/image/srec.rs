//! Motorola S-record decoding and encoding.
//!
//! ## Line Format
//!
//! ```text
//! +---+------+-------+-----------------+----------+----------+
//! | S | type | count |     address     |   data   | checksum |
//! +---+------+-------+-----------------+----------+----------+
//! | 1 |  1   |  2    | 4 / 6 / 8 hex   | 2n hex   |  2 hex   |
//! +---+------+-------+-----------------+----------+----------+
//! ```
//!
//! `count` covers address, data and checksum bytes. The checksum is the
//! ones' complement of the low byte of the sum of count, address and data,
//! so the sum of every byte after the type digit is `0xFF`.
//!
//! | Type | Meaning                          |
//! |------|----------------------------------|
//! | S0   | header                           |
//! | S1   | data, 16-bit address             |
//! | S2   | data, 24-bit address             |
//! | S3   | data, 32-bit address             |
//! | S5   | record count (16-bit)            |
//! | S6   | record count (24-bit)            |
//! | S7   | start address, 32-bit            |
//! | S8   | start address, 24-bit            |
//! | S9   | start address, 16-bit            |

use byteorder::{BigEndian, ByteOrder};

use crate::error::DecodeError;
use crate::image::{Record, RecordKind};

/// Address field width of a data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressWidth {
    /// S1 / S9.
    Bits16,
    /// S2 / S8.
    Bits24,
    /// S3 / S7.
    Bits32,
}

impl AddressWidth {
    /// Address field size in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Self::Bits16 => 2,
            Self::Bits24 => 3,
            Self::Bits32 => 4,
        }
    }

    /// Address width in bits.
    pub fn bits(self) -> u32 {
        (self.bytes() * 8) as u32
    }

    /// One past the highest addressable byte.
    pub fn limit(self) -> u64 {
        1u64 << self.bits()
    }

    fn data_type(self) -> u8 {
        match self {
            Self::Bits16 => b'1',
            Self::Bits24 => b'2',
            Self::Bits32 => b'3',
        }
    }

    fn start_type(self) -> u8 {
        match self {
            Self::Bits16 => b'9',
            Self::Bits24 => b'8',
            Self::Bits32 => b'7',
        }
    }
}

/// Result of decoding an S-record file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Data records in file order, followed by the terminal record if any.
    pub records: Vec<Record>,
    /// Width used by the data records, if there were any.
    pub width: Option<AddressWidth>,
}

/// A single parsed line before it is turned into a [`Record`].
#[derive(Debug)]
struct Line {
    kind: u8,
    address: u32,
    data: Vec<u8>,
}

/// Decode S-record text.
pub fn decode(text: &[u8]) -> Result<Decoded, DecodeError> {
    let mut records = Vec::new();
    let mut width: Option<AddressWidth> = None;
    let mut terminated = false;

    for (index, raw_line) in text.split(|&b| b == b'\n').enumerate() {
        let line_no = index + 1;
        let trimmed = raw_line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        let line = parse_line(trimmed, line_no)?;

        if terminated {
            return Err(DecodeError::MalformedRecord {
                line: line_no,
                reason: "record after start address record".into(),
            });
        }

        match line.kind {
            b'0' | b'5' | b'6' => {},
            b'1' | b'2' | b'3' => {
                let line_width = width_for(line.kind);
                match width {
                    Some(w) if w != line_width => {
                        return Err(DecodeError::MalformedRecord {
                            line: line_no,
                            reason: format!(
                                "S{} record mixed with S{} records",
                                line.kind as char,
                                w.data_type() as char
                            ),
                        });
                    },
                    _ => width = Some(line_width),
                }

                let end = u64::from(line.address) + line.data.len() as u64;
                if end > line_width.limit() {
                    return Err(DecodeError::AddressOverflow {
                        line: line_no,
                        address: u64::from(line.address),
                        len: line.data.len(),
                        bits: line_width.bits(),
                    });
                }

                records.push(Record::data(line.address, line.data));
            },
            b'7' | b'8' | b'9' => {
                records.push(Record::end(line.address));
                terminated = true;
            },
            _ => unreachable!("record type validated by parse_line"),
        }
    }

    Ok(Decoded { records, width })
}

fn width_for(kind: u8) -> AddressWidth {
    match kind {
        b'1' | b'9' | b'0' | b'5' => AddressWidth::Bits16,
        b'2' | b'8' | b'6' => AddressWidth::Bits24,
        _ => AddressWidth::Bits32,
    }
}

fn parse_line(line: &[u8], line_no: usize) -> Result<Line, DecodeError> {
    let malformed = |reason: &str| DecodeError::MalformedRecord {
        line: line_no,
        reason: reason.to_string(),
    };

    if line.len() < 4 || line[0] != b'S' {
        return Err(malformed("missing 'S' record marker"));
    }

    let kind = line[1];
    if !matches!(kind, b'0'..=b'3' | b'5'..=b'9') {
        return Err(malformed(&format!(
            "unknown record type {:?}",
            kind as char
        )));
    }

    let bytes = hex_to_bytes(&line[2..]).ok_or_else(|| malformed("invalid hex digits"))?;

    let count = usize::from(bytes[0]);
    if count + 1 != bytes.len() {
        return Err(malformed(&format!(
            "byte count 0x{:02X} does not match {} bytes on the line",
            bytes[0],
            bytes.len() - 1
        )));
    }

    let addr_len = width_for(kind).bytes();
    if count < addr_len + 1 {
        return Err(malformed("record too short for its address field"));
    }

    let (body, checksum) = bytes.split_at(bytes.len() - 1);
    let expected = checksum_of(body);
    if expected != checksum[0] {
        return Err(DecodeError::ChecksumMismatch {
            line: line_no,
            expected,
            found: checksum[0],
        });
    }

    // Checked above: body holds the count byte, the address and the data.
    let address = BigEndian::read_uint(&body[1..=addr_len], addr_len) as u32;
    let data = body[1 + addr_len..].to_vec();

    Ok(Line {
        kind,
        address,
        data,
    })
}

fn hex_to_bytes(hex: &[u8]) -> Option<Vec<u8>> {
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    hex.chunks_exact(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some(((hi << 4) | lo) as u8)
        })
        .collect()
}

fn checksum_of(bytes: &[u8]) -> u8 {
    !bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Encode a record as one S-record line terminated by CRLF.
///
/// Data records use the data type of `width`, terminal and start records the
/// matching start-address type, headers S0.
pub fn encode_line(record: &Record, width: AddressWidth) -> Vec<u8> {
    let (kind, addr_len) = match record.kind {
        RecordKind::Data => (width.data_type(), width.bytes()),
        RecordKind::Start | RecordKind::End => (width.start_type(), width.bytes()),
        RecordKind::Header => (b'0', 2),
    };

    let payload = record.payload();
    let mut body = Vec::with_capacity(1 + addr_len + payload.len());
    body.push((addr_len + payload.len() + 1) as u8);
    let mut addr = [0u8; 4];
    BigEndian::write_u32(&mut addr, record.address);
    body.extend_from_slice(&addr[4 - addr_len..]);
    body.extend_from_slice(payload);
    let checksum = checksum_of(&body);

    let mut line = Vec::with_capacity(4 + 2 * (body.len() + 1) + 2);
    line.push(b'S');
    line.push(kind);
    for b in body.iter().chain(std::iter::once(&checksum)) {
        line.extend_from_slice(format!("{b:02X}").as_bytes());
    }
    line.extend_from_slice(b"\r\n");
    line
}
