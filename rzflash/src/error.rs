//! Error types for rzflash.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::stage::Stage;

/// Result type for rzflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for rzflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The serial port could not be opened.
    #[error("Serial port {port} unavailable: {reason}")]
    PortUnavailable {
        /// Port name/path.
        port: String,
        /// Reason reported by the OS.
        reason: String,
    },

    /// Image file could not be decoded.
    #[error("Invalid image {}: {source}", path.display())]
    Decode {
        /// Image file path.
        path: PathBuf,
        /// Underlying decode failure.
        #[source]
        source: DecodeError,
    },

    /// A single bounded read expired without data.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device never produced the stage's handshake token.
    #[error("{stage}: no handshake from device after {attempts} attempts (check cable, power and boot mode)")]
    HandshakeTimeout {
        /// Stage being entered.
        stage: Stage,
        /// Attempts made.
        attempts: u32,
    },

    /// The device answered, but never with the stage's handshake token.
    #[error("{stage}: unexpected response from device: {received:?}")]
    UnexpectedToken {
        /// Stage being entered.
        stage: Stage,
        /// Printable preview of the last bytes received.
        received: String,
    },

    /// A Flash Writer dialog prompt did not appear.
    #[error("{stage}: timed out waiting for prompt {expected:?}")]
    PromptTimeout {
        /// Stage running the dialog.
        stage: Stage,
        /// Prompt that was expected.
        expected: String,
    },

    /// Chunk-level retries exhausted.
    #[error(
        "{stage}: transfer aborted at offset 0x{offset:08X} after {attempts} attempts ({reason}); {bytes_sent} bytes written, flash is partial"
    )]
    TransferAborted {
        /// Stage being transferred.
        stage: Stage,
        /// Address of the record that could not be delivered.
        offset: u32,
        /// Payload bytes acknowledged before the failing record.
        bytes_sent: u64,
        /// Attempts made on the failing record.
        attempts: u32,
        /// Last failure seen for the record.
        reason: String,
    },

    /// The host fastboot tool could not flash the system image.
    #[error("{stage}: fastboot failed: {reason}")]
    Fastboot {
        /// Stage handing off to fastboot.
        stage: Stage,
        /// What went wrong.
        reason: String,
    },

    /// The operation was interrupted at a record boundary.
    #[error("{stage}: cancelled after {bytes_sent} bytes, device flash state is undefined")]
    Cancelled {
        /// Stage that was running.
        stage: Stage,
        /// Payload bytes acknowledged before cancellation.
        bytes_sent: u64,
    },

    /// A selected stage has no readable image.
    #[error("Missing {stage} image: {}", path.display())]
    MissingImage {
        /// Stage requiring the image.
        stage: Stage,
        /// Path that was checked.
        path: PathBuf,
    },

    /// Zero or several operations were requested.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure decoding an image file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Record checksum does not match its contents.
    #[error("line {line}: checksum mismatch (expected 0x{expected:02X}, found 0x{found:02X})")]
    ChecksumMismatch {
        /// 1-based line number.
        line: usize,
        /// Checksum computed from the record bytes.
        expected: u8,
        /// Checksum stored in the record.
        found: u8,
    },

    /// Line does not follow the record grammar.
    #[error("line {line}: malformed record: {reason}")]
    MalformedRecord {
        /// 1-based line number (0 for whole-file problems).
        line: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// Record extends past the addressable range of its format.
    #[error("line {line}: record at 0x{address:X} with {len} bytes exceeds the {bits}-bit address range")]
    AddressOverflow {
        /// 1-based line number (chunk index for raw images).
        line: usize,
        /// Record start address.
        address: u64,
        /// Payload length.
        len: usize,
        /// Address width in bits.
        bits: u32,
    },
}

/// Broad error class, used to pick process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller input is wrong; nothing was sent to the device.
    Configuration,
    /// An image file is corrupt or in the wrong format.
    Decode,
    /// Serial or protocol failure talking to the device.
    Device,
    /// Interrupted by the user.
    Cancelled,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingImage { .. } | Self::InvalidOperation(_) | Self::Config(_) => {
                ErrorKind::Configuration
            },
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            _ => ErrorKind::Device,
        }
    }

    /// Stage this error is attached to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::HandshakeTimeout { stage, .. }
            | Self::UnexpectedToken { stage, .. }
            | Self::PromptTimeout { stage, .. }
            | Self::TransferAborted { stage, .. }
            | Self::Fastboot { stage, .. }
            | Self::Cancelled { stage, .. }
            | Self::MissingImage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let missing = Error::MissingImage {
            stage: Stage::Bl2,
            path: PathBuf::from("bl2.srec"),
        };
        assert_eq!(missing.kind(), ErrorKind::Configuration);

        let cancelled = Error::Cancelled {
            stage: Stage::Fip,
            bytes_sent: 12,
        };
        assert_eq!(cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(cancelled.stage(), Some(Stage::Fip));

        let timeout = Error::HandshakeTimeout {
            stage: Stage::WriterBootstrap,
            attempts: 10,
        };
        assert_eq!(timeout.kind(), ErrorKind::Device);
    }

    #[test]
    fn test_transfer_aborted_message_mentions_offset() {
        let err = Error::TransferAborted {
            stage: Stage::Rootfs,
            offset: 0x400,
            bytes_sent: 1024,
            attempts: 10,
            reason: "NAK".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x00000400"));
        assert!(msg.contains("partial"));
    }
}
