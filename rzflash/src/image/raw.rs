//! Raw binary / disk image chunking.
//!
//! A `.wic` image carries no framing or checksums of its own. It is cut into
//! fixed-size data records at sequential addresses starting at 0; integrity
//! is left to the per-chunk acknowledgment of the transfer.
//!
//! Records borrow their payload from the file buffer, so a multi-gigabyte
//! image is held in memory once.

use std::sync::Arc;

use crate::error::DecodeError;
use crate::image::Record;

/// Split raw image bytes into `chunk_size` records.
pub fn decode(bytes: Arc<Vec<u8>>, chunk_size: usize) -> Result<Vec<Record>, DecodeError> {
    if chunk_size == 0 {
        return Err(DecodeError::MalformedRecord {
            line: 0,
            reason: "chunk size must be non-zero".into(),
        });
    }
    if bytes.is_empty() {
        return Err(DecodeError::MalformedRecord {
            line: 0,
            reason: "image is empty".into(),
        });
    }
    if bytes.len() as u64 > 1u64 << 32 {
        return Err(DecodeError::AddressOverflow {
            line: bytes.len().div_ceil(chunk_size),
            address: 0,
            len: bytes.len(),
            bits: 32,
        });
    }

    Ok((0..bytes.len())
        .step_by(chunk_size)
        .map(|start| {
            let end = (start + chunk_size).min(bytes.len());
            Record::shared(start as u32, &bytes, start..end)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::RecordKind;

    #[test]
    fn test_chunks_are_sequential() {
        let data: Vec<u8> = (0..=255u8).cycle().take(2500).collect();
        let records = decode(Arc::new(data.clone()), 1024).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].address, 0);
        assert_eq!(records[1].address, 1024);
        assert_eq!(records[2].address, 2048);
        assert_eq!(records[2].payload().len(), 2500 - 2048);
        assert!(records.iter().all(|r| r.kind == RecordKind::Data));

        let joined: Vec<u8> = records
            .iter()
            .flat_map(|r| r.payload().iter().copied())
            .collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_exact_multiple_has_no_short_tail() {
        let records = decode(Arc::new(vec![0u8; 2048]), 1024).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload().len(), 1024);
    }

    #[test]
    fn test_empty_and_zero_chunk_rejected() {
        assert!(matches!(
            decode(Arc::new(Vec::new()), 1024),
            Err(DecodeError::MalformedRecord { .. })
        ));
        assert!(matches!(
            decode(Arc::new(vec![1, 2, 3]), 0),
            Err(DecodeError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_records_share_the_file_buffer() {
        let buffer = Arc::new(vec![7u8; 3000]);
        let records = decode(Arc::clone(&buffer), 1000).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(Arc::strong_count(&buffer), 4);
        assert!(records.iter().all(|r| Arc::ptr_eq(&r.data, &buffer)));
        assert_eq!(records[1].span, 1000..2000);
    }
}
