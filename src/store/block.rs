//! Columnar record blocks: the on-disk page format of the lazy store.
//!
//! A block holds up to `record_size` rows of four columns:
//!
//! | column | type            |
//! |--------|-----------------|
//! | path   | utf8, nullable  |
//! | offset | int64           |
//! | size   | int64           |
//! | raw    | bytes, nullable |
//!
//! The codec behind the bytes is pluggable; the lazy store never looks
//! past [`BlockCodec`]. The default codec writes a fixed little-endian
//! header followed by a zstd-compressed bincode payload of the columns.

use serde::{Deserialize, Serialize};

use crate::error::{RefError, Result};

// ── Constants ──────────────────────────────────────────────────────

/// Magic bytes for record block files
pub const BLOCK_MAGIC: [u8; 4] = *b"REFB";

/// Format version
pub const BLOCK_VERSION: u16 = 1;

/// Header size in bytes (fixed)
///
/// ```text
/// Offset  Size  Field
/// 0       4     magic: b"REFB"
/// 4       2     version: u16 = 1
/// 6       2     reserved: 0x0000
/// 8       8     row_count: u64
/// ```
pub const BLOCK_HEADER_SIZE: usize = 16;

/// zstd compression level for block payloads
pub const BLOCK_ZSTD_LEVEL: i32 = 3;

// ── RecordBlock ────────────────────────────────────────────────────

/// One decoded page of references, column-oriented.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordBlock {
    pub paths: Vec<Option<String>>,
    pub offsets: Vec<i64>,
    pub sizes: Vec<i64>,
    pub raws: Vec<Option<Vec<u8>>>,
}

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    pub path: Option<&'a str>,
    pub offset: i64,
    pub size: i64,
    pub raw: Option<&'a [u8]>,
}

impl RecordBlock {
    /// An all-defaults block: null paths, zero offsets/sizes, null raws.
    pub fn with_rows(rows: usize) -> Self {
        RecordBlock {
            paths: vec![None; rows],
            offsets: vec![0; rows],
            sizes: vec![0; rows],
            raws: vec![None; rows],
        }
    }

    pub fn rows(&self) -> usize {
        self.paths.len()
    }

    pub fn truncate(&mut self, rows: usize) {
        self.paths.truncate(rows);
        self.offsets.truncate(rows);
        self.sizes.truncate(rows);
        self.raws.truncate(rows);
    }

    /// All four columns must agree on the row count.
    pub fn validate(&self) -> Result<()> {
        let n = self.paths.len();
        if self.offsets.len() != n || self.sizes.len() != n || self.raws.len() != n {
            return Err(RefError::InvalidFormat(format!(
                "ragged columns: path={} offset={} size={} raw={}",
                n,
                self.offsets.len(),
                self.sizes.len(),
                self.raws.len()
            )));
        }
        Ok(())
    }

    pub fn row(&self, index: usize) -> Option<RowView<'_>> {
        if index >= self.rows() {
            return None;
        }
        Some(RowView {
            path: self.paths[index].as_deref(),
            offset: self.offsets[index],
            size: self.sizes[index],
            raw: self.raws[index].as_deref(),
        })
    }
}

// ── Codec ──────────────────────────────────────────────────────────

/// Converts a record block to bytes on disk and back.
pub trait BlockCodec: Send + Sync {
    fn encode(&self, block: &RecordBlock) -> Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> Result<RecordBlock>;
}

/// Default codec: header + zstd(bincode(columns)).
#[derive(Debug, Clone, Copy)]
pub struct ZstdBlockCodec {
    level: i32,
}

impl Default for ZstdBlockCodec {
    fn default() -> Self {
        ZstdBlockCodec {
            level: BLOCK_ZSTD_LEVEL,
        }
    }
}

impl ZstdBlockCodec {
    pub fn with_level(level: i32) -> Self {
        ZstdBlockCodec { level }
    }
}

impl BlockCodec for ZstdBlockCodec {
    fn encode(&self, block: &RecordBlock) -> Result<Vec<u8>> {
        block.validate()?;
        let payload = bincode::serialize(block)?;
        let compressed = zstd::stream::encode_all(&payload[..], self.level)?;

        let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE + compressed.len());
        out.extend_from_slice(&BLOCK_MAGIC);
        out.extend_from_slice(&BLOCK_VERSION.to_le_bytes());
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&(block.rows() as u64).to_le_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<RecordBlock> {
        if data.len() < BLOCK_HEADER_SIZE {
            return Err(RefError::InvalidFormat(
                "file too small for a record block".into(),
            ));
        }
        if data[0..4] != BLOCK_MAGIC {
            return Err(RefError::InvalidFormat(format!(
                "not a record block: expected REFB, got {:?}",
                &data[0..4]
            )));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != BLOCK_VERSION {
            return Err(RefError::InvalidFormat(format!(
                "unsupported record block version: {version}"
            )));
        }
        let row_count = u64::from_le_bytes(
            data[8..16]
                .try_into()
                .map_err(|_| RefError::InvalidFormat("truncated header".into()))?,
        );

        let payload = zstd::stream::decode_all(&data[BLOCK_HEADER_SIZE..])?;
        let block: RecordBlock = bincode::deserialize(&payload)?;
        block.validate()?;
        if block.rows() as u64 != row_count {
            return Err(RefError::InvalidFormat(format!(
                "header declares {row_count} rows, payload has {}",
                block.rows()
            )));
        }
        Ok(block)
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RecordBlock {
        let mut block = RecordBlock::with_rows(4);
        block.paths[0] = Some("s3://bucket/data".to_string());
        block.offsets[0] = 1024;
        block.sizes[0] = 512;
        block.raws[1] = Some(b"inline".to_vec());
        block.paths[2] = Some("s3://bucket/whole".to_string());
        // row 3 stays all-null: an absent slot
        block
    }

    #[test]
    fn encode_decode_round_trip() {
        let codec = ZstdBlockCodec::default();
        let block = sample();
        let data = codec.encode(&block).unwrap();
        assert_eq!(&data[0..4], b"REFB");
        let decoded = codec.decode(&data).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn truncated_blocks_keep_column_agreement() {
        let mut block = sample();
        block.truncate(1);
        assert_eq!(block.rows(), 1);
        block.validate().unwrap();
        assert!(block.row(1).is_none());
        assert_eq!(block.row(0).unwrap().offset, 1024);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let codec = ZstdBlockCodec::default();
        let mut data = codec.encode(&sample()).unwrap();
        data[0] = b'X';
        assert!(matches!(
            codec.decode(&data),
            Err(RefError::InvalidFormat(_))
        ));
    }

    #[test]
    fn row_count_mismatch_is_rejected() {
        let codec = ZstdBlockCodec::default();
        let mut data = codec.encode(&sample()).unwrap();
        data[8] = 9;
        assert!(matches!(
            codec.decode(&data),
            Err(RefError::InvalidFormat(_))
        ));
    }
}
