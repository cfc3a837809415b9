//! Spill segment format.
//!
//! Layout on storage:
//! [ magic: u32 ][ version: u16 ][ codec: u8 ][ reserved: u8 ]
//! [ uncompressed_len: u64 ][ compressed_len: u64 ]
//! [ payload bytes … ]
//!
//! The payload is a JSON array of row batches, optionally compressed. The
//! checksum covers header and payload (blake3) and is kept in memory in the
//! [`SegmentMeta`]; readers verify it before decoding.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use strata_core::RowBatch;

use super::{Codec, SharedSpillStats, Storage};
use crate::error::{Error, Result};

pub const MAGIC: u32 = 0x5354_5241; // "STRA"
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 1 + 1 + 8 + 8;

/// Upper bound accepted for a single segment payload.
const MAX_SEGMENT_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub codec: Codec,
    pub uncompressed_len: u64,
    pub compressed_len: u64,
}

impl SegmentHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&VERSION.to_le_bytes());
        out[6] = self.codec as u8;
        out[8..16].copy_from_slice(&self.uncompressed_len.to_le_bytes());
        out[16..24].copy_from_slice(&self.compressed_len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Storage("short segment header".into()));
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if magic != MAGIC || version != VERSION {
            return Err(Error::Storage(format!(
                "bad segment magic/version {magic:#x}/{version}"
            )));
        }
        let header = Self {
            codec: Codec::from_u8(bytes[6])?,
            uncompressed_len: read_u64(&bytes[8..16]),
            compressed_len: read_u64(&bytes[16..24]),
        };
        header.validate_sizes()?;
        Ok(header)
    }

    /// Reject sizes a corrupted header could use to force huge allocations.
    fn validate_sizes(&self) -> Result<()> {
        if self.uncompressed_len > MAX_SEGMENT_BYTES || self.compressed_len > MAX_SEGMENT_BYTES {
            return Err(Error::Storage(format!(
                "segment sizes {}/{} exceed {}",
                self.uncompressed_len, self.compressed_len, MAX_SEGMENT_BYTES
            )));
        }
        Ok(())
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

/// In-memory handle of a written segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub path: String,
    pub codec: Codec,
    pub uncompressed_len: u64,
    pub compressed_len: u64,
    pub checksum: [u8; 32],
    pub num_rows: u64,
    pub num_batches: u32,
}

impl SegmentMeta {
    pub fn total_len(&self) -> u64 {
        HEADER_LEN as u64 + self.compressed_len
    }
}

/// Serialize, compress and write `batches` as one segment at `path`.
pub fn write_segment(
    storage: &dyn Storage,
    codec: Codec,
    path: &str,
    batches: &[RowBatch],
    stats: &SharedSpillStats,
) -> Result<SegmentMeta> {
    let flush_start = Instant::now();

    let serialize_start = Instant::now();
    let uncompressed =
        serde_json::to_vec(batches).map_err(|e| Error::Codec(format!("json serialize: {e}")))?;
    let compressed = super::codec::compress(codec, &uncompressed)?;
    let serialize_nanos = serialize_start.elapsed().as_nanos() as i64;

    let header = SegmentHeader {
        codec,
        uncompressed_len: uncompressed.len() as u64,
        compressed_len: compressed.len() as u64,
    };
    let mut full = Vec::with_capacity(HEADER_LEN + compressed.len());
    full.extend_from_slice(&header.to_bytes());
    full.extend_from_slice(&compressed);
    let checksum: [u8; 32] = blake3::hash(&full).into();

    let write_start = Instant::now();
    storage.write(path, &full)?;
    let write_nanos = write_start.elapsed().as_nanos() as i64;

    {
        let mut s = stats.lock();
        s.spill_writes += 1;
        s.spilled_files += 1;
        s.spilled_bytes += full.len() as i64;
        s.spill_serialization_time_nanos += serialize_nanos;
        s.spill_write_time_nanos += write_nanos;
        s.spill_flush_time_nanos += flush_start.elapsed().as_nanos() as i64;
    }

    Ok(SegmentMeta {
        path: path.to_string(),
        codec,
        uncompressed_len: header.uncompressed_len,
        compressed_len: header.compressed_len,
        checksum,
        num_rows: batches.iter().map(|b| b.num_rows() as u64).sum(),
        num_batches: batches.len() as u32,
    })
}

/// Read back a segment written by [`write_segment`], verifying its checksum.
pub fn read_segment(
    storage: &dyn Storage,
    meta: &SegmentMeta,
    stats: &SharedSpillStats,
) -> Result<Vec<RowBatch>> {
    let read_start = Instant::now();
    let full = storage.read_range(&meta.path, 0, meta.total_len() as usize)?;
    let read_nanos = read_start.elapsed().as_nanos() as i64;

    let checksum: [u8; 32] = blake3::hash(&full).into();
    if checksum != meta.checksum {
        return Err(Error::ChecksumMismatch(meta.path.clone()));
    }
    let header = SegmentHeader::from_bytes(&full)?;

    let decode_start = Instant::now();
    let payload = super::codec::decompress(header.codec, &full[HEADER_LEN..])?;
    let batches: Vec<RowBatch> = serde_json::from_slice(&payload)
        .map_err(|e| Error::Codec(format!("json deserialize: {e}")))?;
    let decode_nanos = decode_start.elapsed().as_nanos() as i64;

    {
        let mut s = stats.lock();
        s.spill_reads += 1;
        s.spill_read_bytes += full.len() as i64;
        s.spill_read_time_nanos += read_nanos;
        s.spill_deserialization_time_nanos += decode_nanos;
    }
    Ok(batches)
}
