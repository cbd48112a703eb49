//! Block payload encoding
//!
//! A block payload holds every series of the block. Raw blocks carry plain
//! `(timestamp, value)` samples; downsampled blocks carry one
//! [`AggrSample`] per window.
//!
//! # Binary Layout
//!
//! ```text
//! Offset | Size | Field
//! -------|------|---------------------------------------------
//!   0    |  4   | magic (0x504E5242, "PNRB")
//!   4    |  1   | version
//!   5    |  1   | kind (0 = raw, 1 = aggregated)
//!   6    |  4   | series count
//!  10    |  ..  | series: labels, point count, points
//!  end-8 |  8   | CRC-64 (ECMA-182) of all preceding bytes
//! ```
//!
//! Labels are written as a `u16` count followed by `u16`-length-prefixed
//! UTF-8 names and values. All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_64_ECMA_182};

use crate::error::StorageError;
use crate::types::{Aggr, Labels, Sample};

/// Magic number identifying a block payload: "PNRB"
pub const PAYLOAD_MAGIC: u32 = 0x504E_5242;

/// Current payload format version
pub const PAYLOAD_VERSION: u8 = 1;

const KIND_RAW: u8 = 0;
const KIND_AGGREGATED: u8 = 1;

const HEADER_SIZE: usize = 10;
const TRAILER_SIZE: usize = 8;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Per-window aggregate stored in downsampled blocks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggrSample {
    /// Timestamp of the last raw sample in the window
    pub timestamp: i64,
    /// Minimum value
    pub min: f64,
    /// Maximum value
    pub max: f64,
    /// Sum of values
    pub sum: f64,
    /// Number of raw samples aggregated
    pub count: u64,
    /// Reset-compensated counter value at the end of the window
    pub counter: f64,
}

impl AggrSample {
    /// Read one aggregate as a plain value
    pub fn value(&self, aggr: Aggr) -> f64 {
        match aggr {
            Aggr::Min => self.min,
            Aggr::Max => self.max,
            Aggr::Sum => self.sum,
            Aggr::Count => self.count as f64,
            Aggr::Counter => self.counter,
            Aggr::Avg => {
                if self.count == 0 {
                    f64::NAN
                } else {
                    self.sum / self.count as f64
                }
            },
        }
    }
}

/// Points of one series inside a block
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSeries<T> {
    /// Series labels (without the block's external labels)
    pub labels: Labels,
    /// Points ordered by timestamp
    pub points: Vec<T>,
}

impl<T> BlockSeries<T> {
    /// Create a series
    pub fn new(labels: Labels, points: Vec<T>) -> Self {
        Self { labels, points }
    }
}

/// Decoded block content
#[derive(Debug, Clone, PartialEq)]
pub enum BlockPayload {
    /// Samples as scraped
    Raw(Vec<BlockSeries<Sample>>),
    /// Downsampled windows
    Aggregated(Vec<BlockSeries<AggrSample>>),
}

impl BlockPayload {
    /// Number of series
    pub fn series_count(&self) -> usize {
        match self {
            BlockPayload::Raw(s) => s.len(),
            BlockPayload::Aggregated(s) => s.len(),
        }
    }

    /// Total number of points across all series
    pub fn point_count(&self) -> usize {
        match self {
            BlockPayload::Raw(s) => s.iter().map(|s| s.points.len()).sum(),
            BlockPayload::Aggregated(s) => s.iter().map(|s| s.points.len()).sum(),
        }
    }

    /// Smallest and largest timestamp in the payload
    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        let ts: Box<dyn Iterator<Item = i64> + '_> = match self {
            BlockPayload::Raw(s) => Box::new(s.iter().flat_map(|s| s.points.iter().map(|p| p.timestamp))),
            BlockPayload::Aggregated(s) => {
                Box::new(s.iter().flat_map(|s| s.points.iter().map(|p| p.timestamp)))
            },
        };
        ts.fold(None, |acc, t| match acc {
            None => Some((t, t)),
            Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
        })
    }

    /// Series projected to plain samples
    ///
    /// Aggregated payloads are read through `aggr`.
    pub fn into_samples(self, aggr: Aggr) -> Vec<BlockSeries<Sample>> {
        match self {
            BlockPayload::Raw(series) => series,
            BlockPayload::Aggregated(series) => series
                .into_iter()
                .map(|s| BlockSeries {
                    labels: s.labels,
                    points: s
                        .points
                        .iter()
                        .map(|p| Sample::new(p.timestamp, p.value(aggr)))
                        .collect(),
                })
                .collect(),
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode a payload into its binary form
pub fn encode(payload: &BlockPayload) -> Result<Bytes, StorageError> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + TRAILER_SIZE + payload.point_count() * 16);
    buf.put_u32_le(PAYLOAD_MAGIC);
    buf.put_u8(PAYLOAD_VERSION);

    match payload {
        BlockPayload::Raw(series) => {
            buf.put_u8(KIND_RAW);
            buf.put_u32_le(checked_u32(series.len(), "series count")?);
            for s in series {
                put_labels(&mut buf, &s.labels)?;
                buf.put_u32_le(checked_u32(s.points.len(), "point count")?);
                for p in &s.points {
                    buf.put_i64_le(p.timestamp);
                    buf.put_f64_le(p.value);
                }
            }
        },
        BlockPayload::Aggregated(series) => {
            buf.put_u8(KIND_AGGREGATED);
            buf.put_u32_le(checked_u32(series.len(), "series count")?);
            for s in series {
                put_labels(&mut buf, &s.labels)?;
                buf.put_u32_le(checked_u32(s.points.len(), "point count")?);
                for p in &s.points {
                    buf.put_i64_le(p.timestamp);
                    buf.put_f64_le(p.min);
                    buf.put_f64_le(p.max);
                    buf.put_f64_le(p.sum);
                    buf.put_u64_le(p.count);
                    buf.put_f64_le(p.counter);
                }
            }
        },
    }

    let checksum = CRC64.checksum(&buf);
    buf.put_u64_le(checksum);
    Ok(buf.freeze())
}

fn checked_u32(n: usize, what: &str) -> Result<u32, StorageError> {
    u32::try_from(n).map_err(|_| StorageError::Serialization(format!("{} {} exceeds u32", what, n)))
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), StorageError> {
    let len = u16::try_from(s.len())
        .map_err(|_| StorageError::Serialization(format!("label of {} bytes is too long", s.len())))?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_labels(buf: &mut BytesMut, labels: &Labels) -> Result<(), StorageError> {
    let count = u16::try_from(labels.len())
        .map_err(|_| StorageError::Serialization(format!("{} labels exceed u16", labels.len())))?;
    buf.put_u16_le(count);
    for (name, value) in labels.iter() {
        put_str(buf, name)?;
        put_str(buf, value)?;
    }
    Ok(())
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode and verify a payload
pub fn decode(data: &[u8]) -> Result<BlockPayload, StorageError> {
    if data.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(StorageError::CorruptedData(format!(
            "payload too short: {} bytes",
            data.len()
        )));
    }

    let (body, trailer) = data.split_at(data.len() - TRAILER_SIZE);
    let expected = u64::from_le_bytes(
        trailer
            .try_into()
            .map_err(|_| StorageError::CorruptedData("truncated checksum".into()))?,
    );
    let actual = CRC64.checksum(body);
    if expected != actual {
        return Err(StorageError::ChecksumMismatch { expected, actual });
    }

    let mut buf = body;
    let magic = buf.get_u32_le();
    if magic != PAYLOAD_MAGIC {
        return Err(StorageError::CorruptedData(format!(
            "invalid magic number: 0x{:08X}",
            magic
        )));
    }
    let version = buf.get_u8();
    if version > PAYLOAD_VERSION {
        return Err(StorageError::CorruptedData(format!(
            "unsupported payload version: {}",
            version
        )));
    }
    let kind = buf.get_u8();
    let series_count = buf.get_u32_le() as usize;

    let payload = match kind {
        KIND_RAW => {
            let mut series = Vec::with_capacity(series_count.min(1024));
            for _ in 0..series_count {
                let labels = get_labels(&mut buf)?;
                let n = get_u32(&mut buf)? as usize;
                ensure(&buf, n.saturating_mul(16))?;
                let points = (0..n)
                    .map(|_| Sample::new(buf.get_i64_le(), buf.get_f64_le()))
                    .collect();
                series.push(BlockSeries::new(labels, points));
            }
            BlockPayload::Raw(series)
        },
        KIND_AGGREGATED => {
            let mut series = Vec::with_capacity(series_count.min(1024));
            for _ in 0..series_count {
                let labels = get_labels(&mut buf)?;
                let n = get_u32(&mut buf)? as usize;
                ensure(&buf, n.saturating_mul(48))?;
                let points = (0..n)
                    .map(|_| AggrSample {
                        timestamp: buf.get_i64_le(),
                        min: buf.get_f64_le(),
                        max: buf.get_f64_le(),
                        sum: buf.get_f64_le(),
                        count: buf.get_u64_le(),
                        counter: buf.get_f64_le(),
                    })
                    .collect();
                series.push(BlockSeries::new(labels, points));
            }
            BlockPayload::Aggregated(series)
        },
        other => {
            return Err(StorageError::CorruptedData(format!(
                "unknown payload kind: {}",
                other
            )))
        },
    };

    if buf.has_remaining() {
        return Err(StorageError::CorruptedData(format!(
            "{} trailing bytes after last series",
            buf.remaining()
        )));
    }
    Ok(payload)
}

fn ensure(buf: &&[u8], n: usize) -> Result<(), StorageError> {
    if buf.remaining() < n {
        return Err(StorageError::CorruptedData(format!(
            "unexpected end of payload: need {} bytes, have {}",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, StorageError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_str(buf: &mut &[u8]) -> Result<String, StorageError> {
    ensure(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    ensure(buf, len)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| StorageError::CorruptedData(format!("invalid UTF-8 in label: {}", e)))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn get_labels(buf: &mut &[u8]) -> Result<Labels, StorageError> {
    ensure(buf, 2)?;
    let count = buf.get_u16_le();
    let mut labels = Labels::new();
    for _ in 0..count {
        let name = get_str(buf)?;
        let value = get_str(buf)?;
        labels.insert(name, value);
    }
    Ok(labels)
}
