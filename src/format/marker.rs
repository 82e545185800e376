//! Stream markers
//!
//! Stream-optimized extents interleave two kinds of records:
//!
//! ```text
//! Grain marker (variable, padded to a sector):
//! ┌──────────┬──────────┬───────────────────────────┐
//! │ LBA (8)  │ Size (4) │ zlib data (Size bytes)    │
//! └──────────┴──────────┴───────────────────────────┘
//!
//! Metadata marker (exactly one sector):
//! ┌──────────┬──────────┬──────────┬────────────────┐
//! │ Value(8) │ 0 (4)    │ Type (4) │ pad (496)      │
//! └──────────┴──────────┴──────────┴────────────────┘
//! ```
//!
//! For grain-table, grain-directory and footer markers `Value` is the number
//! of metadata sectors that follow. An end-of-stream marker is an all-zero
//! sector.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, VmdkError};

use super::codec::{ensure_len, SECTOR_SIZE};

/// Common prefix of every marker: LBA/value (8) + size (4)
pub const GRAIN_MARKER_SIZE: usize = 12;

/// Metadata marker kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerType {
    EndOfStream,
    GrainTable,
    GrainDirectory,
    Footer,
    Progress,
}

impl MarkerType {
    pub fn code(self) -> u32 {
        match self {
            MarkerType::EndOfStream => 0,
            MarkerType::GrainTable => 1,
            MarkerType::GrainDirectory => 2,
            MarkerType::Footer => 3,
            MarkerType::Progress => 4,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(MarkerType::EndOfStream),
            1 => Ok(MarkerType::GrainTable),
            2 => Ok(MarkerType::GrainDirectory),
            3 => Ok(MarkerType::Footer),
            4 => Ok(MarkerType::Progress),
            other => Err(VmdkError::InvalidFormat(format!(
                "unknown marker type {}",
                other
            ))),
        }
    }
}

/// Header of a compressed grain record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrainMarker {
    /// First virtual sector covered by the grain
    pub lba: u64,
    /// Compressed payload length in bytes
    pub size: u32,
}

impl GrainMarker {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.lba);
        buf.put_u32_le(self.size);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, GRAIN_MARKER_SIZE, "grain marker")?;
        let mut buf = bytes;
        Ok(Self {
            lba: buf.get_u64_le(),
            size: buf.get_u32_le(),
        })
    }

    /// Sectors occupied by the marker plus its payload
    pub fn record_sectors(&self) -> u64 {
        (GRAIN_MARKER_SIZE as u64 + self.size as u64).div_ceil(SECTOR_SIZE)
    }
}

/// One-sector metadata marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataMarker {
    /// Following sectors for GT/GD/footer; percent complete for progress
    pub value: u64,
    pub kind: MarkerType,
}

impl MetadataMarker {
    pub fn new(kind: MarkerType, value: u64) -> Self {
        Self { value, kind }
    }

    pub fn end_of_stream() -> Self {
        Self::new(MarkerType::EndOfStream, 0)
    }

    /// Metadata sectors following this marker
    pub fn payload_sectors(&self) -> u64 {
        match self.kind {
            MarkerType::EndOfStream | MarkerType::Progress => 0,
            _ => self.value,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SECTOR_SIZE as usize);
        buf.put_u64_le(self.value);
        buf.put_u32_le(0);
        buf.put_u32_le(self.kind.code());
        buf.resize(SECTOR_SIZE as usize, 0);
        buf.freeze()
    }
}

/// Any record found at a sector boundary of a stream-optimized extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Grain(GrainMarker),
    Metadata(MetadataMarker),
}

impl Marker {
    /// Decode the record starting at `sector` (at least 16 bytes)
    pub fn decode(sector: &[u8]) -> Result<Self> {
        ensure_len(sector, GRAIN_MARKER_SIZE + 4, "marker")?;
        let grain = GrainMarker::decode(sector)?;
        if grain.size != 0 {
            return Ok(Marker::Grain(grain));
        }
        let mut tail = &sector[GRAIN_MARKER_SIZE..];
        let kind = MarkerType::from_code(tail.get_u32_le())?;
        Ok(Marker::Metadata(MetadataMarker {
            value: grain.lba,
            kind,
        }))
    }

    /// Sectors to skip to reach the next record
    pub fn span_sectors(&self) -> u64 {
        match self {
            Marker::Grain(g) => g.record_sectors(),
            Marker::Metadata(m) => 1 + m.payload_sectors(),
        }
    }
}
