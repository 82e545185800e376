//! Sparse extent header
//!
//! Parses, validates and serializes the 512-byte header found at sector 0 of
//! every sparse and stream-optimized extent (and, for stream-optimized
//! extents, once more inside the footer).
//!
//! ## Layout (little-endian)
//! ```text
//! ┌────────┬──────┬─────────────────────────────────────┐
//! │ Offset │ Size │ Field                               │
//! ├────────┼──────┼─────────────────────────────────────┤
//! │      0 │    4 │ magicNumber ("KDMV" / "kdmv")       │
//! │      4 │    4 │ version                             │
//! │      8 │    4 │ flags                               │
//! │     12 │    8 │ capacity          (sectors)         │
//! │     20 │    8 │ grainSize         (sectors)         │
//! │     28 │    8 │ descriptorOffset  (sectors)         │
//! │     36 │    8 │ descriptorSize    (sectors)         │
//! │     44 │    4 │ numGTEsPerGT                        │
//! │     48 │    8 │ rgdOffset         (sectors)         │
//! │     56 │    8 │ gdOffset          (sectors)         │
//! │     64 │    8 │ overHead          (sectors)         │
//! │     72 │    1 │ uncleanShutdown                     │
//! │     73 │    4 │ '\n' ' ' '\r' '\n'                  │
//! │     77 │    2 │ compressAlgorithm                   │
//! │     79 │  433 │ pad                                 │
//! └────────┴──────┴─────────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::error::{Result, VmdkError};

use super::codec::ensure_len;

// =============================================================================
// Constants
// =============================================================================

/// "VMDK" read as a little-endian u32 (bytes on disk: "KDMV")
pub const MAGIC_NUMBER: u32 = 0x564d_444b;

/// Lowercase signature marking an extent that is still being written
pub const TEMPORARY_MAGIC_NUMBER: u32 = MAGIC_NUMBER ^ 0x2020_2020;

/// Highest header version this implementation understands
pub const MAX_VERSION: u32 = 3;

/// Header size on disk
pub const HEADER_SIZE: usize = 512;

/// Largest grain accepted, in sectors (64 MiB)
pub const MAX_GRAIN_SIZE: u64 = 1 << 17;

/// Largest grain table accepted, in entries (256 KiB per table)
pub const MAX_GTES_PER_GT: u32 = 1 << 16;

/// Largest capacity, in sectors, whose byte size fits in a u64
pub const MAX_CAPACITY: u64 = u64::MAX / super::SECTOR_SIZE;

/// `gdOffset` value meaning "grain directory is in the footer"
pub const GD_AT_END: u64 = 0xFFFF_FFFF_FFFF_FFFF;

pub const FLAG_COMPAT_MASK: u32 = 0x0000_FFFF;
pub const FLAG_VALID_NEWLINE_DETECTOR: u32 = 1 << 0;
pub const FLAG_USE_REDUNDANT: u32 = 1 << 1;
pub const FLAG_MAGIC_GTE: u32 = 1 << 2;
pub const FLAG_INCOMPAT_MASK: u32 = 0xFFFF_0000;
pub const FLAG_COMPRESSED: u32 = 1 << 16;
pub const FLAG_EMBEDDED_LBA: u32 = 1 << 17;

/// Incompatible flags this implementation understands
const KNOWN_INCOMPAT_FLAGS: u32 = FLAG_COMPRESSED | FLAG_EMBEDDED_LBA;

const SINGLE_END_LINE_CHAR: u8 = b'\n';
const NON_END_LINE_CHAR: u8 = b' ';
const DOUBLE_END_LINE_CHAR1: u8 = b'\r';
const DOUBLE_END_LINE_CHAR2: u8 = b'\n';

/// Size of the meaningful prefix before the pad
const FIELDS_SIZE: usize = 79;

// =============================================================================
// Types
// =============================================================================

/// Grain compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompressAlgorithm {
    None,
    Deflate,
}

impl CompressAlgorithm {
    pub fn code(self) -> u16 {
        match self {
            CompressAlgorithm::None => 0x0000,
            CompressAlgorithm::Deflate => 0x0001,
        }
    }

    pub fn from_code(code: u16) -> Result<Self> {
        match code {
            0x0000 => Ok(CompressAlgorithm::None),
            0x0001 => Ok(CompressAlgorithm::Deflate),
            other => Err(VmdkError::UnsupportedFeature(format!(
                "unknown compression algorithm {}",
                other
            ))),
        }
    }
}

/// Which magic number a header carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSignature {
    /// Finalized extent
    Permanent,
    /// Extent whose creation has not completed
    Temporary,
}

impl HeaderSignature {
    /// Identify the signature at the start of `bytes`, if any
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        match magic {
            MAGIC_NUMBER => Some(HeaderSignature::Permanent),
            TEMPORARY_MAGIC_NUMBER => Some(HeaderSignature::Temporary),
            _ => None,
        }
    }
}

/// Decoded sparse extent header; offsets and sizes are in sectors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SparseExtentHeader {
    pub version: u32,
    pub flags: u32,
    pub capacity: u64,
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    pub rgd_offset: u64,
    pub gd_offset: u64,
    pub over_head: u64,
    pub unclean_shutdown: bool,
    pub compress_algorithm: CompressAlgorithm,
}

impl SparseExtentHeader {
    /// Header for a fresh, uncompressed sparse extent; offsets are filled in
    /// by the caller once the layout is known
    pub fn new(capacity: u64, grain_size: u64, num_gtes_per_gt: u32) -> Self {
        Self {
            version: 1,
            flags: FLAG_VALID_NEWLINE_DETECTOR,
            capacity,
            grain_size,
            descriptor_offset: 0,
            descriptor_size: 0,
            num_gtes_per_gt,
            rgd_offset: 0,
            gd_offset: 0,
            over_head: 0,
            unclean_shutdown: false,
            compress_algorithm: CompressAlgorithm::None,
        }
    }

    /// Provisional header for a stream-optimized extent
    pub fn new_stream_optimized(capacity: u64, grain_size: u64, num_gtes_per_gt: u32) -> Self {
        Self {
            version: MAX_VERSION,
            flags: FLAG_VALID_NEWLINE_DETECTOR | FLAG_COMPRESSED | FLAG_EMBEDDED_LBA,
            gd_offset: GD_AT_END,
            compress_algorithm: CompressAlgorithm::Deflate,
            ..Self::new(capacity, grain_size, num_gtes_per_gt)
        }
    }

    /// Parse and validate a header
    ///
    /// Accepts both the permanent and the temporary signature; use
    /// [`HeaderSignature::detect`] to tell them apart.
    pub fn validate(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, HEADER_SIZE, "sparse extent header")?;

        if HeaderSignature::detect(bytes).is_none() {
            return Err(VmdkError::InvalidFormat(format!(
                "bad magic number {:02x?}",
                &bytes[0..4]
            )));
        }

        let mut buf = &bytes[4..FIELDS_SIZE];
        let version = buf.get_u32_le();
        if version > MAX_VERSION {
            return Err(VmdkError::InvalidFormat(format!(
                "unsupported version {} (max {})",
                version, MAX_VERSION
            )));
        }

        let flags = buf.get_u32_le();
        let unknown = flags & FLAG_INCOMPAT_MASK & !KNOWN_INCOMPAT_FLAGS;
        if unknown != 0 {
            return Err(VmdkError::InvalidFormat(format!(
                "unknown incompatible flags 0x{:08x}",
                unknown
            )));
        }

        let capacity = buf.get_u64_le();
        let grain_size = buf.get_u64_le();
        let descriptor_offset = buf.get_u64_le();
        let descriptor_size = buf.get_u64_le();
        let num_gtes_per_gt = buf.get_u32_le();
        let rgd_offset = buf.get_u64_le();
        let gd_offset = buf.get_u64_le();
        let over_head = buf.get_u64_le();
        let unclean_shutdown = buf.get_u8() != 0;
        let newline = [buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8()];
        let compress_code = buf.get_u16_le();

        if capacity > MAX_CAPACITY {
            return Err(VmdkError::InvalidFormat(format!(
                "capacity {} sectors exceeds {}",
                capacity, MAX_CAPACITY
            )));
        }
        if grain_size == 0 || grain_size > MAX_GRAIN_SIZE {
            return Err(VmdkError::InvalidFormat(format!(
                "grain size {} sectors out of range 1..={}",
                grain_size, MAX_GRAIN_SIZE
            )));
        }
        if num_gtes_per_gt == 0 || num_gtes_per_gt > MAX_GTES_PER_GT {
            return Err(VmdkError::InvalidFormat(format!(
                "{} grain table entries out of range 1..={}",
                num_gtes_per_gt, MAX_GTES_PER_GT
            )));
        }

        if flags & FLAG_VALID_NEWLINE_DETECTOR != 0
            && newline
                != [
                    SINGLE_END_LINE_CHAR,
                    NON_END_LINE_CHAR,
                    DOUBLE_END_LINE_CHAR1,
                    DOUBLE_END_LINE_CHAR2,
                ]
        {
            return Err(VmdkError::InvalidFormat(format!(
                "newline detector mismatch {:02x?} (file transferred in text mode?)",
                newline
            )));
        }

        // Embedded LBA is allowed with the compressed flag only
        if flags & FLAG_EMBEDDED_LBA != 0 && flags & FLAG_COMPRESSED == 0 {
            return Err(VmdkError::UnsupportedFeature(
                "embedded LBA without compressed grains".to_string(),
            ));
        }

        let compress_algorithm = CompressAlgorithm::from_code(compress_code)?;
        if flags & FLAG_COMPRESSED != 0 && compress_algorithm == CompressAlgorithm::None {
            return Err(VmdkError::UnsupportedFeature(
                "compressed grains without a compression algorithm".to_string(),
            ));
        }

        Ok(Self {
            version,
            flags,
            capacity,
            grain_size,
            descriptor_offset,
            descriptor_size,
            num_gtes_per_gt,
            rgd_offset,
            gd_offset,
            over_head,
            unclean_shutdown,
            compress_algorithm,
        })
    }

    /// Serialize to the 512-byte on-disk layout
    pub fn serialize(&self, temporary: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u32_le(if temporary {
            TEMPORARY_MAGIC_NUMBER
        } else {
            MAGIC_NUMBER
        });
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.flags);
        buf.put_u64_le(self.capacity);
        buf.put_u64_le(self.grain_size);
        buf.put_u64_le(self.descriptor_offset);
        buf.put_u64_le(self.descriptor_size);
        buf.put_u32_le(self.num_gtes_per_gt);
        buf.put_u64_le(self.rgd_offset);
        buf.put_u64_le(self.gd_offset);
        buf.put_u64_le(self.over_head);
        buf.put_u8(self.unclean_shutdown as u8);
        buf.put_u8(SINGLE_END_LINE_CHAR);
        buf.put_u8(NON_END_LINE_CHAR);
        buf.put_u8(DOUBLE_END_LINE_CHAR1);
        buf.put_u8(DOUBLE_END_LINE_CHAR2);
        buf.put_u16_le(self.compress_algorithm.code());
        buf.resize(HEADER_SIZE, 0);
        buf.freeze()
    }

    // =========================================================================
    // Flag Accessors
    // =========================================================================

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn has_embedded_lba(&self) -> bool {
        self.flags & FLAG_EMBEDDED_LBA != 0
    }

    pub fn use_redundant(&self) -> bool {
        self.flags & FLAG_USE_REDUNDANT != 0
    }

    /// Grain directory lives in the footer (stream-optimized)
    pub fn gd_at_end(&self) -> bool {
        self.gd_offset == GD_AT_END
    }

    /// Capacity in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity.saturating_mul(super::SECTOR_SIZE)
    }
}
