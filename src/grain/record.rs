//! Grain records
//!
//! Reads raw grains and compressed grain records, and builds the compressed
//! records emitted by the stream-optimized writer.

use std::io::{Read, Seek, Write};

use bytes::{Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Result, VmdkError};
use crate::format::codec::{pad_to_sector, SECTOR_SIZE};
use crate::format::{GrainMarker, GRAIN_MARKER_SIZE};
use crate::sector::read_exact_at;

/// zlib-compress one grain
pub fn compress_grain(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish()
}

/// Marker + compressed payload, zero padded to a sector boundary
pub fn encode_grain_record(lba: u64, compressed: &[u8]) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(GRAIN_MARKER_SIZE + compressed.len() + SECTOR_SIZE as usize);
    GrainMarker {
        lba,
        size: compressed.len() as u32,
    }
    .encode_into(&mut buf);
    buf.extend_from_slice(compressed);
    pad_to_sector(&mut buf);
    buf.freeze()
}

/// Read the compressed grain record at `sector` and inflate it into `out`
///
/// `out` must be exactly one grain long; a short inflated grain (the last
/// grain of a disk whose capacity is not grain aligned) is zero filled.
/// Without `embedded_lba` the record is just `size u32` + payload.
/// Every format problem is reported as `CorruptGrain` so callers can skip
/// the grain and keep going.
pub fn read_compressed_grain<R: Read + Seek>(
    io: &mut R,
    sector: u64,
    expected_lba: u64,
    embedded_lba: bool,
    out: &mut [u8],
) -> Result<()> {
    let corrupt = |reason: String| VmdkError::CorruptGrain {
        lba: expected_lba,
        reason,
    };

    let size = if embedded_lba {
        let mut prefix = [0u8; GRAIN_MARKER_SIZE];
        read_exact_at(io, sector * SECTOR_SIZE, &mut prefix)?;
        let marker = GrainMarker::decode(&prefix)?;
        if marker.lba != expected_lba {
            return Err(corrupt(format!(
                "grain marker carries LBA {}",
                marker.lba
            )));
        }
        marker.size
    } else {
        let mut prefix = [0u8; 4];
        read_exact_at(io, sector * SECTOR_SIZE, &mut prefix)?;
        u32::from_le_bytes(prefix)
    };

    // zlib never expands a grain by more than a few bytes per 16 KiB block
    let limit = out.len() + out.len() / 16 + 64;
    if size == 0 || size as usize > limit {
        return Err(corrupt(format!("implausible compressed size {}", size)));
    }

    let mut compressed = vec![0u8; size as usize];
    io.read_exact(&mut compressed)?;
    inflate_grain(&compressed, out).map_err(|e| corrupt(e.to_string()))
}

/// Inflate `compressed` into `out`, zero filling any remainder
pub fn inflate_grain(compressed: &[u8], out: &mut [u8]) -> std::io::Result<()> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut filled = 0;
    while filled < out.len() {
        let n = decoder.read(&mut out[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == out.len() {
        let mut probe = [0u8; 1];
        if decoder.read(&mut probe)? != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "inflated grain exceeds grain size",
            ));
        }
    }
    out[filled..].fill(0);
    Ok(())
}
