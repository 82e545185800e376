//! Binary codec primitives
//!
//! Little-endian helpers and sector arithmetic shared by the header,
//! marker and grain-table encoders.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, VmdkError};

/// Size of one sector; every offset in the format is expressed in sectors
pub const SECTOR_SIZE: u64 = 512;

/// Size of one grain directory / grain table entry
pub const ENTRY_SIZE: u64 = 4;

/// Number of whole sectors needed to hold `bytes` bytes
pub fn sectors_for_bytes(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}

/// Round `value` up to a multiple of `multiple` (which must be positive)
pub fn round_up(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}

/// Zero-pad a buffer to the next sector boundary
pub fn pad_to_sector(buf: &mut BytesMut) {
    let padded = round_up(buf.len() as u64, SECTOR_SIZE) as usize;
    buf.resize(padded, 0);
}

/// True when every byte is zero
pub fn is_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Fail with `InvalidFormat` unless `buf` holds at least `needed` bytes
pub fn ensure_len(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.len() < needed {
        return Err(VmdkError::InvalidFormat(format!(
            "{}: expected {} bytes, got {}",
            what,
            needed,
            buf.len()
        )));
    }
    Ok(())
}

/// Encode a table of 32-bit sector offsets, padded to whole sectors
pub fn encode_entries(entries: &[u32]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(entries.len() * ENTRY_SIZE as usize);
    for &entry in entries {
        buf.put_u32_le(entry);
    }
    pad_to_sector(&mut buf);
    buf
}

/// Decode `count` 32-bit sector offsets
pub fn decode_entries(mut bytes: &[u8], count: usize, what: &str) -> Result<Vec<u32>> {
    ensure_len(bytes, count * ENTRY_SIZE as usize, what)?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(bytes.get_u32_le());
    }
    Ok(entries)
}
