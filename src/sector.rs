//! Sector-addressed I/O helpers
//!
//! Thin wrappers over `Read + Seek` / `Write + Seek` that take sector
//! offsets, so callers never multiply by the sector size themselves.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;
use crate::format::codec::{ENTRY_SIZE, SECTOR_SIZE};

/// Read `count` whole sectors starting at `sector`
pub fn read_sectors<R: Read + Seek>(io: &mut R, sector: u64, count: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; (count * SECTOR_SIZE) as usize];
    io.seek(SeekFrom::Start(sector * SECTOR_SIZE))?;
    io.read_exact(&mut buf)?;
    Ok(buf)
}

/// Fill `buf` from the absolute byte offset `offset`
pub fn read_exact_at<R: Read + Seek>(io: &mut R, offset: u64, buf: &mut [u8]) -> Result<()> {
    io.seek(SeekFrom::Start(offset))?;
    io.read_exact(buf)?;
    Ok(())
}

/// Write `bytes` starting at `sector`
pub fn write_sectors<W: Write + Seek>(io: &mut W, sector: u64, bytes: &[u8]) -> Result<()> {
    write_all_at(io, sector * SECTOR_SIZE, bytes)
}

/// Write `bytes` at the absolute byte offset `offset`
pub fn write_all_at<W: Write + Seek>(io: &mut W, offset: u64, bytes: &[u8]) -> Result<()> {
    io.seek(SeekFrom::Start(offset))?;
    io.write_all(bytes)?;
    Ok(())
}

/// Overwrite entry `index` of the table that starts at `table_sector`
pub fn write_entry<W: Write + Seek>(
    io: &mut W,
    table_sector: u64,
    index: u64,
    value: u32,
) -> Result<()> {
    write_all_at(
        io,
        table_sector * SECTOR_SIZE + index * ENTRY_SIZE,
        &value.to_le_bytes(),
    )
}
