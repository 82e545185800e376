//! Flat Extent
//!
//! Pre-allocated raw bytes with no translation; byte `n` of the extent is
//! byte `n` of the file.

use std::fs::{self, File, OpenOptions};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::error::{Result, VmdkError};
use crate::format::SECTOR_SIZE;
use crate::sector::{read_exact_at, write_all_at};

/// Raw extent backed by a plain file
#[derive(Debug)]
pub struct FlatExtent {
    file: File,
    path: PathBuf,
    /// Capacity in bytes
    capacity: u64,
    writable: bool,
    /// File was created by this handle (abort removes it)
    created: bool,
    position: u64,
}

impl FlatExtent {
    /// Create (or truncate) a flat extent of `capacity` bytes
    pub fn create(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        check_sector_multiple(capacity)?;
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity)?;
        tracing::info!("Created flat extent {:?} ({} bytes)", path, capacity);
        Ok(Self {
            file,
            path,
            capacity,
            writable: true,
            created: true,
            position: 0,
        })
    }

    /// Open an existing flat extent; capacity is the file length
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;
        let capacity = file.metadata()?.len();
        Ok(Self {
            file,
            path,
            capacity,
            writable,
            created: false,
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        check_range(offset, buf.len(), self.capacity)?;
        read_exact_at(&mut self.file, offset, buf)?;
        Ok(buf.len())
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(VmdkError::ReadOnlyExtent);
        }
        check_range(offset, data.len(), self.capacity)?;
        write_all_at(&mut self.file, offset, data)?;
        Ok(data.len())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(self.position, self.capacity, pos)?;
        Ok(self.position)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn close(self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Discard the extent; a file created by this handle is removed
    pub fn abort(self) -> Result<()> {
        let Self {
            file,
            path,
            created,
            ..
        } = self;
        drop(file);
        if created {
            fs::remove_file(&path)?;
            tracing::warn!("Aborted flat extent {:?}, file removed", path);
        }
        Ok(())
    }
}

/// Reject accesses that do not fit inside `capacity` bytes
pub(crate) fn check_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(VmdkError::OutOfRange {
            offset,
            len: len as u64,
            capacity,
        }),
    }
}

/// Capacities handed to the facade are whole sectors
pub(crate) fn check_sector_multiple(capacity: u64) -> Result<()> {
    if capacity % SECTOR_SIZE != 0 {
        return Err(VmdkError::Config(format!(
            "capacity {} is not a multiple of {} bytes",
            capacity, SECTOR_SIZE
        )));
    }
    Ok(())
}

/// Apply `pos` to a cursor over `capacity` bytes; seeking past the end fails
pub(crate) fn resolve_seek(position: u64, capacity: u64, pos: SeekFrom) -> Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::End(delta) => capacity.checked_add_signed(delta),
        SeekFrom::Current(delta) => position.checked_add_signed(delta),
    };
    match target {
        Some(t) if t <= capacity => Ok(t),
        _ => Err(VmdkError::OutOfRange {
            offset: target.unwrap_or(0),
            len: 0,
            capacity,
        }),
    }
}
