//! Extent Facade
//!
//! One capability set over the three extent kinds:
//!
//! | kind             | read        | write                    |
//! |------------------|-------------|--------------------------|
//! | flat             | pass-through| pass-through             |
//! | sparse           | GD/GT lookup| allocate on demand       |
//! | stream-optimized | footer index| append-only (new extent) |
//!
//! Offsets and capacities are in bytes. Accesses beyond the capacity fail
//! with `OutOfRange` and leave the extent usable.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::Serialize;

use crate::config::ExtentConfig;
use crate::error::{Result, VmdkError};
use crate::flat::FlatExtent;
use crate::format::{HeaderSignature, HEADER_SIZE};
use crate::sparse::SparseExtent;
use crate::stream::StreamWriter;

/// Operations every extent supports
pub trait DiskExtent {
    /// Capacity in bytes
    fn capacity(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize>;

    /// Move the cursor used by the `std::io` adapters
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Flush and finalize
    fn close(self) -> Result<()>
    where
        Self: Sized;

    /// Discard partial writes of a create that failed midway
    fn abort(self) -> Result<()>
    where
        Self: Sized;
}

impl DiskExtent for FlatExtent {
    fn capacity(&self) -> u64 {
        FlatExtent::capacity(self)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        FlatExtent::read_at(self, offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        FlatExtent::write_at(self, offset, data)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        FlatExtent::seek(self, pos)
    }

    fn close(self) -> Result<()> {
        FlatExtent::close(self)
    }

    fn abort(self) -> Result<()> {
        FlatExtent::abort(self)
    }
}

impl DiskExtent for SparseExtent {
    fn capacity(&self) -> u64 {
        SparseExtent::capacity(self)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        SparseExtent::read_at(self, offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        SparseExtent::write_at(self, offset, data)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        SparseExtent::seek(self, pos)
    }

    fn close(self) -> Result<()> {
        SparseExtent::close(self)
    }

    fn abort(self) -> Result<()> {
        SparseExtent::abort(self)
    }
}

/// Stream-optimized extent: write-only while streaming, read-only once finished
pub enum StreamOptimizedExtent {
    Writer(StreamWriter),
    Reader(SparseExtent),
}

impl DiskExtent for StreamOptimizedExtent {
    fn capacity(&self) -> u64 {
        match self {
            StreamOptimizedExtent::Writer(w) => w.capacity(),
            StreamOptimizedExtent::Reader(r) => r.capacity(),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            StreamOptimizedExtent::Writer(_) => Err(VmdkError::UnsupportedFeature(
                "reading a stream-optimized extent before it is closed".to_string(),
            )),
            StreamOptimizedExtent::Reader(r) => r.read_at(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        match self {
            StreamOptimizedExtent::Writer(w) => w.write_at(offset, data),
            StreamOptimizedExtent::Reader(_) => Err(VmdkError::ReadOnlyExtent),
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        match self {
            StreamOptimizedExtent::Writer(w) => w.seek(pos),
            StreamOptimizedExtent::Reader(r) => r.seek(pos),
        }
    }

    fn close(self) -> Result<()> {
        match self {
            StreamOptimizedExtent::Writer(w) => w.close(),
            StreamOptimizedExtent::Reader(r) => r.close(),
        }
    }

    fn abort(self) -> Result<()> {
        match self {
            StreamOptimizedExtent::Writer(w) => w.abort(),
            StreamOptimizedExtent::Reader(r) => r.abort(),
        }
    }
}

/// Which kind of extent a handle wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtentKind {
    Flat,
    Sparse,
    StreamOptimized,
}

/// Open extent of any kind
pub enum Extent {
    Flat(FlatExtent),
    Sparse(SparseExtent),
    StreamOptimized(StreamOptimizedExtent),
}

impl Extent {
    // =========================================================================
    // Opening
    // =========================================================================

    /// Open read-only, detecting the kind from the signature and header flags
    ///
    /// A file without a sparse signature is a flat extent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if sniff_signature(path)?.is_none() {
            return Ok(Extent::Flat(FlatExtent::open(path, false)?));
        }
        let sparse = SparseExtent::open(path)?;
        tracing::debug!(
            "Opened {:?} (compressed: {})",
            path,
            sparse.header().is_compressed()
        );
        Ok(if sparse.header().is_compressed() {
            Extent::StreamOptimized(StreamOptimizedExtent::Reader(sparse))
        } else {
            Extent::Sparse(sparse)
        })
    }

    /// Open a raw file as a flat extent
    pub fn open_flat(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        Ok(Extent::Flat(FlatExtent::open(path, writable)?))
    }

    /// Open an existing flat or sparse extent for writing
    ///
    /// Finished stream-optimized extents are rejected with `ReadOnlyExtent`.
    pub fn open_for_write(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if sniff_signature(path)?.is_none() {
            return Ok(Extent::Flat(FlatExtent::open(path, true)?));
        }
        Ok(Extent::Sparse(SparseExtent::open_for_write(path)?))
    }

    // =========================================================================
    // Creation
    // =========================================================================

    pub fn create_flat(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        Ok(Extent::Flat(FlatExtent::create(path, capacity)?))
    }

    pub fn create_sparse(
        path: impl AsRef<Path>,
        capacity: u64,
        config: &ExtentConfig,
    ) -> Result<Self> {
        Ok(Extent::Sparse(SparseExtent::create(path, capacity, config)?))
    }

    pub fn create_stream_optimized(
        path: impl AsRef<Path>,
        capacity: u64,
        config: ExtentConfig,
    ) -> Result<Self> {
        Ok(Extent::StreamOptimized(StreamOptimizedExtent::Writer(
            StreamWriter::create(path, capacity, config)?,
        )))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn kind(&self) -> ExtentKind {
        match self {
            Extent::Flat(_) => ExtentKind::Flat,
            Extent::Sparse(_) => ExtentKind::Sparse,
            Extent::StreamOptimized(_) => ExtentKind::StreamOptimized,
        }
    }

    /// Current cursor of the `std::io` adapters
    pub fn position(&self) -> u64 {
        match self {
            Extent::Flat(f) => f.position(),
            Extent::Sparse(s) => s.position(),
            Extent::StreamOptimized(StreamOptimizedExtent::Writer(w)) => w.position(),
            Extent::StreamOptimized(StreamOptimizedExtent::Reader(r)) => r.position(),
        }
    }

    /// Underlying sparse extent, for inspection and verification
    pub fn as_sparse_mut(&mut self) -> Option<&mut SparseExtent> {
        match self {
            Extent::Sparse(s) | Extent::StreamOptimized(StreamOptimizedExtent::Reader(s)) => {
                Some(s)
            }
            _ => None,
        }
    }
}

impl DiskExtent for Extent {
    fn capacity(&self) -> u64 {
        match self {
            Extent::Flat(f) => DiskExtent::capacity(f),
            Extent::Sparse(s) => DiskExtent::capacity(s),
            Extent::StreamOptimized(o) => o.capacity(),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Extent::Flat(f) => DiskExtent::read_at(f, offset, buf),
            Extent::Sparse(s) => DiskExtent::read_at(s, offset, buf),
            Extent::StreamOptimized(o) => o.read_at(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        match self {
            Extent::Flat(f) => DiskExtent::write_at(f, offset, data),
            Extent::Sparse(s) => DiskExtent::write_at(s, offset, data),
            Extent::StreamOptimized(o) => o.write_at(offset, data),
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        match self {
            Extent::Flat(f) => DiskExtent::seek(f, pos),
            Extent::Sparse(s) => DiskExtent::seek(s, pos),
            Extent::StreamOptimized(o) => o.seek(pos),
        }
    }

    fn close(self) -> Result<()> {
        match self {
            Extent::Flat(f) => DiskExtent::close(f),
            Extent::Sparse(s) => DiskExtent::close(s),
            Extent::StreamOptimized(o) => o.close(),
        }
    }

    fn abort(self) -> Result<()> {
        match self {
            Extent::Flat(f) => DiskExtent::abort(f),
            Extent::Sparse(s) => DiskExtent::abort(s),
            Extent::StreamOptimized(o) => o.abort(),
        }
    }
}

impl Read for Extent {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let position = self.position();
        let remaining = DiskExtent::capacity(self).saturating_sub(position);
        let len = (buf.len() as u64).min(remaining) as usize;
        if len == 0 {
            return Ok(0);
        }
        let n = DiskExtent::read_at(self, position, &mut buf[..len])?;
        DiskExtent::seek(self, SeekFrom::Current(n as i64))?;
        Ok(n)
    }
}

impl Write for Extent {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let position = self.position();
        let n = DiskExtent::write_at(self, position, buf)?;
        DiskExtent::seek(self, SeekFrom::Current(n as i64))?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for Extent {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(DiskExtent::seek(self, pos)?)
    }
}

/// Signature at the start of `path`, `None` for files that are too short
fn sniff_signature(path: &Path) -> Result<Option<HeaderSignature>> {
    let mut file = File::open(path)?;
    let mut first = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < first.len() {
        match file.read(&mut first[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(HeaderSignature::detect(&first[..filled]))
}
