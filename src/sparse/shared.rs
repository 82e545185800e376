//! Shared read-only access to a finished extent.
//!
//! The grain index is an immutable snapshot, so lookups need no locking;
//! only the file cursor (and the one-grain cache) sit behind a mutex.

use std::fs::File;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;
use crate::flat::check_range;
use crate::format::SparseExtentHeader;
use crate::grain::GrainIndex;

use super::read::{read_range, GrainCache, GrainEncoding};

struct ReaderState {
    file: File,
    cache: GrainCache,
}

/// `Send + Sync` reader over a finished sparse or stream-optimized extent
pub struct SharedSparseReader {
    path: PathBuf,
    header: SparseExtentHeader,
    index: GrainIndex,
    encoding: GrainEncoding,
    state: Mutex<ReaderState>,
}

impl SharedSparseReader {
    pub(super) fn new(
        file: File,
        path: PathBuf,
        header: SparseExtentHeader,
        index: GrainIndex,
        encoding: GrainEncoding,
        cache: GrainCache,
    ) -> Self {
        Self {
            path,
            header,
            index,
            encoding,
            state: Mutex::new(ReaderState { file, cache }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.header.capacity_bytes()
    }

    pub fn header(&self) -> &SparseExtentHeader {
        &self.header
    }

    pub fn index(&self) -> &GrainIndex {
        &self.index
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        check_range(offset, buf.len(), self.capacity())?;
        let mut state = self.state.lock();
        let ReaderState { file, cache } = &mut *state;
        read_range(file, &self.index, self.encoding, cache, offset, buf)?;
        Ok(buf.len())
    }
}
