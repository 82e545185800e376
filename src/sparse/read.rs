//! Grain read path shared by [`super::SparseExtent`] and
//! [`super::SharedSparseReader`].

use std::io::{Read, Seek};

use crate::error::Result;
use crate::format::SECTOR_SIZE;
use crate::grain::record::read_compressed_grain;
use crate::grain::{GrainIndex, GrainState};
use crate::sector::read_exact_at;

/// How grains are stored in the extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GrainEncoding {
    pub compressed: bool,
    pub embedded_lba: bool,
}

/// Last inflated grain; sequential readers hit it for every chunk of a grain
#[derive(Debug)]
pub(crate) struct GrainCache {
    lba: Option<u64>,
    data: Vec<u8>,
}

impl GrainCache {
    pub fn new(grain_bytes: usize) -> Self {
        Self {
            lba: None,
            data: vec![0; grain_bytes],
        }
    }

    /// Forget the cached grain if it starts at `lba`
    pub fn invalidate(&mut self, lba: u64) {
        if self.lba == Some(lba) {
            self.lba = None;
        }
    }
}

/// Copy `buf.len()` bytes at byte `offset` of the virtual disk into `buf`
///
/// The caller has already checked the range against the capacity.
pub(crate) fn read_range<R: Read + Seek>(
    io: &mut R,
    index: &GrainIndex,
    encoding: GrainEncoding,
    cache: &mut GrainCache,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    let geometry = index.geometry();
    let grain_bytes = geometry.grain_bytes();
    let mut done = 0usize;

    while done < buf.len() {
        let pos = offset + done as u64;
        let within = pos % grain_bytes;
        let chunk = ((grain_bytes - within) as usize).min(buf.len() - done);
        let lba = (pos / grain_bytes) * geometry.grain_size();
        let out = &mut buf[done..done + chunk];

        match index.lookup(lba) {
            GrainState::Unallocated => out.fill(0),
            GrainState::Allocated(sector) if encoding.compressed => {
                if cache.lba != Some(lba) {
                    cache.lba = None;
                    read_compressed_grain(
                        io,
                        sector,
                        lba,
                        encoding.embedded_lba,
                        &mut cache.data,
                    )?;
                    cache.lba = Some(lba);
                }
                out.copy_from_slice(&cache.data[within as usize..within as usize + chunk]);
            }
            GrainState::Allocated(sector) => {
                read_exact_at(io, sector * SECTOR_SIZE + within, out)?;
            }
        }
        done += chunk;
    }
    Ok(())
}
