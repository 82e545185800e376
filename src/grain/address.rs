//! Grain Address Translator
//!
//! Pure mapping between virtual sector offsets and
//! (grain table, grain table entry, offset within grain).

use crate::error::{Result, VmdkError};
use crate::format::codec::{sectors_for_bytes, ENTRY_SIZE, SECTOR_SIZE};
use crate::format::SparseExtentHeader;

/// Grain size and table fan-out of one extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrainGeometry {
    grain_size: u64,
    num_gtes_per_gt: u32,
    sectors_per_table: u64,
}

/// Location of a virtual sector inside the two-level index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrainAddress {
    /// Grain directory index
    pub table_index: u64,
    /// Grain table index
    pub entry_index: u32,
    /// Sector offset within the grain
    pub grain_offset: u64,
}

impl GrainGeometry {
    /// Both values must be positive and their product must fit in a u64
    pub fn new(grain_size: u64, num_gtes_per_gt: u32) -> Result<Self> {
        if grain_size == 0 || num_gtes_per_gt == 0 {
            return Err(VmdkError::InvalidFormat(format!(
                "grain size {} and grain table entries {} must be positive",
                grain_size, num_gtes_per_gt
            )));
        }
        let sectors_per_table = grain_size
            .checked_mul(num_gtes_per_gt as u64)
            .ok_or_else(|| {
                VmdkError::InvalidFormat(format!(
                    "grain size {} x {} entries overflows",
                    grain_size, num_gtes_per_gt
                ))
            })?;
        // Grain byte size must also be representable
        grain_size.checked_mul(SECTOR_SIZE).ok_or_else(|| {
            VmdkError::InvalidFormat(format!("grain size {} overflows", grain_size))
        })?;
        Ok(Self {
            grain_size,
            num_gtes_per_gt,
            sectors_per_table,
        })
    }

    pub fn from_header(header: &SparseExtentHeader) -> Result<Self> {
        Self::new(header.grain_size, header.num_gtes_per_gt)
    }

    pub fn grain_size(&self) -> u64 {
        self.grain_size
    }

    pub fn num_gtes_per_gt(&self) -> u32 {
        self.num_gtes_per_gt
    }

    pub fn sectors_per_table(&self) -> u64 {
        self.sectors_per_table
    }

    pub fn grain_bytes(&self) -> u64 {
        self.grain_size * SECTOR_SIZE
    }

    /// Translate a virtual sector
    pub fn locate(&self, sector: u64) -> GrainAddress {
        let within_table = sector % self.sectors_per_table;
        GrainAddress {
            table_index: sector / self.sectors_per_table,
            entry_index: (within_table / self.grain_size) as u32,
            grain_offset: sector % self.grain_size,
        }
    }

    /// Index of the grain holding `sector`, counted from the start of the disk
    pub fn grain_index(&self, sector: u64) -> u64 {
        sector / self.grain_size
    }

    /// Grain tables needed to cover `capacity` sectors (last one may be partial)
    pub fn table_count(&self, capacity: u64) -> u64 {
        capacity.div_ceil(self.sectors_per_table)
    }

    /// Sectors occupied by one grain table
    pub fn table_sectors(&self) -> u64 {
        sectors_for_bytes(self.num_gtes_per_gt as u64 * ENTRY_SIZE)
    }

    /// Sectors occupied by a grain directory for `capacity` sectors
    pub fn directory_sectors(&self, capacity: u64) -> u64 {
        sectors_for_bytes(self.table_count(capacity) * ENTRY_SIZE)
    }
}

impl GrainAddress {
    /// Reassemble the virtual sector this address was computed from
    pub fn to_sector(&self, geometry: &GrainGeometry) -> u64 {
        self.table_index * geometry.sectors_per_table()
            + self.entry_index as u64 * geometry.grain_size()
            + self.grain_offset
    }

    /// First sector of the grain holding this address
    pub fn grain_start(&self, geometry: &GrainGeometry) -> u64 {
        self.to_sector(geometry) - self.grain_offset
    }
}
