//! Grain Directory/Table Manager
//!
//! Owns the two-level index (directory → tables → grains) of one extent,
//! including the redundant mirror.
//!
//! ## Invariants
//! - Tables are materialized lazily on the first write into their span and
//!   appended at the current end of the extent; reads never allocate.
//! - Every on-disk mutation updates the mirror (RGD/RGT) before the
//!   primary (GD/GT), so after a crash the mirror is never behind.
//! - A grain table entry only moves `Unallocated -> Allocated(sector)`.
//!
//! ## Recovery Precedence
//! On an extent whose header carries `uncleanShutdown`, the mirror is
//! authoritative wherever it disagrees with the primary. The primary is
//! rewritten from the mirror by [`GrainIndex::repair`] when the extent is
//! opened for writing. A clean extent is read through the primary only.

use std::io::{Read, Seek, Write};

use bytes::BytesMut;
use serde::Serialize;

use crate::error::{Result, VmdkError};
use crate::format::codec::{decode_entries, encode_entries, sectors_for_bytes};
use crate::format::header::FLAG_MAGIC_GTE;
use crate::format::SparseExtentHeader;
use crate::sector::{read_sectors, write_entry, write_sectors};

use super::address::{GrainAddress, GrainGeometry};

/// Upper bound on grain directory entries (64 MiB directory)
const MAX_TABLES: u64 = 1 << 24;

/// With `MAGIC_GTE`, this entry value marks an explicitly zeroed grain
const ZEROED_GRAIN_ENTRY: u32 = 1;

/// Allocation state of one grain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrainState {
    /// Never written; reads as zeros
    Unallocated,
    /// Stored at this sector of the extent
    Allocated(u64),
}

/// Hands out sectors at the end of the extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorAllocator {
    next: u64,
}

impl SectorAllocator {
    pub fn new(next_free: u64) -> Self {
        Self { next: next_free }
    }

    /// Allocator positioned after the last (possibly partial) sector
    pub fn from_file_len(bytes: u64) -> Self {
        Self::new(sectors_for_bytes(bytes))
    }

    pub fn next_free(&self) -> u64 {
        self.next
    }

    /// Reserve `sectors` sectors and return the first one
    pub fn allocate(&mut self, sectors: u64) -> u64 {
        let start = self.next;
        self.next += sectors;
        start
    }
}

/// Outcome of reconciling the primary index with its mirror
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Tables whose primary copy disagreed with the mirror
    pub repaired_tables: u64,
    /// Entries whose primary value disagreed with the mirror
    pub repaired_entries: u64,
}

/// In-memory grain directory and tables of one extent
#[derive(Debug, Clone)]
pub struct GrainIndex {
    geometry: GrainGeometry,
    capacity: u64,
    /// Sector of the primary directory (0 = none on disk yet)
    gd_offset: u64,
    /// Sector of the redundant directory, when redundancy is enabled
    rgd_offset: Option<u64>,
    /// Primary directory: sector of each table, 0 = unallocated
    directory: Vec<u32>,
    /// Mirror directory (empty without redundancy)
    redundant_directory: Vec<u32>,
    /// Table contents, shared by primary and mirror
    tables: Vec<Option<Vec<u32>>>,
    /// Entry value 1 means "zeroed grain"
    magic_gte: bool,
    recovery: RecoveryReport,
    /// Primary copy on disk is stale
    dirty: bool,
}

impl GrainIndex {
    /// Empty index for a new extent
    pub fn new(
        geometry: GrainGeometry,
        capacity: u64,
        gd_offset: u64,
        rgd_offset: Option<u64>,
    ) -> Result<Self> {
        let table_count = geometry.table_count(capacity);
        if table_count > MAX_TABLES {
            return Err(VmdkError::UnsupportedFeature(format!(
                "capacity {} needs {} grain tables (max {})",
                capacity, table_count, MAX_TABLES
            )));
        }
        let table_count = table_count as usize;
        Ok(Self {
            geometry,
            capacity,
            gd_offset,
            rgd_offset,
            directory: vec![0; table_count],
            redundant_directory: if rgd_offset.is_some() {
                vec![0; table_count]
            } else {
                Vec::new()
            },
            tables: vec![None; table_count],
            magic_gte: false,
            recovery: RecoveryReport::default(),
            dirty: false,
        })
    }

    /// Load directory and tables described by `header`
    pub fn load<R: Read + Seek>(io: &mut R, header: &SparseExtentHeader) -> Result<Self> {
        let geometry = GrainGeometry::from_header(header)?;
        let rgd_offset = (header.use_redundant() && header.rgd_offset != 0)
            .then_some(header.rgd_offset);
        let mut index = Self::new(geometry, header.capacity, header.gd_offset, rgd_offset)?;
        index.magic_gte = header.flags & FLAG_MAGIC_GTE != 0;

        let primary = if header.gd_offset != 0 {
            Some(index.read_directory(io, header.gd_offset)?)
        } else {
            None
        };
        let mirror = match rgd_offset {
            Some(rgd) => Some(index.read_directory(io, rgd)?),
            None => None,
        };

        match (primary, mirror) {
            (Some(gd), Some(rgd)) if header.unclean_shutdown => {
                index.recover_from_mirror(io, gd, rgd)?;
            }
            (Some(gd), mirror) => {
                index.tables = index.read_tables(io, &gd)?;
                index.directory = gd;
                if let Some(rgd) = mirror {
                    index.redundant_directory = rgd;
                }
            }
            (None, Some(rgd)) => {
                tracing::warn!("Primary grain directory missing, using redundant copy");
                index.tables = index.read_tables(io, &rgd)?;
                index.recovery.repaired_tables =
                    index.tables.iter().filter(|t| t.is_some()).count() as u64;
                index.redundant_directory = rgd;
                index.dirty = true;
            }
            (None, None) => {
                return Err(VmdkError::InvalidFormat(
                    "extent has no grain directory".to_string(),
                ));
            }
        }

        tracing::debug!(
            "Loaded grain index: {} tables ({} allocated), {} grains",
            index.table_count(),
            index.allocated_table_count(),
            index.allocated_grain_count()
        );
        Ok(index)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// State of the grain holding virtual `sector`; never allocates
    pub fn lookup(&self, sector: u64) -> GrainState {
        let addr = self.geometry.locate(sector);
        self.state(&addr)
    }

    /// State of the grain at `addr`
    pub fn state(&self, addr: &GrainAddress) -> GrainState {
        let entry = self
            .tables
            .get(addr.table_index as usize)
            .and_then(|t| t.as_ref())
            .map(|t| t[addr.entry_index as usize])
            .unwrap_or(0);
        if self.is_allocated(entry) {
            GrainState::Allocated(entry as u64)
        } else {
            GrainState::Unallocated
        }
    }

    /// Zero and (with `MAGIC_GTE`) the zeroed-grain marker point at no data
    fn is_allocated(&self, entry: u32) -> bool {
        entry != 0 && !(self.magic_gte && entry == ZEROED_GRAIN_ENTRY)
    }

    /// (first virtual sector, extent sector) of every allocated grain, in LBA order
    pub fn allocated_grains(&self) -> Vec<(u64, u64)> {
        let mut grains = Vec::new();
        for (t, table) in self.tables.iter().enumerate() {
            let Some(table) = table else { continue };
            for (e, &entry) in table.iter().enumerate() {
                if !self.is_allocated(entry) {
                    continue;
                }
                let lba = t as u64 * self.geometry.sectors_per_table()
                    + e as u64 * self.geometry.grain_size();
                grains.push((lba, entry as u64));
            }
        }
        grains
    }

    pub fn allocated_grain_count(&self) -> u64 {
        self.allocated_grains().len() as u64
    }

    pub fn allocated_table_count(&self) -> u64 {
        self.tables.iter().filter(|t| t.is_some()).count() as u64
    }

    /// Indices of tables that hold at least one entry slot in memory
    pub fn allocated_tables(&self) -> Vec<u64> {
        self.tables
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_some())
            .map(|(i, _)| i as u64)
            .collect()
    }

    // =========================================================================
    // On-disk Mutation (sparse extents)
    // =========================================================================

    /// Make sure table `table_index` exists on disk, appending it (mirror
    /// first) when needed
    pub fn ensure_table<S: Read + Write + Seek>(
        &mut self,
        io: &mut S,
        table_index: u64,
        allocator: &mut SectorAllocator,
    ) -> Result<()> {
        let t = self.check_table_index(table_index)?;
        let needs_mirror = self.rgd_offset.is_some() && self.redundant_directory[t] == 0;
        let needs_primary = self.directory[t] == 0;
        if !needs_mirror && !needs_primary && self.tables[t].is_some() {
            return Ok(());
        }

        let entries = self.tables[t]
            .get_or_insert_with(|| vec![0; self.geometry.num_gtes_per_gt() as usize])
            .clone();
        let bytes = encode_entries(&entries);
        let table_sectors = self.geometry.table_sectors();

        if let (true, Some(rgd)) = (needs_mirror, self.rgd_offset) {
            let sector = allocator.allocate(table_sectors);
            let value = sector_to_entry(sector)?;
            write_sectors(io, sector, &bytes)?;
            write_entry(io, rgd, t as u64, value)?;
            self.redundant_directory[t] = value;
        }
        if needs_primary {
            let sector = allocator.allocate(table_sectors);
            let value = sector_to_entry(sector)?;
            write_sectors(io, sector, &bytes)?;
            write_entry(io, self.gd_offset, t as u64, value)?;
            self.directory[t] = value;
            tracing::debug!("Allocated grain table {} at sector {}", t, sector);
        }
        Ok(())
    }

    /// Record that the grain at `addr` now lives at `grain_sector`
    ///
    /// The table must already exist (see [`GrainIndex::ensure_table`]).
    pub fn commit_grain<S: Write + Seek>(
        &mut self,
        io: &mut S,
        addr: &GrainAddress,
        grain_sector: u64,
    ) -> Result<()> {
        let t = self.check_table_index(addr.table_index)?;
        let e = addr.entry_index as usize;
        let value = sector_to_entry(grain_sector)?;
        match self.tables[t].as_ref() {
            None => {
                return Err(VmdkError::ProtocolViolation(format!(
                    "grain table {} is not allocated",
                    t
                )))
            }
            Some(table) if self.is_allocated(table[e]) => {
                return Err(VmdkError::ProtocolViolation(format!(
                    "grain {} of table {} is already allocated",
                    e, t
                )))
            }
            Some(_) => {}
        }

        if self.rgd_offset.is_some() {
            write_entry(io, self.redundant_directory[t] as u64, e as u64, value)?;
        }
        write_entry(io, self.directory[t] as u64, e as u64, value)?;
        if let Some(table) = self.tables[t].as_mut() {
            table[e] = value;
        }
        Ok(())
    }

    /// Rewrite the primary directory/tables from memory after a recovery
    ///
    /// A missing primary directory is appended at the end of the extent;
    /// callers must persist the new [`GrainIndex::gd_offset`] in the header.
    pub fn repair<S: Read + Write + Seek>(
        &mut self,
        io: &mut S,
        allocator: &mut SectorAllocator,
    ) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if self.gd_offset == 0 {
            self.gd_offset = allocator.allocate(self.geometry.directory_sectors(self.capacity));
        }
        let table_sectors = self.geometry.table_sectors();
        for t in 0..self.tables.len() {
            let Some(entries) = self.tables[t].as_ref() else {
                continue;
            };
            if self.directory[t] == 0 {
                self.directory[t] = sector_to_entry(allocator.allocate(table_sectors))?;
            }
            write_sectors(io, self.directory[t] as u64, &encode_entries(entries))?;
        }
        write_sectors(io, self.gd_offset, &encode_entries(&self.directory))?;
        self.dirty = false;
        tracing::info!(
            "Repaired primary grain index ({} tables, {} entries)",
            self.recovery.repaired_tables,
            self.recovery.repaired_entries
        );
        Ok(())
    }

    // =========================================================================
    // In-memory Mutation (stream-optimized writer and marker scan)
    // =========================================================================

    /// Record a grain location without touching disk
    pub fn set_entry(&mut self, addr: &GrainAddress, grain_sector: u64) -> Result<()> {
        let t = self.check_table_index(addr.table_index)?;
        let value = sector_to_entry(grain_sector)?;
        let per_table = self.geometry.num_gtes_per_gt() as usize;
        let table = self.tables[t].get_or_insert_with(|| vec![0; per_table]);
        let slot = &mut table[addr.entry_index as usize];
        if *slot != 0 {
            return Err(VmdkError::ProtocolViolation(format!(
                "grain {} of table {} is already allocated",
                addr.entry_index, t
            )));
        }
        *slot = value;
        Ok(())
    }

    /// Encoded table `table_index`, if it holds anything
    pub fn table_bytes(&self, table_index: u64) -> Option<BytesMut> {
        self.tables
            .get(table_index as usize)
            .and_then(|t| t.as_ref())
            .map(|t| encode_entries(t))
    }

    pub fn set_table_location(&mut self, table_index: u64, sector: u64) -> Result<()> {
        let t = self.check_table_index(table_index)?;
        self.directory[t] = sector_to_entry(sector)?;
        Ok(())
    }

    pub fn set_redundant_table_location(&mut self, table_index: u64, sector: u64) -> Result<()> {
        let t = self.check_table_index(table_index)?;
        if self.redundant_directory.len() != self.directory.len() {
            self.redundant_directory = vec![0; self.directory.len()];
        }
        self.redundant_directory[t] = sector_to_entry(sector)?;
        Ok(())
    }

    pub fn directory_bytes(&self) -> BytesMut {
        encode_entries(&self.directory)
    }

    pub fn redundant_directory_bytes(&self) -> BytesMut {
        encode_entries(&self.redundant_directory)
    }

    pub fn set_gd_offset(&mut self, sector: u64) {
        self.gd_offset = sector;
    }

    pub fn set_rgd_offset(&mut self, sector: Option<u64>) {
        self.rgd_offset = sector;
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn geometry(&self) -> &GrainGeometry {
        &self.geometry
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn table_count(&self) -> u64 {
        self.directory.len() as u64
    }

    pub fn gd_offset(&self) -> u64 {
        self.gd_offset
    }

    pub fn rgd_offset(&self) -> Option<u64> {
        self.rgd_offset
    }

    pub fn directory(&self) -> &[u32] {
        &self.directory
    }

    pub fn redundant_directory(&self) -> &[u32] {
        &self.redundant_directory
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Primary copy must be rewritten before the extent is modified
    pub fn needs_repair(&self) -> bool {
        self.dirty
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_table_index(&self, table_index: u64) -> Result<usize> {
        if table_index >= self.table_count() {
            return Err(VmdkError::OutOfRange {
                offset: table_index * self.geometry.sectors_per_table(),
                len: 0,
                capacity: self.capacity,
            });
        }
        Ok(table_index as usize)
    }

    fn read_directory<R: Read + Seek>(&self, io: &mut R, sector: u64) -> Result<Vec<u32>> {
        let sectors = self.geometry.directory_sectors(self.capacity);
        let bytes = read_sectors(io, sector, sectors)?;
        decode_entries(&bytes, self.directory.len(), "grain directory")
    }

    fn read_table<R: Read + Seek>(&self, io: &mut R, sector: u64) -> Result<Vec<u32>> {
        let bytes = read_sectors(io, sector, self.geometry.table_sectors())?;
        decode_entries(
            &bytes,
            self.geometry.num_gtes_per_gt() as usize,
            "grain table",
        )
    }

    fn read_tables<R: Read + Seek>(
        &self,
        io: &mut R,
        directory: &[u32],
    ) -> Result<Vec<Option<Vec<u32>>>> {
        directory
            .iter()
            .map(|&sector| match sector {
                0 => Ok(None),
                s => self.read_table(io, s as u64).map(Some),
            })
            .collect()
    }

    /// Adopt the mirror wherever it disagrees with the primary
    fn recover_from_mirror<R: Read + Seek>(
        &mut self,
        io: &mut R,
        mut gd: Vec<u32>,
        rgd: Vec<u32>,
    ) -> Result<()> {
        for t in 0..gd.len() {
            let primary = match gd[t] {
                0 => None,
                s => Some(self.read_table(io, s as u64)?),
            };
            let mirror = match rgd[t] {
                0 => None,
                s => Some(self.read_table(io, s as u64)?),
            };
            if primary == mirror {
                self.tables[t] = mirror;
                continue;
            }

            let differing = match (&primary, &mirror) {
                (Some(p), Some(m)) => p.iter().zip(m).filter(|(a, b)| a != b).count(),
                (None, Some(m)) => m.iter().filter(|&&e| e != 0).count(),
                (Some(p), None) => p.iter().filter(|&&e| e != 0).count(),
                (None, None) => 0,
            };
            tracing::warn!(
                "Grain table {} disagrees with its mirror ({} entries), using mirror",
                t,
                differing
            );
            self.recovery.repaired_tables += 1;
            self.recovery.repaired_entries += differing as u64;
            if mirror.is_none() {
                gd[t] = 0;
            }
            self.tables[t] = mirror;
            self.dirty = true;
        }
        self.directory = gd;
        self.redundant_directory = rgd;
        Ok(())
    }
}

/// Grain directory/table entries are 32-bit sector numbers
fn sector_to_entry(sector: u64) -> Result<u32> {
    u32::try_from(sector).map_err(|_| {
        VmdkError::UnsupportedFeature(format!(
            "sector {} exceeds 32-bit grain table addressing",
            sector
        ))
    })
}
