//! Sparse Extent
//!
//! Random-access extent routed through the grain directory and tables.
//! The same type opens finished stream-optimized extents read-only.
//!
//! ## Open Sequence
//! 1. Read sector 0; refuse the temporary magic (creation never completed)
//! 2. Validate the header
//! 3. `gdOffset == GD_AT_END`: the footer header replaces it; with no footer
//!    the index is rebuilt by a forward marker scan
//! 4. Load the grain directory and tables (mirror wins after an unclean
//!    shutdown)
//! 5. Parse the embedded descriptor, if any
//!
//! ## Write Sessions
//! A freshly created extent carries the temporary magic until `close()`.
//! An existing extent reopened for writing carries `uncleanShutdown = 1`
//! until `close()`, and gets a new content ID on its first change.

mod read;
mod shared;

use std::fs::{self, File, OpenOptions};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;

use crate::config::ExtentConfig;
use crate::descriptor::{CreateType, DescriptorBuilder, DiskDescriptor};
use crate::error::{Result, VmdkError};
use crate::flat::{check_range, check_sector_multiple, resolve_seek};
use crate::format::codec::{is_zero, round_up, sectors_for_bytes};
use crate::format::header::FLAG_USE_REDUNDANT;
use crate::format::{HeaderSignature, SparseExtentHeader, HEADER_SIZE, SECTOR_SIZE};
use crate::grain::record::read_compressed_grain;
use crate::grain::{GrainGeometry, GrainIndex, GrainState, RecoveryReport, SectorAllocator};
use crate::sector::{read_exact_at, read_sectors, write_all_at, write_sectors};
use crate::stream::{embed_descriptor, locate_footer, rebuild_index, ScanReport};

use read::{read_range, GrainCache, GrainEncoding};

pub use shared::SharedSparseReader;

/// Upper bound on an embedded descriptor we are willing to read
const MAX_DESCRIPTOR_SECTORS: u64 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadOnly,
    /// Created by this handle; sector 0 has the temporary magic
    Created,
    /// Existing extent; sector 0 has `uncleanShutdown` set
    Reopened,
}

/// Summary of an open extent
#[derive(Debug, Clone, Serialize)]
pub struct ExtentInfo {
    pub path: PathBuf,
    pub create_type: CreateType,
    pub capacity_bytes: u64,
    pub header: SparseExtentHeader,
    pub table_count: u64,
    pub allocated_tables: u64,
    pub allocated_grains: u64,
    pub allocated_bytes: u64,
    /// `CID` of the embedded descriptor, as written in it
    pub content_id: Option<String>,
    pub recovery: RecoveryReport,
    /// Present when the index had to be rebuilt by a marker scan
    pub scan: Option<ScanReport>,
}

/// One grain that failed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptGrainReport {
    pub lba: u64,
    pub sector: u64,
    pub reason: String,
}

/// Result of [`SparseExtent::verify`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub grains_checked: u64,
    pub corrupt: Vec<CorruptGrainReport>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty()
    }
}

/// Sparse (or finished stream-optimized) extent
pub struct SparseExtent {
    file: File,
    path: PathBuf,
    /// Authoritative header (the footer copy for stream-optimized extents)
    header: SparseExtentHeader,
    index: GrainIndex,
    allocator: SectorAllocator,
    encoding: GrainEncoding,
    cache: GrainCache,
    descriptor: Option<DiskDescriptor>,
    scan: Option<ScanReport>,
    access: Access,
    sync_on_close: bool,
    remove_on_abort: bool,
    /// Content ID already refreshed in this session
    cid_refreshed: bool,
    rng: StdRng,
    position: u64,
}

impl SparseExtent {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Create a sparse extent of `capacity` bytes
    pub fn create(path: impl AsRef<Path>, capacity: u64, config: &ExtentConfig) -> Result<Self> {
        Self::create_with_rng(path, capacity, config, &mut rand::rng())
    }

    /// Like [`SparseExtent::create`], drawing content IDs from `rng`
    pub fn create_with_rng<R: RngCore + ?Sized>(
        path: impl AsRef<Path>,
        capacity: u64,
        config: &ExtentConfig,
        rng: &mut R,
    ) -> Result<Self> {
        // Step 1: Validate parameters
        config.validate()?;
        check_sector_multiple(capacity)?;
        let path = path.as_ref().to_path_buf();
        let capacity_sectors = capacity / SECTOR_SIZE;
        let geometry = GrainGeometry::new(config.grain_size, config.num_gtes_per_gt)?;

        // Step 2: Lay out header, descriptor, RGD and GD
        let mut header =
            SparseExtentHeader::new(capacity_sectors, config.grain_size, config.num_gtes_per_gt);
        let mut next = 1;
        let descriptor = if config.descriptor_sectors > 0 {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            header.descriptor_offset = next;
            header.descriptor_size = config.descriptor_sectors;
            next += config.descriptor_sectors;
            Some(
                DescriptorBuilder::new(file_name, capacity_sectors)
                    .create_type(CreateType::MonolithicSparse)
                    .build(rng),
            )
        } else {
            None
        };
        let directory_sectors = geometry.directory_sectors(capacity_sectors);
        if config.redundant {
            header.flags |= FLAG_USE_REDUNDANT;
            header.rgd_offset = next;
            next += directory_sectors;
        }
        header.gd_offset = next;
        next += directory_sectors;
        header.over_head = round_up(next, config.grain_size);

        let index = GrainIndex::new(
            geometry,
            capacity_sectors,
            header.gd_offset,
            config.redundant.then_some(header.rgd_offset),
        )?;

        // Step 3: Write the metadata area; directories start out zeroed
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(header.over_head * SECTOR_SIZE)?;
        write_sectors(&mut file, 0, &header.serialize(true))?;
        if let Some(descriptor) = &descriptor {
            let text = embed_descriptor(&descriptor.render(), header.descriptor_size);
            match text {
                Ok(bytes) => write_sectors(&mut file, header.descriptor_offset, &bytes)?,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&path);
                    return Err(e);
                }
            }
        }

        tracing::info!(
            "Created sparse extent {:?} ({} sectors, gd={}, rgd={}, overhead={})",
            path,
            capacity_sectors,
            header.gd_offset,
            header.rgd_offset,
            header.over_head
        );
        Ok(Self {
            file,
            path,
            allocator: SectorAllocator::new(header.over_head),
            encoding: GrainEncoding {
                compressed: false,
                embedded_lba: false,
            },
            cache: GrainCache::new(geometry.grain_bytes() as usize),
            header,
            index,
            descriptor,
            scan: None,
            access: Access::Created,
            sync_on_close: config.sync_on_close,
            remove_on_abort: config.remove_on_abort,
            cid_refreshed: true,
            rng: StdRng::from_os_rng(),
            position: 0,
        })
    }

    /// Open an existing sparse or stream-optimized extent read-only
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let metadata = load_metadata(&mut file)?;
        Ok(Self::from_metadata(file, path, metadata, Access::ReadOnly))
    }

    /// Open an existing (uncompressed) sparse extent for writing
    pub fn open_for_write(path: impl AsRef<Path>) -> Result<Self> {
        // Step 1: Load header and index, recovering from the mirror if needed
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let metadata = load_metadata(&mut file)?;
        if metadata.header.is_compressed() {
            return Err(VmdkError::ReadOnlyExtent);
        }
        let mut extent = Self::from_metadata(file, path, metadata, Access::Reopened);

        // Step 2: Bring the primary index back in line with the mirror
        if extent.index.needs_repair() {
            extent.index.repair(&mut extent.file, &mut extent.allocator)?;
            extent.header.gd_offset = extent.index.gd_offset();
        }

        // Step 3: Mark the session open on disk
        extent.header.unclean_shutdown = true;
        write_sectors(&mut extent.file, 0, &extent.header.serialize(false))?;
        extent.file.sync_data()?;
        extent.cid_refreshed = false;

        tracing::info!("Opened sparse extent {:?} for writing", extent.path);
        Ok(extent)
    }

    fn from_metadata(file: File, path: PathBuf, metadata: Metadata, access: Access) -> Self {
        let Metadata {
            header,
            index,
            descriptor,
            scan,
            file_sectors,
        } = metadata;
        Self {
            file,
            path,
            allocator: SectorAllocator::new(file_sectors.max(header.over_head)),
            encoding: GrainEncoding {
                compressed: header.is_compressed(),
                embedded_lba: header.has_embedded_lba(),
            },
            cache: GrainCache::new(index.geometry().grain_bytes() as usize),
            header,
            index,
            descriptor,
            scan,
            access,
            sync_on_close: true,
            remove_on_abort: false,
            cid_refreshed: true,
            rng: StdRng::from_os_rng(),
            position: 0,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

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

    pub fn descriptor(&self) -> Option<&DiskDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn is_writable(&self) -> bool {
        self.access != Access::ReadOnly
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(self.position, self.capacity(), pos)?;
        Ok(self.position)
    }

    pub fn info(&self) -> ExtentInfo {
        let allocated_grains = self.index.allocated_grain_count();
        ExtentInfo {
            path: self.path.clone(),
            create_type: if self.header.is_compressed() {
                CreateType::StreamOptimized
            } else {
                CreateType::MonolithicSparse
            },
            capacity_bytes: self.capacity(),
            header: self.header.clone(),
            table_count: self.index.table_count(),
            allocated_tables: self.index.allocated_table_count(),
            allocated_grains,
            allocated_bytes: allocated_grains * self.index.geometry().grain_bytes(),
            content_id: self.descriptor.as_ref().map(|d| format!("{:08x}", d.cid)),
            recovery: self.index.recovery().clone(),
            scan: self.scan.clone(),
        }
    }

    // =========================================================================
    // Data Path
    // =========================================================================

    /// Read `buf.len()` bytes at byte `offset`; unallocated grains read as zeros
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        check_range(offset, buf.len(), self.capacity())?;
        read_range(
            &mut self.file,
            &self.index,
            self.encoding,
            &mut self.cache,
            offset,
            buf,
        )?;
        Ok(buf.len())
    }

    /// Write `data` at byte `offset`, allocating grains and tables on demand
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        if self.access == Access::ReadOnly {
            return Err(VmdkError::ReadOnlyExtent);
        }
        check_range(offset, data.len(), self.capacity())?;

        let geometry = *self.index.geometry();
        let grain_bytes = geometry.grain_bytes();
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let within = pos % grain_bytes;
            let chunk = ((grain_bytes - within) as usize).min(data.len() - done);
            let lba = (pos / grain_bytes) * geometry.grain_size();
            let bytes = &data[done..done + chunk];

            match self.index.lookup(lba) {
                GrainState::Allocated(sector) => {
                    self.note_content_change()?;
                    write_all_at(&mut self.file, sector * SECTOR_SIZE + within, bytes)?;
                    self.cache.invalidate(lba);
                }
                // Unallocated grains already read as zeros
                GrainState::Unallocated if is_zero(bytes) => {}
                GrainState::Unallocated => {
                    self.note_content_change()?;
                    let mut grain = vec![0u8; grain_bytes as usize];
                    grain[within as usize..within as usize + chunk].copy_from_slice(bytes);
                    let addr = geometry.locate(lba);
                    self.index
                        .ensure_table(&mut self.file, addr.table_index, &mut self.allocator)?;
                    // Grain data lands before the table entry that points at it
                    let sector = self.allocator.allocate(geometry.grain_size());
                    write_sectors(&mut self.file, sector, &grain)?;
                    self.index.commit_grain(&mut self.file, &addr, sector)?;
                    tracing::trace!("Allocated grain LBA {} at sector {}", lba, sector);
                }
            }
            done += chunk;
        }
        Ok(data.len())
    }

    /// Check every allocated grain without stopping at the first bad one
    pub fn verify(&mut self) -> Result<VerifyReport> {
        let geometry = *self.index.geometry();
        let file_sectors = sectors_for_bytes(self.file.metadata()?.len());
        let mut scratch = vec![0u8; geometry.grain_bytes() as usize];
        let mut report = VerifyReport::default();

        for (lba, sector) in self.index.allocated_grains() {
            report.grains_checked += 1;
            let outcome = if self.encoding.compressed {
                read_compressed_grain(
                    &mut self.file,
                    sector,
                    lba,
                    self.encoding.embedded_lba,
                    &mut scratch,
                )
            } else if sector + geometry.grain_size() > file_sectors {
                Err(VmdkError::CorruptGrain {
                    lba,
                    reason: "grain lies past the end of the file".to_string(),
                })
            } else {
                Ok(())
            };

            let reason = match outcome {
                Ok(()) => continue,
                Err(VmdkError::CorruptGrain { reason, .. }) => reason,
                Err(VmdkError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    "grain record is truncated".to_string()
                }
                Err(e) => return Err(e),
            };
            tracing::warn!("Corrupt grain at LBA {} (sector {}): {}", lba, sector, reason);
            report.corrupt.push(CorruptGrainReport {
                lba,
                sector,
                reason,
            });
        }
        Ok(report)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Finish the write session (no-op for read-only handles)
    pub fn close(mut self) -> Result<()> {
        if self.access == Access::ReadOnly {
            return Ok(());
        }
        self.header.unclean_shutdown = false;
        write_sectors(&mut self.file, 0, &self.header.serialize(false))?;
        if self.sync_on_close {
            self.file.sync_all()?;
        }
        tracing::info!(
            "Closed sparse extent {:?}: {} grains in {} tables",
            self.path,
            self.index.allocated_grain_count(),
            self.index.allocated_table_count()
        );
        Ok(())
    }

    /// Discard the write session
    ///
    /// A created extent is removed (or keeps its temporary magic); a
    /// reopened one keeps `uncleanShutdown` so the next open reconciles the
    /// index with its mirror.
    pub fn abort(self) -> Result<()> {
        let Self {
            file,
            path,
            access,
            remove_on_abort,
            ..
        } = self;
        drop(file);
        match access {
            Access::Created if remove_on_abort => {
                fs::remove_file(&path)?;
                tracing::warn!("Aborted sparse extent {:?}, file removed", path);
            }
            Access::Created => {
                tracing::warn!("Aborted sparse extent {:?}, temporary magic left", path);
            }
            Access::Reopened => {
                tracing::warn!("Aborted write session on {:?}, extent left unclean", path);
            }
            Access::ReadOnly => {}
        }
        Ok(())
    }

    /// Freeze a read-only handle into a reader that can be shared across threads
    pub fn into_shared(self) -> Result<SharedSparseReader> {
        if self.access != Access::ReadOnly {
            return Err(VmdkError::ProtocolViolation(
                "close the write session before sharing the extent".to_string(),
            ));
        }
        Ok(SharedSparseReader::new(
            self.file,
            self.path,
            self.header,
            self.index,
            self.encoding,
            self.cache,
        ))
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// New content ID before the first change of a reopened extent
    fn note_content_change(&mut self) -> Result<()> {
        if self.cid_refreshed {
            return Ok(());
        }
        self.cid_refreshed = true;
        let Some(descriptor) = self.descriptor.as_mut() else {
            return Ok(());
        };
        descriptor.refresh_content_id(&mut self.rng);
        let bytes = embed_descriptor(&descriptor.render(), self.header.descriptor_size)?;
        write_sectors(&mut self.file, self.header.descriptor_offset, &bytes)?;
        Ok(())
    }
}

/// Everything decoded while opening an extent
struct Metadata {
    header: SparseExtentHeader,
    index: GrainIndex,
    descriptor: Option<DiskDescriptor>,
    scan: Option<ScanReport>,
    file_sectors: u64,
}

fn load_metadata(file: &mut File) -> Result<Metadata> {
    let file_len = file.metadata()?.len();
    if file_len < HEADER_SIZE as u64 {
        return Err(VmdkError::InvalidFormat(format!(
            "file of {} bytes cannot hold a sparse header",
            file_len
        )));
    }

    let mut first = [0u8; HEADER_SIZE];
    read_exact_at(file, 0, &mut first)?;
    if HeaderSignature::detect(&first) == Some(HeaderSignature::Temporary) {
        return Err(VmdkError::InvalidFormat(
            "extent carries the temporary signature; creation never completed".to_string(),
        ));
    }
    let mut header = SparseExtentHeader::validate(&first)?;

    let mut scan = None;
    let index = if header.gd_at_end() {
        match locate_footer(file)? {
            Some(footer) => {
                let index = GrainIndex::load(file, &footer)?;
                header = footer;
                index
            }
            None if header.is_compressed() && header.has_embedded_lba() => {
                tracing::warn!("Stream has no footer, rebuilding index from grain markers");
                let (index, report) = rebuild_index(file, &header)?;
                scan = Some(report);
                index
            }
            None => {
                return Err(VmdkError::InvalidFormat(
                    "grain directory is at the end but no footer was found".to_string(),
                ))
            }
        }
    } else {
        GrainIndex::load(file, &header)?
    };

    let descriptor = read_descriptor(file, &header)?;
    Ok(Metadata {
        header,
        index,
        descriptor,
        scan,
        file_sectors: sectors_for_bytes(file_len),
    })
}

/// Parse the embedded descriptor; an unparsable one is ignored
fn read_descriptor(file: &mut File, header: &SparseExtentHeader) -> Result<Option<DiskDescriptor>> {
    if header.descriptor_offset == 0 || header.descriptor_size == 0 {
        return Ok(None);
    }
    if header.descriptor_size > MAX_DESCRIPTOR_SECTORS {
        tracing::warn!("Ignoring descriptor of {} sectors", header.descriptor_size);
        return Ok(None);
    }
    let bytes = read_sectors(file, header.descriptor_offset, header.descriptor_size)?;
    let text = String::from_utf8_lossy(&bytes);
    match DiskDescriptor::parse(&text) {
        Ok(descriptor) => Ok(Some(descriptor)),
        Err(e) => {
            tracing::warn!("Ignoring embedded descriptor: {}", e);
            Ok(None)
        }
    }
}
