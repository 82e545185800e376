//! Stream-Optimized Writer
//!
//! Append-only writer for compressed, marker-delimited extents.
//!
//! ## State Machine
//! ```text
//!   Opening ──► Streaming ──► Finalizing ──► Closed
//!      │            │              │
//!      └────────────┴──────────────┴──────► Aborted
//! ```
//!
//! ## Write Protocol
//! 1. A provisional header (temporary magic, `gdOffset = GD_AT_END`) and the
//!    embedded descriptor are written, then zero padding up to `overHead`.
//! 2. Every non-zero grain is emitted as a grain marker + zlib payload, in
//!    strictly increasing LBA order. All-zero grains are not emitted.
//! 3. When the emitted LBA leaves a grain table, that table is dumped behind
//!    a grain-table marker.
//! 4. On close: last table, grain directory, mirror tables + redundant
//!    directory, footer (final header), end-of-stream marker. Only then is
//!    sector 0 rewritten with the permanent magic.
//!
//! Anything that breaks the protocol aborts the session; an aborted extent is
//! removed, or keeps its temporary magic so no reader will accept it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use rand::RngCore;

use crate::config::ExtentConfig;
use crate::descriptor::{CreateType, DescriptorBuilder};
use crate::error::{Result, VmdkError};
use crate::flat::{check_range, check_sector_multiple, resolve_seek};
use crate::format::codec::{encode_entries, is_zero, pad_to_sector, round_up, sectors_for_bytes};
use crate::format::header::FLAG_USE_REDUNDANT;
use crate::format::{MarkerType, MetadataMarker, SparseExtentHeader, SECTOR_SIZE};
use crate::grain::record::encode_grain_record;
use crate::grain::{GrainGeometry, GrainIndex};

use super::compress::{CompressedGrain, Compressor};

/// Lifecycle of a write session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Opening,
    Streaming,
    Finalizing,
    Closed,
    Aborted,
}

/// Grain being assembled from sequential `write_at` calls
struct PendingGrain {
    lba: u64,
    data: Vec<u8>,
}

/// Writer for one stream-optimized extent
pub struct StreamWriter {
    file: BufWriter<File>,
    path: PathBuf,
    config: ExtentConfig,
    /// Provisional header; also the template of the footer
    header: SparseExtentHeader,
    index: GrainIndex,
    state: WriterState,
    compressor: Compressor,
    /// Append cursor
    next_sector: u64,
    /// Lowest LBA the next grain may carry
    next_lba: u64,
    /// Table holding the grains emitted since the last table dump
    current_table: Option<u64>,
    pending: Option<PendingGrain>,
    grains_emitted: u64,
    position: u64,
}

impl StreamWriter {
    /// Create a stream-optimized extent of `capacity` bytes
    pub fn create(path: impl AsRef<Path>, capacity: u64, config: ExtentConfig) -> Result<Self> {
        Self::create_with_rng(path, capacity, config, &mut rand::rng())
    }

    /// Like [`StreamWriter::create`], drawing the descriptor's content IDs from `rng`
    pub fn create_with_rng<R: RngCore + ?Sized>(
        path: impl AsRef<Path>,
        capacity: u64,
        config: ExtentConfig,
        rng: &mut R,
    ) -> Result<Self> {
        // Step 1: Validate parameters
        config.validate_stream_optimized()?;
        check_sector_multiple(capacity)?;
        let path = path.as_ref().to_path_buf();
        let capacity_sectors = capacity / SECTOR_SIZE;

        // Step 2: Plan the layout
        let geometry = GrainGeometry::new(config.grain_size, config.num_gtes_per_gt)?;
        let mut header = SparseExtentHeader::new_stream_optimized(
            capacity_sectors,
            config.grain_size,
            config.num_gtes_per_gt,
        );
        if config.redundant {
            header.flags |= FLAG_USE_REDUNDANT;
        }
        let descriptor = if config.descriptor_sectors > 0 {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let text = DescriptorBuilder::new(file_name, capacity_sectors)
                .create_type(CreateType::StreamOptimized)
                .build(rng)
                .render();
            Some(embed_descriptor(&text, config.descriptor_sectors)?)
        } else {
            None
        };
        if descriptor.is_some() {
            header.descriptor_offset = 1;
            header.descriptor_size = config.descriptor_sectors;
        }
        header.over_head = round_up(1 + config.descriptor_sectors, config.grain_size);
        let index = GrainIndex::new(geometry, capacity_sectors, 0, None)?;

        // Step 3: Write the provisional header, descriptor and padding
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let compressor = Compressor::new(
            config.compression_level,
            config.compression_workers,
            config.queue_depth,
        )?;
        let mut writer = Self {
            file: BufWriter::new(file),
            path,
            config,
            header,
            index,
            state: WriterState::Opening,
            compressor,
            next_sector: 0,
            next_lba: 0,
            current_table: None,
            pending: None,
            grains_emitted: 0,
            position: 0,
        };
        if let Err(e) = writer.write_prologue(descriptor) {
            let _ = writer.abort_in_place();
            return Err(e);
        }
        writer.state = WriterState::Streaming;

        tracing::info!(
            "Created stream-optimized extent {:?} ({} sectors, grain {} sectors)",
            writer.path,
            capacity_sectors,
            writer.header.grain_size
        );
        Ok(writer)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.header.capacity_bytes()
    }

    /// Provisional header (gdOffset is `GD_AT_END`)
    pub fn header(&self) -> &SparseExtentHeader {
        &self.header
    }

    /// Non-zero grains written so far
    pub fn grains_emitted(&self) -> u64 {
        self.grains_emitted
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor; a later write behind the emitted grains still fails
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(self.position, self.capacity(), pos)?;
        Ok(self.position)
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Append one whole grain starting at virtual sector `lba`
    ///
    /// `lba` must be grain aligned and greater than every LBA appended
    /// before; anything else aborts the session. `data` holds at most one
    /// grain in whole sectors.
    pub fn append_grain(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        self.check_streaming()?;
        self.flush_pending()?;

        let grain_size = self.header.grain_size;
        check_range(lba.saturating_mul(SECTOR_SIZE), data.len(), self.capacity())?;
        if lba % grain_size != 0 {
            return self.fail(VmdkError::ProtocolViolation(format!(
                "LBA {} is not aligned to grain size {}",
                lba, grain_size
            )));
        }
        if lba < self.next_lba {
            return self.fail(VmdkError::ProtocolViolation(format!(
                "LBA {} appended after LBA {}",
                lba,
                self.next_lba - grain_size
            )));
        }
        if data.is_empty()
            || data.len() as u64 > grain_size * SECTOR_SIZE
            || data.len() as u64 % SECTOR_SIZE != 0
        {
            return self.fail(VmdkError::ProtocolViolation(format!(
                "grain payload of {} bytes",
                data.len()
            )));
        }

        self.submit(lba, data.to_vec())
    }

    /// Sequential write of `data` at byte `offset`
    ///
    /// Bytes are gathered into the current grain, which is emitted once a
    /// write moves past it. Writing into an already emitted grain aborts the
    /// session.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_streaming()?;
        check_range(offset, data.len(), self.capacity())?;

        let grain_size = self.header.grain_size;
        let grain_bytes = grain_size * SECTOR_SIZE;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let within = (pos % grain_bytes) as usize;
            let chunk = (grain_bytes as usize - within).min(data.len() - done);
            let lba = (pos / grain_bytes) * grain_size;

            match self.pending.as_ref().map(|p| p.lba) {
                Some(current) if current == lba => {}
                Some(current) if current > lba => {
                    return self.fail(VmdkError::ProtocolViolation(format!(
                        "write at byte {} lands before buffered grain {}",
                        pos, current
                    )));
                }
                _ => {
                    self.flush_pending()?;
                    if lba < self.next_lba {
                        return self.fail(VmdkError::ProtocolViolation(format!(
                            "write at byte {} lands in an emitted grain",
                            pos
                        )));
                    }
                    self.pending = Some(PendingGrain {
                        lba,
                        data: vec![0; grain_bytes as usize],
                    });
                }
            }
            if let Some(pending) = self.pending.as_mut() {
                pending.data[within..within + chunk].copy_from_slice(&data[done..done + chunk]);
            }
            done += chunk;
        }
        Ok(data.len())
    }

    /// Finalize the extent, keeping the handle; later writes are rejected
    /// with `ReadOnlyExtent`
    pub fn finish(&mut self) -> Result<()> {
        match self.state {
            WriterState::Closed => return Ok(()),
            WriterState::Streaming => {}
            _ => return self.check_streaming(),
        }
        self.state = WriterState::Finalizing;
        if let Err(e) = self.write_epilogue() {
            tracing::error!("Finalizing {:?} failed: {}", self.path, e);
            let _ = self.abort_in_place();
            return Err(e);
        }
        self.compressor.shutdown();
        self.state = WriterState::Closed;
        tracing::info!(
            "Closed stream-optimized extent {:?}: {} grains, {} sectors",
            self.path,
            self.grains_emitted,
            self.next_sector
        );
        Ok(())
    }

    /// Finalize and release the extent
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    /// Discard the extent
    pub fn abort(mut self) -> Result<()> {
        self.abort_in_place()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_streaming(&self) -> Result<()> {
        match self.state {
            WriterState::Streaming => Ok(()),
            WriterState::Closed => Err(VmdkError::ReadOnlyExtent),
            WriterState::Aborted => Err(VmdkError::ProtocolViolation(
                "write session was aborted".to_string(),
            )),
            other => Err(VmdkError::ProtocolViolation(format!(
                "writer is {:?}",
                other
            ))),
        }
    }

    /// Abort the session and hand back `err`
    fn fail<T>(&mut self, err: VmdkError) -> Result<T> {
        tracing::warn!("Aborting stream-optimized extent {:?}: {}", self.path, err);
        if let Err(e) = self.abort_in_place() {
            tracing::warn!("Abort of {:?} failed: {}", self.path, e);
        }
        Err(err)
    }

    fn abort_in_place(&mut self) -> Result<()> {
        if matches!(self.state, WriterState::Closed | WriterState::Aborted) {
            return Ok(());
        }
        self.state = WriterState::Aborted;
        self.compressor.shutdown();
        self.pending = None;
        // Sector 0 still carries the temporary magic at this point
        let _ = self.file.flush();
        if self.config.remove_on_abort {
            fs::remove_file(&self.path)?;
            tracing::info!("Removed aborted extent {:?}", self.path);
        } else {
            tracing::info!("Left aborted extent {:?} with temporary magic", self.path);
        }
        Ok(())
    }

    fn write_prologue(&mut self, descriptor: Option<BytesMut>) -> Result<()> {
        let header = self.header.serialize(true);
        self.append(&header)?;
        if let Some(descriptor) = descriptor {
            self.append(&descriptor)?;
        }
        let padding = self.header.over_head - self.next_sector;
        self.append(&vec![0u8; (padding * SECTOR_SIZE) as usize])?;
        Ok(())
    }

    fn write_epilogue(&mut self) -> Result<()> {
        // Step 1: Emit everything still buffered or being compressed
        self.flush_pending()?;
        for grain in self.compressor.finish()? {
            self.emit(grain)?;
        }
        if let Some(table) = self.current_table.take() {
            self.dump_table(table)?;
        }

        // Step 2: Grain directory
        let gd_bytes = self.index.directory_bytes();
        let gd_offset = self.append_metadata(MarkerType::GrainDirectory, gd_bytes)?;
        self.index.set_gd_offset(gd_offset);

        // Step 3: Mirror tables and redundant directory
        let mut rgd_offset = 0;
        if self.config.redundant {
            for table in self.index.allocated_tables() {
                if let Some(bytes) = self.index.table_bytes(table) {
                    let sector = self.append_metadata(MarkerType::GrainTable, bytes)?;
                    self.index.set_redundant_table_location(table, sector)?;
                }
            }
            let rgd_bytes = if self.index.redundant_directory().is_empty() {
                // No tables were emitted
                encode_entries(&vec![0; self.index.table_count() as usize])
            } else {
                self.index.redundant_directory_bytes()
            };
            rgd_offset = self.append_metadata(MarkerType::GrainDirectory, rgd_bytes)?;
            self.index.set_rgd_offset(Some(rgd_offset));
        }

        // Step 4: Footer and end of stream
        let mut footer = self.header.clone();
        footer.gd_offset = gd_offset;
        footer.rgd_offset = rgd_offset;
        let footer_bytes = BytesMut::from(&footer.serialize(false)[..]);
        self.append_metadata(MarkerType::Footer, footer_bytes)?;
        self.append(&MetadataMarker::end_of_stream().encode())?;

        // Step 5: Only now does sector 0 get the permanent magic
        self.file.flush()?;
        let header = self.header.serialize(false);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.flush()?;
        if self.config.sync_on_close {
            self.file.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            self.submit(pending.lba, pending.data)?;
        }
        Ok(())
    }

    fn submit(&mut self, lba: u64, data: Vec<u8>) -> Result<()> {
        self.next_lba = lba + self.header.grain_size;
        if is_zero(&data) {
            return Ok(());
        }
        // A lost grain would leave a hole in the stream
        let ready = match self.compressor.submit(lba, data) {
            Ok(ready) => ready,
            Err(e) => return self.fail(e),
        };
        for grain in ready {
            if let Err(e) = self.emit(grain) {
                return self.fail(e);
            }
        }
        Ok(())
    }

    fn emit(&mut self, grain: CompressedGrain) -> Result<()> {
        let addr = self.index.geometry().locate(grain.lba);
        match self.current_table {
            Some(table) if table != addr.table_index => self.dump_table(table)?,
            _ => {}
        }
        self.current_table = Some(addr.table_index);

        let sector = self.next_sector;
        self.append(&encode_grain_record(grain.lba, &grain.data))?;
        self.index.set_entry(&addr, sector)?;
        self.grains_emitted += 1;
        tracing::trace!("Grain LBA {} at sector {}", grain.lba, sector);

        if let Some(interval) = self.config.progress_interval {
            if self.grains_emitted % interval == 0 {
                let percent = (grain.lba + self.header.grain_size).min(self.header.capacity) * 100
                    / self.header.capacity.max(1);
                self.append(&MetadataMarker::new(MarkerType::Progress, percent).encode())?;
            }
        }
        Ok(())
    }

    fn dump_table(&mut self, table: u64) -> Result<()> {
        let Some(bytes) = self.index.table_bytes(table) else {
            return Ok(());
        };
        let sector = self.append_metadata(MarkerType::GrainTable, bytes)?;
        self.index.set_table_location(table, sector)?;
        tracing::debug!("Dumped grain table {} at sector {}", table, sector);
        Ok(())
    }

    /// Marker followed by its sector-padded payload; returns the payload sector
    fn append_metadata(&mut self, kind: MarkerType, mut payload: BytesMut) -> Result<u64> {
        pad_to_sector(&mut payload);
        let sectors = sectors_for_bytes(payload.len() as u64);
        self.append(&MetadataMarker::new(kind, sectors).encode())?;
        let start = self.next_sector;
        self.append(&payload)?;
        Ok(start)
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len() as u64 % SECTOR_SIZE, 0);
        self.file.write_all(bytes)?;
        self.next_sector += bytes.len() as u64 / SECTOR_SIZE;
        Ok(())
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !matches!(self.state, WriterState::Closed | WriterState::Aborted) {
            tracing::warn!("Stream writer for {:?} dropped before close", self.path);
            let _ = self.abort_in_place();
        }
    }
}

/// Descriptor text zero padded to exactly `sectors` sectors
pub(crate) fn embed_descriptor(text: &str, sectors: u64) -> Result<BytesMut> {
    let room = sectors * SECTOR_SIZE;
    if text.len() as u64 > room {
        return Err(VmdkError::Config(format!(
            "descriptor of {} bytes does not fit in {} sectors",
            text.len(),
            sectors
        )));
    }
    let mut buf = BytesMut::with_capacity(room as usize);
    buf.extend_from_slice(text.as_bytes());
    buf.resize(room as usize, 0);
    Ok(buf)
}
