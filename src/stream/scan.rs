//! Marker scan
//!
//! Forward walk over the records of a stream-optimized extent. Used to
//! rebuild the grain index of a stream that never got its footer (the
//! writer died, or the file was truncated in transit).

use std::io::{Read, Seek, SeekFrom};

use serde::Serialize;

use crate::error::{Result, VmdkError};
use crate::format::{Marker, MarkerType, SparseExtentHeader, SECTOR_SIZE};
use crate::grain::{GrainGeometry, GrainIndex};
use crate::sector::read_sectors;

/// Iterator over `(sector, marker)` pairs in stream order
pub struct MarkerIterator<'a, R> {
    io: &'a mut R,
    /// Sector of the next record
    current_sector: u64,
    /// Stop before this sector (end of file)
    end_sector: u64,
    done: bool,
}

impl<'a, R: Read + Seek> MarkerIterator<'a, R> {
    /// Iterate from `start_sector` to the end of the file
    pub fn new(io: &'a mut R, start_sector: u64) -> Result<Self> {
        let end_sector = io.seek(SeekFrom::End(0))? / SECTOR_SIZE;
        Ok(Self {
            io,
            current_sector: start_sector,
            end_sector,
            done: false,
        })
    }

    /// Sector the iterator will read next
    pub fn position(&self) -> u64 {
        self.current_sector
    }
}

impl<'a, R: Read + Seek> Iterator for MarkerIterator<'a, R> {
    type Item = Result<(u64, Marker)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.current_sector >= self.end_sector {
            return None;
        }

        let sector = self.current_sector;
        let marker = match read_sectors(&mut *self.io, sector, 1).and_then(|b| Marker::decode(&b)) {
            Ok(marker) => marker,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let next = sector + marker.span_sectors();
        if next > self.end_sector {
            // Record runs past the end of the file
            self.done = true;
            return Some(Err(VmdkError::InvalidFormat(format!(
                "record at sector {} is truncated",
                sector
            ))));
        }
        if let Marker::Metadata(m) = marker {
            if m.kind == MarkerType::EndOfStream {
                self.done = true;
            }
        }
        self.current_sector = next;
        Some(Ok((sector, marker)))
    }
}

/// Statistics of a forward scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Grain markers adopted into the index
    pub grains: u64,
    /// Grain markers ignored (misaligned, out of range or duplicated)
    pub skipped: u64,
    /// The scan ended on an end-of-stream marker
    pub reached_end_of_stream: bool,
}

/// Rebuild the grain index from the embedded LBAs of every grain marker
///
/// Scanning stops at the end-of-stream marker, at the end of the file, or at
/// the first record that cannot be decoded; grains seen up to that point are
/// kept.
pub fn rebuild_index<R: Read + Seek>(
    io: &mut R,
    header: &SparseExtentHeader,
) -> Result<(GrainIndex, ScanReport)> {
    if !header.has_embedded_lba() {
        return Err(VmdkError::UnsupportedFeature(
            "marker scan needs embedded LBAs".to_string(),
        ));
    }
    let geometry = GrainGeometry::from_header(header)?;
    let mut index = GrainIndex::new(geometry, header.capacity, 0, None)?;
    let mut report = ScanReport::default();

    let start = header.over_head.max(1);
    for item in MarkerIterator::new(io, start)? {
        let (sector, marker) = match item {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Marker scan stopped: {}", e);
                break;
            }
        };
        match marker {
            Marker::Grain(grain) => {
                if grain.lba % geometry.grain_size() != 0 || grain.lba >= header.capacity {
                    tracing::warn!(
                        "Skipping grain marker at sector {} with LBA {}",
                        sector,
                        grain.lba
                    );
                    report.skipped += 1;
                    continue;
                }
                let addr = geometry.locate(grain.lba);
                match index.set_entry(&addr, sector) {
                    Ok(()) => report.grains += 1,
                    Err(e) => {
                        tracing::warn!("Skipping grain marker at sector {}: {}", sector, e);
                        report.skipped += 1;
                    }
                }
            }
            Marker::Metadata(m) if m.kind == MarkerType::EndOfStream => {
                report.reached_end_of_stream = true;
            }
            Marker::Metadata(_) => {}
        }
    }

    tracing::info!(
        "Rebuilt grain index by scan: {} grains, {} skipped",
        report.grains,
        report.skipped
    );
    Ok((index, report))
}
