//! Footer locator
//!
//! A finalized stream-optimized extent ends with
//!
//! ```text
//! ... [Footer marker][Footer header][EOS] <zero padding>
//! ```
//!
//! The footer header is the authoritative copy: it carries the real grain
//! directory offsets, while the header at sector 0 says `GD_AT_END`.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{Result, VmdkError};
use crate::format::codec::is_zero;
use crate::format::{Marker, MarkerType, SparseExtentHeader, SECTOR_SIZE};
use crate::sector::read_sectors;

/// Trailing zero sectors tolerated after the end-of-stream marker
pub const MAX_TRAILING_SECTORS: u64 = 2048;

/// Find and decode the footer header, `None` when the stream has no footer
pub fn locate_footer<R: Read + Seek>(io: &mut R) -> Result<Option<SparseExtentHeader>> {
    let total = io.seek(SeekFrom::End(0))? / SECTOR_SIZE;
    // marker + footer + EOS, plus at least the header in front
    if total < 4 {
        return Ok(None);
    }

    let window = total.min(MAX_TRAILING_SECTORS + 3);
    let first = total - window;
    let tail = read_sectors(io, first, window)?;
    let sector = |i: u64| {
        let start = ((i - first) * SECTOR_SIZE) as usize;
        &tail[start..start + SECTOR_SIZE as usize]
    };

    // Last non-zero sector must be the footer header; the zero sector after
    // it is the EOS marker
    let Some(footer) = (first..total).rev().find(|&i| !is_zero(sector(i))) else {
        tracing::debug!("No footer: last {} sectors are all zero", window);
        return Ok(None);
    };
    if footer + 1 >= total || footer < first + 1 || footer < 2 {
        tracing::debug!("No footer: last data sector {} has no EOS behind it", footer);
        return Ok(None);
    }

    match Marker::decode(sector(footer - 1)) {
        Ok(Marker::Metadata(m)) if m.kind == MarkerType::Footer => {}
        _ => {
            tracing::debug!("No footer marker in front of sector {}", footer);
            return Ok(None);
        }
    }

    let header = SparseExtentHeader::validate(sector(footer))?;
    if header.gd_at_end() {
        return Err(VmdkError::InvalidFormat(
            "footer header does not locate the grain directory".to_string(),
        ));
    }
    tracing::debug!(
        "Footer at sector {}: gd={} rgd={}",
        footer,
        header.gd_offset,
        header.rgd_offset
    );
    Ok(Some(header))
}
