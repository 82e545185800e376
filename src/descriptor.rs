//! Disk descriptor
//!
//! Generates the text descriptor embedded in (or accompanying) an extent,
//! and parses it back so the content ID can be refreshed in place.
//!
//! The random source is always supplied by the caller, so tests can use a
//! seeded generator and check the exact output.

use std::fmt::Write as _;
use std::str::FromStr;

use rand::RngCore;
use serde::Serialize;

use crate::error::{Result, VmdkError};

/// Parent content ID of a base (non-snapshot) disk
pub const BASE_PARENT_CID: u32 = 0xffff_ffff;

const HEADS: u64 = 255;
const SECTORS_PER_TRACK: u64 = 63;
const MAX_CYLINDERS: u64 = 65535;

/// Cylinder count reported in `ddb.geometry.cylinders`
pub fn cylinders(capacity: u64) -> u64 {
    if capacity > MAX_CYLINDERS * HEADS * SECTORS_PER_TRACK {
        MAX_CYLINDERS
    } else {
        capacity.div_ceil(HEADS * SECTORS_PER_TRACK)
    }
}

/// `createType` of the disk the extent belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CreateType {
    StreamOptimized,
    MonolithicSparse,
    MonolithicFlat,
}

impl CreateType {
    pub fn as_str(self) -> &'static str {
        match self {
            CreateType::StreamOptimized => "streamOptimized",
            CreateType::MonolithicSparse => "monolithicSparse",
            CreateType::MonolithicFlat => "monolithicFlat",
        }
    }

    /// Extent type keyword used on the extent line
    fn extent_keyword(self) -> &'static str {
        match self {
            CreateType::MonolithicFlat => "FLAT",
            _ => "SPARSE",
        }
    }
}

impl FromStr for CreateType {
    type Err = VmdkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "streamOptimized" => Ok(CreateType::StreamOptimized),
            "monolithicSparse" => Ok(CreateType::MonolithicSparse),
            "monolithicFlat" => Ok(CreateType::MonolithicFlat),
            other => Err(VmdkError::UnsupportedFeature(format!(
                "createType \"{}\"",
                other
            ))),
        }
    }
}

/// Parsed or generated descriptor of a single-extent disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescriptor {
    pub cid: u32,
    pub parent_cid: u32,
    pub create_type: CreateType,
    /// Extent size in sectors
    pub capacity: u64,
    /// Extent file name, relative to the descriptor
    pub file_name: String,
    /// Random words preceding the CID in `ddb.longContentID`
    pub long_content_id: [u32; 3],
}

impl DiskDescriptor {
    /// Pick a fresh content ID; must be called whenever extent content changes
    pub fn refresh_content_id<R: RngCore + ?Sized>(&mut self, rng: &mut R) {
        let previous = self.cid;
        self.cid = rng.next_u32();
        self.long_content_id = [rng.next_u32(), rng.next_u32(), rng.next_u32()];
        tracing::debug!("Content ID changed {:08x} -> {:08x}", previous, self.cid);
    }

    pub fn cylinders(&self) -> u64 {
        cylinders(self.capacity)
    }

    /// Render the descriptor text
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512);
        // Writing to a String cannot fail
        let _ = write!(
            out,
            "# Disk DescriptorFile\n\
             version=1\n\
             encoding=\"UTF-8\"\n\
             CID={:08x}\n\
             parentCID={:08x}\n\
             createType=\"{}\"\n\
             \n\
             # Extent description\n",
            self.cid,
            self.parent_cid,
            self.create_type.as_str()
        );
        match self.create_type {
            CreateType::MonolithicFlat => {
                let _ = writeln!(
                    out,
                    "RW {} {} \"{}\" 0",
                    self.capacity,
                    self.create_type.extent_keyword(),
                    self.file_name
                );
            }
            _ => {
                let _ = writeln!(
                    out,
                    "RW {} {} \"{}\"",
                    self.capacity,
                    self.create_type.extent_keyword(),
                    self.file_name
                );
            }
        }
        let [a, b, c] = self.long_content_id;
        let _ = write!(
            out,
            "\n\
             # The Disk Data Base\n\
             #DDB\n\
             \n\
             ddb.longContentID = \"{:08x}{:08x}{:08x}{:08x}\"\n\
             ddb.toolsVersion = \"2147483647\"\n\
             ddb.virtualHWVersion = \"4\"\n\
             ddb.geometry.cylinders = \"{}\"\n\
             ddb.geometry.heads = \"{}\"\n\
             ddb.geometry.sectors = \"{}\"\n\
             ddb.adapterType = \"lsilogic\"\n",
            a,
            b,
            c,
            self.cid,
            self.cylinders(),
            HEADS,
            SECTORS_PER_TRACK
        );
        out
    }

    /// Parse descriptor text (trailing NUL padding is ignored)
    pub fn parse(text: &str) -> Result<Self> {
        let mut cid = None;
        let mut parent_cid = BASE_PARENT_CID;
        let mut create_type = None;
        let mut extent = None;
        let mut long_content_id = [0u32; 3];

        for line in text.trim_end_matches('\0').lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim().trim_matches('"');
                match key.trim() {
                    "CID" => cid = Some(parse_hex(value, "CID")?),
                    "parentCID" => parent_cid = parse_hex(value, "parentCID")?,
                    "createType" => create_type = Some(value.parse::<CreateType>()?),
                    "ddb.longContentID" if value.len() >= 24 => {
                        for (i, word) in long_content_id.iter_mut().enumerate() {
                            let digits = value.get(i * 8..i * 8 + 8).ok_or_else(|| {
                                VmdkError::InvalidFormat(format!(
                                    "invalid longContentID \"{}\"",
                                    value
                                ))
                            })?;
                            *word = parse_hex(digits, "longContentID")?;
                        }
                    }
                    _ => {}
                }
            } else if extent.is_none() {
                extent = parse_extent_line(line);
            }
        }

        let (capacity, file_name) = extent.ok_or_else(|| {
            VmdkError::InvalidFormat("descriptor has no extent line".to_string())
        })?;
        Ok(Self {
            cid: cid
                .ok_or_else(|| VmdkError::InvalidFormat("descriptor has no CID".to_string()))?,
            parent_cid,
            create_type: create_type.ok_or_else(|| {
                VmdkError::InvalidFormat("descriptor has no createType".to_string())
            })?,
            capacity,
            file_name,
            long_content_id,
        })
    }
}

/// Builder for a fresh descriptor
pub struct DescriptorBuilder {
    file_name: String,
    capacity: u64,
    create_type: CreateType,
    parent_cid: u32,
}

impl DescriptorBuilder {
    /// Descriptor for `file_name` holding `capacity` sectors
    pub fn new(file_name: impl Into<String>, capacity: u64) -> Self {
        Self {
            file_name: file_name.into(),
            capacity,
            create_type: CreateType::StreamOptimized,
            parent_cid: BASE_PARENT_CID,
        }
    }

    pub fn create_type(mut self, create_type: CreateType) -> Self {
        self.create_type = create_type;
        self
    }

    pub fn parent_cid(mut self, parent_cid: u32) -> Self {
        self.parent_cid = parent_cid;
        self
    }

    /// Draw the content IDs from `rng`
    pub fn build<R: RngCore + ?Sized>(self, rng: &mut R) -> DiskDescriptor {
        let cid = rng.next_u32();
        let long_content_id = [rng.next_u32(), rng.next_u32(), rng.next_u32()];
        DiskDescriptor {
            cid,
            parent_cid: self.parent_cid,
            create_type: self.create_type,
            capacity: self.capacity,
            file_name: self.file_name,
            long_content_id,
        }
    }
}

fn parse_hex(value: &str, what: &str) -> Result<u32> {
    u32::from_str_radix(value, 16)
        .map_err(|_| VmdkError::InvalidFormat(format!("invalid {} \"{}\"", what, value)))
}

/// `RW <sectors> <TYPE> "<file>" [offset]`
fn parse_extent_line(line: &str) -> Option<(u64, String)> {
    let mut parts = line.splitn(4, char::is_whitespace);
    let access = parts.next()?;
    if !matches!(access, "RW" | "RDONLY" | "NOACCESS") {
        return None;
    }
    let capacity = parts.next()?.parse().ok()?;
    let _kind = parts.next()?;
    let rest = parts.next()?.trim();
    let name = rest.strip_prefix('"')?;
    let end = name.find('"')?;
    Some((capacity, name[..end].to_string()))
}
