//! # vmdk-extent
//!
//! On-disk engine for single VMDK extents:
//! - Flat extents (raw bytes, no translation)
//! - Sparse extents with a two-level grain index and a redundant mirror
//! - Stream-optimized extents (append-only, zlib-compressed grains)
//! - Crash handling via the temporary magic and `uncleanShutdown`
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Extent Facade                          │
//! │          (DiskExtent: read_at / write_at / close)           │
//! └───────┬─────────────────────┬─────────────────────┬─────────┘
//!         │                     │                     │
//!         ▼                     ▼                     ▼
//!  ┌─────────────┐      ┌──────────────┐      ┌───────────────┐
//!  │    Flat     │      │    Sparse    │      │ Stream Writer │
//!  │ (raw file)  │      │ (read/write) │      │ (append-only) │
//!  └─────────────┘      └──────┬───────┘      └───────┬───────┘
//!                              │                      │
//!                              ▼                      ▼
//!                      ┌──────────────┐      ┌────────────────┐
//!                      │ Grain Index  │◄─────│ Compress Pool  │
//!                      │  (GD / GT)   │      │  (crossbeam)   │
//!                      └──────┬───────┘      └────────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │    Format    │
//!                      │ header/marker│
//!                      └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod format;
pub mod sector;
pub mod grain;
pub mod descriptor;
pub mod flat;
pub mod sparse;
pub mod stream;
pub mod extent;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{ConfigBuilder, ExtentConfig};
pub use descriptor::{CreateType, DescriptorBuilder, DiskDescriptor};
pub use error::{Result, VmdkError};
pub use extent::{DiskExtent, Extent, ExtentKind, StreamOptimizedExtent};
pub use flat::FlatExtent;
pub use format::{HeaderSignature, SparseExtentHeader};
pub use sparse::{ExtentInfo, SharedSparseReader, SparseExtent, VerifyReport};
pub use stream::{StreamWriter, WriterState};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of vmdk-extent
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
