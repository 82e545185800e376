//! On-Disk Format Module
//!
//! Bit-exact encoders/decoders for the structures that live inside a sparse
//! or stream-optimized extent.
//!
//! ## Sparse Extent Layout
//! ```text
//! ┌──────────────────────────────────────────────┐ sector 0
//! │ Header (512 bytes, magic "KDMV")             │
//! ├──────────────────────────────────────────────┤ descriptorOffset
//! │ Embedded descriptor (text, zero padded)      │
//! ├──────────────────────────────────────────────┤ rgdOffset
//! │ Redundant grain directory                    │
//! ├──────────────────────────────────────────────┤ gdOffset
//! │ Grain directory                              │
//! ├──────────────────────────────────────────────┤ overHead
//! │ Grains and grain tables (appended on demand) │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Stream-Optimized Layout
//! ```text
//! ┌────────┬────────────┬─────────────────────────────────────┐
//! │ Header │ Descriptor │ [Grain][Grain]..[GT marker][GT]..   │
//! ├────────┴────────────┴─────────────────────────────────────┤
//! │ [GD marker][GD] [RGT..][RGD] [Footer marker][Footer] [EOS]│
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod header;
pub mod marker;

pub use codec::SECTOR_SIZE;
pub use header::{CompressAlgorithm, HeaderSignature, SparseExtentHeader, HEADER_SIZE};
pub use marker::{GrainMarker, Marker, MarkerType, MetadataMarker, GRAIN_MARKER_SIZE};
