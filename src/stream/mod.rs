//! Stream-Optimized Extents
//!
//! Writing goes through [`StreamWriter`]. Reading a finished stream is done
//! by [`crate::sparse::SparseExtent`], which uses [`locate_footer`] to find
//! the authoritative header and falls back to [`rebuild_index`] when the
//! footer is missing.

pub mod compress;
pub mod footer;
pub mod scan;
mod writer;

pub use compress::{CompressedGrain, Compressor};
pub use footer::locate_footer;
pub use scan::{rebuild_index, MarkerIterator, ScanReport};
pub use writer::{StreamWriter, WriterState};

pub(crate) use writer::embed_descriptor;
