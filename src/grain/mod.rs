//! Grain Module
//!
//! Two-level address translation from virtual sectors to grains.
//!
//! ```text
//!   virtual sector S
//!         │
//!         ▼
//!  ┌──────────────┐  S / (grainSize*numGTEsPerGT)
//!  │ Grain Dir    │──────────────────────────────┐
//!  └──────────────┘                              ▼
//!                                       ┌──────────────┐ (S % spt) / grainSize
//!                                       │ Grain Table  │──────────────┐
//!                                       └──────────────┘              ▼
//!                                                              ┌────────────┐
//!                                                              │   Grain    │ S % grainSize
//!                                                              └────────────┘
//! ```

mod address;
mod index;
pub mod record;

pub use address::{GrainAddress, GrainGeometry};
pub use index::{GrainIndex, GrainState, RecoveryReport, SectorAllocator};
