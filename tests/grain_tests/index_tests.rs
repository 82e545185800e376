//! Tests for the grain directory/table manager
//!
//! These tests verify:
//! - Mirror-first allocation of tables and grains
//! - Recovery precedence between the primary index and its mirror
//! - Repair of the primary copy

use std::io::Cursor;

use vmdk_extent::format::header::FLAG_USE_REDUNDANT;
use vmdk_extent::format::SparseExtentHeader;
use vmdk_extent::grain::{GrainGeometry, GrainIndex, GrainState, SectorAllocator};
use vmdk_extent::VmdkError;

// =============================================================================
// Helper Functions
// =============================================================================

const CAPACITY: u64 = 256;
const RGD: u64 = 1;
const GD: u64 = 2;

/// 8-sector grains, 4 entries per table: 8 tables of one sector each
fn geometry() -> GrainGeometry {
    GrainGeometry::new(8, 4).unwrap()
}

fn header(unclean: bool) -> SparseExtentHeader {
    let mut header = SparseExtentHeader::new(CAPACITY, 8, 4);
    header.flags |= FLAG_USE_REDUNDANT;
    header.rgd_offset = RGD;
    header.gd_offset = GD;
    header.over_head = 3;
    header.unclean_shutdown = unclean;
    header
}

/// Image with one grain at LBA 40 stored at sector 20
///
/// Returns the image and the sector of the primary grain table.
fn image_with_one_grain() -> (Cursor<Vec<u8>>, u64) {
    let mut io = Cursor::new(vec![0u8; 32 * 512]);
    let mut index = GrainIndex::new(geometry(), CAPACITY, GD, Some(RGD)).unwrap();
    let mut allocator = SectorAllocator::new(3);

    let addr = index.geometry().locate(40);
    index.ensure_table(&mut io, addr.table_index, &mut allocator).unwrap();
    index.commit_grain(&mut io, &addr, 20).unwrap();

    let primary_table = index.directory()[addr.table_index as usize] as u64;
    (io, primary_table)
}

fn zero_entry(io: &mut Cursor<Vec<u8>>, table_sector: u64, entry: usize) {
    let offset = table_sector as usize * 512 + entry * 4;
    io.get_mut()[offset..offset + 4].copy_from_slice(&[0; 4]);
}

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_reload_sees_committed_grain() {
    let (mut io, primary_table) = image_with_one_grain();
    // Mirror table first, then primary
    assert_eq!(primary_table, 4);

    let index = GrainIndex::load(&mut io, &header(false)).unwrap();
    assert_eq!(index.lookup(40), GrainState::Allocated(20));
    assert_eq!(index.lookup(47), GrainState::Allocated(20));
    assert_eq!(index.lookup(48), GrainState::Unallocated);
    assert_eq!(index.allocated_grains(), vec![(40, 20)]);
    assert_eq!(index.allocated_tables(), vec![1]);
    assert_eq!(index.redundant_directory()[1], 3);
    assert!(!index.needs_repair());
}

#[test]
fn test_set_entry_rejects_duplicates() {
    let mut index = GrainIndex::new(geometry(), CAPACITY, 0, None).unwrap();
    let addr = index.geometry().locate(64);

    index.set_entry(&addr, 7).unwrap();
    let err = index.set_entry(&addr, 9).unwrap_err();
    assert!(matches!(err, VmdkError::ProtocolViolation(_)));
    assert_eq!(index.lookup(64), GrainState::Allocated(7));

    let table = index.table_bytes(addr.table_index).unwrap();
    assert_eq!(&table[0..4], &7u32.to_le_bytes());
    assert!(index.table_bytes(0).is_none());
}

#[test]
fn test_directory_bytes_follow_table_locations() {
    let mut index = GrainIndex::new(geometry(), CAPACITY, 0, None).unwrap();
    index.set_table_location(2, 99).unwrap();
    index.set_redundant_table_location(2, 77).unwrap();

    let gd = index.directory_bytes();
    let rgd = index.redundant_directory_bytes();
    assert_eq!(gd.len(), 32);
    assert_eq!(&gd[8..12], &99u32.to_le_bytes());
    assert_eq!(&rgd[8..12], &77u32.to_le_bytes());
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_unclean_extent_prefers_mirror() {
    let (mut io, primary_table) = image_with_one_grain();
    zero_entry(&mut io, primary_table, 1);

    let index = GrainIndex::load(&mut io, &header(true)).unwrap();
    assert_eq!(index.lookup(40), GrainState::Allocated(20));
    assert_eq!(index.recovery().repaired_tables, 1);
    assert_eq!(index.recovery().repaired_entries, 1);
    assert!(index.needs_repair());
}

#[test]
fn test_clean_extent_trusts_primary() {
    let (mut io, primary_table) = image_with_one_grain();
    zero_entry(&mut io, primary_table, 1);

    let index = GrainIndex::load(&mut io, &header(false)).unwrap();
    assert_eq!(index.lookup(40), GrainState::Unallocated);
    assert_eq!(index.recovery().repaired_tables, 0);
}

#[test]
fn test_repair_rewrites_primary_table() {
    let (mut io, primary_table) = image_with_one_grain();
    zero_entry(&mut io, primary_table, 1);

    let mut index = GrainIndex::load(&mut io, &header(true)).unwrap();
    let mut allocator = SectorAllocator::new(21);
    index.repair(&mut io, &mut allocator).unwrap();
    assert!(!index.needs_repair());
    assert_eq!(allocator.next_free(), 21);

    let index = GrainIndex::load(&mut io, &header(false)).unwrap();
    assert_eq!(index.lookup(40), GrainState::Allocated(20));
}

#[test]
fn test_missing_primary_directory_falls_back_to_mirror() {
    let (mut io, _) = image_with_one_grain();
    let mut header = header(false);
    header.gd_offset = 0;

    let mut index = GrainIndex::load(&mut io, &header).unwrap();
    assert_eq!(index.lookup(40), GrainState::Allocated(20));
    assert!(index.needs_repair());

    // A fresh directory and table are appended
    let mut allocator = SectorAllocator::new(21);
    index.repair(&mut io, &mut allocator).unwrap();
    assert_eq!(index.gd_offset(), 21);
    assert_eq!(index.directory()[1], 22);
    assert_eq!(allocator.next_free(), 23);

    header.gd_offset = 21;
    let index = GrainIndex::load(&mut io, &header).unwrap();
    assert_eq!(index.lookup(40), GrainState::Allocated(20));
}

#[test]
fn test_no_directory_at_all_is_invalid() {
    let mut io = Cursor::new(vec![0u8; 4096]);
    let header = SparseExtentHeader::new(CAPACITY, 8, 4);
    let err = GrainIndex::load(&mut io, &header).unwrap_err();
    assert!(matches!(err, VmdkError::InvalidFormat(_)));
}
