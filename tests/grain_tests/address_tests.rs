//! Tests for virtual sector translation

use vmdk_extent::grain::{GrainAddress, GrainGeometry};
use vmdk_extent::VmdkError;

#[test]
fn test_locate_default_geometry() {
    let geometry = GrainGeometry::new(128, 512).unwrap();
    assert_eq!(geometry.sectors_per_table(), 65536);
    assert_eq!(
        geometry.locate(70000),
        GrainAddress {
            table_index: 1,
            entry_index: 34,
            grain_offset: 112,
        }
    );
    assert_eq!(geometry.grain_index(70000), 546);
}

#[test]
fn test_locate_inverts_for_every_sector_of_a_small_geometry() {
    let geometry = GrainGeometry::new(8, 4).unwrap();
    for sector in 0..200 {
        let addr = geometry.locate(sector);
        assert!(addr.entry_index < 4);
        assert!(addr.grain_offset < 8);
        assert_eq!(addr.to_sector(&geometry), sector);
        assert_eq!(addr.grain_start(&geometry), sector - sector % 8);
    }
}

#[test]
fn test_table_and_directory_sizes() {
    let geometry = GrainGeometry::new(128, 512).unwrap();
    // 100M sectors need 1526 tables, 6104 bytes of directory
    assert_eq!(geometry.table_count(100_000_000), 1526);
    assert_eq!(geometry.directory_sectors(100_000_000), 12);
    assert_eq!(geometry.table_sectors(), 4);
    assert_eq!(geometry.grain_bytes(), 65536);

    // A partial last table still counts
    assert_eq!(geometry.table_count(65537), 2);
    assert_eq!(geometry.table_count(0), 0);
}

#[test]
fn test_rejects_zero_geometry() {
    assert!(matches!(
        GrainGeometry::new(0, 512),
        Err(VmdkError::InvalidFormat(_))
    ));
    assert!(matches!(
        GrainGeometry::new(128, 0),
        Err(VmdkError::InvalidFormat(_))
    ));
}

#[test]
fn test_rejects_overflowing_geometry() {
    assert!(matches!(
        GrainGeometry::new(u64::MAX / 2, 512),
        Err(VmdkError::InvalidFormat(_))
    ));
}
