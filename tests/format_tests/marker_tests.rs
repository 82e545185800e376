//! Tests for stream markers

use bytes::BytesMut;
use vmdk_extent::format::{GrainMarker, Marker, MarkerType, MetadataMarker, GRAIN_MARKER_SIZE};
use vmdk_extent::VmdkError;

#[test]
fn test_metadata_marker_layout() {
    let bytes = MetadataMarker::new(MarkerType::GrainTable, 4).encode();
    assert_eq!(bytes.len(), 512);
    assert_eq!(&bytes[0..8], &4u64.to_le_bytes());
    assert_eq!(&bytes[8..12], &0u32.to_le_bytes());
    assert_eq!(&bytes[12..16], &1u32.to_le_bytes());
    assert!(bytes[16..].iter().all(|&b| b == 0));
}

#[test]
fn test_marker_decode_distinguishes_grain_and_metadata() {
    let mut buf = BytesMut::new();
    GrainMarker { lba: 256, size: 77 }.encode_into(&mut buf);
    buf.resize(512, 0);
    assert_eq!(
        Marker::decode(&buf).unwrap(),
        Marker::Grain(GrainMarker { lba: 256, size: 77 })
    );

    let footer = MetadataMarker::new(MarkerType::Footer, 1).encode();
    let decoded = Marker::decode(&footer).unwrap();
    assert_eq!(decoded, Marker::Metadata(MetadataMarker::new(MarkerType::Footer, 1)));
    assert_eq!(decoded.span_sectors(), 2);
}

#[test]
fn test_progress_marker_has_no_payload() {
    let progress = MetadataMarker::new(MarkerType::Progress, 42);
    assert_eq!(progress.payload_sectors(), 0);
    assert_eq!(Marker::Metadata(progress).span_sectors(), 1);
}

#[test]
fn test_unknown_marker_type_is_invalid() {
    let mut bytes = MetadataMarker::new(MarkerType::GrainTable, 4).encode().to_vec();
    bytes[12..16].copy_from_slice(&9u32.to_le_bytes());
    assert!(matches!(
        Marker::decode(&bytes),
        Err(VmdkError::InvalidFormat(_))
    ));
}

#[test]
fn test_short_marker_is_invalid() {
    assert!(matches!(
        GrainMarker::decode(&[0u8; GRAIN_MARKER_SIZE - 1]),
        Err(VmdkError::InvalidFormat(_))
    ));
}
