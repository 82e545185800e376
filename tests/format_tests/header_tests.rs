//! Tests for the sparse extent header
//!
//! These tests verify:
//! - Serialize/validate round trip for sparse and stream-optimized headers
//! - Every rejection rule of `validate`
//! - Permanent vs temporary signature detection

use vmdk_extent::format::header::{
    FLAG_COMPRESSED, FLAG_EMBEDDED_LBA, FLAG_USE_REDUNDANT, GD_AT_END, MAGIC_NUMBER,
    TEMPORARY_MAGIC_NUMBER,
};
use vmdk_extent::format::{CompressAlgorithm, HeaderSignature, SparseExtentHeader, HEADER_SIZE};
use vmdk_extent::VmdkError;

// =============================================================================
// Helper Functions
// =============================================================================

fn sample_header() -> SparseExtentHeader {
    let mut header = SparseExtentHeader::new(100_000_000, 128, 512);
    header.flags |= FLAG_USE_REDUNDANT;
    header.descriptor_offset = 1;
    header.descriptor_size = 20;
    header.rgd_offset = 21;
    header.gd_offset = 6128;
    header.over_head = 12288;
    header
}

fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_sparse_header_round_trip() {
    let header = sample_header();
    let bytes = header.serialize(false);
    assert_eq!(bytes.len(), HEADER_SIZE);
    assert_eq!(SparseExtentHeader::validate(&bytes).unwrap(), header);
}

#[test]
fn test_stream_optimized_header_round_trip() {
    let mut header = SparseExtentHeader::new_stream_optimized(2048, 128, 512);
    header.unclean_shutdown = true;
    let parsed = SparseExtentHeader::validate(&header.serialize(false)).unwrap();

    assert_eq!(parsed, header);
    assert_eq!(parsed.version, 3);
    assert!(parsed.is_compressed());
    assert!(parsed.has_embedded_lba());
    assert!(parsed.gd_at_end());
    assert_eq!(parsed.gd_offset, GD_AT_END);
    assert_eq!(parsed.compress_algorithm, CompressAlgorithm::Deflate);
}

#[test]
fn test_temporary_header_validates_and_is_detected() {
    let header = sample_header();
    let bytes = header.serialize(true);
    assert_eq!(HeaderSignature::detect(&bytes), Some(HeaderSignature::Temporary));
    assert_eq!(SparseExtentHeader::validate(&bytes).unwrap(), header);

    let bytes = header.serialize(false);
    assert_eq!(HeaderSignature::detect(&bytes), Some(HeaderSignature::Permanent));
    assert_eq!(MAGIC_NUMBER ^ 0x2020_2020, TEMPORARY_MAGIC_NUMBER);
}

#[test]
fn test_detect_needs_four_bytes() {
    assert_eq!(HeaderSignature::detect(b"KDM"), None);
    assert_eq!(HeaderSignature::detect(b"KDMV"), Some(HeaderSignature::Permanent));
    assert_eq!(HeaderSignature::detect(&[0u8; 512]), None);
}

// =============================================================================
// Rejection Tests
// =============================================================================

#[test]
fn test_rejects_short_buffer() {
    let bytes = sample_header().serialize(false);
    let err = SparseExtentHeader::validate(&bytes[..100]).unwrap_err();
    assert!(matches!(err, VmdkError::InvalidFormat(_)));
}

#[test]
fn test_rejects_bad_magic() {
    let mut bytes = sample_header().serialize(false).to_vec();
    bytes[0..4].copy_from_slice(b"VMDK");
    let err = SparseExtentHeader::validate(&bytes).unwrap_err();
    assert!(matches!(err, VmdkError::InvalidFormat(_)));
}

#[test]
fn test_rejects_future_version() {
    let mut bytes = sample_header().serialize(false).to_vec();
    put_u32(&mut bytes, 4, 4);
    let err = SparseExtentHeader::validate(&bytes).unwrap_err();
    assert!(matches!(err, VmdkError::InvalidFormat(_)));
}

#[test]
fn test_rejects_unknown_incompatible_flag() {
    let mut bytes = sample_header().serialize(false).to_vec();
    let flags = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    put_u32(&mut bytes, 8, flags | (1 << 20));
    let err = SparseExtentHeader::validate(&bytes).unwrap_err();
    assert!(matches!(err, VmdkError::InvalidFormat(_)));
}

#[test]
fn test_accepts_unknown_compatible_flag() {
    let mut bytes = sample_header().serialize(false).to_vec();
    let flags = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    put_u32(&mut bytes, 8, flags | (1 << 9));
    assert!(SparseExtentHeader::validate(&bytes).is_ok());
}

#[test]
fn test_rejects_mangled_newline_detector() {
    let mut bytes = sample_header().serialize(false).to_vec();
    // What a text-mode transfer does to "\r\n"
    bytes[75] = b'\n';
    let err = SparseExtentHeader::validate(&bytes).unwrap_err();
    assert!(matches!(err, VmdkError::InvalidFormat(_)));
}

#[test]
fn test_rejects_embedded_lba_without_compression() {
    let mut header = sample_header();
    header.flags |= FLAG_EMBEDDED_LBA;
    let err = SparseExtentHeader::validate(&header.serialize(false)).unwrap_err();
    assert!(matches!(err, VmdkError::UnsupportedFeature(_)));
}

#[test]
fn test_rejects_unknown_compression_algorithm() {
    let mut bytes = SparseExtentHeader::new_stream_optimized(2048, 128, 512)
        .serialize(false)
        .to_vec();
    bytes[77..79].copy_from_slice(&7u16.to_le_bytes());
    let err = SparseExtentHeader::validate(&bytes).unwrap_err();
    assert!(matches!(err, VmdkError::UnsupportedFeature(_)));
}

#[test]
fn test_rejects_compressed_flag_without_algorithm() {
    let mut header = sample_header();
    header.flags |= FLAG_COMPRESSED;
    let err = SparseExtentHeader::validate(&header.serialize(false)).unwrap_err();
    assert!(matches!(err, VmdkError::UnsupportedFeature(_)));
}
