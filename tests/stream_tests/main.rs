//! Tests for stream-optimized extents
//!
//! These tests verify:
//! - Write / close / read back through the footer
//! - Footer discovery behind trailing padding
//! - Index rebuild by marker scan for a stream without footer
//! - Protocol violations abort the session
//! - Pool and inline compression produce identical files

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;
use vmdk_extent::format::header::GD_AT_END;
use vmdk_extent::format::{HeaderSignature, Marker, MarkerType, SparseExtentHeader};
use vmdk_extent::grain::GrainState;
use vmdk_extent::stream::{locate_footer, MarkerIterator};
use vmdk_extent::{ExtentConfig, SparseExtent, StreamWriter, VmdkError, WriterState};

// =============================================================================
// Helper Functions
// =============================================================================

const GRAIN_BYTES: usize = 4096;
/// 64 grains in 16 tables
const CAPACITY: u64 = 64 * GRAIN_BYTES as u64;

fn builder() -> vmdk_extent::ConfigBuilder {
    ExtentConfig::builder()
        .grain_size(8)
        .num_gtes_per_gt(4)
        .compression_workers(0)
        .sync_on_close(false)
}

fn config() -> ExtentConfig {
    builder().build()
}

fn setup_stream() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("stream.vmdk");
    (temp_dir, path)
}

fn grain(seed: u8) -> Vec<u8> {
    (0..GRAIN_BYTES)
        .map(|i| ((i / 64) as u8).wrapping_add(seed))
        .collect()
}

/// Stream with grains at LBAs 0, 8, 40 and 256
fn write_sample_stream(path: &Path, config: ExtentConfig) {
    let mut writer = StreamWriter::create(path, CAPACITY, config).unwrap();
    for (lba, seed) in [(0u64, 1u8), (8, 2), (40, 3), (256, 4)] {
        writer.append_grain(lba, &grain(seed)).unwrap();
    }
    writer.close().unwrap();
}

fn expected_sample_disk() -> Vec<u8> {
    let mut disk = vec![0u8; CAPACITY as usize];
    for (lba, seed) in [(0usize, 1u8), (8, 2), (40, 3), (256, 4)] {
        let start = lba * 512;
        disk[start..start + GRAIN_BYTES].copy_from_slice(&grain(seed));
    }
    disk
}

fn read_all(extent: &mut SparseExtent) -> Vec<u8> {
    let mut buf = vec![0u8; extent.capacity() as usize];
    extent.read_at(0, &mut buf).unwrap();
    buf
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_write_close_read_back() {
    let (_temp, path) = setup_stream();
    write_sample_stream(&path, config());

    let mut extent = SparseExtent::open(&path).unwrap();
    assert!(extent.header().is_compressed());
    assert_ne!(extent.header().gd_offset, GD_AT_END);
    assert_eq!(read_all(&mut extent), expected_sample_disk());
    assert_eq!(extent.index().allocated_grain_count(), 4);
    assert!(extent.verify().unwrap().is_clean());
}

#[test]
fn test_sector_zero_keeps_gd_at_end() {
    let (_temp, path) = setup_stream();
    write_sample_stream(&path, config());

    let bytes = fs::read(&path).unwrap();
    assert_eq!(HeaderSignature::detect(&bytes), Some(HeaderSignature::Permanent));
    let header = SparseExtentHeader::validate(&bytes[..512]).unwrap();
    assert!(header.gd_at_end());

    let footer = locate_footer(&mut File::open(&path).unwrap())
        .unwrap()
        .unwrap();
    assert!(!footer.gd_at_end());
    assert_ne!(footer.rgd_offset, 0);
}

#[test]
fn test_sequential_write_at_across_grains() {
    let (_temp, path) = setup_stream();
    let mut data = vec![0u8; 40_000];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    let mut writer = StreamWriter::create(&path, CAPACITY, config()).unwrap();
    for chunk in data.chunks(1000) {
        let position = writer.position();
        writer.write_at(position, chunk).unwrap();
        writer
            .seek(std::io::SeekFrom::Current(chunk.len() as i64))
            .unwrap();
    }
    writer.close().unwrap();

    let mut extent = SparseExtent::open(&path).unwrap();
    let all = read_all(&mut extent);
    assert_eq!(&all[..40_000], &data[..]);
    assert!(all[40_000..].iter().all(|&b| b == 0));
}

#[test]
fn test_empty_stream_reads_zeros() {
    let (_temp, path) = setup_stream();
    StreamWriter::create(&path, CAPACITY, config())
        .unwrap()
        .close()
        .unwrap();

    let mut extent = SparseExtent::open(&path).unwrap();
    assert_eq!(extent.index().allocated_grain_count(), 0);
    assert!(read_all(&mut extent).iter().all(|&b| b == 0));
}

#[test]
fn test_zero_grains_are_skipped() {
    let (_temp, path) = setup_stream();
    let mut writer = StreamWriter::create(&path, CAPACITY, config()).unwrap();
    writer.append_grain(0, &[0u8; GRAIN_BYTES]).unwrap();
    writer.append_grain(8, &grain(9)).unwrap();
    assert_eq!(writer.grains_emitted(), 1);
    writer.close().unwrap();

    let extent = SparseExtent::open(&path).unwrap();
    assert_eq!(extent.index().allocated_grain_count(), 1);
}

#[test]
fn test_short_final_grain_is_zero_padded() {
    let (_temp, path) = setup_stream();
    let mut writer = StreamWriter::create(&path, CAPACITY, config()).unwrap();
    writer.append_grain(16, &[7u8; 1024]).unwrap();
    writer.close().unwrap();

    let mut extent = SparseExtent::open(&path).unwrap();
    let mut buf = vec![0u8; GRAIN_BYTES];
    extent.read_at(16 * 512, &mut buf).unwrap();
    assert!(buf[..1024].iter().all(|&b| b == 7));
    assert!(buf[1024..].iter().all(|&b| b == 0));
}

// =============================================================================
// Footer and Scan Tests
// =============================================================================

#[test]
fn test_footer_found_behind_padding() {
    let (_temp, path) = setup_stream();
    write_sample_stream(&path, config());
    let len = fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len + 100 * 512)
        .unwrap();

    let mut extent = SparseExtent::open(&path).unwrap();
    assert!(extent.info().scan.is_none());
    assert_eq!(read_all(&mut extent), expected_sample_disk());
}

#[test]
fn test_truncated_stream_is_rebuilt_by_scan() {
    let (_temp, path) = setup_stream();
    write_sample_stream(&path, config());
    // Drop footer marker, footer and end-of-stream marker
    let len = fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 3 * 512)
        .unwrap();

    let mut extent = SparseExtent::open(&path).unwrap();
    let scan = extent.info().scan.unwrap();
    assert_eq!(scan.grains, 4);
    assert_eq!(scan.skipped, 0);
    assert!(!scan.reached_end_of_stream);
    assert_eq!(read_all(&mut extent), expected_sample_disk());
}

#[test]
fn test_progress_markers_are_emitted() {
    let (_temp, path) = setup_stream();
    let config = builder().progress_interval(Some(2)).build();
    let mut writer = StreamWriter::create(&path, CAPACITY, config).unwrap();
    let over_head = writer.header().over_head;
    for i in 0..5u64 {
        writer.append_grain(i * 8, &grain(i as u8 + 1)).unwrap();
    }
    writer.close().unwrap();

    let mut file = File::open(&path).unwrap();
    let markers: Vec<Marker> = MarkerIterator::new(&mut file, over_head)
        .unwrap()
        .map(|item| item.unwrap().1)
        .collect();
    let progress = markers
        .iter()
        .filter(|m| matches!(m, Marker::Metadata(meta) if meta.kind == MarkerType::Progress))
        .count();
    assert_eq!(progress, 2);
    assert!(matches!(
        markers.last(),
        Some(Marker::Metadata(meta)) if meta.kind == MarkerType::EndOfStream
    ));

    // Readers step over progress markers
    let mut extent = SparseExtent::open(&path).unwrap();
    let mut buf = vec![0u8; GRAIN_BYTES];
    extent.read_at(4 * GRAIN_BYTES as u64, &mut buf).unwrap();
    assert_eq!(buf, grain(5));
}

// =============================================================================
// Corrupt Grain Tests
// =============================================================================

#[test]
fn test_corrupt_grain_is_reported_per_grain() {
    let (_temp, path) = setup_stream();
    let mut writer = StreamWriter::create(&path, CAPACITY, config()).unwrap();
    for (lba, seed) in [(0u64, 1u8), (8, 2), (16, 3)] {
        writer.append_grain(lba, &grain(seed)).unwrap();
    }
    writer.close().unwrap();

    let sector = match SparseExtent::open(&path).unwrap().index().lookup(8) {
        GrainState::Allocated(sector) => sector,
        GrainState::Unallocated => panic!("grain 8 was not written"),
    };
    // Clobber the deflate payload behind the 12-byte grain marker
    let mut bytes = fs::read(&path).unwrap();
    let start = sector as usize * 512 + 12;
    bytes[start..start + 32].fill(0xAB);
    fs::write(&path, &bytes).unwrap();

    let mut extent = SparseExtent::open(&path).unwrap();
    let mut buf = vec![0u8; GRAIN_BYTES];
    let err = extent.read_at(8 * 512, &mut buf).unwrap_err();
    assert!(matches!(err, VmdkError::CorruptGrain { lba: 8, .. }));
    assert!(err.is_recoverable());

    extent.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, grain(1));
    extent.read_at(16 * 512, &mut buf).unwrap();
    assert_eq!(buf, grain(3));

    let report = extent.verify().unwrap();
    assert_eq!(report.grains_checked, 3);
    assert_eq!(report.corrupt.len(), 1);
    assert_eq!(report.corrupt[0].lba, 8);
}

// =============================================================================
// Protocol Tests
// =============================================================================

#[test]
fn test_out_of_order_grain_aborts_and_removes() {
    let (_temp, path) = setup_stream();
    let mut writer = StreamWriter::create(&path, CAPACITY, config()).unwrap();
    writer.append_grain(16, &grain(1)).unwrap();

    let err = writer.append_grain(8, &grain(2)).unwrap_err();
    assert!(matches!(err, VmdkError::ProtocolViolation(_)));
    assert_eq!(writer.state(), WriterState::Aborted);
    assert!(!path.exists());

    let err = writer.append_grain(24, &grain(3)).unwrap_err();
    assert!(matches!(err, VmdkError::ProtocolViolation(_)));
}

#[test]
fn test_misaligned_grain_aborts() {
    let (_temp, path) = setup_stream();
    let mut writer = StreamWriter::create(&path, CAPACITY, config()).unwrap();
    let err = writer.append_grain(4, &grain(1)).unwrap_err();
    assert!(matches!(err, VmdkError::ProtocolViolation(_)));
    assert_eq!(writer.state(), WriterState::Aborted);
}

#[test]
fn test_out_of_range_grain_keeps_session() {
    let (_temp, path) = setup_stream();
    let mut writer = StreamWriter::create(&path, CAPACITY, config()).unwrap();
    let err = writer.append_grain(512, &grain(1)).unwrap_err();
    assert!(matches!(err, VmdkError::OutOfRange { .. }));
    assert_eq!(writer.state(), WriterState::Streaming);

    writer.append_grain(0, &grain(1)).unwrap();
    writer.close().unwrap();
    assert!(SparseExtent::open(&path).is_ok());
}

#[test]
fn test_write_behind_emitted_grain_aborts() {
    let (_temp, path) = setup_stream();
    let mut writer = StreamWriter::create(&path, CAPACITY, config()).unwrap();
    writer.write_at(8192, &[1u8; 100]).unwrap();
    writer.write_at(12288, &[2u8; 100]).unwrap();

    let err = writer.write_at(0, &[3u8; 100]).unwrap_err();
    assert!(matches!(err, VmdkError::ProtocolViolation(_)));
    assert!(!path.exists());
}

#[test]
fn test_write_after_finish_is_read_only() {
    let (_temp, path) = setup_stream();
    let mut writer = StreamWriter::create(&path, CAPACITY, config()).unwrap();
    writer.append_grain(0, &grain(1)).unwrap();
    writer.finish().unwrap();
    assert_eq!(writer.state(), WriterState::Closed);

    assert!(matches!(
        writer.append_grain(8, &grain(2)),
        Err(VmdkError::ReadOnlyExtent)
    ));
    assert!(matches!(
        writer.write_at(0, &[1u8; 10]),
        Err(VmdkError::ReadOnlyExtent)
    ));
    writer.close().unwrap();
    assert!(SparseExtent::open(&path).is_ok());
}

#[test]
fn test_dropped_writer_leaves_temporary_magic() {
    let (_temp, path) = setup_stream();
    let config = builder().remove_on_abort(false).build();
    let mut writer = StreamWriter::create(&path, CAPACITY, config).unwrap();
    writer.append_grain(0, &grain(1)).unwrap();
    drop(writer);

    let bytes = fs::read(&path).unwrap();
    assert_eq!(HeaderSignature::detect(&bytes), Some(HeaderSignature::Temporary));
    assert!(matches!(
        SparseExtent::open(&path),
        Err(VmdkError::InvalidFormat(_))
    ));
}

#[test]
fn test_stream_cannot_be_opened_for_write() {
    let (_temp, path) = setup_stream();
    write_sample_stream(&path, config());
    assert!(matches!(
        SparseExtent::open_for_write(&path),
        Err(VmdkError::ReadOnlyExtent)
    ));
}

#[test]
fn test_rejects_non_power_of_two_grain() {
    let (_temp, path) = setup_stream();
    let config = builder().grain_size(12).build();
    assert!(matches!(
        StreamWriter::create(&path, CAPACITY, config),
        Err(VmdkError::Config(_))
    ));
}

// =============================================================================
// Compression Pool Tests
// =============================================================================

#[test]
fn test_pool_and_inline_produce_identical_files() {
    let inline_dir = TempDir::new().unwrap();
    let pool_dir = TempDir::new().unwrap();
    let inline_path = inline_dir.path().join("same.vmdk");
    let pool_path = pool_dir.path().join("same.vmdk");

    let mut inline = StreamWriter::create_with_rng(
        &inline_path,
        CAPACITY,
        config(),
        &mut StdRng::seed_from_u64(7),
    )
    .unwrap();
    let mut pooled = StreamWriter::create_with_rng(
        &pool_path,
        CAPACITY,
        builder().compression_workers(4).queue_depth(3).build(),
        &mut StdRng::seed_from_u64(7),
    )
    .unwrap();

    for i in 0..40u64 {
        if i % 7 == 3 {
            continue;
        }
        let data = grain(i as u8);
        inline.append_grain(i * 8, &data).unwrap();
        pooled.append_grain(i * 8, &data).unwrap();
    }
    inline.close().unwrap();
    pooled.close().unwrap();

    assert_eq!(fs::read(&inline_path).unwrap(), fs::read(&pool_path).unwrap());
}
