//! Tests for descriptor generation

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use vmdk_extent::descriptor::{cylinders, BASE_PARENT_CID};
use vmdk_extent::{CreateType, DescriptorBuilder, DiskDescriptor, VmdkError};

/// Deterministic source returning 0x11111111, 0x22222222, ...
struct CountingRng(u32);

impl RngCore for CountingRng {
    fn next_u32(&mut self) -> u32 {
        self.0 = self.0.wrapping_add(1);
        self.0.wrapping_mul(0x1111_1111)
    }

    fn next_u64(&mut self) -> u64 {
        self.next_u32() as u64
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for b in dest {
            *b = self.next_u32() as u8;
        }
    }
}

#[test]
fn test_cylinders_for_100m_sectors() {
    assert_eq!(cylinders(100_000_000), 6225);
}

#[test]
fn test_cylinders_cap_at_65535() {
    assert_eq!(cylinders(65535 * 255 * 63), 65535);
    assert_eq!(cylinders(u64::MAX / 2), 65535);
}

#[test]
fn test_exact_output_with_injected_rng() {
    let descriptor = DescriptorBuilder::new("disk-s001.vmdk", 100_000_000)
        .create_type(CreateType::StreamOptimized)
        .build(&mut CountingRng(0));

    let expected = "# Disk DescriptorFile\n\
                    version=1\n\
                    encoding=\"UTF-8\"\n\
                    CID=11111111\n\
                    parentCID=ffffffff\n\
                    createType=\"streamOptimized\"\n\
                    \n\
                    # Extent description\n\
                    RW 100000000 SPARSE \"disk-s001.vmdk\"\n\
                    \n\
                    # The Disk Data Base\n\
                    #DDB\n\
                    \n\
                    ddb.longContentID = \"22222222333333334444444411111111\"\n\
                    ddb.toolsVersion = \"2147483647\"\n\
                    ddb.virtualHWVersion = \"4\"\n\
                    ddb.geometry.cylinders = \"6225\"\n\
                    ddb.geometry.heads = \"255\"\n\
                    ddb.geometry.sectors = \"63\"\n\
                    ddb.adapterType = \"lsilogic\"\n";
    assert_eq!(descriptor.render(), expected);
}

#[test]
fn test_same_seed_same_descriptor() {
    let a = DescriptorBuilder::new("a.vmdk", 2048).build(&mut StdRng::seed_from_u64(99));
    let b = DescriptorBuilder::new("a.vmdk", 2048).build(&mut StdRng::seed_from_u64(99));
    assert_eq!(a.render(), b.render());
}

#[test]
fn test_parse_ignores_nul_padding() {
    let descriptor = DescriptorBuilder::new("pad.vmdk", 4096)
        .create_type(CreateType::MonolithicSparse)
        .build(&mut CountingRng(4));
    let mut text = descriptor.render();
    text.push_str(&"\0".repeat(300));

    let parsed = DiskDescriptor::parse(&text).unwrap();
    assert_eq!(parsed, descriptor);
    assert_eq!(parsed.parent_cid, BASE_PARENT_CID);
}

#[test]
fn test_refresh_changes_cid() {
    let mut descriptor = DescriptorBuilder::new("x.vmdk", 2048).build(&mut CountingRng(0));
    let before = descriptor.cid;
    descriptor.refresh_content_id(&mut CountingRng(10));
    assert_ne!(descriptor.cid, before);
    assert!(descriptor.render().contains(&format!("CID={:08x}", descriptor.cid)));
}

#[test]
fn test_parse_requires_cid_and_extent_line() {
    let err = DiskDescriptor::parse("version=1\ncreateType=\"monolithicSparse\"\n").unwrap_err();
    assert!(matches!(err, VmdkError::InvalidFormat(_)));

    let err = DiskDescriptor::parse("CID=12345678\ncreateType=\"monolithicSparse\"\n").unwrap_err();
    assert!(matches!(err, VmdkError::InvalidFormat(_)));
}

#[test]
fn test_non_ascii_long_content_id_is_invalid_format() {
    let descriptor = DescriptorBuilder::new("x.vmdk", 2048).build(&mut CountingRng(0));
    let text = descriptor.render();
    let start = text.find("ddb.longContentID = \"").unwrap() + "ddb.longContentID = \"".len();
    let garbled = format!("a{}a", "\u{e9}".repeat(11));
    let text = format!("{}{}{}", &text[..start], garbled, &text[start + 32..]);

    let err = DiskDescriptor::parse(&text).unwrap_err();
    assert!(matches!(err, VmdkError::InvalidFormat(_)));
}
