// vim: tw=80
use std::{fs, os::unix::fs::FileExt};

use pretty_assertions::assert_eq;
use rstest::rstest;

use dmz_core::probe::{probe_content, Content};

use super::Harness;

#[rstest]
#[case(0x438, &[0x53, 0xef], Content::Filesystem("ext2"))]
#[case(0, b"XFSB", Content::Filesystem("xfs"))]
#[case(0x10040, b"_BHRfS_M", Content::Filesystem("btrfs"))]
#[case(512, b"EFI PART", Content::PartitionTable("gpt"))]
#[case(0, b"LUKS\xba\xbe", Content::Volume("crypto_LUKS"))]
#[case(4096, &[0xfc, 0x4e, 0x2b, 0xa9], Content::Volume("linux_raid_member"))]
// md 1.0, 8 KiB from the end of the 1 MiB image
#[case(1040384, &[0xfc, 0x4e, 0x2b, 0xa9],
       Content::Volume("linux_raid_member"))]
// Backup GPT header, in the last sector
#[case(1048064, b"EFI PART", Content::PartitionTable("gpt"))]
fn detects(#[case] offset: u64, #[case] magic: &[u8],
           #[case] expected: Content)
{
    let harness = Harness::new(&[2048]);
    let f = fs::OpenOptions::new()
        .write(true)
        .open(&harness.images[0])
        .unwrap();
    f.write_all_at(magic, offset).unwrap();
    assert_eq!(probe_content(&harness.images[0]).unwrap(), Some(expected));
}

#[test]
fn clean() {
    let harness = Harness::new(&[2048]);
    assert_eq!(probe_content(&harness.images[0]).unwrap(), None);
}

#[test]
fn display() {
    assert_eq!(Content::PartitionTable("dos").to_string(),
        "a partition table (dos)");
    assert_eq!(Content::Volume("crypto_LUKS").to_string(),
        "an existing volume (crypto_LUKS)");
}
