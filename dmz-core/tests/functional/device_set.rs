// vim: tw=80
//! Opening, using, and closing whole device sets

use std::{fs, os::unix::fs::FileExt};

use nonzero_ext::nonzero;
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};

use dmz_core::{
    config::{OpenOptions, Operation},
    report::ZoneSource,
    translate::Extent,
    BYTES_PER_BLOCK,
    Direction,
    Error,
};

use super::Harness;

/// A 1000-sector cache image followed by a 500-sector image
#[fixture]
fn harness() -> Harness {
    Harness::new(&[1000, 500])
}

fn options(harness: &Harness, op: Operation) -> OpenOptions {
    let mut oo = OpenOptions::new(op);
    oo.zone_sectors(nonzero!(256u64))
        .config(harness.config.clone());
    oo
}

#[rstest]
#[test_log::test]
fn open(harness: Harness) {
    let ds = options(&harness, Operation::Format)
        .open(&harness.images)
        .unwrap();
    assert_eq!(ds.label(), "disk0+disk1");
    assert_eq!(ds.capacity(), 1500);
    assert_eq!(ds.nr_zones(), 6);
    assert_eq!(ds.bdevs().iter().map(|b| b.nr_zones()).collect::<Vec<_>>(),
        vec![4, 2]);
    assert_eq!(ds.bdevs()[1].block_offset(), 125);

    let lens = ds.zones().iter().map(|z| z.len).collect::<Vec<_>>();
    assert_eq!(lens, vec![256, 256, 256, 232, 256, 244]);
    assert_eq!(ds.zones()[4].start, 1000);
    assert_eq!(ds.zones().last().unwrap().end(), 1500);
    for w in ds.zones().windows(2) {
        assert_eq!(w[0].end(), w[1].start);
    }
}

/// A block written through the set lands at the right place in the right
/// backing device, and reads back unchanged.
#[rstest]
#[test_log::test]
fn write_read(harness: Harness) {
    let ds = options(&harness, Operation::Format)
        .open(&harness.images)
        .unwrap();
    let mut wbuf = [0u8; BYTES_PER_BLOCK];
    for (i, b) in wbuf.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    ds.write_block(127, &wbuf).unwrap();
    ds.sync().unwrap();

    let mut rbuf = [0u8; BYTES_PER_BLOCK];
    ds.read_block(127, &mut rbuf).unwrap();
    assert_eq!(&rbuf[..], &wbuf[..]);

    let f = fs::File::open(&harness.images[1]).unwrap();
    let mut raw = [0u8; BYTES_PER_BLOCK];
    f.read_exact_at(&mut raw, 2 * BYTES_PER_BLOCK as u64).unwrap();
    assert_eq!(&raw[..], &wbuf[..]);
}

/// The last device's final block is partial, so it can't be transferred
#[rstest]
fn short_transfer(harness: Harness) {
    let ds = options(&harness, Operation::Inspect)
        .open(&harness.images)
        .unwrap();
    let mut rbuf = [0u8; BYTES_PER_BLOCK];
    let e = ds.read_block(187, &mut rbuf).unwrap_err();
    assert_eq!(e, Error::ShortTransfer {
        name: "disk1".to_owned(),
        dir: Direction::Read,
        block: 187,
        transferred: 2048,
        errno: None
    });
}

#[rstest]
#[case(Operation::Format, false)]
#[case(Operation::Format, true)]
#[case(Operation::Inspect, false)]
fn mounted(harness: Harness, #[case] op: Operation, #[case] overwrite: bool) {
    harness.mount(&harness.images[1]);
    let e = options(&harness, op)
        .overwrite(overwrite)
        .open(&harness.images)
        .unwrap_err();
    assert!(matches!(e, Error::DeviceMounted{..}), "{e:?}");
}

/// Formatting over an existing file system requires the overwrite flag
#[rstest]
#[test_log::test]
fn existing_fs(harness: Harness) {
    let f = fs::OpenOptions::new()
        .write(true)
        .open(&harness.images[0])
        .unwrap();
    // An ext4 super block, with the extents feature
    f.write_all_at(&[0x53, 0xef], 0x438).unwrap();
    f.write_all_at(&[0x40], 0x460).unwrap();

    let e = options(&harness, Operation::Format)
        .open(&harness.images)
        .unwrap_err();
    assert!(e.to_string().contains("an existing filesystem (ext4)"), "{e}");

    options(&harness, Operation::Format)
        .overwrite(true)
        .open(&harness.images)
        .unwrap();
    options(&harness, Operation::Inspect)
        .open(&harness.images)
        .unwrap();
}

#[rstest]
fn close(harness: Harness) {
    let mut ds = options(&harness, Operation::Inspect)
        .open(&harness.images)
        .unwrap();
    ds.close();
    ds.close();
    assert!(!ds.is_open());
}

/// Image files are never zoned, so they can't form a dm-zoned target on
/// their own.
#[rstest]
fn cache_layout(harness: Harness) {
    let ds = options(&harness, Operation::Inspect)
        .open(&harness.images[..1])
        .unwrap();
    assert!(matches!(ds.check_cache_layout(), Err(Error::InvalidLayout{..})));
}

#[test]
fn holder_of_image() {
    let harness = Harness::new(&[1024]);
    let holder = dmz_core::bdev::BackingDevice::holder(&harness.images[0],
        &harness.config).unwrap();
    assert_eq!(holder, None);
    harness.mount(&harness.images[0]);
    let e = dmz_core::bdev::BackingDevice::holder(&harness.images[0],
        &harness.config).unwrap_err();
    assert!(matches!(e, Error::DeviceMounted{..}), "{e:?}");
}

#[test]
fn no_emulated_zone_size() {
    let harness = Harness::new(&[1024]);
    let e = OpenOptions::new(Operation::Inspect)
        .config(harness.config.clone())
        .open(&harness.images)
        .unwrap_err();
    assert!(matches!(e, Error::ZoneSizeInvalid{zone_sectors: 0, ..}),
        "{e:?}");
}

#[test]
fn not_a_block_device() {
    let harness = Harness::new(&[1024]);
    let mut config = harness.config.clone();
    config.allow_files = false;
    let e = OpenOptions::new(Operation::Inspect)
        .zone_sectors(nonzero!(256u64))
        .config(config)
        .open(&harness.images)
        .unwrap_err();
    assert!(matches!(e, Error::NotABlockDevice{..}), "{e:?}");
    let e = OpenOptions::new(Operation::Inspect)
        .zone_sectors(nonzero!(256u64))
        .config(harness.config.clone())
        .open(&[harness.tempdir.path()])
        .unwrap_err();
    assert!(matches!(e, Error::NotABlockDevice{..}), "{e:?}");
}
