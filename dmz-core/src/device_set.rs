// vim: tw=80
//! The combined address space of one or more backing devices

use itertools::Itertools;
use std::{
    fmt::{self, Display, Formatter},
    num::NonZeroU64,
    path::Path,
};
use tracing::{instrument, warn};

use crate::{
    bdev::BackingDevice,
    config::OpenOptions,
    report::{self, ZoneSource},
    translate::{self, Extent},
    types::*,
    zone::Zone,
};

/// One or more backing devices, laid end to end, with their zones.
///
/// In a multi-device set the first device is normally a regular device used
/// as a cache, and the rest are zoned.
#[derive(Debug)]
pub struct DeviceSet {
    label: String,
    bdevs: Vec<BackingDevice>,
    /// Capacity in sectors
    capacity: SectorT,
    zone_sectors: SectorT,
    zone_blocks: BlockT,
    nr_zones: ZoneT,
    zones: Vec<Zone>,
}

impl DeviceSet {
    /// Open every device in `paths` and assemble them into a set.
    ///
    /// Usually called through [`OpenOptions::open`].
    #[instrument(skip(paths, options), fields(op = ?options.op))]
    pub fn open<P: AsRef<Path>>(paths: &[P], options: &OpenOptions)
        -> Result<Self>
    {
        let bdevs = paths.iter()
            .map(|p| BackingDevice::open(p.as_ref(), options.op,
                options.overwrite, &options.config))
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(options.label.clone(), bdevs, options.zone_sectors)
    }

    /// Lay out already-open backing devices and read their zones.
    ///
    /// `emulated` is the zone size to use if none of the devices are zoned.
    pub fn assemble(label: Option<String>, mut bdevs: Vec<BackingDevice>,
                    emulated: Option<NonZeroU64>) -> Result<Self>
    {
        let label = label.unwrap_or_else(|| {
            bdevs.iter().map(ZoneSource::name).join("+")
        });
        if bdevs.is_empty() {
            return Err(Error::InvalidLayout {
                name: label,
                reason: "no backing devices"
            });
        }

        let zone_sectors = Self::zone_size(&bdevs, emulated)?;
        for bdev in bdevs.iter_mut().filter(|b| !b.model().is_zoned()) {
            bdev.set_zone_size(zone_sectors)?;
        }

        let last = bdevs.len() - 1;
        let mut block_offset: BlockT = 0;
        for (i, bdev) in bdevs.iter_mut().enumerate() {
            let capacity = bdev.capacity();
            if i < last && capacity % SECTORS_PER_BLOCK != 0 {
                return Err(Error::ZoneGeometryMismatch {
                    label: bdev.name().to_owned(),
                    detail: GeometryMismatch::UnalignedSpan { capacity }
                });
            }
            bdev.set_block_offset(block_offset);
            block_offset += sect2blk(capacity);
        }

        let capacity = bdevs.iter().map(ZoneSource::capacity).sum();
        let zones = report::get_zones(&label, &bdevs, zone_sectors)?;
        let nr_zones = zones.len() as ZoneT;
        Ok(DeviceSet {
            label,
            bdevs,
            capacity,
            zone_sectors,
            zone_blocks: sect2blk(zone_sectors),
            nr_zones,
            zones,
        })
    }

    /// Choose the set's zone size.
    ///
    /// Zoned devices dictate it, and must all agree.  Otherwise the caller's
    /// emulated size is used.
    fn zone_size(bdevs: &[BackingDevice], emulated: Option<NonZeroU64>)
        -> Result<SectorT>
    {
        let mut zoned = bdevs.iter().filter(|b| b.model().is_zoned());
        if let Some(first) = zoned.next() {
            let expected = first.zone_sectors();
            for bdev in zoned {
                if bdev.zone_sectors() != expected ||
                    bdev.zone_blocks() != first.zone_blocks()
                {
                    return Err(Error::ZoneGeometryMismatch {
                        label: bdev.name().to_owned(),
                        detail: GeometryMismatch::ZoneSizeDisagreement {
                            expected,
                            got: bdev.zone_sectors()
                        }
                    });
                }
            }
            if let Some(e) = emulated.filter(|e| e.get() != expected) {
                warn!(requested = e.get(), zone_sectors = expected,
                    "using the zoned devices' zone size");
            }
            return Ok(expected);
        }
        let zone_sectors = emulated.map(NonZeroU64::get).unwrap_or(0);
        if zone_sectors == 0 || zone_sectors % SECTORS_PER_BLOCK != 0 {
            return Err(Error::ZoneSizeInvalid {
                name: bdevs[0].name().to_owned(),
                zone_sectors
            });
        }
        Ok(zone_sectors)
    }

    /// Enforce the layout that a dm-zoned target requires.
    ///
    /// A lone device must be zoned.  With several devices, the first must be
    /// a regular device, for use as a cache, and the rest must be zoned.
    pub fn check_cache_layout(&self) -> Result<()> {
        let (first, rest) = self.bdevs.split_first()
            .expect("DeviceSet with no backing devices");
        if rest.is_empty() {
            if !first.model().is_zoned() {
                return Err(Error::InvalidLayout {
                    name: first.name().to_owned(),
                    reason: "Not a zoned block device"
                });
            }
            return Ok(());
        }
        if first.model().is_zoned() {
            return Err(Error::InvalidLayout {
                name: first.name().to_owned(),
                reason: "Cache device must be a regular block device"
            });
        }
        if let Some(b) = rest.iter().find(|b| !b.model().is_zoned()) {
            return Err(Error::InvalidLayout {
                name: b.name().to_owned(),
                reason: "Not a zoned block device"
            });
        }
        Ok(())
    }

    /// Can `zone` hold cached data?
    ///
    /// With a separate cache device, that's the cache device's emulated
    /// zones.  Otherwise, it's the zoned device's random zones.
    pub fn is_cache_zone(&self, zone: &Zone) -> bool {
        if self.bdevs.len() > 1 {
            zone.is_unknown()
        } else {
            zone.is_random()
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn bdevs(&self) -> &[BackingDevice] {
        &self.bdevs
    }

    /// Total capacity in sectors
    pub fn capacity(&self) -> SectorT {
        self.capacity
    }

    pub fn zone_sectors(&self) -> SectorT {
        self.zone_sectors
    }

    pub fn zone_blocks(&self) -> BlockT {
        self.zone_blocks
    }

    pub fn nr_zones(&self) -> ZoneT {
        self.nr_zones
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Find the device that owns global block `block`, and the local block.
    pub fn block_to_bdev(&self, block: BlockT)
        -> Option<(&BackingDevice, BlockT)>
    {
        translate::block_to_bdev(&self.bdevs, block)
    }

    /// Find the device that owns global sector `sector`, and the local sector.
    pub fn sector_to_bdev(&self, sector: SectorT)
        -> Option<(&BackingDevice, SectorT)>
    {
        translate::sector_to_bdev(&self.bdevs, sector)
    }

    /// Index in [`zones`](Self::zones) of the zone holding global block
    /// `block`, or `None` if the block is past the end of the set.
    pub fn block_zone_id(&self, block: BlockT) -> Option<ZoneT> {
        translate::block_zone_id(&self.zones, block)
    }

    fn owner(&self, block: BlockT) -> (&BackingDevice, BlockT) {
        self.block_to_bdev(block)
            .expect("DeviceSet layout does not start at block 0")
    }

    /// Read one metadata block at global block number `block`.
    pub fn read_block(&self, block: BlockT, buf: &mut [u8; BYTES_PER_BLOCK])
        -> Result<()>
    {
        let (bdev, local) = self.owner(block);
        bdev.read_block(local, block, buf)
    }

    /// Write one metadata block at global block number `block`.
    pub fn write_block(&self, block: BlockT, buf: &[u8; BYTES_PER_BLOCK])
        -> Result<()>
    {
        let (bdev, local) = self.owner(block);
        bdev.write_block(local, block, buf)
    }

    /// Flush every backing device's write cache, stopping at the first
    /// failure.
    pub fn sync(&self) -> Result<()> {
        self.bdevs.iter().try_for_each(BackingDevice::sync)
    }

    /// Release all backing devices.  Closing twice is harmless.
    pub fn close(&mut self) {
        for bdev in self.bdevs.iter_mut() {
            bdev.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.bdevs.iter().any(BackingDevice::is_open)
    }
}

/// A summary of the set's zones
impl Display for DeviceSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        const MIB: u64 = 1 << 20;
        // Any device may end in a short zone, not only the last one.
        let (full, runts): (Vec<&Zone>, Vec<&Zone>) = self.zones.iter()
            .partition(|z| z.len == self.zone_sectors);
        writeln!(f, "  {} zones of {} 512-byte sectors ({} MiB)", full.len(),
            self.zone_sectors, self.zone_sectors * BYTES_PER_SECTOR / MIB)?;
        for z in runts {
            writeln!(f, "  1 runt zone of {} 512-byte sectors ({} MiB)", z.len,
                z.len * BYTES_PER_SECTOR / MIB)?;
        }
        write!(f, "  {} 4KB data blocks per zone", self.zone_blocks)
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use super::*;
    use crate::config::{Config, Operation};
    use nonzero_ext::nonzero;
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};
    use std::fs;
    use tempfile::{Builder, NamedTempFile, TempDir};

    struct Harness {
        config: Config,
        images: Vec<NamedTempFile>,
        _dir: TempDir,
    }

    impl Harness {
        fn bdevs(&self) -> Vec<BackingDevice> {
            self.images.iter()
                .map(|i| BackingDevice::open(i.path(), Operation::Inspect,
                    false, &self.config).unwrap())
                .collect()
        }
    }

    /// Image files of 1000 and 500 sectors
    #[fixture]
    fn harness() -> Harness {
        let dir = Builder::new()
            .prefix("test_device_set")
            .tempdir()
            .unwrap();
        let mount_table = dir.path().join("mounts");
        fs::write(&mount_table, "").unwrap();
        let images = [1000, 500].iter()
            .map(|sectors| {
                let f = Builder::new()
                    .prefix("test_device_set_image")
                    .tempfile()
                    .unwrap();
                f.as_file().set_len(sectors * BYTES_PER_SECTOR).unwrap();
                f
            }).collect();
        let config = Config {
            sysfs_root: dir.path().join("sys"),
            mount_table,
            allow_files: true,
        };
        Harness { config, images, _dir: dir }
    }

    #[rstest]
    fn assemble(harness: Harness) {
        let ds = DeviceSet::assemble(None, harness.bdevs(),
            Some(nonzero!(256u64))).unwrap();
        assert_eq!(ds.capacity(), 1500);
        assert_eq!(ds.nr_zones(), 6);
        assert_eq!(ds.zones().len(), 6);
        assert_eq!(ds.zone_blocks(), 32);
        assert_eq!(ds.bdevs()[0].block_offset(), 0);
        assert_eq!(ds.bdevs()[1].block_offset(), 125);
        assert_eq!(ds.zones()[3].len, 232);
        assert_eq!(ds.zones()[5].end(), 1500);
        let names = ds.bdevs().iter().map(ZoneSource::name).join("+");
        assert_eq!(ds.label(), names);
    }

    #[rstest]
    fn label(harness: Harness) {
        let ds = DeviceSet::assemble(Some("mylabel".to_owned()),
            harness.bdevs(), Some(nonzero!(256u64))).unwrap();
        assert_eq!(ds.label(), "mylabel");
    }

    #[test]
    fn empty() {
        let e = DeviceSet::assemble(None, Vec::new(), Some(nonzero!(256u64)))
            .unwrap_err();
        assert!(matches!(e, Error::InvalidLayout{..}), "{e:?}");
    }

    #[rstest]
    #[case(None)]
    #[case(Some(nonzero!(100u64)))]
    fn bad_emulated_zone_size(harness: Harness,
                              #[case] zs: Option<NonZeroU64>)
    {
        let e = DeviceSet::assemble(None, harness.bdevs(), zs).unwrap_err();
        assert!(matches!(e, Error::ZoneSizeInvalid{..}), "{e:?}");
    }

    /// Only the last device may end in the middle of a block
    #[rstest]
    fn unaligned(harness: Harness) {
        harness.images[0].as_file().set_len(1001 * BYTES_PER_SECTOR)
            .unwrap();
        let e = DeviceSet::assemble(None, harness.bdevs(),
            Some(nonzero!(256u64))).unwrap_err();
        assert!(matches!(e, Error::ZoneGeometryMismatch {
            detail: GeometryMismatch::UnalignedSpan{capacity: 1001}, ..
        }), "{e:?}");

        harness.images[0].as_file().set_len(1000 * BYTES_PER_SECTOR)
            .unwrap();
        harness.images[1].as_file().set_len(501 * BYTES_PER_SECTOR)
            .unwrap();
        let ds = DeviceSet::assemble(None, harness.bdevs(),
            Some(nonzero!(256u64))).unwrap();
        assert_eq!(ds.capacity(), 1501);
    }

    #[rstest]
    fn translate(harness: Harness) {
        let ds = DeviceSet::assemble(None, harness.bdevs(),
            Some(nonzero!(256u64))).unwrap();
        let (bdev, local) = ds.block_to_bdev(130).unwrap();
        assert_eq!(bdev.path(), ds.bdevs()[1].path());
        assert_eq!(local, 5);
        let (bdev, local) = ds.sector_to_bdev(999).unwrap();
        assert_eq!(bdev.path(), ds.bdevs()[0].path());
        assert_eq!(local, 999);
        assert_eq!(ds.block_zone_id(31), Some(0));
        assert_eq!(ds.block_zone_id(32), Some(1));
        assert_eq!(ds.block_zone_id(188), None);
    }

    /// The first block of the second device starts a new zone, even though
    /// the first device's last zone is short.
    #[rstest]
    fn zone_id_across_devices(harness: Harness) {
        let ds = DeviceSet::assemble(None, harness.bdevs(),
            Some(nonzero!(256u64))).unwrap();
        assert_eq!(ds.block_zone_id(124), Some(3));
        assert_eq!(ds.block_zone_id(125), Some(4));
        for block in 0..sect2blk(ds.capacity()) {
            let id = ds.block_zone_id(block).unwrap();
            let z = &ds.zones()[id as usize];
            let sector = blk2sect(block);
            assert!(z.start <= sector && sector < z.end(),
                "block {block} is not in zone {id}");
        }
    }

    #[rstest]
    fn cache_layout(harness: Harness) {
        let ds = DeviceSet::assemble(None, harness.bdevs(),
            Some(nonzero!(256u64))).unwrap();
        let e = ds.check_cache_layout().unwrap_err();
        assert!(matches!(e, Error::InvalidLayout{
            reason: "Not a zoned block device", ..
        }), "{e:?}");
        assert!(ds.zones().iter().all(|z| ds.is_cache_zone(z)));
    }

    #[rstest]
    fn close(harness: Harness) {
        let mut ds = DeviceSet::assemble(None, harness.bdevs(),
            Some(nonzero!(256u64))).unwrap();
        assert!(ds.is_open());
        ds.close();
        assert!(!ds.is_open());
        ds.close();
        let e = ds.sync().unwrap_err();
        assert!(matches!(e, Error::Os{..}), "{e:?}");
    }

    #[rstest]
    fn display(harness: Harness) {
        let ds = DeviceSet::assemble(None, harness.bdevs(),
            Some(nonzero!(256u64))).unwrap();
        assert_eq!(ds.to_string(),
            "  4 zones of 256 512-byte sectors (0 MiB)\n  \
            1 runt zone of 232 512-byte sectors (0 MiB)\n  \
            1 runt zone of 244 512-byte sectors (0 MiB)\n  \
            32 4KB data blocks per zone");
    }
}
// LCOV_EXCL_STOP
