// vim: tw=80
//! One backing device of a `DeviceSet`

use std::{
    fmt::{self, Display, Formatter},
    fs::{self, File},
    os::unix::{
        fs::{FileExt, FileTypeExt},
        io::AsRawFd,
    },
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

use crate::{
    config::{Config, Operation},
    probe,
    report::{ZoneReportBuf, ZoneSource},
    sysfs::Sysfs,
    translate::Extent,
    types::*,
};

/// FFI definitions that don't belong in libc.  The ioctls can't go in libc
/// because they use Nix's macros.
#[doc(hidden)]
mod ffi {
    use nix::{ioctl_read_bad, ioctl_readwrite, request_code_read};
    use std::mem;

    /// Header of a zone report.  The kernel writes `nr_zones` `blk_zone`
    /// structures immediately after it.
    #[allow(dead_code)]
    #[repr(C)]
    // ioctl macros make the ioctl functions `pub`.
    pub struct blk_zone_report {
        pub sector: u64,
        pub nr_zones: u32,
        pub flags: u32,
    }

    ioctl_read_bad! {
        /// Get the size of a block device in bytes
        #[doc(hidden)]
        blkgetsize64,
        request_code_read!(0x12, 114, mem::size_of::<usize>()),
        u64
    }

    ioctl_readwrite! {
        /// Report the zones of a zoned block device
        #[doc(hidden)]
        blkreportzone, 0x12, 130, blk_zone_report
    }
}

/// Is `zone_sectors` usable as a zone size?
fn valid_zone_size(zone_sectors: SectorT) -> bool {
    zone_sectors != 0 && zone_sectors % SECTORS_PER_BLOCK == 0
}

/// Number of zones needed to cover `capacity` sectors
fn zone_count(name: &str, capacity: SectorT, zone_sectors: SectorT)
    -> Result<ZoneT>
{
    let nr_zones = div_roundup(capacity, zone_sectors);
    let mismatch = |detail| Error::ZoneGeometryMismatch {
        label: name.to_owned(),
        detail
    };
    if nr_zones == 0 {
        return Err(mismatch(GeometryMismatch::NoZones { capacity }));
    }
    ZoneT::try_from(nr_zones)
        .map_err(|_| mismatch(GeometryMismatch::TooManyZones { nr_zones }))
}

/// A single block device (or image file) contributing a contiguous slice of a
/// `DeviceSet`'s address space.
#[derive(Debug)]
pub struct BackingDevice {
    /// Canonical path of the device node
    path: PathBuf,
    /// Device name, like "sdb"
    name: String,
    /// Open handle.  `None` once closed.
    file: Option<File>,
    model: Model,
    /// Capacity in sectors
    capacity: SectorT,
    /// Zone size in sectors.  For regular devices, 0 until the `DeviceSet`
    /// assigns its zone size.
    zone_sectors: SectorT,
    zone_blocks: BlockT,
    nr_zones: ZoneT,
    /// First global block owned by this device
    block_offset: BlockT,
}

impl BackingDevice {
    /// Open and classify a backing device.
    ///
    /// The safety checks depend on `op`.  For [`Operation::Format`] the
    /// device must not be mounted, must not be held by another block-layer
    /// consumer, and unless `overwrite` is set must not contain a recognized
    /// file system or partition table.  For [`Operation::Inspect`] it must
    /// only be unmounted.
    #[instrument(skip(config))]
    pub fn open(path: &Path, op: Operation, overwrite: bool, config: &Config)
        -> Result<Self>
    {
        let path = fs::canonicalize(path)
            .map_err(Error::os(path, "resolve path"))?;
        let name = device_name(&path);
        let is_blk = check_block_device(&path, config)?;

        if op == Operation::Format && !overwrite {
            if let Some(content) = probe::probe_content(&path)? {
                return Err(Error::ExistingContentDetected { path, content });
            }
        }
        if probe::is_mounted(&config.mount_table, &path)? {
            return Err(Error::DeviceMounted { path });
        }
        let sysfs = Sysfs::new(&config.sysfs_root);
        if is_blk && op == Operation::Format {
            if let Some(holder) = probe::holder(&sysfs, &name)? {
                return Err(Error::DeviceBusy { path, holder });
            }
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(Error::os(&path, "open"))?;

        let (model, capacity) = if is_blk {
            let model = sysfs.model(&name)?;
            let mut bytes = 0u64;
            // Safe because blkgetsize64 writes exactly one u64
            unsafe { ffi::blkgetsize64(file.as_raw_fd(), &mut bytes) }
                .map_err(|errno| Error::Os {
                    path: path.clone(),
                    context: "get capacity",
                    errno
                })?;
            (model, bytes / BYTES_PER_SECTOR)
        } else {
            let len = file.metadata()
                .map_err(Error::os(&path, "get capacity"))?
                .len();
            (Model::Regular, len / BYTES_PER_SECTOR)
        };

        let mut bdev = BackingDevice {
            path,
            name,
            file: Some(file),
            model,
            capacity,
            zone_sectors: 0,
            zone_blocks: 0,
            nr_zones: 0,
            block_offset: 0,
        };
        if model.is_zoned() {
            let zone_sectors = sysfs.zone_sectors(&bdev.name)?;
            if !valid_zone_size(zone_sectors) {
                return Err(Error::ZoneSizeInvalid {
                    name: bdev.name,
                    zone_sectors
                });
            }
            bdev.set_zone_size(zone_sectors)?;
        }
        info!(path = %bdev.path.display(), model = %bdev.model,
            capacity = bdev.capacity, nr_zones = bdev.nr_zones,
            "opened backing device");
        Ok(bdev)
    }

    /// Report which other block-layer consumer holds the device, if any.
    ///
    /// Does not keep the device open.  Fails if the device is mounted, since
    /// the mount itself is then the holder.
    pub fn holder<P: AsRef<Path>>(path: P, config: &Config)
        -> Result<Option<String>>
    {
        let path = path.as_ref();
        let path = fs::canonicalize(path)
            .map_err(Error::os(path, "resolve path"))?;
        let is_blk = check_block_device(&path, config)?;
        if probe::is_mounted(&config.mount_table, &path)? {
            return Err(Error::DeviceMounted { path });
        }
        if !is_blk {
            return Ok(None);
        }
        probe::holder(&Sysfs::new(&config.sysfs_root), &device_name(&path))
    }

    /// Release the device.  Closing twice is harmless.
    pub fn close(&mut self) {
        self.file = None;
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn zone_sectors(&self) -> SectorT {
        self.zone_sectors
    }

    pub fn zone_blocks(&self) -> BlockT {
        self.zone_blocks
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| Error::Os {
            path: self.path.clone(),
            context: "access closed device",
            errno: nix::errno::Errno::EBADF
        })
    }

    /// Set the zone size and recompute the zone count
    pub(crate) fn set_zone_size(&mut self, zone_sectors: SectorT) -> Result<()>
    {
        self.nr_zones = zone_count(&self.name, self.capacity, zone_sectors)?;
        self.zone_sectors = zone_sectors;
        self.zone_blocks = sect2blk(zone_sectors);
        Ok(())
    }

    pub(crate) fn set_block_offset(&mut self, block_offset: BlockT) {
        self.block_offset = block_offset;
    }

    /// Read one metadata block.
    ///
    /// `local` is relative to this device.  `global` is only used for error
    /// messages.
    pub(crate) fn read_block(&self, local: BlockT, global: BlockT,
                             buf: &mut [u8; BYTES_PER_BLOCK]) -> Result<()>
    {
        let offset = local * BYTES_PER_BLOCK as u64;
        let r = self.file()?.read_at(&mut buf[..], offset);
        self.check_transfer(Direction::Read, global, r)
    }

    /// Write one metadata block.
    pub(crate) fn write_block(&self, local: BlockT, global: BlockT,
                              buf: &[u8; BYTES_PER_BLOCK]) -> Result<()>
    {
        let offset = local * BYTES_PER_BLOCK as u64;
        let r = self.file()?.write_at(&buf[..], offset);
        self.check_transfer(Direction::Write, global, r)
    }

    fn check_transfer(&self, dir: Direction, block: BlockT,
                      r: std::io::Result<usize>) -> Result<()>
    {
        let (transferred, errno) = match r {
            Ok(BYTES_PER_BLOCK) => return Ok(()),
            Ok(n) => (n, None),
            Err(e) => (0, Some(errno_of(&e)))
        };
        Err(Error::ShortTransfer {
            name: self.name.clone(),
            dir,
            block,
            transferred,
            errno
        })
    }

    /// Flush the device's write cache.
    pub(crate) fn sync(&self) -> Result<()> {
        self.file()?
            .sync_all()
            .map_err(|e| Error::SyncFailed {
                name: self.name.clone(),
                errno: errno_of(&e)
            })
    }
}

impl Display for BackingDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {} 512-byte sectors ({} GiB)", self.path.display(),
            self.capacity, (self.capacity * BYTES_PER_SECTOR) >> 30)?;
        writeln!(f, "  {}", self.model)?;
        write!(f, "  {} zones, offset {}", self.nr_zones, self.block_offset)
    }
}

impl Extent for BackingDevice {
    fn block_offset(&self) -> BlockT {
        self.block_offset
    }
}

impl ZoneSource for BackingDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> Model {
        self.model
    }

    fn capacity(&self) -> SectorT {
        self.capacity
    }

    fn nr_zones(&self) -> ZoneT {
        self.nr_zones
    }

    fn report_zones(&self, sector: SectorT, buf: &mut ZoneReportBuf)
        -> Result<()>
    {
        let fd = self.file()?.as_raw_fd();
        buf.prepare(sector);
        // Safe because the buffer is large enough for the header plus as
        // many zones as the header says.
        unsafe {
            ffi::blkreportzone(fd, buf.as_mut_ptr().cast())
        }.map_err(|errno| {
            warn!(dev = %self.name, sector, "zone report failed: {errno}");
            Error::Os {
                path: self.path.clone(),
                context: "get zone information",
                errno
            }
        })?;
        Ok(())
    }
}

/// The device's name, like "sdb"
fn device_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Make sure that `path` is something we can use as a backing device.
///
/// Returns `true` for a block device and `false` for a permitted image file.
fn check_block_device(path: &Path, config: &Config) -> Result<bool> {
    let ft = fs::metadata(path)
        .map_err(Error::os(path, "stat"))?
        .file_type();
    if ft.is_block_device() {
        Ok(true)
    } else if ft.is_file() && config.allow_files {
        Ok(false)
    } else {
        Err(Error::NotABlockDevice { path: path.to_owned() })
    }
}

// LCOV_EXCL_STOP
