// vim: tw=80
//! Common type definitions used throughout dmz-core

use nix::errno::Errno;
use std::{
    fmt::{self, Display, Formatter},
    io,
    path::PathBuf,
};
use thiserror::Error;

use crate::probe::Content;

/// Indexes a 4 KiB metadata block, either globally or within one device.
pub type BlockT = u64;

/// Indexes a 512-byte sector, either globally or within one device.
pub type SectorT = u64;

/// Indexes a zone within a `DeviceSet`.
pub type ZoneT = u32;

/// Sectors are always 512 bytes, regardless of the device's logical block
/// size.
pub const BYTES_PER_SECTOR: u64 = 512;

/// dm-zoned always uses 4 KiB metadata blocks.
pub const BYTES_PER_BLOCK: usize = 4096;

/// Number of sectors in one metadata block
pub const SECTORS_PER_BLOCK: SectorT =
    BYTES_PER_BLOCK as u64 / BYTES_PER_SECTOR;

const BLOCK_SECTORS_SHIFT: u32 = SECTORS_PER_BLOCK.trailing_zeros();

/// Convert a block count to a sector count
pub const fn blk2sect(blocks: BlockT) -> SectorT {
    blocks << BLOCK_SECTORS_SHIFT
}

/// Convert a sector count to a block count, rounding down
pub const fn sect2blk(sectors: SectorT) -> BlockT {
    sectors >> BLOCK_SECTORS_SHIFT
}

/// Direction of a metadata block transfer
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => "Read".fmt(f),
            Direction::Write => "Write".fmt(f),
        }
    }
}

/// Zoned storage model of a backing device
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Model {
    /// No native zones.  Zones will be emulated.
    Regular,
    /// Zoned, but tolerates random writes
    HostAware,
    /// Zoned, and rejects writes that aren't at the write pointer
    HostManaged,
}

impl Model {
    pub fn is_zoned(self) -> bool {
        self != Model::Regular
    }
}

impl Display for Model {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Model::Regular => "Regular block device".fmt(f),
            Model::HostAware => "Host-aware device".fmt(f),
            Model::HostManaged => "Host-managed device".fmt(f),
        }
    }
}

/// The various ways in which a zone report can disagree with the geometry
/// that was computed from the devices' attributes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GeometryMismatch {
    /// The walk produced the wrong number of zones
    ZoneCount { expected: ZoneT, got: ZoneT },
    /// The walk did not end exactly at the end of the address space
    EndSector { expected: SectorT, got: SectorT },
    /// A zone other than a device's last had an unexpected length
    ZoneSize { zone: ZoneT, length: SectorT, expected: SectorT },
    /// A zone's writable capacity is smaller than its length
    ZoneCapacity { zone: ZoneT, capacity: SectorT, length: SectorT },
    /// More zones were reported than the devices can hold
    ZoneStart { zone: ZoneT, start: SectorT },
    /// The kernel reported a zone condition we don't know
    ZoneCondition { zone: ZoneT, raw: u8 },
    /// Two zoned devices disagree about the zone size
    ZoneSizeDisagreement { expected: SectorT, got: SectorT },
    /// A device that is followed by another one does not end on a block
    /// boundary
    UnalignedSpan { capacity: SectorT },
    /// A zoned device is too small to hold even one zone
    NoZones { capacity: SectorT },
    /// The zone count doesn't fit in a `ZoneT`
    TooManyZones { nr_zones: u64 },
}

impl Display for GeometryMismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ZoneCount{expected, got} => write!(f,
                "Invalid number of zones (expected {expected}, got {got})"),
            Self::EndSector{expected, got} => write!(f,
                "Invalid zones (last sector reported is {got}, expected \
                {expected})"),
            Self::ZoneSize{zone, length, expected} => write!(f,
                "Invalid zone {zone} size ({length} sectors, expected \
                {expected})"),
            Self::ZoneCapacity{zone, capacity, length} => write!(f,
                "Unsupported device with zone capacity smaller than zone \
                size (zone {zone}: capacity {capacity}, length {length})"),
            Self::ZoneStart{zone, start} => write!(f,
                "Invalid zone {zone} start {start}"),
            Self::ZoneCondition{zone, raw} => write!(f,
                "Invalid zone {zone} condition 0x{raw:x}"),
            Self::ZoneSizeDisagreement{expected, got} => write!(f,
                "zone size mismatch ({expected}/{got} sectors)"),
            Self::UnalignedSpan{capacity} => write!(f,
                "capacity of {capacity} sectors is not a whole number of \
                {BYTES_PER_BLOCK}-byte blocks"),
            Self::NoZones{capacity} => write!(f,
                "invalid number of zones (capacity {capacity} sectors)"),
            Self::TooManyZones{nr_zones} => write!(f,
                "invalid number of zones ({nr_zones})"),
        }
    }
}

/// dmz-core's error type.
///
/// Every variant identifies the offending device.  Variants that stem from a
/// failed system call also carry its `errno`.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("{}: {context} failed: {errno}", .path.display())]
    Os {
        path: PathBuf,
        context: &'static str,
        errno: Errno,
    },
    #[error("{} is not a block device", .path.display())]
    NotABlockDevice { path: PathBuf },
    #[error("{} is mounted", .path.display())]
    DeviceMounted { path: PathBuf },
    #[error("{} is in use (held by {holder})", .path.display())]
    DeviceBusy { path: PathBuf, holder: String },
    #[error("{} appears to contain {content}.  Use the overwrite option to \
            format it anyway", .path.display())]
    ExistingContentDetected { path: PathBuf, content: Content },
    #[error("{}: probe failed, cannot detect existing filesystem: {errno}",
            .path.display())]
    ProbeFailed { path: PathBuf, errno: Errno },
    #[error("{}: {reason}", .attr.display())]
    AttributeMissingOrMalformed { attr: PathBuf, reason: String },
    #[error("{name}: Invalid zone size {zone_sectors}")]
    ZoneSizeInvalid { name: String, zone_sectors: SectorT },
    /// `label` is the device set's label for whole-set checks, and the
    /// backing device's name for per-zone checks.
    #[error("{label}: {detail}")]
    ZoneGeometryMismatch { label: String, detail: GeometryMismatch },
    #[error("{name}: {dir} block {block} failed ({transferred} of 4096 \
            bytes){}", .errno.map(|e| format!(": {e}")).unwrap_or_default())]
    ShortTransfer {
        name: String,
        dir: Direction,
        block: BlockT,
        transferred: usize,
        errno: Option<Errno>,
    },
    #[error("{name}: fsync failed: {errno}")]
    SyncFailed { name: String, errno: Errno },
    #[error("{name}: {reason}")]
    InvalidLayout { name: String, reason: &'static str },
    #[error("Not enough memory")]
    OutOfMemory,
    #[error("{}: invalid configuration: {reason}", .path.display())]
    InvalidConfig { path: PathBuf, reason: String },
}

impl Error {
    /// Build a closure that converts an `io::Error` from a system call on
    /// `path` into an `Error::Os`.
    pub(crate) fn os<P>(path: P, context: &'static str)
        -> impl FnOnce(io::Error) -> Error
        where P: Into<PathBuf>
    {
        let path = path.into();
        move |e| Error::Os { path, context, errno: errno_of(&e) }
    }
}

/// Extract the `errno` from an `io::Error`, if it has one.
pub(crate) fn errno_of(e: &io::Error) -> Errno {
    e.raw_os_error()
        .map(Errno::from_raw)
        .unwrap_or(Errno::UnknownErrno)
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Divide `num` by `den`, rounding up
pub const fn div_roundup(num: u64, den: u64) -> u64 {
    num.div_ceil(den)
}

// LCOV_EXCL_STOP
