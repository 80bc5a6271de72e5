// vim: tw=80
//! Zone descriptors, as reported by the kernel or emulated for regular devices

use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::fmt::{self, Display, Formatter};

use crate::types::*;

/// A zone's write semantics
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, IntoPrimitive, PartialEq)]
#[repr(u8)]
pub enum ZoneType {
    /// Emulated zones of regular devices, and anything the kernel reports
    /// that we don't recognize.
    #[num_enum(default)]
    Unknown = 0,
    Conventional = 1,
    SequentialWriteRequired = 2,
    SequentialWritePreferred = 3,
}

impl Display for ZoneType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conventional => "Conventional".fmt(f),
            Self::SequentialWriteRequired => "Sequential-write-required".fmt(f),
            Self::SequentialWritePreferred =>
                "Sequential-write-preferred".fmt(f),
            Self::Unknown => "Unknown-type".fmt(f),
        }
    }
}

/// A zone's condition, using the kernel's encoding
#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ZoneCond {
    NotWritePointer = 0x0,
    Empty = 0x1,
    ImplicitOpen = 0x2,
    ExplicitOpen = 0x3,
    Closed = 0x4,
    ReadOnly = 0xD,
    Full = 0xE,
    Offline = 0xF,
}

impl Display for ZoneCond {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotWritePointer => "Not-write-pointer".fmt(f),
            Self::Empty => "Empty".fmt(f),
            Self::ImplicitOpen => "Implicit-open".fmt(f),
            Self::ExplicitOpen => "Explicit-open".fmt(f),
            Self::Closed => "Closed".fmt(f),
            Self::ReadOnly => "Read-only".fmt(f),
            Self::Full => "Full".fmt(f),
            Self::Offline => "Offline".fmt(f),
        }
    }
}

/// One zone of a `DeviceSet`.
///
/// All sector numbers are global, ie relative to the start of the
/// `DeviceSet`'s address space rather than to the backing device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Zone {
    /// First sector of the zone
    pub start: SectorT,
    /// Length of the zone in sectors
    pub len: SectorT,
    /// Writable sectors in the zone.  Never less than `len` for zones that
    /// passed validation.
    pub capacity: SectorT,
    /// Write pointer.  `None` for emulated zones and for conventional zones.
    pub wp: Option<SectorT>,
    pub zone_type: ZoneType,
    pub cond: ZoneCond,
    pub needs_reset: bool,
    pub non_seq: bool,
}

impl Zone {
    /// Build a zone for a regular device, which has no native zones.
    pub fn emulated(start: SectorT, len: SectorT) -> Self {
        Zone {
            start,
            len,
            capacity: len,
            wp: None,
            zone_type: ZoneType::Unknown,
            cond: ZoneCond::NotWritePointer,
            needs_reset: false,
            non_seq: false,
        }
    }

    /// Wrap this zone with enough context to print it.
    pub fn display<'a>(&'a self, id: ZoneT, bdev_name: &'a str)
        -> ZoneDisplay<'a>
    {
        ZoneDisplay { zone: self, id, bdev_name }
    }

    /// The first sector after the end of this zone
    pub fn end(&self) -> SectorT {
        self.start + self.len
    }

    pub fn is_conventional(&self) -> bool {
        self.zone_type == ZoneType::Conventional
    }

    pub fn is_empty(&self) -> bool {
        self.cond == ZoneCond::Empty
    }

    /// Can this zone be written randomly?
    pub fn is_random(&self) -> bool {
        matches!(self.zone_type,
            ZoneType::Conventional | ZoneType::SequentialWritePreferred)
    }

    pub fn is_seq_req(&self) -> bool {
        self.zone_type == ZoneType::SequentialWriteRequired
    }

    pub fn is_unknown(&self) -> bool {
        self.zone_type == ZoneType::Unknown
    }
}

/// Helper for printing a [`Zone`] the way `dmzadm` always has.
pub struct ZoneDisplay<'a> {
    zone: &'a Zone,
    id: ZoneT,
    bdev_name: &'a str,
}

impl Display for ZoneDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let z = self.zone;
        let id = self.id;
        let name = self.bdev_name;
        let cond = u8::from(z.cond);
        match z.cond {
            ZoneCond::ReadOnly =>
                return write!(f, "Zone {id:06} ({name}): readonly {} zone",
                    z.cond),
            ZoneCond::Offline =>
                return write!(f, "Zone {id:06} ({name}): offline {} zone",
                    z.cond),
            _ => ()
        }
        if z.is_conventional() {
            write!(f, "Zone {id:06} ({name}): Conventional, cond 0x{cond:x} \
                ({}), sector {}, {} sectors", z.cond, z.start, z.len)
        } else {
            write!(f, "Zone {id:06} ({name}): type 0x{:x} ({}), cond 0x{cond:x} \
                ({}), need_reset {}, non_seq {}, sector {}, {} sectors, \
                wp sector {}",
                u8::from(z.zone_type), z.zone_type, z.cond,
                u8::from(z.needs_reset), u8::from(z.non_seq),
                z.start, z.len, z.wp.unwrap_or(u64::MAX))
        }
    }
}

// LCOV_EXCL_STOP
