// vim: tw=80
//! Safety checks to run before claiming a device
//!
//! None of these checks takes a lock.  They only guard against the operator
//! accidentally pointing us at a device that is already in use.

use byteorder::{ByteOrder, LittleEndian};
use std::{
    cmp,
    fmt::{self, Display, Formatter},
    fs::{self, File},
    io::{self, Seek, SeekFrom},
    ops::Range,
    os::unix::fs::FileExt,
    path::Path,
};
use tracing::warn;

use crate::{sysfs::Sysfs, types::*};

/// Something found on a device by [`probe_content`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Content {
    /// A file system, identified by its usual type name
    Filesystem(&'static str),
    /// A RAID member, cache device, or encrypted volume, identified by its
    /// usual type name
    Volume(&'static str),
    /// A partition table, identified by its usual type name
    PartitionTable(&'static str),
}

impl Display for Content {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Content::Filesystem(t) =>
                write!(f, "an existing filesystem ({t})"),
            Content::Volume(t) =>
                write!(f, "an existing volume ({t})"),
            Content::PartitionTable(t) =>
                write!(f, "a partition table ({t})"),
        }
    }
}

/// How much of the start of the device to examine.  That covers ZFS's first
/// two labels, the deepest signatures at the front of a device.
const HEAD_LEN: u64 = 512 * 1024;

/// How much of the end of the device to examine.  That covers ZFS's last two
/// labels, even after they're aligned down, and md's trailing super blocks.
const TAIL_LEN: u64 = 1024 * 1024;

/// The regions of a device that signatures can live in.
///
/// Small devices are held whole.  Larger ones are held as a head and a tail,
/// with a gap between.
#[derive(Debug)]
pub struct Sample {
    size: u64,
    head: Vec<u8>,
    /// Device offset of `tail[0]`
    tail_start: u64,
    tail: Vec<u8>,
}

impl Sample {
    /// Byte ranges to sample from a device of `size` bytes
    fn ranges(size: u64) -> (Range<u64>, Range<u64>) {
        let head = 0..cmp::min(size, HEAD_LEN);
        let tail = cmp::max(head.end, size.saturating_sub(TAIL_LEN))..size;
        (head, tail)
    }

    /// Sample a device image that's already in memory
    pub fn from_bytes(buf: &[u8]) -> Self {
        let (head, tail) = Self::ranges(buf.len() as u64);
        Sample {
            size: buf.len() as u64,
            tail_start: tail.start,
            head: buf[head.start as usize..head.end as usize].to_vec(),
            tail: buf[tail.start as usize..tail.end as usize].to_vec(),
        }
    }

    /// Read the interesting regions of an open device
    pub fn read(f: &mut File) -> io::Result<Self> {
        let size = f.seek(SeekFrom::End(0))?;
        let (head, tail) = Self::ranges(size);
        let read = |r: &Range<u64>| -> io::Result<Vec<u8>> {
            let mut buf = vec![0u8; (r.end - r.start) as usize];
            f.read_exact_at(&mut buf, r.start)?;
            Ok(buf)
        };
        Ok(Sample {
            size,
            head: read(&head)?,
            tail_start: tail.start,
            tail: read(&tail)?,
        })
    }

    /// Device size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The `len` bytes at device offset `offset`, if they were sampled
    fn get(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len as u64)?;
        if end <= self.head.len() as u64 {
            self.head.get(offset as usize..end as usize)
        } else if offset >= self.tail_start && end <= self.size {
            let off = (offset - self.tail_start) as usize;
            self.tail.get(off..off + len)
        } else {
            None
        }
    }

    fn magic_at(&self, offset: u64, magic: &[u8]) -> bool {
        self.get(offset, magic.len()) == Some(magic)
    }

    fn u32_at(&self, offset: u64) -> Option<[u8; 4]> {
        self.get(offset, 4)?.try_into().ok()
    }

    fn u64_at(&self, offset: u64) -> Option<[u8; 8]> {
        self.get(offset, 8)?.try_into().ok()
    }
}

/// A magic string at a fixed byte offset
struct Magic {
    offset: u64,
    magic: &'static [u8],
    name: &'static str,
}

/// File system signatures, besides the ones that need more than a single
/// comparison.
const FS_MAGICS: &[Magic] = &[
    Magic { offset: 0, magic: b"XFSB", name: "xfs" },
    Magic { offset: 0x10040, magic: b"_BHRfS_M", name: "btrfs" },
    Magic { offset: 0x400, magic: &[0x10, 0x20, 0xf5, 0xf2], name: "f2fs" },
    Magic { offset: 4086, magic: b"SWAPSPACE2", name: "swap" },
    Magic { offset: 4086, magic: b"SWAP-SPACE", name: "swap" },
    Magic { offset: 3, magic: b"NTFS    ", name: "ntfs" },
    Magic { offset: 0x8001, magic: b"CD001", name: "iso9660" },
    // dm-zoned's own super block, as written by a previous format.  The magic
    // is "DZBD", stored little-endian.
    Magic { offset: 0, magic: b"DBZD", name: "dm-zoned" },
];

/// Volume signatures at fixed offsets
const VOLUME_MAGICS: &[Magic] = &[
    // Both LUKS1 and LUKS2
    Magic { offset: 0, magic: b"LUKS\xba\xbe", name: "crypto_LUKS" },
    // In the super block at 4 KiB, after the checksum, offset and version
    Magic {
        offset: 4096 + 24,
        magic: &[0xc6, 0x85, 0x73, 0xf6, 0x4e, 0x1a, 0x45, 0xca,
                 0x82, 0x65, 0xf5, 0x7f, 0x48, 0xba, 0x6d, 0x81],
        name: "bcache"
    },
];

/// Offset of the ext2/3/4 super block
const EXT_SB: u64 = 1024;
const EXT_MAGIC: u16 = 0xEF53;
const EXT3_FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
const EXT4_FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
const EXT4_FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
const EXT4_FEATURE_INCOMPAT_FLEX_BG: u32 = 0x0200;

const MD_SB_MAGIC: u32 = 0xa92b4efc;
/// Space reserved at the end of the device for an md 0.90 super block
const MD_RESERVED_BYTES: u64 = 64 * 1024;

const ZFS_LABEL_LEN: u64 = 256 * 1024;
/// Offset of the uberblock ring within a ZFS label
const ZFS_UBERBLOCK_RING: u64 = 128 * 1024;
const ZFS_UBERBLOCK_SLOT: u64 = 1024;
const ZFS_UBERBLOCK_MAGIC: u64 = 0x00bab10c;
/// How many uberblocks make a ZFS member, rather than a coincidence
const ZFS_WANT: usize = 4;

fn scan_ext(s: &Sample) -> Option<&'static str> {
    let sb = s.get(EXT_SB, 0x68)?;
    if LittleEndian::read_u16(&sb[0x38..]) != EXT_MAGIC {
        return None;
    }
    let compat = LittleEndian::read_u32(&sb[0x5C..]);
    let incompat = LittleEndian::read_u32(&sb[0x60..]);
    let ext4_features = EXT4_FEATURE_INCOMPAT_EXTENTS |
        EXT4_FEATURE_INCOMPAT_64BIT |
        EXT4_FEATURE_INCOMPAT_FLEX_BG;
    if incompat & ext4_features != 0 {
        Some("ext4")
    } else if compat & EXT3_FEATURE_COMPAT_HAS_JOURNAL != 0 {
        Some("ext3")
    } else {
        Some("ext2")
    }
}

/// Look for an md super block of any metadata version
fn scan_md(s: &Sample) -> bool {
    let v1_at = |offset| s.u32_at(offset)
        .is_some_and(|b| u32::from_le_bytes(b) == MD_SB_MAGIC);
    // 1.1 at the start, 1.2 at 4 KiB
    if v1_at(0) || v1_at(4096) {
        return true;
    }
    // 1.0 at least 8 KiB from the end, aligned to 4 KiB
    let sectors = s.size() / BYTES_PER_SECTOR;
    if sectors >= 16 && v1_at(((sectors - 16) & !7) * BYTES_PER_SECTOR) {
        return true;
    }
    // 0.90 in the last whole 64 KiB, in the host's byte order
    let aligned = s.size() & !(MD_RESERVED_BYTES - 1);
    aligned >= MD_RESERVED_BYTES &&
        s.u32_at(aligned - MD_RESERVED_BYTES).is_some_and(|b|
            u32::from_le_bytes(b) == MD_SB_MAGIC ||
            u32::from_be_bytes(b) == MD_SB_MAGIC)
}

/// Count ZFS uberblocks in all four vdev labels
fn scan_zfs(s: &Sample) -> bool {
    let aligned = s.size() & !(ZFS_LABEL_LEN - 1);
    let mut labels = vec![0, ZFS_LABEL_LEN];
    if aligned >= 2 * ZFS_LABEL_LEN {
        labels.extend([aligned - 2 * ZFS_LABEL_LEN, aligned - ZFS_LABEL_LEN]);
    }
    labels.sort_unstable();
    labels.dedup();
    let slots = ZFS_UBERBLOCK_RING / ZFS_UBERBLOCK_SLOT;
    let found = labels.iter()
        .flat_map(|label| (0..slots).map(move |i|
            label + ZFS_UBERBLOCK_RING + i * ZFS_UBERBLOCK_SLOT))
        .filter_map(|off| s.u64_at(off))
        .filter(|b| u64::from_le_bytes(*b) == ZFS_UBERBLOCK_MAGIC ||
            u64::from_be_bytes(*b) == ZFS_UBERBLOCK_MAGIC)
        .count();
    found >= ZFS_WANT
}

fn has_mbr_signature(s: &Sample) -> bool {
    s.magic_at(510, &[0x55, 0xaa])
}

fn scan_vfat(s: &Sample) -> bool {
    has_mbr_signature(s) && (
        s.magic_at(0x52, b"FAT32   ") ||
        s.magic_at(0x36, b"FAT16   ") ||
        s.magic_at(0x36, b"FAT12   ")
    )
}

fn scan_lvm2(s: &Sample) -> bool {
    // The label may live in any of the first four sectors
    (0..4).any(|sector| {
        let off = sector * BYTES_PER_SECTOR;
        s.magic_at(off, b"LABELONE") && s.magic_at(off + 24, b"LVM2 001")
    })
}

/// Look for the primary GPT header, or the backup in the last sector
fn scan_gpt(s: &Sample) -> bool {
    s.magic_at(BYTES_PER_SECTOR, b"EFI PART") ||
        (s.size() >= 2 * BYTES_PER_SECTOR &&
         s.magic_at((s.size() / BYTES_PER_SECTOR - 1) * BYTES_PER_SECTOR,
            b"EFI PART"))
}

fn scan_dos(s: &Sample) -> bool {
    // Besides the boot signature, at least one of the four primary partition
    // entries must have a non-zero type.
    has_mbr_signature(s) &&
        (0..4).any(|i| s.get(446 + 16 * i + 4, 1).is_some_and(|t| t[0] != 0))
}

/// Look for known signatures on a sampled device.
///
/// Volume signatures come first, then file systems, then partition tables.
/// So an md member that holds a file system reports as a RAID member, and a
/// GPT disk's protective MBR reports as gpt.
pub fn scan(s: &Sample) -> Option<Content> {
    if scan_md(s) {
        return Some(Content::Volume("linux_raid_member"));
    }
    if let Some(m) = VOLUME_MAGICS.iter()
        .find(|m| s.magic_at(m.offset, m.magic))
    {
        return Some(Content::Volume(m.name));
    }
    if scan_zfs(s) {
        return Some(Content::Volume("zfs_member"));
    }
    if let Some(t) = scan_ext(s) {
        return Some(Content::Filesystem(t));
    }
    if let Some(m) = FS_MAGICS.iter().find(|m| s.magic_at(m.offset, m.magic))
    {
        return Some(Content::Filesystem(m.name));
    }
    if scan_vfat(s) {
        return Some(Content::Filesystem("vfat"));
    }
    if scan_lvm2(s) {
        return Some(Content::Volume("LVM2_member"));
    }
    if scan_gpt(s) {
        return Some(Content::PartitionTable("gpt"));
    }
    if scan_dos(s) {
        return Some(Content::PartitionTable("dos"));
    }
    None
}

/// Look for an existing file system, volume, or partition table on a device.
///
/// Returns `Ok(None)` if the device looks unused.  An error means that we
/// could not tell.
pub fn probe_content(path: &Path) -> Result<Option<Content>> {
    let probe_failed = |e: io::Error| Error::ProbeFailed {
        path: path.to_owned(),
        errno: errno_of(&e)
    };
    let mut f = File::open(path).map_err(probe_failed)?;
    let sample = Sample::read(&mut f).map_err(probe_failed)?;
    let content = scan(&sample);
    if let Some(c) = content {
        warn!(path = %path.display(), "device appears to contain {c}");
    }
    Ok(content)
}

/// Is `path` the source of any mount in the mount table?
///
/// `path` is compared as a string, so it should already be canonical.
pub fn is_mounted(mount_table: &Path, path: &Path) -> Result<bool> {
    let table = fs::read_to_string(mount_table)
        .map_err(Error::os(mount_table, "read mount table"))?;
    let path = path.to_string_lossy();
    Ok(table.lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|source| unescape_mount_field(source) == path))
}

/// Undo the octal escaping that the kernel applies to whitespace and
/// backslashes in mount table fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let oct = std::str::from_utf8(&bytes[i + 1..i + 4]).ok()
                .and_then(|s| u8::from_str_radix(s, 8).ok());
            if let Some(c) = oct {
                out.push(c);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Return the first holder of the named device, if it has any.
pub fn holder(sysfs: &Sysfs, name: &str) -> Result<Option<String>> {
    Ok(sysfs.holders(name)?.into_iter().next())
}

// LCOV_EXCL_STOP
