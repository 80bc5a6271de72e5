// vim: tw=80
//! Translation between the `DeviceSet`'s global address space and the
//! addresses of its backing devices.
//!
//! The backing devices are laid end to end, in the order they were given.
//! Each owns the range from its own `block_offset` up to the next device's.
//!
//! Lookups scan the devices from last to first.  A `DeviceSet` has one or two
//! devices, so a linear scan is all we need.  A sorted-range search would give
//! the same answers if that ever changes.

use crate::{types::*, zone::Zone};

/// A contiguous slice of the global address space
pub trait Extent {
    /// First global block owned by this extent
    fn block_offset(&self) -> BlockT;

    /// First global sector owned by this extent
    fn sector_offset(&self) -> SectorT {
        blk2sect(self.block_offset())
    }
}

/// Find the device that owns global block `block`.
///
/// Returns the device and the device-relative block number, or `None` if no
/// device's offset is low enough.  `None` can only result from a corrupt
/// layout, so callers should treat it as a bug.
pub fn block_to_bdev<E: Extent>(bdevs: &[E], block: BlockT)
    -> Option<(&E, BlockT)>
{
    bdevs.iter()
        .rev()
        .find(|bdev| block >= bdev.block_offset())
        .map(|bdev| (bdev, block - bdev.block_offset()))
}

/// Find the device that owns global sector `sector`.
///
/// Like [`block_to_bdev`], but for sectors.
pub fn sector_to_bdev<E: Extent>(bdevs: &[E], sector: SectorT)
    -> Option<(&E, SectorT)>
{
    bdevs.iter()
        .rev()
        .find(|bdev| sector >= bdev.sector_offset())
        .map(|bdev| (bdev, sector - bdev.sector_offset()))
}

/// Return the index of the zone containing global block `block`.
///
/// `zones` must be sorted and contiguous.  The last zone of every device may
/// be short, so a block's zone can't be computed by division alone.  `None`
/// if the block is past the last zone.
pub fn block_zone_id(zones: &[Zone], block: BlockT) -> Option<ZoneT> {
    let sector = blk2sect(block);
    let i = zones.partition_point(|z| z.end() <= sector);
    zones.get(i)
        .filter(|z| z.start <= sector)
        .map(|_| i as ZoneT)
}

// LCOV_EXCL_STOP
