// vim: tw=80
//! Acquisition, validation, and emulation of zone reports
//!
//! Zoned devices describe their own zones through the kernel's zone report
//! interface.  Regular devices have no zones, so we make them up, using the
//! zone size of the rest of the `DeviceSet`.

use byteorder::{ByteOrder, NativeEndian};
use std::cmp;
use tracing::{debug, instrument, trace};

use crate::{
    translate::{Extent, sector_to_bdev},
    types::*,
    zone::{Zone, ZoneCond, ZoneType},
};

/// Size of the buffer used for each zone report query
pub const REPORT_ZONES_BUFSZ: usize = 524288;

/// Size of the report header: `sector: u64, nr_zones: u32, flags: u32`
const REPORT_HDR_LEN: usize = 16;

/// Size of one zone descriptor in a report
const BLK_ZONE_LEN: usize = 64;

/// Set in the report header when the descriptors' capacity field is valid
const BLK_ZONE_REP_CAPACITY: u32 = 1 << 0;

/// One zone descriptor, exactly as the kernel reported it.
///
/// All sector numbers are local to the reporting device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RawZone {
    pub start: SectorT,
    pub len: SectorT,
    pub wp: SectorT,
    /// Writable sectors, or 0 if the reporting kernel doesn't know about zone
    /// capacity.
    pub capacity: SectorT,
    pub zone_type: u8,
    pub cond: u8,
    pub non_seq: bool,
    pub reset: bool,
}

impl RawZone {
    /// The zone's writable capacity, falling back to its length when the
    /// capacity wasn't reported.
    pub fn effective_capacity(&self) -> SectorT {
        if self.capacity == 0 {
            self.len
        } else {
            self.capacity
        }
    }
}

/// A transfer buffer for the kernel's zone report ioctl.
///
/// Layout is a `blk_zone_report` header followed by as many `blk_zone`
/// descriptors as will fit.
pub struct ZoneReportBuf(Vec<u8>);

impl ZoneReportBuf {
    pub fn new() -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(REPORT_ZONES_BUFSZ)
            .map_err(|_| Error::OutOfMemory)?;
        buf.resize(REPORT_ZONES_BUFSZ, 0);
        Ok(ZoneReportBuf(buf))
    }

    /// The most zones that a single query can return
    pub const fn max_zones() -> u32 {
        ((REPORT_ZONES_BUFSZ - REPORT_HDR_LEN) / BLK_ZONE_LEN) as u32
    }

    /// Clear the buffer and set up the header for a query starting at `sector`
    pub fn prepare(&mut self, sector: SectorT) {
        self.0.fill(0);
        NativeEndian::write_u64(&mut self.0[0..8], sector);
        NativeEndian::write_u32(&mut self.0[8..12], Self::max_zones());
    }

    /// Pointer to hand to the kernel
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }

    fn flags(&self) -> u32 {
        NativeEndian::read_u32(&self.0[12..16])
    }

    /// Number of zones returned by the last query
    pub fn nr_zones(&self) -> u32 {
        cmp::min(NativeEndian::read_u32(&self.0[8..12]), Self::max_zones())
    }

    /// Decode the `i`th descriptor of the last query
    pub fn zone(&self, i: u32) -> RawZone {
        assert!(i < self.nr_zones(), "zone report index out of range");
        let off = REPORT_HDR_LEN + i as usize * BLK_ZONE_LEN;
        let d = &self.0[off..off + BLK_ZONE_LEN];
        let capacity = if self.flags() & BLK_ZONE_REP_CAPACITY != 0 {
            NativeEndian::read_u64(&d[32..40])
        } else {
            0
        };
        RawZone {
            start: NativeEndian::read_u64(&d[0..8]),
            len: NativeEndian::read_u64(&d[8..16]),
            wp: NativeEndian::read_u64(&d[16..24]),
            capacity,
            zone_type: d[24],
            cond: d[25],
            non_seq: d[26] != 0,
            reset: d[27] != 0,
        }
    }

    /// Fill the buffer the way the kernel would
    #[cfg(test)]
    pub(crate) fn fill(&mut self, sector: SectorT, zones: &[RawZone]) {
        assert!(zones.len() <= Self::max_zones() as usize);
        self.0.fill(0);
        NativeEndian::write_u64(&mut self.0[0..8], sector);
        NativeEndian::write_u32(&mut self.0[8..12], zones.len() as u32);
        NativeEndian::write_u32(&mut self.0[12..16], BLK_ZONE_REP_CAPACITY);
        for (i, z) in zones.iter().enumerate() {
            let off = REPORT_HDR_LEN + i * BLK_ZONE_LEN;
            let d = &mut self.0[off..off + BLK_ZONE_LEN];
            NativeEndian::write_u64(&mut d[0..8], z.start);
            NativeEndian::write_u64(&mut d[8..16], z.len);
            NativeEndian::write_u64(&mut d[16..24], z.wp);
            d[24] = z.zone_type;
            d[25] = z.cond;
            d[26] = u8::from(z.non_seq);
            d[27] = u8::from(z.reset);
            NativeEndian::write_u64(&mut d[32..40], z.capacity);
        }
    }
}

/// A backing device, as seen by the zone report engine
pub trait ZoneSource: Extent {
    fn name(&self) -> &str;

    fn model(&self) -> Model;

    /// Capacity in sectors
    fn capacity(&self) -> SectorT;

    /// Number of zones this device contributes to the set
    fn nr_zones(&self) -> ZoneT;

    /// Ask the device for the zones starting at local sector `sector`.
    ///
    /// On return `buf` holds zero or more descriptors.  Zero means that the
    /// device has no more zones to report.
    fn report_zones(&self, sector: SectorT, buf: &mut ZoneReportBuf)
        -> Result<()>;
}

fn mismatch(label: &str, detail: GeometryMismatch) -> Error {
    Error::ZoneGeometryMismatch { label: label.to_owned(), detail }
}

/// Validate one reported zone and convert it to global coordinates.
fn check_zone<D: ZoneSource>(dev: &D, idx: ZoneT, nr_zones: ZoneT,
                             zone_sectors: SectorT, raw: &RawZone)
    -> Result<Zone>
{
    let name = dev.name();
    let out_of_range = || mismatch(name, GeometryMismatch::ZoneStart {
        zone: idx, start: raw.start
    });
    let end = raw.start.checked_add(raw.len).ok_or_else(out_of_range)?;
    if raw.len == 0 || (raw.len != zone_sectors && end != dev.capacity()) {
        return Err(mismatch(name, GeometryMismatch::ZoneSize {
            zone: idx, length: raw.len, expected: zone_sectors
        }));
    }
    let capacity = raw.effective_capacity();
    if capacity < raw.len {
        return Err(mismatch(name, GeometryMismatch::ZoneCapacity {
            zone: idx, capacity, length: raw.len
        }));
    }
    if idx >= nr_zones {
        return Err(out_of_range());
    }
    let cond = ZoneCond::try_from(raw.cond)
        .map_err(|_| mismatch(name, GeometryMismatch::ZoneCondition {
            zone: idx, raw: raw.cond
        }))?;
    let zone_type = ZoneType::from(raw.zone_type);
    let offset = dev.sector_offset();
    let start = raw.start.checked_add(offset).ok_or_else(out_of_range)?;
    let wp = if zone_type == ZoneType::Conventional {
        None
    } else {
        Some(raw.wp.checked_add(offset).ok_or_else(out_of_range)?)
    };
    Ok(Zone {
        start,
        len: raw.len,
        capacity,
        wp,
        zone_type,
        cond,
        needs_reset: raw.reset,
        non_seq: raw.non_seq,
    })
}

/// Build the zone array of a device set.
///
/// `devs` must already be laid out end to end, and each device's `nr_zones`
/// must be computed with `zone_sectors`.  The returned array covers the whole
/// address space, in ascending order.
#[instrument(skip(devs))]
pub fn get_zones<D: ZoneSource>(label: &str, devs: &[D],
                                zone_sectors: SectorT)
    -> Result<Vec<Zone>>
{
    let total_capacity: SectorT = devs.iter().map(ZoneSource::capacity).sum();
    let total_zones = devs.iter()
        .map(|d| u64::from(d.nr_zones()))
        .sum::<u64>();
    let total_zones = ZoneT::try_from(total_zones)
        .map_err(|_| mismatch(label, GeometryMismatch::TooManyZones {
            nr_zones: total_zones
        }))?;

    let mut zones = Vec::new();
    zones.try_reserve_exact(total_zones as usize)
        .map_err(|_| Error::OutOfMemory)?;
    let mut buf = if devs.iter().any(|d| d.model().is_zoned()) {
        Some(ZoneReportBuf::new()?)
    } else {
        None
    };

    let mut sector: SectorT = 0;
    'walk: while sector < total_capacity {
        let (dev, local) = sector_to_bdev(devs, sector)
            .expect("device set layout does not start at sector 0");
        let idx = zones.len() as ZoneT;

        if !dev.model().is_zoned() {
            let len = cmp::min(zone_sectors, dev.capacity() - local);
            if idx >= total_zones {
                return Err(mismatch(dev.name(), GeometryMismatch::ZoneStart {
                    zone: idx, start: sector
                }));
            }
            let zone = Zone::emulated(sector, len);
            trace!("{}", zone.display(idx, dev.name()));
            zones.push(zone);
            sector += len;
            continue;
        }

        let Some(rep) = buf.as_mut() else {
            unreachable!("zone report buffer missing for a zoned device");
        };
        debug!(dev = dev.name(), local, sector,
            max_zones = ZoneReportBuf::max_zones(), start = idx,
            "report zones");
        dev.report_zones(local, rep)?;
        if rep.nr_zones() == 0 {
            break 'walk;
        }
        for i in 0..rep.nr_zones() {
            let idx = zones.len() as ZoneT;
            let zone = check_zone(dev, idx, total_zones, zone_sectors,
                                  &rep.zone(i))?;
            trace!("{}", zone.display(idx, dev.name()));
            sector = zone.end();
            zones.push(zone);
        }
    }

    let got = zones.len() as ZoneT;
    if got != total_zones {
        return Err(mismatch(label, GeometryMismatch::ZoneCount {
            expected: total_zones, got
        }));
    }
    if sector != total_capacity {
        return Err(mismatch(label, GeometryMismatch::EndSector {
            expected: total_capacity, got: sector
        }));
    }
    Ok(zones)
}

// LCOV_EXCL_STOP
