//! Sector tables.
//!
//! A device is described by a static, ordered table of sectors.  Sectors may
//! be contiguous, or there may be explicit gaps between them (a bootloader
//! region that has been left out, or a hole in the memory map), but they never
//! overlap and are always sorted by base address.

use crate::{Error, Result};

/// A contiguous range of addresses, `[start, start + length)`.  The end never
/// wraps past the top of the address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Region {
    start: u32,
    length: u32,
}

impl Region {
    /// Build a region.  Intended for constant tables, so overflow is a build
    /// failure rather than an error.
    pub const fn new(start: u32, length: u32) -> Region {
        match start.checked_add(length) {
            Some(_) => Region { start, length },
            None => panic!("region wraps the address space"),
        }
    }

    pub fn checked(start: u32, length: u32) -> Option<Region> {
        start.checked_add(length)?;
        Some(Region { start, length })
    }

    pub const fn start(&self) -> u32 {
        self.start
    }

    pub const fn len(&self) -> u32 {
        self.length
    }

    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// One past the last address.
    pub const fn end(&self) -> u32 {
        self.start + self.length
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end()
    }

    pub fn contains_region(&self, other: &Region) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start < other.end()
            && other.start < self.end()
    }
}

/// One erasable unit of code memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SectorDescriptor {
    pub base: u32,
    pub size: u32,
    /// The device's own number for this sector.
    pub index: u16,
}

impl SectorDescriptor {
    pub const fn new(base: u32, size: u32, index: u16) -> SectorDescriptor {
        SectorDescriptor { base, size, index }
    }

    /// A run of `N` equally sized sectors, starting at `base`, numbered from
    /// `first_index`.
    pub const fn uniform<const N: usize>(
        base: u32,
        size: u32,
        first_index: u16,
    ) -> [SectorDescriptor; N] {
        let mut out = [SectorDescriptor::new(0, 0, 0); N];
        let mut i = 0;
        while i < N {
            out[i] = SectorDescriptor::new(base + (i as u32) * size, size, first_index + i as u16);
            i += 1;
        }
        out
    }

    pub const fn region(&self) -> Region {
        Region::new(self.base, self.size)
    }

    pub const fn end(&self) -> u32 {
        self.base + self.size
    }
}

/// Inclusive range of positions within a [`SectorMap`].  These are positions
/// in the table, not the device's sector numbers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SectorSpan {
    pub first: usize,
    pub last: usize,
}

impl SectorSpan {
    /// Number of sectors.  A span always holds at least one.
    pub fn count(&self) -> usize {
        self.last - self.first + 1
    }

    pub fn positions(&self) -> core::ops::RangeInclusive<usize> {
        self.first..=self.last
    }
}

/// A validated view of a sector table.
#[derive(Debug, Copy, Clone)]
pub struct SectorMap<'a> {
    sectors: &'a [SectorDescriptor],
}

impl<'a> SectorMap<'a> {
    /// Check that the table is sorted, non-overlapping, and that no sector is
    /// empty or runs off the end of the address space.
    pub fn new(sectors: &'a [SectorDescriptor]) -> Result<SectorMap<'a>> {
        let mut prev_end: Option<u32> = None;
        for s in sectors {
            if s.size == 0 {
                return Err(Error::OutOfBounds);
            }
            let end = s.base.checked_add(s.size).ok_or(Error::OutOfBounds)?;
            if let Some(prev_end) = prev_end {
                if s.base < prev_end {
                    return Err(Error::NotAligned);
                }
            }
            prev_end = Some(end);
        }
        Ok(SectorMap { sectors })
    }

    pub fn sectors(&self) -> &'a [SectorDescriptor] {
        self.sectors
    }

    pub fn get(&self, position: usize) -> Option<&'a SectorDescriptor> {
        self.sectors.get(position)
    }

    /// Position of the sector holding `address`.
    pub fn find(&self, address: u32) -> Option<usize> {
        let idx = self.sectors.partition_point(|s| s.base <= address);
        if idx == 0 {
            return None;
        }
        if self.sectors[idx - 1].region().contains(address) {
            Some(idx - 1)
        } else {
            None
        }
    }

    /// Resolve a region to the whole sectors that make it up.  The region must
    /// start on a sector base, end on a sector end, and not cross a gap.
    pub fn resolve(&self, region: &Region) -> Result<SectorSpan> {
        if region.is_empty() {
            return Err(Error::NotAligned);
        }
        let first = self.find(region.start()).ok_or(Error::OutOfBounds)?;
        if self.sectors[first].base != region.start() {
            return Err(Error::NotAligned);
        }

        let mut cursor = region.start();
        for (pos, s) in self.sectors.iter().enumerate().skip(first) {
            if s.base != cursor {
                // A gap in the table.
                return Err(Error::NotAligned);
            }
            cursor = s.end();
            if cursor == region.end() {
                return Ok(SectorSpan { first, last: pos });
            }
            if cursor > region.end() {
                return Err(Error::NotAligned);
            }
        }
        Err(Error::OutOfBounds)
    }

    /// The address range covered by a span.
    pub fn span_region(&self, span: &SectorSpan) -> Region {
        let first = &self.sectors[span.first];
        let last = &self.sectors[span.last];
        Region::new(first.base, last.end() - first.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // STM32F4 style, with the first sector held back for the bootloader.
    static F4: [SectorDescriptor; 4] = [
        SectorDescriptor::new(0x0800_4000, 0x4000, 1),
        SectorDescriptor::new(0x0800_8000, 0x4000, 2),
        SectorDescriptor::new(0x0800_c000, 0x4000, 3),
        SectorDescriptor::new(0x0801_0000, 0x1_0000, 4),
    ];

    #[test]
    fn find_sectors() {
        let map = SectorMap::new(&F4).unwrap();
        assert_eq!(map.find(0x0800_0000), None);
        assert_eq!(map.find(0x0800_4000), Some(0));
        assert_eq!(map.find(0x0800_7fff), Some(0));
        assert_eq!(map.find(0x0801_ffff), Some(3));
        assert_eq!(map.find(0x0802_0000), None);
    }

    #[test]
    fn resolve_whole_sectors() {
        let map = SectorMap::new(&F4).unwrap();
        let span = map.resolve(&Region::new(0x0800_4000, 0x8000)).unwrap();
        assert_eq!(span, SectorSpan { first: 0, last: 1 });
        assert_eq!(map.span_region(&span), Region::new(0x0800_4000, 0x8000));

        assert_eq!(
            map.resolve(&Region::new(0x0800_4000, 0x4001)),
            Err(Error::NotAligned)
        );
        assert_eq!(
            map.resolve(&Region::new(0x0800_4800, 0x3800)),
            Err(Error::NotAligned)
        );
        assert_eq!(
            map.resolve(&Region::new(0x0801_0000, 0x2_0000)),
            Err(Error::OutOfBounds)
        );
        assert_eq!(map.resolve(&Region::new(0x0800_4000, 0)), Err(Error::NotAligned));
    }

    #[test]
    fn gaps_do_not_resolve() {
        static GAPPED: [SectorDescriptor; 2] = [
            SectorDescriptor::new(0x1000, 0x1000, 0),
            SectorDescriptor::new(0x3000, 0x1000, 2),
        ];
        let map = SectorMap::new(&GAPPED).unwrap();
        assert_eq!(map.find(0x2000), None);
        assert_eq!(map.resolve(&Region::new(0x1000, 0x3000)), Err(Error::NotAligned));
        assert!(map.resolve(&Region::new(0x3000, 0x1000)).is_ok());
    }

    #[test]
    fn bad_tables() {
        let overlap = [
            SectorDescriptor::new(0x1000, 0x1000, 0),
            SectorDescriptor::new(0x1800, 0x1000, 1),
        ];
        assert!(SectorMap::new(&overlap).is_err());
        let unsorted = [
            SectorDescriptor::new(0x2000, 0x1000, 0),
            SectorDescriptor::new(0x1000, 0x1000, 1),
        ];
        assert!(SectorMap::new(&unsorted).is_err());
        let empty = [SectorDescriptor::new(0x2000, 0, 0)];
        assert!(SectorMap::new(&empty).is_err());
    }

    #[test]
    fn uniform_table() {
        let pages: [SectorDescriptor; 4] = SectorDescriptor::uniform(0x100, 0x200, 7);
        assert_eq!(pages[3], SectorDescriptor::new(0x700, 0x200, 10));
        assert!(SectorMap::new(&pages).is_ok());
    }

    #[test]
    fn region_overlap() {
        let boot = Region::new(0x0800_0000, 0x4000);
        assert!(boot.overlaps(&Region::new(0x0800_3fff, 1)));
        assert!(!boot.overlaps(&Region::new(0x0800_4000, 0x4000)));
        assert!(!boot.overlaps(&Region::new(0x0800_0000, 0)));
        assert!(boot.contains_region(&Region::new(0x0800_0000, 0x800)));
        assert!(Region::checked(0xffff_ff00, 0x200).is_none());
    }
}
