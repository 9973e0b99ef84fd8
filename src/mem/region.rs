//! The registry of physical memory regions managed by the buddy allocator.
//!
//! Physical memory is usually not one contiguous block, but the buddy
//! allocator wants to index its per-page metadata and bitmaps with a single
//! number. The registry maps every managed page to a *flat page index*.
//!
//! Regions are laid out one after another in the flat index space, but every
//! region starts in a fresh window of `2^(max_order - 1)` indices, at the same
//! offset its first page has inside a physical window of that size. Two pages
//! that are buddies physically are therefore buddies in the flat index space
//! too, and pages of different regions never share a pair bit.

use super::{align_down, align_up, Error, Result, PAGE_SIZE};
use core::slice;

/// The maximum number of discontiguous regions that can be registered.
pub const MAX_REGIONS: usize = 32;

/// One physically contiguous span of usable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// The first byte of the region, aligned to the page size.
    pub start: usize,
    /// The first byte after the region, aligned to the page size.
    pub end: usize,
    /// The number of usable bytes.
    pub size: usize,
    /// The number of pages.
    pub pages: usize,
    /// The flat page index of the first page.
    pub flat_base: usize,
    /// Bytes of the reported region that were lost to page alignment.
    pub wasted: usize,
}

impl Region {
    const EMPTY: Region = Region {
        start: 0,
        end: 0,
        size: 0,
        pages: 0,
        flat_base: 0,
        wasted: 0,
    };

    /// Check if `addr` is part of this region.
    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// Check if the flat page `index` belongs to this region.
    pub fn contains_index(&self, index: usize) -> bool {
        (self.flat_base..self.flat_base + self.pages).contains(&index)
    }
}

/// Fixed size list of all [regions](Region) known to the buddy allocator.
#[derive(Debug, Clone)]
pub struct RegionRegistry {
    regions: [Region; MAX_REGIONS],
    len: usize,
    max_order: usize,
    /// The number of pages inside one flat index window.
    window: usize,
    /// The length of the flat index space, including padding between regions.
    span: usize,
}

impl RegionRegistry {
    /// Create an empty registry for a buddy allocator with `max_order` orders.
    pub const fn new(max_order: usize) -> Self {
        Self {
            regions: [Region::EMPTY; MAX_REGIONS],
            len: 0,
            max_order,
            window: 1 << max_order.saturating_sub(1),
            span: 0,
        }
    }

    /// Register the memory `start..start + size`.
    ///
    /// The start is rounded up and the end rounded down to the page size.
    pub fn add(&mut self, start: usize, size: usize) -> Result<Region> {
        let end = start.checked_add(size).ok_or(Error::InvalidRegion)?;
        let aligned_start = start
            .checked_add(PAGE_SIZE - 1)
            .map(|addr| align_down(addr, PAGE_SIZE))
            .ok_or(Error::RegionTooSmall)?
            // page zero can't be handed out as a `NonNull` pointer
            .max(PAGE_SIZE);
        let aligned_end = align_down(end, PAGE_SIZE);

        if aligned_end <= aligned_start {
            return Err(Error::RegionTooSmall);
        }

        if self
            .iter()
            .any(|other| other.start < aligned_end && aligned_start < other.end)
        {
            return Err(Error::InvalidRegion);
        }

        if self.len == MAX_REGIONS {
            return Err(Error::TooManyRegions);
        }

        let pages = (aligned_end - aligned_start) / PAGE_SIZE;
        let start_pfn = aligned_start / PAGE_SIZE;
        let flat_base = align_up(self.span, self.window) + start_pfn % self.window;

        let region = Region {
            start: aligned_start,
            end: aligned_end,
            size: aligned_end - aligned_start,
            pages,
            flat_base,
            wasted: size - (aligned_end - aligned_start),
        };

        self.regions[self.len] = region;
        self.len += 1;
        self.span = flat_base + pages;
        Ok(region)
    }

    /// Translate a physical address into its flat page index.
    pub fn page_index(&self, addr: usize) -> Option<usize> {
        let region = self.region_of(addr)?;
        Some(region.flat_base + (addr - region.start) / PAGE_SIZE)
    }

    /// Translate a flat page index back into the address of the page.
    pub fn address_of(&self, index: usize) -> Option<usize> {
        let region = self.iter().find(|r| r.contains_index(index))?;
        Some(region.start + (index - region.flat_base) * PAGE_SIZE)
    }

    /// Return the region that contains `addr`.
    pub fn region_of(&self, addr: usize) -> Option<&Region> {
        self.iter().find(|r| r.contains(addr))
    }

    /// Check if `addr` lies inside any registered region.
    pub fn contains(&self, addr: usize) -> bool {
        self.region_of(addr).is_some()
    }

    /// The number of buddy orders this registry was laid out for.
    pub fn max_order(&self) -> usize {
        self.max_order
    }

    /// The length of the flat index space.
    ///
    /// This is the number of per-page entries the buddy allocator needs,
    /// which is larger than [`Self::total_pages`] if there are holes.
    pub fn span(&self) -> usize {
        self.span
    }

    /// The number of pages inside all regions.
    pub fn total_pages(&self) -> usize {
        self.iter().map(|r| r.pages).sum()
    }

    /// The number of bytes lost to page alignment of all regions.
    pub fn wasted(&self) -> usize {
        self.iter().map(|r| r.wasted).sum()
    }

    /// Return an iterator over all regions.
    pub fn iter(&self) -> slice::Iter<'_, Region> {
        self.regions[..self.len].iter()
    }

    /// Return the number of regions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no region was registered yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
