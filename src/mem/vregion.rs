//! Tracker for free ranges of a virtual address space.
//!
//! Free ranges are kept in an ordered map keyed by their base address, plus
//! a second map keyed by their end address, so a released range finds both
//! of its possible neighbours with a single lookup each. Free ranges are
//! never adjacent to each other: every release merges with its neighbours.

use super::{Error, Result, PAGE_SIZE};
use alloc::collections::BTreeMap;
use core::ops::Range;

/// The free parts of one virtual address space.
///
/// The kernel and every process each own a separate instance.
#[derive(Debug, Clone)]
pub struct VirtualRegions {
    bounds: Range<usize>,
    /// base -> size in bytes
    by_base: BTreeMap<usize, usize>,
    /// end -> base
    by_end: BTreeMap<usize, usize>,
}

impl VirtualRegions {
    /// Create a tracker where the whole `bounds` range is free.
    pub fn new(bounds: Range<usize>) -> Result<Self> {
        if bounds.start >= bounds.end
            || bounds.start % PAGE_SIZE != 0
            || bounds.end % PAGE_SIZE != 0
        {
            return Err(Error::InvalidRegion);
        }

        let mut this = Self {
            bounds: bounds.clone(),
            by_base: BTreeMap::new(),
            by_end: BTreeMap::new(),
        };
        this.insert(bounds.start, bounds.end - bounds.start);
        Ok(this)
    }

    /// Reserve `pages` pages and return the base address of the range.
    ///
    /// The free range with the lowest address that is large enough is used.
    pub fn reserve(&mut self, pages: usize) -> Result<usize> {
        if pages == 0 {
            return Err(Error::ZeroPages);
        }
        let size = pages.checked_mul(PAGE_SIZE).ok_or(Error::NoMemoryAvailable)?;

        let (base, len) = match self.by_base.iter().find(|(_, &len)| len >= size) {
            Some((&base, &len)) => (base, len),
            None => {
                log::warn!("vregion: no free range of {} pages", pages);
                return Err(Error::NoMemoryAvailable);
            }
        };

        self.by_base.remove(&base);
        if len == size {
            self.by_end.remove(&(base + len));
        } else {
            self.by_base.insert(base + size, len - size);
            self.by_end.insert(base + len, base + size);
        }

        log::trace!("vregion: reserved {:#x}..{:#x}", base, base + size);
        Ok(base)
    }

    /// Give `pages` pages starting at `addr` back.
    ///
    /// # Panics
    ///
    /// If any part of the range is already free.
    pub fn release(&mut self, addr: usize, pages: usize) -> Result<()> {
        if pages == 0 {
            return Err(Error::ZeroPages);
        }
        if addr % PAGE_SIZE != 0 {
            return Err(Error::Misaligned);
        }

        let end = pages
            .checked_mul(PAGE_SIZE)
            .and_then(|size| addr.checked_add(size))
            .ok_or(Error::OutOfBounds)?;
        if addr < self.bounds.start || end > self.bounds.end {
            return Err(Error::OutOfBounds);
        }

        // free ranges are disjoint, so only the closest one below `end` can overlap
        if let Some((&base, &len)) = self.by_base.range(..end).next_back() {
            assert!(
                base + len <= addr,
                "vregion: release of {:#x}..{:#x} overlaps free range {:#x}..{:#x}",
                addr,
                end,
                base,
                base + len
            );
        }

        if let Some(len) = self.by_base.remove(&end) {
            // extend the following range downwards, and merge it
            // with the range that ends where it now begins
            self.by_end.remove(&(end + len));
            let mut base = addr;
            let mut len = len + (end - addr);
            while let Some(prev) = self.by_end.remove(&base) {
                len += self.take_base(prev);
                base = prev;
            }
            self.insert(base, len);
        } else if let Some(base) = self.by_end.remove(&addr) {
            // extend the preceding range upwards
            let len = self.take_base(base);
            self.insert(base, len + (end - addr));
        } else {
            self.insert(addr, end - addr);
        }

        log::trace!("vregion: released {:#x}..{:#x}", addr, end);
        Ok(())
    }

    /// Remove the range starting at `base`, which the end map pointed to.
    fn take_base(&mut self, base: usize) -> usize {
        match self.by_base.remove(&base) {
            Some(len) => len,
            None => panic!("vregion: end map points to {:#x}, which is not a free range", base),
        }
    }

    fn insert(&mut self, base: usize, len: usize) {
        self.by_base.insert(base, len);
        self.by_end.insert(base + len, base);
    }

    /// Iterate over all free ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.by_base.iter().map(|(&base, &len)| base..base + len)
    }

    /// The number of free ranges.
    pub fn len(&self) -> usize {
        self.by_base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_base.is_empty()
    }

    /// The number of free pages.
    pub fn free_pages(&self) -> usize {
        self.by_base.values().sum::<usize>() / PAGE_SIZE
    }

    /// Check if the page containing `addr` is free.
    pub fn is_free(&self, addr: usize) -> bool {
        self.by_base
            .range(..=addr)
            .next_back()
            .map_or(false, |(&base, &len)| addr < base + len)
    }

    pub fn bounds(&self) -> Range<usize> {
        self.bounds.clone()
    }
}
