//! The memory map that exists before any real allocator does.
//!
//! The firmware reports usable memory, the kernel removes everything that is
//! already in use (the kernel image, firmware data, ...), and small early
//! allocations are carved off the front of the remaining ranges. Whatever is
//! left afterwards is handed to the [buddy allocator](super::buddy).

use super::{
    align_down, align_up,
    rangeset::{Error as RangeError, Range, RangeSet},
    PAGE_SIZE,
};

/// Linear allocator over the firmware reported memory regions.
///
/// There is no way to free memory that was allocated using [`BootMemory::alloc`].
#[derive(Debug, Clone, Default)]
pub struct BootMemory {
    memory: RangeSet,
}

impl BootMemory {
    /// Create a boot memory map without any memory.
    pub const fn new() -> Self {
        Self {
            memory: RangeSet::new(),
        }
    }

    /// Make `size` bytes starting at `start` available.
    pub fn add_region(&mut self, start: usize, size: usize) -> Result<(), RangeError> {
        let range = Range::from_size(start, size).ok_or(RangeError::InvalidRange)?;
        self.memory.insert(range)
    }

    /// Remove `size` bytes starting at `start` from the available memory.
    pub fn reserve(&mut self, start: usize, size: usize) -> Result<(), RangeError> {
        let range = Range::from_size(start, size).ok_or(RangeError::InvalidRange)?;
        self.memory.remove_range(range)
    }

    /// Allocate `size` bytes aligned to `align` from the first range they fit in.
    ///
    /// `align` must be a power of two.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }

        let (front, addr) = self.memory.iter().find_map(|range| {
            let addr = align_up(range.start, align);
            let last = addr.checked_add(size - 1)?;
            (addr >= range.start && last <= range.end).then(|| (range.start, addr))
        })?;

        // the alignment gap in front of the allocation is lost as well
        let used = Range::new(front, addr + size - 1);
        self.memory.remove_range(used).ok()?;

        log::trace!("boot memory: allocated {:#x} bytes at {:#x}", size, addr);
        Some(addr)
    }

    /// The number of whole pages that are still available.
    pub fn free_pages(&self) -> usize {
        self.regions().map(|(_, size)| size / PAGE_SIZE).sum()
    }

    /// Iterate over the page aligned parts of all remaining ranges as `(start, size)` pairs.
    ///
    /// Ranges that don't contain a single whole page are skipped.
    pub fn regions(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.memory.iter().filter_map(|range| {
            let start = align_up(range.start, PAGE_SIZE);
            let end = align_down(range.end.saturating_add(1), PAGE_SIZE);
            (end > start).then(|| (start, end - start))
        })
    }

    /// Access the raw ranges, including parts that are not page aligned.
    pub fn ranges(&self) -> &RangeSet {
        &self.memory
    }
}
