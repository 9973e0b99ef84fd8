//! Physical and virtual memory management.

pub mod boot;
pub mod buddy;
pub mod global;
pub mod rangeset;
pub mod region;
pub mod slab;
pub mod vregion;

mod bitmap;
mod linked_list;

#[cfg(test)]
pub(crate) mod testing;

pub use self::{
    boot::BootMemory,
    buddy::BuddyAllocator,
    global::{GlobalHeap, LockedVirtualRegions, MemoryManager},
    rangeset::{Error as RangeError, Range, RangeSet},
    region::{Region, RegionRegistry},
    slab::ChunkAllocator,
    vregion::VirtualRegions,
};

use crate::unit::{self, KIB};
use core::fmt;
use displaydoc_lite::displaydoc;

/// The size of a single page in memory.
///
/// This is also the size of an order-0 block
/// inside the buddy allocator.
pub const PAGE_SIZE: usize = 4 * KIB;

/// `log2(PAGE_SIZE)`
pub const PAGE_SHIFT: usize = 12;

/// Result for every memory management operation.
pub type Result<T, E = Error> = core::result::Result<T, E>;

displaydoc! {
    /// Any error that can happen while managing memory.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        /// tried to add a region that does not contain a single page.
        RegionTooSmall,
        /// tried to add a region that overflows or overlaps another region.
        InvalidRegion,
        /// tried to add more regions than the registry can hold.
        TooManyRegions,
        /// tried to allocate an order that exceeded the maximum order.
        OrderTooLarge,
        /// tried to allocate, but there was no free memory left.
        NoMemoryAvailable,
        /// tried to allocate zero bytes.
        ZeroSize,
        /// tried to allocate an object larger than the largest size class.
        SizeTooLarge,
        /// tried to reserve or release zero pages.
        ZeroPages,
        /// the address is not aligned to the page size.
        Misaligned,
        /// the range lies outside of the managed address space.
        OutOfBounds,
        /// the allocator configuration is invalid.
        InvalidConfig,
        /// the boot memory map rejected a range.
        RangeSet,
    }
}

impl From<RangeError> for Error {
    fn from(err: RangeError) -> Self {
        log::debug!("memory map: {}", err);
        Error::RangeSet
    }
}

/// Statistics for a memory allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocStats {
    /// The name of the allocator that collected these stats.
    pub name: &'static str,
    /// The number of bytes that were requested over the lifetime of the allocator.
    pub requested: usize,
    /// Bytes lost to rounding, either of requests or of region boundaries.
    pub wasted: usize,
    /// The number of bytes that are currently handed out.
    pub allocated: usize,
    /// The number of bytes that are left for allocation.
    pub free: usize,
    /// The total number of bytes that this allocator has available for allocation.
    pub total: usize,
}

impl AllocStats {
    /// Create a new [`AllocStats`] instance for the given allocator name.
    pub const fn with_name(name: &'static str) -> Self {
        Self {
            name,
            requested: 0,
            wasted: 0,
            allocated: 0,
            free: 0,
            total: 0,
        }
    }

    pub(crate) fn on_alloc(&mut self, size: usize) {
        self.free = self.free.saturating_sub(size);
        self.allocated = self.allocated.saturating_add(size);
    }

    pub(crate) fn on_dealloc(&mut self, size: usize) {
        self.free = self.free.saturating_add(size);
        self.allocated = self.allocated.saturating_sub(size);
    }
}

impl fmt::Display for AllocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        self.name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f, "\nRequested: {}", unit::bytes(self.requested))?;
        writeln!(f, "Wasted:    {}", unit::bytes(self.wasted))?;
        writeln!(f, "Allocated: {}", unit::bytes(self.allocated))?;
        writeln!(f, "Free:      {}", unit::bytes(self.free))?;
        writeln!(f, "Total:     {}", unit::bytes(self.total))?;
        self.name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f)?;
        Ok(())
    }
}

/// Aligns the given `addr` upwards to `align`.
///
/// `align` must be a power of two.
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Aligns the given `addr` downwards to `align`.
///
/// `align` must be a power of two.
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}
