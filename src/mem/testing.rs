//! Fixtures shared by the allocator tests.

use super::{
    buddy::{BuddyAllocator, Metadata},
    region::RegionRegistry,
};
use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, Layout};

/// Allocate a zeroed, leaked block of host memory and return its address.
pub fn arena(size: usize, align: usize) -> usize {
    let layout = Layout::from_size_align(size, align).unwrap();
    let ptr = unsafe { alloc_zeroed(layout) };
    assert!(!ptr.is_null(), "failed to allocate test arena");
    ptr as usize
}

/// Leak metadata storage for `registry`.
pub fn metadata(registry: &RegionRegistry) -> Metadata<'static> {
    let layout = Metadata::layout(registry).unwrap();
    let storage = arena(layout.size().max(1), layout.align());
    unsafe { Metadata::from_raw(NonNull::new(storage as *mut u8).unwrap(), registry).unwrap() }
}

/// A buddy allocator over the given `(start, size)` regions.
///
/// The regions don't have to be backed by memory, as long as the test
/// never writes to the pages it claims.
pub fn buddy(max_order: usize, regions: &[(usize, usize)]) -> BuddyAllocator<'static> {
    let mut registry = RegionRegistry::new(max_order);
    for &(start, size) in regions {
        registry.add(start, size).unwrap();
    }

    let metadata = metadata(&registry);
    unsafe { BuddyAllocator::new(registry, metadata) }
}

/// A buddy allocator over `size` bytes of real, leaked memory.
///
/// The arena is aligned to the largest block, so the allocator starts out
/// with nothing but blocks of the highest order.
pub fn backed_buddy(max_order: usize, size: usize) -> BuddyAllocator<'static> {
    let align = super::buddy::size_for_order(max_order - 1);
    let start = arena(size, align);
    buddy(max_order, &[(start, size)])
}
