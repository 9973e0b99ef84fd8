//! Thread safe front-ends for the allocators.
//!
//! Whenever both allocators are needed, the chunk allocator is locked
//! before the buddy allocator.

use super::{
    buddy::{order_for_size, BuddyAllocator},
    slab::{ChunkAllocator, MAX_SIZE},
    vregion::VirtualRegions,
    AllocStats, Error, Result,
};
use crate::Config;
use core::{
    alloc::{GlobalAlloc, Layout},
    ops::Range,
    ptr::{self, NonNull},
};
use spin::{Mutex, MutexGuard, Once};

/// The central structure that owns the page and the chunk allocator.
pub struct MemoryManager<'m> {
    chunks: Mutex<ChunkAllocator>,
    pages: Mutex<BuddyAllocator<'m>>,
}

impl<'m> MemoryManager<'m> {
    /// Create a memory manager on top of `pages` and prefill the chunk pools.
    pub fn new(config: Config, mut pages: BuddyAllocator<'m>) -> Result<Self> {
        config.validate()?;
        if config.max_order != pages.max_order() {
            return Err(Error::InvalidConfig);
        }

        let mut chunks = ChunkAllocator::new(config)?;
        chunks.prefill(&mut pages)?;

        Ok(Self {
            chunks: Mutex::new(chunks),
            pages: Mutex::new(pages),
        })
    }

    /// Allocate `2^order` contiguous pages.
    pub fn claim_pages(&self, order: usize) -> Result<NonNull<u8>> {
        self.pages.lock().claim(order)
    }

    /// Return pages that were allocated using [`claim_pages`](Self::claim_pages).
    ///
    /// # Safety
    ///
    /// The pages must not be used after calling this method.
    pub unsafe fn release_pages(&self, addr: NonNull<u8>, order: usize) {
        self.pages.lock().release(addr, order)
    }

    /// Allocate a small object of up to 64 KiB.
    pub fn allocate_small(&self, size: usize) -> Result<NonNull<u8>> {
        let mut chunks = self.chunks.lock();
        let mut pages = self.pages.lock();
        chunks.allocate(&mut pages, size)
    }

    /// Free an object that was allocated using [`allocate_small`](Self::allocate_small).
    ///
    /// # Safety
    ///
    /// The object must not be used after calling this method.
    pub unsafe fn free_small(&self, ptr: NonNull<u8>) {
        let mut chunks = self.chunks.lock();
        let pages = self.pages.lock();
        chunks.free(&pages, ptr)
    }

    /// Return every unused chunk but the first of each pool to the page allocator.
    pub fn reclaim(&self) -> usize {
        let mut chunks = self.chunks.lock();
        let mut pages = self.pages.lock();
        chunks.reclaim(&mut pages)
    }

    /// Return the statistics of the page allocator.
    pub fn page_stats(&self) -> AllocStats {
        self.pages.lock().stats()
    }

    /// Return the statistics of the chunk allocator.
    pub fn chunk_stats(&self) -> AllocStats {
        self.chunks.lock().stats()
    }
}

unsafe impl GlobalAlloc for MemoryManager<'_> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // slots and blocks are aligned to their size
        let size = layout.size().max(layout.align());
        let block = if size <= MAX_SIZE {
            self.allocate_small(size)
        } else {
            self.claim_pages(order_for_size(size))
        };

        block.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return,
        };

        let size = layout.size().max(layout.align());
        if size <= MAX_SIZE {
            self.free_small(ptr)
        } else {
            self.release_pages(ptr, order_for_size(size))
        }
    }
}

/// A [`MemoryManager`] that can be stored inside a `static` and
/// installed as the `#[global_allocator]` before it is initialized.
///
/// Every allocation fails until [`GlobalHeap::init`] was called.
pub struct GlobalHeap(Once<MemoryManager<'static>>);

impl GlobalHeap {
    pub const fn new() -> Self {
        Self(Once::new())
    }

    /// Install the memory manager.
    ///
    /// If the heap was initialized before, `manager` is dropped and
    /// the existing one is returned.
    pub fn init(&self, manager: MemoryManager<'static>) -> &MemoryManager<'static> {
        self.0.call_once(|| manager)
    }

    pub fn get(&self) -> Option<&MemoryManager<'static>> {
        self.0.get()
    }
}

impl Default for GlobalHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.get() {
            Some(manager) => manager.alloc(layout),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(manager) = self.get() {
            manager.dealloc(ptr, layout)
        }
    }
}

/// A [`VirtualRegions`] tracker behind a lock.
pub struct LockedVirtualRegions(Mutex<VirtualRegions>);

impl LockedVirtualRegions {
    pub fn new(bounds: Range<usize>) -> Result<Self> {
        VirtualRegions::new(bounds).map(|regions| Self(Mutex::new(regions)))
    }

    /// Reserve `pages` pages of address space.
    pub fn reserve_virtual_range(&self, pages: usize) -> Result<usize> {
        self.0.lock().reserve(pages)
    }

    /// Return address space that was reserved using
    /// [`reserve_virtual_range`](Self::reserve_virtual_range).
    pub fn release_virtual_range(&self, addr: usize, pages: usize) -> Result<()> {
        self.0.lock().release(addr, pages)
    }

    pub fn lock(&self) -> MutexGuard<'_, VirtualRegions> {
        self.0.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{testing, PAGE_SIZE};
    use std::{sync::Arc, thread};

    fn manager() -> MemoryManager<'static> {
        MemoryManager::new(Config::new(), testing::backed_buddy(11, 0x40_0000)).unwrap()
    }

    #[test]
    fn config_must_match_the_buddy() {
        let pages = testing::backed_buddy(11, 0x40_0000);
        let config = Config::new().with_max_order(10);
        assert!(matches!(
            MemoryManager::new(config, pages),
            Err(Error::InvalidConfig)
        ));
    }

    #[test]
    fn pools_are_prefilled() {
        let manager = manager();
        let stats = manager.chunk_stats();
        assert!(stats.total > 0);
        assert_eq!(stats.allocated, 0);
        assert_eq!(manager.page_stats().allocated, stats.total + PAGE_SIZE);
    }

    #[test]
    fn small_and_page_allocations() {
        let manager = manager();

        let obj = manager.allocate_small(40).unwrap();
        assert_eq!(obj.as_ptr() as usize % 64, 0);
        assert_eq!(manager.chunk_stats().allocated, 64);
        unsafe { manager.free_small(obj) };
        assert_eq!(manager.chunk_stats().allocated, 0);

        let before = manager.page_stats().allocated;
        let block = manager.claim_pages(2).unwrap();
        assert_eq!(block.as_ptr() as usize % (4 * PAGE_SIZE), 0);
        assert_eq!(manager.page_stats().allocated, before + 4 * PAGE_SIZE);
        unsafe { manager.release_pages(block, 2) };
        assert_eq!(manager.page_stats().allocated, before);

        assert_eq!(manager.claim_pages(11), Err(Error::OrderTooLarge));
    }

    #[test]
    fn global_alloc_routes_by_size() {
        let manager = manager();
        unsafe {
            let small = Layout::from_size_align(24, 8).unwrap();
            let ptr = manager.alloc(small);
            assert!(!ptr.is_null());
            assert!(manager.chunk_stats().allocated > 0);
            manager.dealloc(ptr, small);

            // over-aligned small objects use a larger class
            let aligned = Layout::from_size_align(16, 256).unwrap();
            let ptr = manager.alloc(aligned);
            assert_eq!(ptr as usize % 256, 0);
            manager.dealloc(ptr, aligned);
            assert_eq!(manager.chunk_stats().allocated, 0);

            let before = manager.page_stats().allocated;
            let large = Layout::from_size_align(100 * 1024, 8).unwrap();
            let ptr = manager.alloc(large);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % (32 * PAGE_SIZE), 0);
            assert_eq!(manager.page_stats().allocated, before + 32 * PAGE_SIZE);
            manager.dealloc(ptr, large);
            assert_eq!(manager.page_stats().allocated, before);

            let huge = Layout::from_size_align(0x100_0000, 8).unwrap();
            assert!(manager.alloc(huge).is_null());
        }
    }

    #[test]
    fn reclaim_through_the_manager() {
        let manager = manager();
        let objects = (0..600)
            .map(|_| manager.allocate_small(MAX_SIZE / 64).unwrap())
            .collect::<Vec<_>>();

        for obj in objects {
            unsafe { manager.free_small(obj) };
        }
        assert!(manager.reclaim() > 0);
        assert_eq!(manager.reclaim(), 0);
    }

    #[test]
    fn global_heap_before_and_after_init() {
        let heap = GlobalHeap::new();
        let layout = Layout::from_size_align(32, 8).unwrap();
        assert!(heap.get().is_none());
        assert!(unsafe { heap.alloc(layout) }.is_null());

        heap.init(manager());
        let ptr = unsafe { heap.alloc(layout) };
        assert!(!ptr.is_null());
        unsafe { heap.dealloc(ptr, layout) };
        assert!(heap.get().is_some());
    }

    #[test]
    fn concurrent_allocations() {
        let manager = Arc::new(manager());

        let workers = (0..4)
            .map(|worker| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    for round in 0..200usize {
                        let size = 8 << ((worker + round) % 8);
                        let obj = manager.allocate_small(size).unwrap();
                        unsafe {
                            obj.as_ptr().write_bytes(worker as u8, size);
                            assert_eq!(*obj.as_ptr().add(size - 1), worker as u8);
                            manager.free_small(obj);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(manager.chunk_stats().allocated, 0);
    }

    #[test]
    fn locked_virtual_regions() {
        let regions = LockedVirtualRegions::new(0x4000_0000..0x4010_0000).unwrap();
        let a = regions.reserve_virtual_range(16).unwrap();
        let b = regions.reserve_virtual_range(16).unwrap();
        assert_eq!(b, a + 16 * PAGE_SIZE);

        regions.release_virtual_range(a, 16).unwrap();
        regions.release_virtual_range(b, 16).unwrap();
        assert_eq!(regions.lock().len(), 1);
        assert_eq!(regions.lock().free_pages(), 0x100);
        assert_eq!(regions.release_virtual_range(a, 0), Err(Error::ZeroPages));
    }
}
