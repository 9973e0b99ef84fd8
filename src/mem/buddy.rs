//! Implementation of a Buddy Allocator that is responsible for allocating
//! pages that will then be used by either the chunk allocator
//! to allocate objects, or directly by the kernel.
//!
//! All bookkeeping lives in a separate [`Metadata`] block, which holds one
//! [`Frame`] per page and one pair bitmap per order. The allocator itself
//! never reads or writes the memory it hands out.
//!
//! # Pair bitmaps
//!
//! For every order `k < max_order - 1` there is one bit per pair of
//! buddies. The bit is flipped whenever one of the two buddies is pushed to,
//! or removed from, the order `k` free list. It is therefore set if and only
//! if exactly one of the buddies is free, which lets [`BuddyAllocator::release`]
//! decide whether to merge without searching any list.

use super::{
    bitmap::{words_for, Bitmap},
    boot::BootMemory,
    linked_list::FrameList,
    region::RegionRegistry,
    AllocStats, Error, Result, PAGE_SIZE,
};
use crate::unit;
use bitflags::bitflags;
use core::{
    alloc::Layout,
    mem,
    ptr::{self, NonNull},
    slice,
};

/// The upper bound for the number of orders a buddy allocator can manage.
pub const ORDER_LIMIT: usize = 16;

/// Marks the end of a [`FrameList`] and frames without an owner.
pub(crate) const NIL: u32 = u32::MAX;

/// Calculates the number of bytes inside the `order`.
pub const fn size_for_order(order: usize) -> usize {
    (1 << order) * PAGE_SIZE
}

/// Calculates the smallest order that can hold `size` bytes.
pub fn order_for_size(size: usize) -> usize {
    let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    pages.max(1).next_power_of_two().trailing_zeros() as usize
}

bitflags! {
    /// The state of a single page frame.
    pub struct FrameFlags: u8 {
        /// The frame is the first page of a free block.
        const FREE = 1 << 0;
        /// The frame is the first page of an allocated block.
        const HEAD = 1 << 1;
        /// The page belongs to a chunk of the chunk allocator.
        const CHUNK = 1 << 2;
    }
}

/// Per-page metadata.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub(super) next: u32,
    pub(super) prev: u32,
    owner: u32,
    order: u8,
    flags: FrameFlags,
}

impl Frame {
    pub(crate) const EMPTY: Frame = Frame {
        next: NIL,
        prev: NIL,
        owner: NIL,
        order: 0,
        flags: FrameFlags::empty(),
    };

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// The order of the block this frame is the head of.
    pub fn order(&self) -> usize {
        self.order as usize
    }
}

/// The frame table and pair bitmaps for a [`BuddyAllocator`].
#[derive(Debug)]
pub struct Metadata<'m> {
    frames: &'m mut [Frame],
    bitmaps: [Bitmap<'m>; ORDER_LIMIT],
}

impl<'m> Metadata<'m> {
    /// The size and alignment of the storage needed for the given regions.
    pub fn layout(registry: &RegionRegistry) -> Result<Layout> {
        let span = registry.span();
        if span >= NIL as usize {
            return Err(Error::InvalidRegion);
        }

        let words = (0..registry.max_order().saturating_sub(1))
            .map(|order| words_for(pair_count(span, order)))
            .sum::<usize>();
        let size = frames_size(span) + words * mem::size_of::<u64>();

        Layout::from_size_align(size, mem::align_of::<u64>()).map_err(|_| Error::InvalidRegion)
    }

    /// Initialize the metadata for `registry` inside the memory at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of [`Metadata::layout`] bytes, aligned to
    /// its alignment and must not be used by anything else for `'m`.
    pub unsafe fn from_raw(ptr: NonNull<u8>, registry: &RegionRegistry) -> Result<Self> {
        let layout = Self::layout(registry)?;
        assert_eq!(
            ptr.as_ptr() as usize % layout.align(),
            0,
            "buddy: misaligned metadata storage at {:p}",
            ptr
        );

        let span = registry.span();
        let frames = ptr.as_ptr().cast::<Frame>();
        for idx in 0..span {
            ptr::write(frames.add(idx), Frame::EMPTY);
        }
        let frames = slice::from_raw_parts_mut(frames, span);

        let mut bitmaps: [Bitmap<'m>; ORDER_LIMIT] = Default::default();
        let mut words = ptr.as_ptr().add(frames_size(span)).cast::<u64>();
        for (order, bitmap) in bitmaps
            .iter_mut()
            .enumerate()
            .take(registry.max_order().saturating_sub(1))
        {
            let bits = pair_count(span, order);
            let count = words_for(bits);
            ptr::write_bytes(words, 0, count);
            *bitmap = Bitmap::new(slice::from_raw_parts_mut(words, count), bits);
            words = words.add(count);
        }

        Ok(Self { frames, bitmaps })
    }
}

/// The number of buddy pairs at `order` inside `span` frames.
fn pair_count(span: usize, order: usize) -> usize {
    let pair = 1 << (order + 1);
    (span + pair - 1) / pair
}

/// The size of the frame table, padded for the bitmap words behind it.
fn frames_size(span: usize) -> usize {
    super::align_up(span * mem::size_of::<Frame>(), mem::align_of::<u64>())
}

/// The central structure that is responsible for allocating memory
/// using the buddy algorithm.
pub struct BuddyAllocator<'m> {
    max_order: usize,
    registry: RegionRegistry,
    frames: &'m mut [Frame],
    lists: [FrameList; ORDER_LIMIT],
    bitmaps: [Bitmap<'m>; ORDER_LIMIT],
    stats: AllocStats,
}

impl<'m> BuddyAllocator<'m> {
    /// Create a buddy allocator that manages every page of `registry`.
    ///
    /// Every region is split into the largest naturally aligned blocks
    /// that fit, which are then made available for allocation.
    ///
    /// # Safety
    ///
    /// The regions must describe memory that is unused and directly accessible,
    /// because pages claimed from this allocator are written by their users.
    pub unsafe fn new(registry: RegionRegistry, metadata: Metadata<'m>) -> Self {
        let max_order = registry.max_order();
        assert!(
            (1..=ORDER_LIMIT).contains(&max_order),
            "buddy: invalid max order {}",
            max_order
        );
        assert!(
            metadata.frames.len() >= registry.span(),
            "buddy: metadata was created for a different registry"
        );

        let mut stats = AllocStats::with_name("Buddy Allocator");
        stats.total = registry.total_pages() * PAGE_SIZE;
        stats.free = stats.total;
        stats.wasted = registry.wasted();

        let Metadata { frames, bitmaps } = metadata;
        let mut this = Self {
            max_order,
            registry,
            frames,
            lists: [FrameList::new(); ORDER_LIMIT],
            bitmaps,
            stats,
        };

        let registry = this.registry.clone();
        for region in registry.iter() {
            log::debug!(
                "buddy: adding region {:#x}..{:#x} ({})",
                region.start,
                region.end,
                unit::bytes(region.size)
            );

            let end = region.flat_base + region.pages;
            let mut idx = region.flat_base;
            while idx < end {
                // the largest order that is aligned at `idx` and still fits
                let mut order = max_order - 1;
                while idx & ((1 << order) - 1) != 0 || idx + (1 << order) > end {
                    order -= 1;
                }

                this.append_free(idx, order);
                idx += 1 << order;
            }
        }

        log::info!(
            "buddy: {} available in {} regions",
            unit::bytes(this.stats.total),
            this.registry.len()
        );
        this
    }
}

impl BuddyAllocator<'static> {
    /// Build a buddy allocator from the memory left in `boot`.
    ///
    /// The metadata is allocated from `boot` itself, and the remaining
    /// memory is managed by the returned allocator.
    ///
    /// # Safety
    ///
    /// Every region inside `boot` must be unused, directly accessible memory.
    pub unsafe fn bootstrap(max_order: usize, mut boot: BootMemory) -> Result<Self> {
        let registry = registry_for(max_order, &boot)?;
        let layout = Metadata::layout(&registry)?;
        log::debug!(
            "buddy: allocating {} of metadata for {} pages",
            unit::bytes(layout.size()),
            registry.total_pages()
        );

        let storage = boot
            .alloc(layout.size(), layout.align())
            .and_then(|addr| NonNull::new(addr as *mut u8))
            .ok_or(Error::NoMemoryAvailable)?;

        // carving the metadata off the front of a region never grows the layout
        let registry = registry_for(max_order, &boot)?;
        if Metadata::layout(&registry)?.size() > layout.size() {
            return Err(Error::NoMemoryAvailable);
        }

        let metadata = Metadata::from_raw(storage, &registry)?;
        Ok(BuddyAllocator::new(registry, metadata))
    }
}

impl<'m> BuddyAllocator<'m> {
    /// Allocates a block of `2^order` pages.
    ///
    /// The returned block is aligned to its own size.
    pub fn claim(&mut self, order: usize) -> Result<NonNull<u8>> {
        if order >= self.max_order {
            return Err(Error::OrderTooLarge);
        }

        let found = match (order..self.max_order).find(|&k| !self.lists[k].is_empty()) {
            Some(found) => found,
            None => {
                log::warn!("buddy: out of memory while claiming order {}", order);
                return Err(Error::NoMemoryAvailable);
            }
        };

        let idx = self.pop_free(found).ok_or(Error::NoMemoryAvailable)?;

        // split the block, keeping the lower half and freeing the upper one
        let mut current = found;
        while current > order {
            current -= 1;
            self.push_free(idx + (1 << current), current);
        }

        let frame = &mut self.frames[idx];
        frame.flags = FrameFlags::HEAD;
        frame.order = order as u8;
        frame.owner = NIL;

        let size = size_for_order(order);
        self.stats.requested += size;
        self.stats.on_alloc(size);

        let addr = self.address_of(idx);
        log::trace!("buddy: claimed {:#x} (order {})", addr, order);
        NonNull::new(addr as *mut u8).ok_or(Error::NoMemoryAvailable)
    }

    /// Returns a block of `2^order` pages to this allocator and merges it
    /// with its buddies as far as possible.
    ///
    /// # Panics
    ///
    /// If `addr` is not the start of a block that was claimed with `order`,
    /// including if the block was already released.
    ///
    /// # Safety
    ///
    /// The block must not be used anymore after calling this method.
    pub unsafe fn release(&mut self, addr: NonNull<u8>, order: usize) {
        let addr = addr.as_ptr() as usize;
        let mut idx = match self.registry.page_index(addr) {
            Some(idx) => idx,
            None => panic!("buddy: release of untracked address {:#x} (order {})", addr, order),
        };

        assert!(
            order < self.max_order && idx & ((1 << order) - 1) == 0,
            "buddy: release of misaligned block {:#x} (order {})",
            addr,
            order
        );

        let frame = self.frames[idx];
        assert!(
            !frame.flags.contains(FrameFlags::FREE),
            "buddy: double release of {:#x} (order {})",
            addr,
            order
        );
        assert!(
            frame.flags.contains(FrameFlags::HEAD),
            "buddy: release of {:#x} (order {}), which is not an allocated block",
            addr,
            order
        );
        assert!(
            frame.order() == order,
            "buddy: release of {:#x} with order {}, but it was claimed with order {}",
            addr,
            order,
            frame.order()
        );

        for frame in &mut self.frames[idx..idx + (1 << order)] {
            frame.flags = FrameFlags::empty();
            frame.owner = NIL;
        }

        let size = size_for_order(order);
        self.stats.on_dealloc(size);
        log::trace!("buddy: released {:#x} (order {})", addr, order);

        let mut order = order;
        while order + 1 < self.max_order && self.bitmaps[order].test(idx >> (order + 1)) {
            let buddy = idx ^ (1 << order);
            let free = self
                .frames
                .get(buddy)
                .map_or(false, |f| f.flags.contains(FrameFlags::FREE) && f.order() == order);
            assert!(
                free,
                "buddy: pair bit of {:#x} is set at order {}, but its buddy is not free",
                addr,
                order
            );

            self.remove_free(buddy, order);
            idx = idx.min(buddy);
            order += 1;
        }

        self.push_free(idx, order);
    }

    /// Tag every page of the claimed block at `block` as owned by `owner`.
    ///
    /// This is used by the chunk allocator to find the chunk of a pointer.
    pub fn set_owner(&mut self, block: NonNull<u8>, order: usize, owner: u32) {
        let addr = block.as_ptr() as usize;
        let idx = match self.registry.page_index(addr) {
            Some(idx) => idx,
            None => panic!("buddy: tagging untracked address {:#x}", addr),
        };

        let frame = self.frames[idx];
        assert!(
            frame.flags.contains(FrameFlags::HEAD) && frame.order() == order,
            "buddy: tagging {:#x} (order {}), which is not an allocated block",
            addr,
            order
        );

        for frame in &mut self.frames[idx..idx + (1 << order)] {
            frame.flags.insert(FrameFlags::CHUNK);
            frame.owner = owner;
        }
    }

    /// Returns the owner tag of the page containing `addr`.
    pub fn owner_of(&self, addr: usize) -> Option<u32> {
        let frame = self.frames[self.registry.page_index(addr)?];
        frame
            .flags
            .contains(FrameFlags::CHUNK)
            .then(|| frame.owner)
    }

    /// The number of free blocks at `order`.
    pub fn free_blocks(&self, order: usize) -> usize {
        self.lists.get(order).map_or(0, FrameList::len)
    }

    /// The number of free pages across all orders.
    pub fn free_pages(&self) -> usize {
        self.lists[..self.max_order]
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() << order)
            .sum()
    }

    /// Iterate over the addresses of all free blocks at `order`.
    pub fn free_list(&self, order: usize) -> impl Iterator<Item = usize> + '_ {
        self.lists[order]
            .iter(&*self.frames)
            .map(move |idx| self.address_of(idx))
    }

    pub fn max_order(&self) -> usize {
        self.max_order
    }

    pub fn regions(&self) -> &RegionRegistry {
        &self.registry
    }

    /// Check if `addr` is managed by this allocator.
    pub fn contains(&self, addr: usize) -> bool {
        self.registry.contains(addr)
    }

    /// Returns a copy of the stats at the moment for this allocator.
    pub fn stats(&self) -> AllocStats {
        self.stats.clone()
    }

    fn address_of(&self, idx: usize) -> usize {
        match self.registry.address_of(idx) {
            Some(addr) => addr,
            None => panic!("buddy: frame {} is not part of any region", idx),
        }
    }

    fn toggle(&mut self, idx: usize, order: usize) {
        if order + 1 < self.max_order {
            self.bitmaps[order].toggle(idx >> (order + 1));
        }
    }

    fn mark_free(&mut self, idx: usize, order: usize) {
        let frame = &mut self.frames[idx];
        frame.flags = FrameFlags::FREE;
        frame.order = order as u8;
        frame.owner = NIL;
        self.toggle(idx, order);
    }

    fn push_free(&mut self, idx: usize, order: usize) {
        self.lists[order].push(self.frames, idx);
        self.mark_free(idx, order);
    }

    fn append_free(&mut self, idx: usize, order: usize) {
        self.lists[order].push_back(self.frames, idx);
        self.mark_free(idx, order);
    }

    fn remove_free(&mut self, idx: usize, order: usize) {
        self.lists[order].remove(self.frames, idx);
        self.frames[idx].flags.remove(FrameFlags::FREE);
        self.toggle(idx, order);
    }

    fn pop_free(&mut self, order: usize) -> Option<usize> {
        let idx = self.lists[order].pop(self.frames)?;
        self.frames[idx].flags.remove(FrameFlags::FREE);
        self.toggle(idx, order);
        Some(idx)
    }
}

/// Build the region registry for every page aligned range inside `boot`.
fn registry_for(max_order: usize, boot: &BootMemory) -> Result<RegionRegistry> {
    let mut registry = RegionRegistry::new(max_order);
    for (start, size) in boot.regions() {
        registry.add(start, size)?;
    }
    Ok(registry)
}
