//! Chunk allocator that serves small objects out of buddy pages.
//!
//! Every power of two size class between [`MIN_SIZE`] and [`MAX_SIZE`] has its
//! own pool of chunks. A chunk is one buddy block cut into equally sized
//! slots. Free slots form a singly linked list threaded through the slots
//! themselves, with one exception: slots behind the chunk's *frontier* were
//! never handed out, and instead of linking all of them up front, only the
//! frontier slot is marked with the [`PRISTINE`] sentinel.
//!
//! # Sentinel contract
//!
//! [`PRISTINE`] is odd and non-canonical, so it is never the address of a slot.
//! The allocator only ever writes it at the frontier. Finding it anywhere else
//! means user data overwrote a free slot, and the allocator panics instead of
//! handing out memory twice.
//!
//! # In-use bitmap
//!
//! Every chunk also tracks which of its slots are handed out, one bit per slot.
//! Chunks with up to 64 slots keep the bits inside their descriptor, larger
//! chunks give up their last slots for the bitmap. Freeing a slot whose bit is
//! clear is a double free, no matter where the slot sits in the free list.

use super::{
    bitmap::{words_for, Bitmap},
    buddy::{order_for_size, size_for_order, BuddyAllocator},
    AllocStats, Error, Result, PAGE_SIZE,
};
use crate::{unit, Config};
use core::{mem, ptr, ptr::NonNull, slice};

/// `log2` of the smallest size class.
pub const MIN_SHIFT: usize = 3;
/// `log2` of the largest size class.
pub const MAX_SHIFT: usize = 16;
/// The smallest object size that is served.
pub const MIN_SIZE: usize = 1 << MIN_SHIFT;
/// The largest object size that is served.
pub const MAX_SIZE: usize = 1 << MAX_SHIFT;
/// The number of size classes.
pub const CLASS_COUNT: usize = MAX_SHIFT - MIN_SHIFT + 1;

/// The marker stored in the frontier slot of a chunk.
pub const PRISTINE: usize = 0xF7EE_F7EE_F7EE_F7EF;

/// The number of pages the descriptor table can grow to.
const TABLE_PAGES: usize = 64;
const DESC_PER_PAGE: usize = PAGE_SIZE / mem::size_of::<DescSlot>();

/// The number of chunks that can exist at the same time.
///
/// Creating another chunk fails with [`Error::NoMemoryAvailable`], even if
/// the buddy allocator has pages left.
pub const MAX_CHUNKS: usize = TABLE_PAGES * DESC_PER_PAGE;

/// Chunks with more slots than this store their in-use bitmap in the chunk.
const INLINE_SLOTS: usize = u64::BITS as usize;

/// Handle to a chunk descriptor.
///
/// The raw index is stored as the owner tag of every page of the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(u32);

impl ChunkId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    NotFull,
    Full,
}

/// Descriptor of a single chunk.
#[derive(Debug, Clone)]
pub struct Chunk {
    base: usize,
    order: usize,
    class: usize,
    capacity: usize,
    free_count: usize,
    /// The next free slot, or `0` if there is none.
    free: usize,
    /// The first slot that was never handed out.
    frontier: usize,
    /// In-use bits for chunks with up to [`INLINE_SLOTS`] slots.
    used: u64,
    prev: Option<ChunkId>,
    next: Option<ChunkId>,
    list: ListKind,
}

impl Chunk {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn slot_size(&self) -> usize {
        1 << (self.class + MIN_SHIFT)
    }

    /// The number of slots inside this chunk.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of slots that are not handed out.
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Check if no slot of this chunk is in use.
    pub fn is_unused(&self) -> bool {
        self.free_count == self.capacity
    }

    fn end(&self) -> usize {
        self.base + size_for_order(self.order)
    }

    /// The end of the last slot that can be handed out.
    fn slots_end(&self) -> usize {
        self.base + self.capacity * self.slot_size()
    }

    fn slot_index(&self, addr: usize) -> usize {
        (addr - self.base) / self.slot_size()
    }

    /// The in-use bits of all slots.
    fn in_use(&mut self) -> Bitmap<'_> {
        if size_for_order(self.order) / self.slot_size() <= INLINE_SLOTS {
            return Bitmap::from_words(slice::from_mut(&mut self.used), self.capacity);
        }

        let words = words_for(self.capacity);
        let map = self.end() - words * mem::size_of::<u64>();
        // SAFETY: the words behind the last slot were reserved for the bitmap
        // when the chunk was created and are never handed out
        let words = unsafe { slice::from_raw_parts_mut(map as *mut u64, words) };
        Bitmap::from_words(words, self.capacity)
    }

    /// Check if `addr` is the start of a slot that was handed out at least once.
    fn is_used_slot(&self, addr: usize) -> bool {
        (self.base..self.frontier).contains(&addr) && (addr - self.base) % self.slot_size() == 0
    }

    /// Check if `addr` may be stored as the next pointer of a free slot.
    fn is_valid_next(&self, addr: usize) -> bool {
        addr == 0 || self.is_used_slot(addr) || (addr == self.frontier && addr < self.slots_end())
    }
}

enum DescSlot {
    Vacant(Option<ChunkId>),
    Used(Chunk),
}

/// Storage for chunk descriptors.
///
/// The table grows by whole pages claimed from the buddy allocator,
/// which are never given back.
struct ChunkTable {
    directory: [Option<NonNull<DescSlot>>; TABLE_PAGES],
    vacant: Option<ChunkId>,
}

// SAFETY: the table exclusively owns the pages it points to.
unsafe impl Send for ChunkTable {}

impl ChunkTable {
    const fn new() -> Self {
        Self {
            directory: [None; TABLE_PAGES],
            vacant: None,
        }
    }

    fn insert(&mut self, pages: &mut BuddyAllocator<'_>, chunk: Chunk) -> Result<ChunkId> {
        if self.vacant.is_none() {
            self.grow(pages)?;
        }

        let id = self.vacant.ok_or(Error::NoMemoryAvailable)?;
        let slot = self.slot_mut(id).ok_or(Error::NoMemoryAvailable)?;
        let next = match slot {
            DescSlot::Vacant(next) => *next,
            DescSlot::Used(_) => panic!("chunk: vacant list points to used descriptor {}", id.0),
        };

        *slot = DescSlot::Used(chunk);
        self.vacant = next;
        Ok(id)
    }

    fn remove(&mut self, id: ChunkId) -> Chunk {
        let vacant = self.vacant;
        let slot = match self.slot_mut(id) {
            Some(slot) => slot,
            None => panic!("chunk: removing unknown descriptor {}", id.0),
        };

        match mem::replace(slot, DescSlot::Vacant(vacant)) {
            DescSlot::Used(chunk) => {
                self.vacant = Some(id);
                chunk
            }
            DescSlot::Vacant(_) => panic!("chunk: removing vacant descriptor {}", id.0),
        }
    }

    fn grow(&mut self, pages: &mut BuddyAllocator<'_>) -> Result<()> {
        let (page_idx, entry) = self
            .directory
            .iter_mut()
            .enumerate()
            .find(|(_, page)| page.is_none())
            .ok_or(Error::NoMemoryAvailable)?;

        let page = pages.claim(0)?.cast::<DescSlot>();
        let first = page_idx * DESC_PER_PAGE;
        for i in 0..DESC_PER_PAGE {
            let next = (i + 1 < DESC_PER_PAGE).then(|| ChunkId((first + i + 1) as u32));
            // SAFETY: the page was just claimed and holds `DESC_PER_PAGE` slots
            unsafe { ptr::write(page.as_ptr().add(i), DescSlot::Vacant(next)) };
        }

        *entry = Some(page);
        self.vacant = Some(ChunkId(first as u32));
        log::debug!("chunk: descriptor table grew to {} pages", page_idx + 1);
        Ok(())
    }

    fn slot(&self, id: ChunkId) -> Option<&DescSlot> {
        let page = (*self.directory.get(id.index() / DESC_PER_PAGE)?)?;
        // SAFETY: every page in the directory holds `DESC_PER_PAGE` initialized slots
        Some(unsafe { &*page.as_ptr().add(id.index() % DESC_PER_PAGE) })
    }

    fn slot_mut(&mut self, id: ChunkId) -> Option<&mut DescSlot> {
        let page = (*self.directory.get(id.index() / DESC_PER_PAGE)?)?;
        // SAFETY: see `slot`
        Some(unsafe { &mut *page.as_ptr().add(id.index() % DESC_PER_PAGE) })
    }

    fn get(&self, id: ChunkId) -> Option<&Chunk> {
        match self.slot(id)? {
            DescSlot::Used(chunk) => Some(chunk),
            DescSlot::Vacant(_) => None,
        }
    }

    fn get_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        match self.slot_mut(id)? {
            DescSlot::Used(chunk) => Some(chunk),
            DescSlot::Vacant(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ChunkList {
    head: Option<ChunkId>,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
struct Pool {
    not_full: ChunkList,
    full: ChunkList,
    order: usize,
}

impl Pool {
    fn list_mut(&mut self, kind: ListKind) -> &mut ChunkList {
        match kind {
            ListKind::NotFull => &mut self.not_full,
            ListKind::Full => &mut self.full,
        }
    }
}

/// Allocator for objects of up to [`MAX_SIZE`] bytes.
///
/// Pages are claimed from, and returned to, the buddy allocator
/// that is passed to every operation.
pub struct ChunkAllocator {
    pools: [Pool; CLASS_COUNT],
    table: ChunkTable,
    /// The largest size that fits into a chunk of the buddy's largest order.
    max_size: usize,
    prefill: bool,
    stats: AllocStats,
}

impl ChunkAllocator {
    /// Create a chunk allocator without any chunks.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let largest = config.max_order - 1;
        let mut pools = [Pool {
            not_full: ChunkList::default(),
            full: ChunkList::default(),
            order: 0,
        }; CLASS_COUNT];

        for (class, pool) in pools.iter_mut().enumerate() {
            let slots = (MIN_SIZE << class) * config.min_slots_per_chunk;
            pool.order = config.chunk_order.max(order_for_size(slots)).min(largest);
        }

        Ok(Self {
            pools,
            table: ChunkTable::new(),
            max_size: MAX_SIZE.min(size_for_order(largest)),
            prefill: config.prefill_pools,
            stats: AllocStats::with_name("Chunk Allocator"),
        })
    }

    /// Give every size class its first chunk.
    ///
    /// Does nothing if the configuration disabled prefilling.
    pub fn prefill(&mut self, pages: &mut BuddyAllocator<'_>) -> Result<()> {
        if !self.prefill {
            return Ok(());
        }

        for class in 0..CLASS_COUNT {
            if self.slot_size(class) <= self.max_size && self.pools[class].not_full.head.is_none() {
                self.grow(pages, class)?;
            }
        }

        log::info!(
            "chunk: prefilled pools with {}",
            unit::bytes(self.stats.total)
        );
        Ok(())
    }

    /// Returns the size class that serves objects of `size` bytes.
    pub fn class_of(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.max_size {
            return None;
        }

        let shift = size.next_power_of_two().trailing_zeros() as usize;
        Some(shift.max(MIN_SHIFT) - MIN_SHIFT)
    }

    /// The size of a slot in the given class.
    pub fn slot_size(&self, class: usize) -> usize {
        MIN_SIZE << class
    }

    /// Allocate an object of `size` bytes.
    ///
    /// The object is aligned to its size rounded up to a power of two.
    pub fn allocate(&mut self, pages: &mut BuddyAllocator<'_>, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        let class = self.class_of(size).ok_or(Error::SizeTooLarge)?;
        let slot_size = self.slot_size(class);

        let id = match self.pools[class].not_full.head {
            Some(id) => id,
            None => self.grow(pages, class)?,
        };

        let chunk = self.chunk_mut(id);
        let slot = chunk.free;
        assert!(
            slot != 0,
            "chunk: chunk at {:#x} is not full but has no free slot",
            chunk.base
        );

        // SAFETY: `slot` is a slot of a chunk this allocator claimed
        let value = unsafe { ptr::read(slot as *const usize) };
        if value == PRISTINE {
            assert!(
                slot == chunk.frontier,
                "chunk: sentinel found at {:#x} but the frontier is at {:#x} ({} byte slots)",
                slot,
                chunk.frontier,
                slot_size
            );

            chunk.frontier += slot_size;
            chunk.free = if chunk.frontier < chunk.slots_end() {
                // SAFETY: the frontier is inside the chunk
                unsafe { ptr::write(chunk.frontier as *mut usize, PRISTINE) };
                chunk.frontier
            } else {
                0
            };
        } else {
            assert!(
                chunk.is_valid_next(value),
                "chunk: corrupted free list at {:#x} (next {:#x}, {} byte slots)",
                slot,
                value,
                slot_size
            );
            chunk.free = value;
        }

        let idx = chunk.slot_index(slot);
        let fresh = chunk.in_use().toggle(idx);
        assert!(
            fresh,
            "chunk: free list of chunk at {:#x} hands out {:#x}, which is in use",
            chunk.base,
            slot
        );

        chunk.free_count -= 1;
        assert!(
            chunk.free != 0 || chunk.free_count == 0,
            "chunk: free list of chunk at {:#x} ended early",
            chunk.base
        );

        if chunk.free_count == 0 {
            self.unlink(id);
            self.link(id, ListKind::Full);
        }

        self.stats.requested += size;
        self.stats.wasted += slot_size - size;
        self.stats.on_alloc(slot_size);

        log::trace!("chunk: allocated {:#x} ({} bytes)", slot, size);
        NonNull::new(slot as *mut u8).ok_or(Error::NoMemoryAvailable)
    }

    /// Return an object to its chunk.
    ///
    /// # Panics
    ///
    /// If `ptr` was not returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The object must not be used after calling this method.
    pub unsafe fn free(&mut self, pages: &BuddyAllocator<'_>, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let id = match pages.owner_of(addr) {
            Some(owner) => ChunkId(owner),
            None => panic!("chunk: free of unknown pointer {:#x}", addr),
        };

        let chunk = self.chunk_mut(id);
        let slot_size = chunk.slot_size();
        assert!(
            chunk.is_used_slot(addr),
            "chunk: free of {:#x}, which is not a slot of the chunk at {:#x} ({} byte slots)",
            addr,
            chunk.base,
            slot_size
        );
        let idx = chunk.slot_index(addr);
        let was_used = !chunk.in_use().toggle(idx);
        assert!(
            was_used,
            "chunk: double free of {:#x} ({} byte slots)",
            addr,
            slot_size
        );

        ptr::write(addr as *mut usize, chunk.free);
        chunk.free = addr;
        chunk.free_count += 1;

        if chunk.free_count == 1 {
            self.unlink(id);
            self.link(id, ListKind::NotFull);
        }

        self.stats.on_dealloc(slot_size);
        log::trace!("chunk: freed {:#x} ({} byte slots)", addr, slot_size);
    }

    /// Give every chunk without live objects back to the buddy allocator.
    ///
    /// The first chunk of every pool is kept. Returns the number of released chunks.
    pub fn reclaim(&mut self, pages: &mut BuddyAllocator<'_>) -> usize {
        let mut released = 0;

        for class in 0..CLASS_COUNT {
            let mut cursor = self.pools[class]
                .not_full
                .head
                .and_then(|head| self.chunk(head).next);

            while let Some(id) = cursor {
                let chunk = self.chunk(id);
                cursor = chunk.next;
                if !chunk.is_unused() {
                    continue;
                }

                self.unlink(id);
                let chunk = self.table.remove(id);
                let size = size_for_order(chunk.order);
                self.stats.total -= size;
                self.stats.free -= size;

                // SAFETY: no slot of the chunk is in use
                unsafe {
                    match NonNull::new(chunk.base as *mut u8) {
                        Some(block) => pages.release(block, chunk.order),
                        None => panic!("chunk: chunk {} has no base", id.0),
                    }
                }

                log::debug!(
                    "chunk: reclaimed {} chunk at {:#x}",
                    unit::bytes(size),
                    chunk.base
                );
                released += 1;
            }
        }

        released
    }

    /// Returns the chunk that holds `addr`.
    pub fn chunk_of(&self, pages: &BuddyAllocator<'_>, addr: usize) -> Option<&Chunk> {
        self.table.get(ChunkId(pages.owner_of(addr)?))
    }

    /// The number of chunks of the class, full or not.
    pub fn chunk_count(&self, class: usize) -> usize {
        let pool = &self.pools[class];
        pool.not_full.len + pool.full.len
    }

    /// The number of chunks of the class that have no free slot left.
    pub fn full_count(&self, class: usize) -> usize {
        self.pools[class].full.len
    }

    /// The order of the chunks of the given class.
    pub fn chunk_order(&self, class: usize) -> usize {
        self.pools[class].order
    }

    /// Returns a copy of the stats at the moment for this allocator.
    pub fn stats(&self) -> AllocStats {
        self.stats.clone()
    }

    fn grow(&mut self, pages: &mut BuddyAllocator<'_>, class: usize) -> Result<ChunkId> {
        let order = self.pools[class].order;
        let slot_size = self.slot_size(class);
        let size = size_for_order(order);

        let block = pages.claim(order).map_err(|err| {
            log::warn!("chunk: no pages left for {} byte slots", slot_size);
            err
        })?;

        let base = block.as_ptr() as usize;
        // SAFETY: the block was just claimed and is `size` bytes large
        unsafe {
            ptr::write_bytes(block.as_ptr(), 0, size);
            ptr::write(base as *mut usize, PRISTINE);
        }

        let slots = size / slot_size;
        let capacity = if slots <= INLINE_SLOTS {
            slots
        } else {
            let map = words_for(slots) * mem::size_of::<u64>();
            slots - (map + slot_size - 1) / slot_size
        };

        let chunk = Chunk {
            base,
            order,
            class,
            capacity,
            free_count: capacity,
            free: base,
            frontier: base,
            used: 0,
            prev: None,
            next: None,
            list: ListKind::NotFull,
        };

        let id = match self.table.insert(pages, chunk) {
            Ok(id) => id,
            Err(err) => {
                // SAFETY: the block was never handed out
                unsafe { pages.release(block, order) };
                return Err(err);
            }
        };

        pages.set_owner(block, order, id.0);
        self.link(id, ListKind::NotFull);

        self.stats.total += size;
        self.stats.free += size;
        log::debug!(
            "chunk: new {} chunk at {:#x} for {} byte slots",
            unit::bytes(size),
            base,
            slot_size
        );
        Ok(id)
    }

    fn chunk(&self, id: ChunkId) -> &Chunk {
        match self.table.get(id) {
            Some(chunk) => chunk,
            None => panic!("chunk: stale chunk id {}", id.0),
        }
    }

    fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk {
        match self.table.get_mut(id) {
            Some(chunk) => chunk,
            None => panic!("chunk: stale chunk id {}", id.0),
        }
    }

    /// Push the chunk to the front of the given list of its pool.
    fn link(&mut self, id: ChunkId, kind: ListKind) {
        let class = self.chunk(id).class;
        let list = self.pools[class].list_mut(kind);
        let head = list.head.replace(id);
        list.len += 1;

        let chunk = self.chunk_mut(id);
        chunk.prev = None;
        chunk.next = head;
        chunk.list = kind;

        if let Some(head) = head {
            self.chunk_mut(head).prev = Some(id);
        }
    }

    fn unlink(&mut self, id: ChunkId) {
        let Chunk {
            class,
            list,
            prev,
            next,
            ..
        } = *self.chunk(id);

        match prev {
            Some(prev) => self.chunk_mut(prev).next = next,
            None => self.pools[class].list_mut(list).head = next,
        }
        if let Some(next) = next {
            self.chunk_mut(next).prev = prev;
        }
        self.pools[class].list_mut(list).len -= 1;

        let chunk = self.chunk_mut(id);
        chunk.prev = None;
        chunk.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::testing;
    use std::collections::HashSet;

    /// One 4 MiB block of real memory.
    fn setup(config: Config) -> (BuddyAllocator<'static>, ChunkAllocator) {
        let pages = testing::backed_buddy(config.max_order, 0x40_0000);
        (pages, ChunkAllocator::new(config).unwrap())
    }

    /// Two 2 KiB slots per chunk.
    fn tiny_chunks() -> Config {
        Config::new()
            .with_chunk_order(0)
            .with_min_slots_per_chunk(1)
            .with_prefill_pools(false)
    }

    const CLASS_2K: usize = 8;

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    #[test]
    fn size_classes() {
        let chunks = ChunkAllocator::new(Config::new()).unwrap();
        assert_eq!(chunks.class_of(0), None);
        assert_eq!(chunks.class_of(1), Some(0));
        assert_eq!(chunks.class_of(8), Some(0));
        assert_eq!(chunks.class_of(9), Some(1));
        assert_eq!(chunks.class_of(2048), Some(CLASS_2K));
        assert_eq!(chunks.class_of(MAX_SIZE), Some(CLASS_COUNT - 1));
        assert_eq!(chunks.class_of(MAX_SIZE + 1), None);

        assert_eq!(chunks.chunk_order(0), 3);
        assert_eq!(chunks.chunk_order(CLASS_COUNT - 1), 4);

        // 32 KiB is the largest block with 4 orders
        let chunks = ChunkAllocator::new(Config::new().with_max_order(4)).unwrap();
        assert_eq!(chunks.class_of(MAX_SIZE), None);
        assert_eq!(chunks.class_of(0x8000), Some(12));
        assert_eq!(chunks.chunk_order(12), 3);
    }

    #[test]
    fn default_chunks_are_eight_pages() {
        let (mut pages, mut chunks) = setup(Config::new().with_prefill_pools(false));

        for class in 0..CLASS_COUNT - 1 {
            assert_eq!(chunks.chunk_order(class), 3, "class {}", class);
        }

        let obj = chunks.allocate(&mut pages, 8 * 1024).unwrap();
        let chunk = chunks.chunk_of(&pages, addr(obj)).unwrap();
        assert_eq!(chunk.order(), 3);
        assert_eq!(chunk.capacity(), 4);
    }

    #[test]
    fn ten_small_objects_and_reuse() {
        let (mut pages, mut chunks) = setup(Config::new().with_prefill_pools(false));

        let objects = (0..10)
            .map(|_| addr(chunks.allocate(&mut pages, 8).unwrap()))
            .collect::<Vec<_>>();

        let distinct = objects.iter().copied().collect::<HashSet<_>>();
        assert_eq!(distinct.len(), 10);
        assert!(objects.iter().all(|obj| obj % 8 == 0));

        let base = chunks.chunk_of(&pages, objects[0]).unwrap().base();
        for obj in &objects {
            assert_eq!(chunks.chunk_of(&pages, *obj).unwrap().base(), base);
        }
        assert_eq!(chunks.chunk_count(0), 1);

        unsafe { chunks.free(&pages, NonNull::new(objects[4] as *mut u8).unwrap()) };
        assert_eq!(addr(chunks.allocate(&mut pages, 8).unwrap()), objects[4]);

        // the frontier continues behind the tenth object
        assert_eq!(addr(chunks.allocate(&mut pages, 8).unwrap()), objects[9] + 8);
    }

    #[test]
    fn full_chunks_move_and_come_back() {
        let (mut pages, mut chunks) = setup(tiny_chunks());

        let a = chunks.allocate(&mut pages, 2048).unwrap();
        let b = chunks.allocate(&mut pages, 2000).unwrap();
        assert_eq!(addr(b), addr(a) + 2048);
        assert_eq!(chunks.full_count(CLASS_2K), 1);
        assert_eq!(chunks.chunk_count(CLASS_2K), 1);

        let c = chunks.allocate(&mut pages, 2048).unwrap();
        assert_ne!(addr(c) & !(PAGE_SIZE - 1), addr(a));
        assert_eq!(chunks.chunk_count(CLASS_2K), 2);

        unsafe { chunks.free(&pages, b) };
        assert_eq!(chunks.full_count(CLASS_2K), 0);
        assert_eq!(addr(chunks.allocate(&mut pages, 2048).unwrap()), addr(b));
    }

    #[test]
    fn largest_class() {
        let (mut pages, mut chunks) = setup(Config::new().with_prefill_pools(false));

        let obj = chunks.allocate(&mut pages, MAX_SIZE).unwrap();
        assert_eq!(addr(obj) % MAX_SIZE, 0);
        let chunk = chunks.chunk_of(&pages, addr(obj)).unwrap();
        assert_eq!(chunk.order(), 4);
        assert_eq!(chunk.capacity(), 1);
        assert_eq!(chunk.free_count(), 0);
        assert_eq!(chunks.full_count(CLASS_COUNT - 1), 1);

        assert_eq!(chunks.allocate(&mut pages, MAX_SIZE + 1), Err(Error::SizeTooLarge));
        assert_eq!(chunks.allocate(&mut pages, 0), Err(Error::ZeroSize));
    }

    #[test]
    fn prefill_creates_one_chunk_per_class() {
        let (mut pages, mut chunks) = setup(Config::new());
        chunks.prefill(&mut pages).unwrap();

        for class in 0..CLASS_COUNT {
            assert_eq!(chunks.chunk_count(class), 1);
        }
        // 13 chunks of 8 pages and one of 16 pages for the 64 KiB class
        assert_eq!(chunks.stats().total, (13 * 8 + 16) * PAGE_SIZE);
    }

    #[test]
    fn reclaim_keeps_the_first_chunk() {
        let (mut pages, mut chunks) = setup(tiny_chunks());

        let objects = (0..6)
            .map(|_| chunks.allocate(&mut pages, 2048).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(chunks.chunk_count(CLASS_2K), 3);

        let free_before = pages.free_pages();
        for obj in objects {
            unsafe { chunks.free(&pages, obj) };
        }

        assert_eq!(chunks.reclaim(&mut pages), 2);
        assert_eq!(chunks.chunk_count(CLASS_2K), 1);
        assert_eq!(pages.free_pages(), free_before + 2);
        assert_eq!(chunks.stats().total, PAGE_SIZE);

        // nothing left to reclaim
        assert_eq!(chunks.reclaim(&mut pages), 0);
        assert!(chunks.allocate(&mut pages, 2048).is_ok());
    }

    #[test]
    fn stats_track_requests() {
        let (mut pages, mut chunks) = setup(Config::new().with_prefill_pools(false));

        let obj = chunks.allocate(&mut pages, 100).unwrap();
        let stats = chunks.stats();
        assert_eq!(stats.requested, 100);
        assert_eq!(stats.wasted, 28);
        assert_eq!(stats.allocated, 128);
        assert_eq!(stats.total, 8 * PAGE_SIZE);
        assert_eq!(stats.free, 8 * PAGE_SIZE - 128);

        unsafe { chunks.free(&pages, obj) };
        assert_eq!(chunks.stats().allocated, 0);
    }

    #[test]
    #[should_panic(expected = "chunk: free of unknown pointer")]
    fn unknown_pointer_panics() {
        let (mut pages, mut chunks) = setup(Config::new().with_prefill_pools(false));
        let block = pages.claim(0).unwrap();
        unsafe { chunks.free(&pages, block) };
    }

    #[test]
    #[should_panic(expected = "which is not a slot")]
    fn misaligned_free_panics() {
        let (mut pages, mut chunks) = setup(Config::new().with_prefill_pools(false));
        let obj = chunks.allocate(&mut pages, 64).unwrap();
        unsafe { chunks.free(&pages, NonNull::new(obj.as_ptr().add(8)).unwrap()) };
    }

    #[test]
    #[should_panic(expected = "chunk: double free")]
    fn double_free_panics() {
        let (mut pages, mut chunks) = setup(Config::new().with_prefill_pools(false));
        let _keep = chunks.allocate(&mut pages, 64).unwrap();
        let obj = chunks.allocate(&mut pages, 64).unwrap();
        unsafe {
            chunks.free(&pages, obj);
            chunks.free(&pages, obj);
        }
    }

    #[test]
    #[should_panic(expected = "chunk: double free")]
    fn double_free_behind_the_list_head_panics() {
        let (mut pages, mut chunks) = setup(Config::new().with_prefill_pools(false));
        let a = chunks.allocate(&mut pages, 64).unwrap();
        let b = chunks.allocate(&mut pages, 64).unwrap();
        let _c = chunks.allocate(&mut pages, 64).unwrap();
        unsafe {
            chunks.free(&pages, a);
            chunks.free(&pages, b);
            // `a` is the second entry of the free list now
            chunks.free(&pages, a);
        }
    }

    #[test]
    fn small_slots_keep_their_bitmap_at_the_tail() {
        let (mut pages, mut chunks) = setup(Config::new().with_prefill_pools(false));

        let first = chunks.allocate(&mut pages, 8).unwrap();
        let chunk = chunks.chunk_of(&pages, addr(first)).unwrap();
        let (base, capacity) = (chunk.base(), chunk.capacity());
        // 4096 slots, 64 of them hold the 512 byte bitmap
        assert_eq!(capacity, 4096 - 64);

        let mut last = addr(first);
        for _ in 1..capacity {
            last = addr(chunks.allocate(&mut pages, 8).unwrap());
        }
        assert_eq!(last, base + (capacity - 1) * 8);
        assert_eq!(chunks.full_count(0), 1);

        let next = chunks.allocate(&mut pages, 8).unwrap();
        assert_ne!(chunks.chunk_of(&pages, addr(next)).unwrap().base(), base);
        assert_eq!(chunks.chunk_count(0), 2);

        // every slot frees exactly once
        unsafe { chunks.free(&pages, NonNull::new(last as *mut u8).unwrap()) };
        assert_eq!(addr(chunks.allocate(&mut pages, 8).unwrap()), last);
    }

    #[test]
    fn descriptor_table_limit() {
        let config = Config::new()
            .with_chunk_order(0)
            .with_min_slots_per_chunk(1)
            .with_prefill_pools(false);
        let mut pages = testing::backed_buddy(config.max_order, 0x100_0000);
        let mut chunks = ChunkAllocator::new(config).unwrap();

        // one page sized slot per chunk
        for _ in 0..MAX_CHUNKS {
            chunks.allocate(&mut pages, PAGE_SIZE).unwrap();
        }

        let free = pages.free_pages();
        assert_eq!(chunks.allocate(&mut pages, PAGE_SIZE), Err(Error::NoMemoryAvailable));
        assert_eq!(pages.free_pages(), free);
        assert!(free > 0);
    }

    #[test]
    #[should_panic(expected = "chunk: sentinel found")]
    fn sentinel_in_freed_slot_panics() {
        let (mut pages, mut chunks) = setup(Config::new().with_prefill_pools(false));
        let obj = chunks.allocate(&mut pages, 8).unwrap();
        unsafe {
            chunks.free(&pages, obj);
            // use after free
            ptr::write(obj.as_ptr().cast::<usize>(), PRISTINE);
        }
        let _ = chunks.allocate(&mut pages, 8);
    }

    #[test]
    #[should_panic(expected = "chunk: corrupted free list")]
    fn corrupted_free_list_panics() {
        let (mut pages, mut chunks) = setup(Config::new().with_prefill_pools(false));
        let obj = chunks.allocate(&mut pages, 8).unwrap();
        unsafe {
            chunks.free(&pages, obj);
            ptr::write(obj.as_ptr().cast::<usize>(), 0x1234);
        }
        let _ = chunks.allocate(&mut pages, 8);
    }
}
