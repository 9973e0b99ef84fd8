//! Tunables of the memory subsystem.

use crate::mem::{buddy::ORDER_LIMIT, Error, Result};

/// Configuration shared by the page and chunk allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Number of buddy orders. Blocks range from `2^0` to `2^(max_order - 1)` pages.
    pub max_order: usize,
    /// The smallest order a slab chunk is allocated with.
    pub chunk_order: usize,
    /// Every chunk is made large enough to hold at least this many slots.
    /// Size classes that don't fit into a `chunk_order` chunk use a higher order.
    pub min_slots_per_chunk: usize,
    /// Give every size class one chunk up front instead of on first use.
    pub prefill_pools: bool,
}

impl Config {
    /// The configuration the kernel boots with: 11 orders (4 MiB blocks)
    /// and 8 page chunks, except for the 64 KiB class which needs 16 pages.
    pub const fn new() -> Self {
        Self {
            max_order: 11,
            chunk_order: 3,
            min_slots_per_chunk: 1,
            prefill_pools: true,
        }
    }

    pub const fn with_max_order(mut self, max_order: usize) -> Self {
        self.max_order = max_order;
        self
    }

    pub const fn with_chunk_order(mut self, chunk_order: usize) -> Self {
        self.chunk_order = chunk_order;
        self
    }

    pub const fn with_min_slots_per_chunk(mut self, slots: usize) -> Self {
        self.min_slots_per_chunk = slots;
        self
    }

    pub const fn with_prefill_pools(mut self, prefill: bool) -> Self {
        self.prefill_pools = prefill;
        self
    }

    /// Check that the allocators can be built from this configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_order == 0 || self.max_order > ORDER_LIMIT {
            return Err(Error::InvalidConfig);
        }

        if self.chunk_order >= self.max_order || self.min_slots_per_chunk == 0 {
            return Err(Error::InvalidConfig);
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
