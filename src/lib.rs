//! Memory management core of the Windy kernel.
//!
//! Three allocators live here, each usable on its own and each guarded by its
//! own lock once wrapped by [`mem::global`]:
//!
//! - the [buddy allocator](mem::buddy) hands out physical page blocks of
//!   power-of-two orders,
//! - the [chunk allocator](mem::slab) carves those blocks into small fixed
//!   size objects, from 8 bytes up to 64 KiB,
//! - the [virtual region tracker](mem::vregion) keeps the free virtual address
//!   ranges of an address space.

#![deny(rust_2018_idioms, rustdoc::broken_intra_doc_links)]
#![allow(clippy::missing_safety_doc)]
#![cfg_attr(not(test), no_std)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("kmem can only run on 64 bit systems");

extern crate alloc;

pub mod config;
pub mod logger;
pub mod mem;
pub mod unit;

pub use config::Config;
