//! Physical-memory and address-space management for a small Sv39-style
//! multiprocessor kernel.
//!
//! The crate is built around three layers:
//!
//! - [`FrameAllocator`]: per-core free lists over one contiguous span of
//!   page frames, with single-frame stealing between cores and sharded
//!   reference counts.
//! - [`PageTable`]: three-level radix tables stored entirely inside
//!   allocated frames, with journaled mapping so a failed multi-page map
//!   leaves no trace.
//! - [`AddressSpace`]: a user table paired with a private kernel-mirror
//!   table that repeats every user translation without the user bit, plus
//!   the process-lifecycle operations (grow, shrink, fork, image loading)
//!   and bounds-checked cross-space copies.
//!
//! `no_std` with `alloc`; the host is only needed for tests.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod address;
mod address_space;
mod config;
mod copy;
mod error;
mod frame_allocator;
mod page_table;

pub use address::{
    PhysAddr, PhysPageNum, SimpleRange, StepByOne, VirtAddr, VirtPageNum, VpnRange,
};
pub use address_space::{
    AddressSpace, ImageSource, KernelLayout, KernelRegion, MapPermission,
};
pub use config::{ENTRIES_PER_TABLE, MAX_VA, PAGE_SIZE, TRAMPOLINE, USER_CEILING};
pub use copy::{copy_in, copy_in_string, copy_out};
pub use error::{CopyError, GrowError, LoadError, OutOfFrames};
pub use frame_allocator::{FrameAllocator, PhysMemory};
pub use page_table::{PageTable, PageTableDump, PageTableEntry, PteFlags, Teardown};
