//! Physical frame allocator: per-core free lists over an owned frame arena.
//!
//! [`PhysMemory`] models the managed window of physical RAM as an arena
//! indexed by [`PhysPageNum`], so frames and page-table pages are handles
//! rather than raw pointers. [`FrameAllocator`] owns the arena and hands
//! frames out from per-core free lists, stealing a single frame from a
//! foreign list when the local one is empty. A sharded reference-count
//! table tracks sharing; a frame returns to a free list only when its
//! count drops back to zero.

use alloc::{boxed::Box, vec::Vec};
use core::cell::UnsafeCell;

use log::info;
use spin::Mutex;

use crate::{
    address::{PhysAddr, PhysPageNum},
    config::{ALLOC_JUNK, ENTRIES_PER_TABLE, FREE_JUNK, PAGE_SIZE, REFCOUNT_SHARDS},
    error::OutOfFrames,
    page_table::PageTableEntry,
};

/// Backing storage for one frame, aligned the way real RAM pages are.
#[repr(C, align(4096))]
struct FrameSlot(UnsafeCell<[u8; PAGE_SIZE]>);

/// The managed window of physical memory.
///
/// Covers `[base, top)` of the physical address space. Frame contents are
/// reached through [`PhysMemory::frame_bytes`] and [`PhysMemory::frame_ptes`];
/// exclusivity of a frame's contents follows from allocator ownership (a
/// frame is touched only by the context that holds its reference), not from
/// the borrow checker.
pub struct PhysMemory {
    base: PhysPageNum,
    frames: Box<[FrameSlot]>,
}

// Frame contents are plain bytes; cross-thread access is serialized by
// frame ownership (free list or reference holder).
unsafe impl Sync for PhysMemory {}

impl PhysMemory {
    fn new(base: PhysAddr, top: PhysAddr) -> Self {
        let base_ppn = base.to_ppn_by_ceil();
        let top_ppn = top.to_ppn_by_floor();
        assert!(
            base_ppn < top_ppn,
            "empty physical window [{base:?}, {top:?})"
        );
        let mut frames = Vec::new();
        frames.resize_with(top_ppn.0 - base_ppn.0, || {
            FrameSlot(UnsafeCell::new([0; PAGE_SIZE]))
        });
        Self {
            base: base_ppn,
            frames: frames.into_boxed_slice(),
        }
    }

    /// First managed frame.
    pub fn base(&self) -> PhysPageNum {
        self.base
    }

    /// One past the last managed frame.
    pub fn top(&self) -> PhysPageNum {
        PhysPageNum(self.base.0 + self.frames.len())
    }

    /// Number of managed frames.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Whether `ppn` falls inside the managed window.
    pub fn contains(&self, ppn: PhysPageNum) -> bool {
        self.base <= ppn && ppn < self.top()
    }

    fn slot(&self, ppn: PhysPageNum) -> &FrameSlot {
        assert!(
            self.contains(ppn),
            "{ppn:?} is outside the managed window [{:?}, {:?})",
            self.base,
            self.top()
        );
        &self.frames[ppn.0 - self.base.0]
    }

    /// Byte view of a frame.
    #[allow(clippy::mut_from_ref)]
    pub fn frame_bytes(&self, ppn: PhysPageNum) -> &mut [u8; PAGE_SIZE] {
        unsafe { &mut *self.slot(ppn).0.get() }
    }

    /// Page-table view of a frame.
    #[allow(clippy::mut_from_ref)]
    pub fn frame_ptes(&self, ppn: PhysPageNum) -> &mut [PageTableEntry; ENTRIES_PER_TABLE] {
        let bytes = self.slot(ppn).0.get();
        unsafe { &mut *bytes.cast::<[PageTableEntry; ENTRIES_PER_TABLE]>() }
    }
}

/// Multiprocessor-safe physical frame allocator.
///
/// Constructed once at startup with the managed physical window and the core
/// count, then shared (`Arc`) with every subsystem that needs frames. Each
/// free-list lock is a leaf lock: `allocate` holds at most one at a time,
/// its own list first, then one foreign list while stealing.
pub struct FrameAllocator {
    mem: PhysMemory,
    free_lists: Box<[Mutex<Vec<PhysPageNum>>]>,
    ref_counts: Box<[Mutex<Vec<u32>>]>,
}

impl FrameAllocator {
    /// Build an allocator managing `[base, top)` for `cores` processor cores.
    ///
    /// Frames are dealt round-robin onto the per-core free lists.
    pub fn new(base: PhysAddr, top: PhysAddr, cores: usize) -> Self {
        assert!(cores > 0, "need at least one core");
        let mem = PhysMemory::new(base, top);

        let mut free_lists = Vec::new();
        free_lists.resize_with(cores, || Mutex::new(Vec::new()));
        for i in 0..mem.frame_count() {
            free_lists[i % cores]
                .lock()
                .push(PhysPageNum(mem.base().0 + i));
        }

        let shard_len = (mem.frame_count() + REFCOUNT_SHARDS - 1) / REFCOUNT_SHARDS;
        let mut ref_counts = Vec::new();
        ref_counts.resize_with(REFCOUNT_SHARDS, || Mutex::new(alloc::vec![0; shard_len]));

        info!(
            "frame allocator managing {} frames in [{:?}, {:?}) across {} cores",
            mem.frame_count(),
            mem.base(),
            mem.top(),
            cores
        );

        Self {
            mem,
            free_lists: free_lists.into_boxed_slice(),
            ref_counts: ref_counts.into_boxed_slice(),
        }
    }

    /// The backing arena.
    pub fn mem(&self) -> &PhysMemory {
        &self.mem
    }

    /// Number of per-core free lists.
    pub fn core_count(&self) -> usize {
        self.free_lists.len()
    }

    /// Total number of managed frames.
    pub fn total_frames(&self) -> usize {
        self.mem.frame_count()
    }

    /// Frames currently sitting on some free list.
    pub fn free_frames(&self) -> usize {
        self.free_lists.iter().map(|l| l.lock().len()).sum()
    }

    /// Take one frame, preferring `core`'s own list.
    ///
    /// On a miss, every other list is visited in a fixed order and a single
    /// frame is stolen from the first non-empty one; at most one foreign
    /// lock is ever held, and never two locks simultaneously. The returned
    /// frame has reference count 1 and is filled with junk; callers
    /// initialize contents before use.
    pub fn allocate(&self, core: usize) -> Result<PhysPageNum, OutOfFrames> {
        assert!(core < self.free_lists.len(), "core {core} out of range");
        let ppn = self.take_frame(core).ok_or(OutOfFrames)?;

        {
            let (shard, slot) = self.ref_slot(ppn);
            let mut counts = self.ref_counts[shard].lock();
            assert!(
                counts[slot] == 0,
                "{ppn:?} was on a free list with a live reference count"
            );
            counts[slot] = 1;
        }

        self.mem.frame_bytes(ppn).fill(ALLOC_JUNK);
        Ok(ppn)
    }

    /// Add one reference to an already-allocated frame.
    pub fn retain(&self, ppn: PhysPageNum) {
        let (shard, slot) = self.ref_slot(ppn);
        let mut counts = self.ref_counts[shard].lock();
        assert!(counts[slot] > 0, "retain of an unreferenced {ppn:?}");
        counts[slot] += 1;
    }

    /// Drop one reference; on the last one, scrub the frame and return it
    /// to `core`'s free list.
    ///
    /// Releasing a frame that is already free, or one outside the managed
    /// window, is a caller bug and panics.
    pub fn release(&self, core: usize, ppn: PhysPageNum) {
        assert!(core < self.free_lists.len(), "core {core} out of range");
        let (shard, slot) = self.ref_slot(ppn);
        let last = {
            let mut counts = self.ref_counts[shard].lock();
            assert!(counts[slot] > 0, "release of a free {ppn:?}");
            counts[slot] -= 1;
            counts[slot] == 0
        };
        if last {
            // Sole former owner: no other context can reach the frame now.
            self.mem.frame_bytes(ppn).fill(FREE_JUNK);
            self.free_lists[core].lock().push(ppn);
        }
    }

    /// Current reference count of a frame.
    pub fn ref_count(&self, ppn: PhysPageNum) -> u32 {
        let (shard, slot) = self.ref_slot(ppn);
        self.ref_counts[shard].lock()[slot]
    }

    fn take_frame(&self, core: usize) -> Option<PhysPageNum> {
        if let Some(ppn) = self.free_lists[core].lock().pop() {
            return Some(ppn);
        }
        for i in 1..self.free_lists.len() {
            let victim = (core + i) % self.free_lists.len();
            if let Some(ppn) = self.free_lists[victim].lock().pop() {
                return Some(ppn);
            }
        }
        None
    }

    fn ref_slot(&self, ppn: PhysPageNum) -> (usize, usize) {
        assert!(
            self.mem.contains(ppn),
            "{ppn:?} is outside the managed window"
        );
        let index = ppn.0 - self.mem.base().0;
        (index % REFCOUNT_SHARDS, index / REFCOUNT_SHARDS)
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use std::thread;

    use super::*;
    use crate::config::PAGE_SIZE;

    fn allocator(frames: usize, cores: usize) -> FrameAllocator {
        let base = PhysAddr(0x8010_0000);
        let top = PhysAddr(base.0 + frames * PAGE_SIZE);
        FrameAllocator::new(base, top, cores)
    }

    #[test]
    fn allocate_fills_junk_and_counts_one() {
        let pool = allocator(4, 1);
        let ppn = pool.allocate(0).unwrap();
        assert!(pool.mem().frame_bytes(ppn).iter().all(|&b| b == ALLOC_JUNK));
        assert_eq!(pool.ref_count(ppn), 1);
        assert_eq!(pool.free_frames(), 3);
    }

    #[test]
    fn release_scrubs_and_recycles() {
        let pool = allocator(4, 1);
        let ppn = pool.allocate(0).unwrap();
        pool.mem().frame_bytes(ppn).fill(0xee);
        pool.release(0, ppn);
        assert_eq!(pool.free_frames(), 4);
        let again = pool.allocate(0).unwrap();
        // LIFO recycling hands the same frame back, already scrubbed then
        // junk-filled by allocate.
        assert_eq!(again, ppn);
        assert!(pool
            .mem()
            .frame_bytes(again)
            .iter()
            .all(|&b| b == ALLOC_JUNK));
    }

    #[test]
    fn stealing_drains_foreign_lists_before_failing() {
        let pool = allocator(6, 3);
        let mut taken = alloc::vec::Vec::new();
        // Core 0 owns two frames; keep allocating from it until the whole
        // machine is empty.
        for _ in 0..6 {
            taken.push(pool.allocate(0).unwrap());
        }
        assert_eq!(pool.free_frames(), 0);
        assert_eq!(pool.allocate(0), Err(OutOfFrames));
        for ppn in taken {
            pool.release(0, ppn);
        }
        assert_eq!(pool.free_frames(), 6);
    }

    #[test]
    fn retain_defers_the_free() {
        let pool = allocator(4, 1);
        let ppn = pool.allocate(0).unwrap();
        pool.retain(ppn);
        assert_eq!(pool.ref_count(ppn), 2);
        pool.release(0, ppn);
        assert_eq!(pool.free_frames(), 3); // still referenced
        pool.release(0, ppn);
        assert_eq!(pool.free_frames(), 4);
    }

    #[test]
    #[should_panic(expected = "release of a free")]
    fn double_release_panics() {
        let pool = allocator(4, 1);
        let ppn = pool.allocate(0).unwrap();
        pool.release(0, ppn);
        pool.release(0, ppn);
    }

    #[test]
    #[should_panic(expected = "outside the managed window")]
    fn release_outside_window_panics() {
        let pool = allocator(4, 1);
        pool.release(0, PhysPageNum(1));
    }

    #[test]
    #[should_panic(expected = "retain of an unreferenced")]
    fn retain_of_free_frame_panics() {
        let pool = allocator(4, 1);
        let ppn = pool.allocate(0).unwrap();
        pool.release(0, ppn);
        pool.retain(ppn);
    }

    #[test]
    fn parallel_alloc_release_conserves_frames() {
        let pool = Arc::new(allocator(64, 4));
        let mut handles = alloc::vec::Vec::new();
        for core in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let mut held = alloc::vec::Vec::new();
                    for _ in 0..8 {
                        if let Ok(ppn) = pool.allocate(core) {
                            held.push(ppn);
                        }
                    }
                    for ppn in held {
                        pool.release(core, ppn);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.free_frames(), pool.total_frames());
    }
}
