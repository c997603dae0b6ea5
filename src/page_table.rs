//! Three-level radix-tree page tables.
//!
//! A [`PageTable`] owns its root frame and every interior frame reachable
//! from it; leaf frames belong to the reference-count mechanism in
//! [`FrameAllocator`]. Callers serialize access to a given table, so there
//! is no lock here, only in the allocator underneath.

use alloc::{sync::Arc, vec::Vec};
use core::fmt::{self, Display, Formatter};

use bitflags::bitflags;

use crate::{
    address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum, VpnRange},
    config::{ENTRIES_PER_TABLE, MAX_VPN},
    error::OutOfFrames,
    frame_allocator::{FrameAllocator, PhysMemory},
};

bitflags! {
    /// Page-table entry flags.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct PteFlags: u8 {
        /// Valid.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// User-accessible.
        const U = 1 << 4;
        /// Global.
        const G = 1 << 5;
        /// Accessed.
        const A = 1 << 6;
        /// Dirty.
        const D = 1 << 7;
    }
}

impl PteFlags {
    /// The access bits that distinguish a leaf from an interior entry.
    pub const LEAF: Self = Self::R.union(Self::W).union(Self::X);
}

/// One packed page-table entry: `ppn << 10 | flags`.
#[repr(transparent)]
#[derive(Copy, Clone)]
pub struct PageTableEntry {
    bits: usize,
}

impl PageTableEntry {
    /// Pack a frame number and flags into an entry.
    pub fn new(ppn: PhysPageNum, flags: PteFlags) -> Self {
        Self {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }

    /// The invalid (zero) entry.
    pub fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Frame this entry points at.
    pub fn ppn(self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }

    /// Flag bits.
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.bits as u8)
    }

    /// Entry participates in translation.
    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// Entry terminates translation at a data/code frame.
    ///
    /// Interior entries never carry R/W/X; leaves always carry at least one.
    pub fn is_leaf(self) -> bool {
        self.flags().intersects(PteFlags::LEAF)
    }

    /// Readable leaf.
    pub fn is_readable(self) -> bool {
        self.flags().contains(PteFlags::R)
    }

    /// Writable leaf.
    pub fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::W)
    }

    /// Executable leaf.
    pub fn is_executable(self) -> bool {
        self.flags().contains(PteFlags::X)
    }

    /// User-accessible leaf.
    pub fn is_user(self) -> bool {
        self.flags().contains(PteFlags::U)
    }
}

/// How [`PageTable::destroy`] treats leftover leaves.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Teardown {
    /// No leaf may remain; one left behind would orphan its frame forever.
    Strict,
    /// Leaves are tolerated and skipped: used for mirror tables, whose
    /// leaves are never the sole owner of their frames.
    Loose,
}

/// A three-level page table rooted in a single frame.
pub struct PageTable {
    root_ppn: PhysPageNum,
    allocator: Arc<FrameAllocator>,
    core: usize,
}

impl PageTable {
    /// Allocate an empty table (root frame only) on behalf of `core`.
    pub fn new(allocator: &Arc<FrameAllocator>, core: usize) -> Result<Self, OutOfFrames> {
        let root = allocator.allocate(core)?;
        allocator.mem().frame_bytes(root).fill(0);
        Ok(Self {
            root_ppn: root,
            allocator: Arc::clone(allocator),
            core,
        })
    }

    /// Frame holding the root of this table.
    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }

    pub(crate) fn mem(&self) -> &PhysMemory {
        self.allocator.mem()
    }

    /// Final-level entry for `vpn`, if every interior level is present.
    ///
    /// The returned entry may itself be invalid.
    pub(crate) fn find_pte(&self, vpn: VirtPageNum) -> Option<&mut PageTableEntry> {
        assert!(vpn.0 < MAX_VPN, "walk past the address ceiling: {vpn:?}");
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;

        for &idx in &idxs[..2] {
            let pte = &mut self.mem().frame_ptes(ppn)[idx];
            if !pte.is_valid() {
                return None;
            }
            ppn = pte.ppn();
        }
        Some(&mut self.mem().frame_ptes(ppn)[idxs[2]])
    }

    /// Final-level entry for `vpn`, allocating interior tables on the way.
    ///
    /// Every interior frame allocated during this call is appended to
    /// `created` as `(parent frame, slot)` so a failing caller can unroll.
    pub(crate) fn find_pte_create(
        &self,
        vpn: VirtPageNum,
        created: &mut Vec<(PhysPageNum, usize)>,
    ) -> Result<&mut PageTableEntry, OutOfFrames> {
        assert!(vpn.0 < MAX_VPN, "walk past the address ceiling: {vpn:?}");
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;

        for &idx in &idxs[..2] {
            let pte = &mut self.mem().frame_ptes(ppn)[idx];
            if !pte.is_valid() {
                let frame = self.allocator.allocate(self.core)?;
                self.mem().frame_bytes(frame).fill(0);
                *pte = PageTableEntry::new(frame, PteFlags::V);
                created.push((ppn, idx));
            }
            ppn = pte.ppn();
        }
        Ok(&mut self.mem().frame_ptes(ppn)[idxs[2]])
    }

    /// Map `range` to the frames starting at `first_ppn`, page by page.
    ///
    /// Interior tables are allocated on demand. On allocation failure
    /// partway through, every leaf installed and every interior table
    /// created by this call is unrolled, so the table is unchanged: map is
    /// atomic from the caller's perspective. Installing over an
    /// already-valid leaf is a caller aliasing bug and panics.
    pub fn map(
        &mut self,
        range: VpnRange,
        first_ppn: PhysPageNum,
        flags: PteFlags,
    ) -> Result<(), OutOfFrames> {
        let mut created = Vec::new();
        let mut installed = Vec::new();

        for (i, vpn) in range.into_iter().enumerate() {
            if let Err(e) = self.map_one(vpn, PhysPageNum(first_ppn.0 + i), flags, &mut created) {
                self.unroll(&installed, &created);
                return Err(e);
            }
            installed.push(vpn);
        }
        Ok(())
    }

    /// Install one leaf, journaling interior tables into the caller's
    /// `created` so a multi-page caller can unroll the whole sequence.
    pub(crate) fn map_one(
        &mut self,
        vpn: VirtPageNum,
        ppn: PhysPageNum,
        flags: PteFlags,
        created: &mut Vec<(PhysPageNum, usize)>,
    ) -> Result<(), OutOfFrames> {
        assert!(
            flags.intersects(PteFlags::LEAF),
            "leaf mapping without any of R/W/X"
        );
        let pte = self.find_pte_create(vpn, created)?;
        assert!(!pte.is_valid(), "{vpn:?} is mapped before mapping");
        *pte = PageTableEntry::new(ppn, flags | PteFlags::V);
        Ok(())
    }

    /// Clear the leaves in `installed` (without releasing their frames),
    /// then release every journaled interior table, deepest first.
    pub(crate) fn unroll(&self, installed: &[VirtPageNum], created: &[(PhysPageNum, usize)]) {
        for &vpn in installed {
            let pte = self.find_pte(vpn).unwrap();
            *pte = PageTableEntry::empty();
        }
        // Children were recorded after their parents; reverse order clears
        // the deepest tables first.
        for &(parent, idx) in created.iter().rev() {
            let entries = self.mem().frame_ptes(parent);
            let child = entries[idx].ppn();
            entries[idx] = PageTableEntry::empty();
            self.allocator.release(self.core, child);
        }
    }

    /// Remove the leaf for every page in `range`.
    ///
    /// Each page must be mapped by a genuine leaf; anything else is a
    /// caller bug and panics. With `release_frames`, each frame's reference
    /// count is dropped as its entry is cleared.
    pub fn unmap(&mut self, range: VpnRange, release_frames: bool) {
        for vpn in range {
            let pte = self
                .find_pte(vpn)
                .unwrap_or_else(|| panic!("unmap: no table for {vpn:?}"));
            assert!(pte.is_valid(), "unmap: {vpn:?} is not mapped");
            assert!(pte.is_leaf(), "unmap: {vpn:?} is not a leaf");
            let ppn = pte.ppn();
            *pte = PageTableEntry::empty();
            if release_frames {
                self.allocator.release(self.core, ppn);
            }
        }
    }

    /// Valid final-level entry for `vpn`, if any.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.find_pte(vpn).copied().filter(|pte| pte.is_valid())
    }

    /// Physical address for a virtual one, walking without a user check.
    pub fn translate_va(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.translate(va.to_vpn_by_floor()).map(|pte| {
            let base: PhysAddr = pte.ppn().into();
            PhysAddr(base.0 + va.page_offset())
        })
    }

    /// Recursively free every table frame reachable from the root, then the
    /// root itself.
    ///
    /// Under [`Teardown::Strict`] a reachable leaf panics: the caller was
    /// required to unmap all data first. Under [`Teardown::Loose`] leaves
    /// are skipped, never released.
    pub fn destroy(self, mode: Teardown) {
        self.free_walk(self.root_ppn, mode);
    }

    fn free_walk(&self, table: PhysPageNum, mode: Teardown) {
        let entries = self.mem().frame_ptes(table);
        for (idx, entry) in entries.iter_mut().enumerate() {
            let pte = *entry;
            if pte.is_valid() && !pte.is_leaf() {
                self.free_walk(pte.ppn(), mode);
                *entry = PageTableEntry::empty();
            } else if pte.is_valid() && mode == Teardown::Strict {
                panic!("teardown: leaf left behind at slot {idx} of {table:?}");
            }
        }
        self.allocator.release(self.core, table);
    }

    /// Tree dump in the classic `vmprint` layout.
    pub fn dump(&self) -> PageTableDump<'_> {
        PageTableDump(self)
    }
}

/// [`Display`] adaptor produced by [`PageTable::dump`].
pub struct PageTableDump<'a>(&'a PageTable);

impl PageTableDump<'_> {
    fn walk(&self, f: &mut Formatter<'_>, table: PhysPageNum, depth: usize) -> fmt::Result {
        for idx in 0..ENTRIES_PER_TABLE {
            let pte = self.0.mem().frame_ptes(table)[idx];
            if !pte.is_valid() {
                continue;
            }
            for _ in 0..depth {
                write!(f, " ..")?;
            }
            writeln!(f, "{idx}: flags {:?} -> {:?}", pte.flags(), pte.ppn())?;
            if !pte.is_leaf() {
                self.walk(f, pte.ppn(), depth + 1)?;
            }
        }
        Ok(())
    }
}

impl Display for PageTableDump<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "page table {:?}", self.0.root_ppn())?;
        self.walk(f, self.0.root_ppn(), 1)
    }
}
