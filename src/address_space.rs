//! Per-process address spaces with a private kernel-mirror table.
//!
//! An [`AddressSpace`] owns two page tables built from the same primitives:
//! the *user* table, holding every user mapping, and a *mirror* table that
//! repeats each user translation with the user-accessible bit stripped on
//! top of the fixed kernel layout. Trusted code can then resolve user
//! addresses through the mirror without consulting the user table. Every
//! mutation (grow, shrink, fork, image staging) writes the user table first
//! and re-syncs the affected range into the mirror, so the two never
//! diverge between operations.

use alloc::{sync::Arc, vec::Vec};

use bitflags::bitflags;
use log::{debug, trace};

use crate::{
    address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum, VpnRange},
    config::{PAGE_SIZE, USER_CEILING},
    copy,
    error::{CopyError, GrowError, LoadError, OutOfFrames},
    frame_allocator::FrameAllocator,
    page_table::{PageTable, PageTableEntry, PteFlags, Teardown},
};

bitflags! {
    /// Access permission of a mapping, the R/W/X/U subset of [`PteFlags`].
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct MapPermission: u8 {
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// User-accessible.
        const U = 1 << 4;
    }
}

impl From<MapPermission> for PteFlags {
    fn from(perm: MapPermission) -> Self {
        PteFlags::from_bits_truncate(perm.bits())
    }
}

/// One fixed kernel mapping: device window, kernel text/data, trampoline.
pub struct KernelRegion {
    /// Human-readable name, used only for logging.
    pub name: &'static str,
    /// Start of the virtual range.
    pub va: VirtAddr,
    /// Start of the physical range.
    pub pa: PhysAddr,
    /// Length in bytes; rounded up to whole pages.
    pub len: usize,
    /// Access bits; must not include [`MapPermission::U`].
    pub perm: MapPermission,
}

/// The fixed kernel mappings copied into every mirror table.
///
/// Supplied once at bootstrap and immutable afterwards.
pub struct KernelLayout {
    /// Regions in mapping order.
    pub regions: Vec<KernelRegion>,
}

impl KernelLayout {
    fn apply(&self, table: &mut PageTable) -> Result<(), OutOfFrames> {
        for region in &self.regions {
            assert!(
                !region.perm.contains(MapPermission::U),
                "kernel region {} must not be user-accessible",
                region.name
            );
            trace!(
                "mapping {} [{:#x}, {:#x})",
                region.name,
                region.va.0,
                region.va.0 + region.len
            );
            let range = VpnRange::new(
                region.va.to_vpn_by_floor(),
                VirtAddr(region.va.0 + region.len).to_vpn_by_ceil(),
            );
            table.map(range, region.pa.to_ppn_by_floor(), region.perm.into())?;
        }
        Ok(())
    }
}

/// Readable source of program-image bytes.
///
/// The seam through which the loader hands segment contents to
/// [`AddressSpace::load_segment`] without this crate knowing about
/// executables or filesystems.
pub trait ImageSource {
    /// Read up to `buf.len()` bytes at `offset`; returns the number read.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;
}

impl ImageSource for [u8] {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        if offset >= self.len() {
            return 0;
        }
        let n = buf.len().min(self.len() - offset);
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        n
    }
}

/// The complete virtual-memory state of one process.
pub struct AddressSpace {
    user: PageTable,
    mirror: PageTable,
    size: usize,
    allocator: Arc<FrameAllocator>,
    layout: Arc<KernelLayout>,
    core: usize,
}

impl AddressSpace {
    /// Create an empty address space on behalf of `core`.
    ///
    /// The user table starts bare; the mirror is pre-populated with the
    /// fixed kernel regions from `layout`.
    pub fn new_user(
        allocator: &Arc<FrameAllocator>,
        core: usize,
        layout: &Arc<KernelLayout>,
    ) -> Result<Self, OutOfFrames> {
        let user = PageTable::new(allocator, core)?;
        let mirror = match PageTable::new(allocator, core) {
            Ok(mirror) => mirror,
            Err(e) => {
                user.destroy(Teardown::Strict);
                return Err(e);
            }
        };
        let mut space = Self {
            user,
            mirror,
            size: 0,
            allocator: Arc::clone(allocator),
            layout: Arc::clone(layout),
            core,
        };
        if let Err(e) = space.layout.apply(&mut space.mirror) {
            // Kernel leaves are not refcounted; loose teardown drops only
            // the table frames themselves.
            space.mirror.destroy(Teardown::Loose);
            space.user.destroy(Teardown::Strict);
            return Err(e);
        }
        debug!(
            "new address space: user root {:?}, mirror root {:?}",
            space.user.root_ppn(),
            space.mirror.root_ppn()
        );
        Ok(space)
    }

    /// Current high-water mark of mapped user memory, in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The user page table.
    pub fn user_table(&self) -> &PageTable {
        &self.user
    }

    /// The private kernel-mirror table.
    pub fn mirror_table(&self) -> &PageTable {
        &self.mirror
    }

    /// Valid user-table entry for `vpn`, if any.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.user.translate(vpn)
    }

    /// Extend mapped user memory up to `new_top` bytes.
    ///
    /// Every new page is zero-filled and mapped user-read-write-execute.
    /// All-or-nothing: on failure the address space is exactly as before.
    /// Returns the new size; a `new_top` at or below the current size is a
    /// no-op.
    pub fn grow(&mut self, new_top: usize) -> Result<usize, GrowError> {
        if new_top <= self.size {
            return Ok(self.size);
        }
        if new_top > USER_CEILING {
            return Err(GrowError::AboveCeiling(new_top));
        }

        let start = VirtAddr(self.size).to_vpn_by_ceil();
        let end = VirtAddr(new_top).to_vpn_by_ceil();
        let perm = PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U;

        // One journal for the whole call: a failure anywhere must give back
        // the interior tables of every page mapped so far, not just the
        // data frames.
        let mut created = Vec::new();
        for vpn in VpnRange::new(start, end) {
            let frame = match self.allocator.allocate(self.core) {
                Ok(frame) => frame,
                Err(e) => {
                    self.unwind_grow(start, vpn, &created);
                    return Err(e.into());
                }
            };
            self.allocator.mem().frame_bytes(frame).fill(0);
            if let Err(e) = self.user.map_one(vpn, frame, perm, &mut created) {
                self.allocator.release(self.core, frame);
                self.unwind_grow(start, vpn, &created);
                return Err(e.into());
            }
        }

        if let Err(e) = self.mirror_sync(VpnRange::new(start, end)) {
            self.unwind_grow(start, end, &created);
            // Clear whatever made it into the mirror; the clearing pass
            // allocates nothing.
            self.mirror_sync(VpnRange::new(start, end))
                .expect("clearing mirror entries does not allocate");
            return Err(e.into());
        }

        trace!("grow {:#x} -> {new_top:#x}", self.size);
        self.size = new_top;
        Ok(new_top)
    }

    /// Unmap and release every page at or above `new_top`.
    ///
    /// A no-op if `new_top` is not below the current size. Returns the new
    /// size.
    pub fn shrink(&mut self, new_top: usize) -> usize {
        if new_top >= self.size {
            return self.size;
        }
        let start = VirtAddr(new_top).to_vpn_by_ceil();
        let end = VirtAddr(self.size).to_vpn_by_ceil();
        if start < end {
            let range = VpnRange::new(start, end);
            self.user.unmap(range, true);
            self.mirror_sync(range)
                .expect("clearing mirror entries does not allocate");
        }
        trace!("shrink {:#x} -> {new_top:#x}", self.size);
        self.size = new_top;
        new_top
    }

    /// Duplicate this address space for a forked process.
    ///
    /// Every mapped page is deep-copied into a fresh frame with the same
    /// permissions. On failure nothing the call allocated stays behind.
    pub fn fork_copy(&self) -> Result<Self, OutOfFrames> {
        let mut child = Self::new_user(&self.allocator, self.core, &self.layout)?;
        let end = VirtAddr(self.size).to_vpn_by_ceil();

        for vpn in VpnRange::new(VirtPageNum(0), end) {
            let src = self
                .user
                .translate(vpn)
                .unwrap_or_else(|| panic!("fork: {vpn:?} should be mapped"));
            let frame = match self.allocator.allocate(self.core) {
                Ok(frame) => frame,
                Err(e) => {
                    child.abandon(vpn);
                    return Err(e);
                }
            };
            let bytes = self.allocator.mem().frame_bytes(src.ppn());
            self.allocator
                .mem()
                .frame_bytes(frame)
                .copy_from_slice(bytes);
            let perm = src.flags() & (PteFlags::LEAF | PteFlags::U);
            if let Err(e) = child.map_user_page(vpn, frame, perm) {
                self.allocator.release(self.core, frame);
                child.abandon(vpn);
                return Err(e);
            }
        }

        if let Err(e) = child.mirror_sync(VpnRange::new(VirtPageNum(0), end)) {
            child.abandon(end);
            return Err(e);
        }
        child.size = self.size;
        debug!(
            "forked {:?} -> {:?} ({} bytes)",
            self.user.root_ppn(),
            child.user.root_ppn(),
            self.size
        );
        Ok(child)
    }

    /// Map one page at virtual address zero and copy the initial program
    /// image into it. Used once, for the very first process.
    pub fn stage_image(&mut self, image: &[u8]) -> Result<(), OutOfFrames> {
        assert!(self.size == 0, "stage_image on a non-empty address space");
        assert!(image.len() <= PAGE_SIZE, "image larger than a page");

        let frame = self.allocator.allocate(self.core)?;
        let bytes = self.allocator.mem().frame_bytes(frame);
        bytes.fill(0);
        bytes[..image.len()].copy_from_slice(image);

        let perm = PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U;
        let first = VpnRange::new(VirtPageNum(0), VirtPageNum(1));
        let mut created = Vec::new();
        if let Err(e) = self.user.map_one(VirtPageNum(0), frame, perm, &mut created) {
            self.allocator.release(self.core, frame);
            self.user.unroll(&[], &created);
            return Err(e);
        }
        if let Err(e) = self.mirror_sync(first) {
            self.user.unmap(first, true);
            self.user.unroll(&[], &created);
            return Err(e);
        }
        self.size = PAGE_SIZE;
        trace!("staged {} image bytes at va 0", image.len());
        Ok(())
    }

    /// Copy `len` bytes from `source` into the pages already mapped at
    /// page-aligned `va`.
    ///
    /// Fails if a destination page is unmapped or the source runs dry;
    /// earlier pages keep what was written.
    pub fn load_segment<S>(
        &mut self,
        va: VirtAddr,
        len: usize,
        source: &S,
        offset: usize,
    ) -> Result<(), LoadError>
    where
        S: ImageSource + ?Sized,
    {
        assert!(va.is_aligned(), "load_segment: {va:?} is not page-aligned");
        let mut done = 0;
        while done < len {
            let page = VirtAddr(va.0 + done);
            let pte = self
                .user
                .translate(page.to_vpn_by_floor())
                .ok_or(LoadError::Unmapped(page))?;
            let n = PAGE_SIZE.min(len - done);
            let buf = &mut self.allocator.mem().frame_bytes(pte.ppn())[..n];
            let got = source.read_at(offset + done, buf);
            if got != n {
                return Err(LoadError::SourceTruncated(n - got));
            }
            done += n;
        }
        Ok(())
    }

    /// Re-derive the mirror entries for `range` from the user table.
    ///
    /// Each user entry is copied verbatim with the user-accessible bit
    /// stripped; a page absent user-side loses its mirror leaf. Mirror
    /// leaves take no reference counts; the user table is always a
    /// co-owner of their frames.
    ///
    /// On allocation failure the interior tables this call created are
    /// released again. Entries written into pre-existing mirror tables
    /// before the failure stay; the caller clears them by re-running the
    /// sync once the user side is unwound.
    pub fn mirror_sync(&mut self, range: VpnRange) -> Result<(), OutOfFrames> {
        let mut created = Vec::new();
        for vpn in range {
            match self.user.translate(vpn) {
                Some(upte) => {
                    let pte = match self.mirror.find_pte_create(vpn, &mut created) {
                        Ok(pte) => pte,
                        Err(e) => {
                            self.mirror.unroll(&[], &created);
                            return Err(e);
                        }
                    };
                    *pte = PageTableEntry::new(upte.ppn(), upte.flags() - PteFlags::U);
                }
                None => {
                    if let Some(pte) = self.mirror.find_pte(vpn) {
                        if pte.is_valid() {
                            assert!(pte.is_leaf(), "mirror: {vpn:?} is not a leaf");
                            *pte = PageTableEntry::empty();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Tear the address space down: release every user page, then both
    /// tables (user strictly, mirror loosely).
    pub fn destroy(mut self) {
        let end = VirtAddr(self.size).to_vpn_by_ceil();
        if end.0 > 0 {
            self.user.unmap(VpnRange::new(VirtPageNum(0), end), true);
        }
        debug!("destroying address space, user root {:?}", self.user.root_ppn());
        self.user.destroy(Teardown::Strict);
        self.mirror.destroy(Teardown::Loose);
    }

    /// Copy `src` into this address space at `dst`, resolving pages through
    /// the kernel-mirror table.
    ///
    /// Faults on the first unmapped or non-writable page; earlier pages
    /// stay written.
    pub fn copy_out(&self, dst: VirtAddr, src: &[u8]) -> Result<(), CopyError> {
        self.check_user_range(dst, src.len())?;
        copy::copy_out_kernel(&self.mirror, dst, src)
    }

    /// Fill `dst` from this address space at `src`, resolving pages through
    /// the kernel-mirror table.
    pub fn copy_in(&self, dst: &mut [u8], src: VirtAddr) -> Result<(), CopyError> {
        self.check_user_range(src, dst.len())?;
        copy::copy_in_kernel(&self.mirror, dst, src)
    }

    /// Copy a terminated byte string from `src`, terminator included.
    ///
    /// Returns the copied length. Fails if no terminator shows up within
    /// `dst.len()` bytes or before the end of mapped user memory.
    pub fn copy_in_string(&self, dst: &mut [u8], src: VirtAddr) -> Result<usize, CopyError> {
        if src.0 >= self.size {
            return Err(CopyError::Unmapped(src));
        }
        let bound = dst.len().min(self.size - src.0);
        match copy::copy_in_string_kernel(&self.mirror, &mut dst[..bound], src) {
            Err(CopyError::Unterminated(_)) if bound < dst.len() => {
                // The scan was cut short by the end of user memory, not by
                // the caller's buffer.
                Err(CopyError::Unmapped(VirtAddr(self.size)))
            }
            other => other,
        }
    }

    fn map_user_page(
        &mut self,
        vpn: VirtPageNum,
        frame: PhysPageNum,
        perm: PteFlags,
    ) -> Result<(), OutOfFrames> {
        self.user
            .map(VpnRange::new(vpn, VirtPageNum(vpn.0 + 1)), frame, perm)
    }

    /// Failure path for half-built spaces: drop the user pages below `upto`
    /// and both tables. `size` is still zero here, so plain `destroy` would
    /// leave those pages behind.
    fn abandon(mut self, upto: VirtPageNum) {
        if upto.0 > 0 {
            self.user
                .unmap(VpnRange::new(VirtPageNum(0), upto), true);
        }
        self.size = 0;
        self.destroy();
    }

    /// Failure path for `grow`: unmap and release the data frames mapped in
    /// `[start, upto)`, then give back the interior tables journaled in
    /// `created`.
    fn unwind_grow(
        &mut self,
        start: VirtPageNum,
        upto: VirtPageNum,
        created: &[(PhysPageNum, usize)],
    ) {
        if start < upto {
            self.user.unmap(VpnRange::new(start, upto), true);
        }
        self.user.unroll(&[], created);
    }

    fn check_user_range(&self, va: VirtAddr, len: usize) -> Result<(), CopyError> {
        if va.0.checked_add(len).map_or(true, |end| end > self.size) {
            let first_bad = if va.0 >= self.size { va } else { VirtAddr(self.size) };
            return Err(CopyError::Unmapped(first_bad));
        }
        Ok(())
    }
}
