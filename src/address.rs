//! Physical and virtual addresses and page numbers.

use core::fmt::{self, Debug, Formatter};

use crate::config::{INDEX_BITS, PAGE_SIZE, PAGE_SIZE_BITS, TABLE_LEVELS};

//              Virtual Address (39 bits)
// 38                  12 11           0
// +---------------------+-------------+
// | Virtual Page Number | Page Offset |
// +---------------------+-------------+
//
//              Physical Address (56 bits)
// 55                               12 11           0
// +----------------------------------+-------------+
// |       Physical Page Number       | Page Offset |
// +----------------------------------+-------------+
const PA_WIDTH: usize = 56;
const VA_WIDTH: usize = 39;
const PPN_WIDTH: usize = PA_WIDTH - PAGE_SIZE_BITS;
const VPN_WIDTH: usize = VA_WIDTH - PAGE_SIZE_BITS;

/// Physical address.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct PhysAddr(pub usize);

/// Virtual address.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct VirtAddr(pub usize);

/// Physical page number: a frame handle, not a dereferenceable pointer.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct PhysPageNum(pub usize);

/// Virtual page number.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct VirtPageNum(pub usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VA:{:#x}", self.0))
    }
}
impl Debug for VirtPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VPN:{:#x}", self.0))
    }
}
impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PA:{:#x}", self.0))
    }
}
impl Debug for PhysPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PPN:{:#x}", self.0))
    }
}

impl From<usize> for PhysAddr {
    fn from(value: usize) -> Self {
        Self(value & ((1 << PA_WIDTH) - 1))
    }
}

impl From<usize> for PhysPageNum {
    fn from(value: usize) -> Self {
        Self(value & ((1 << PPN_WIDTH) - 1))
    }
}

impl From<usize> for VirtAddr {
    fn from(value: usize) -> Self {
        Self(value & ((1 << VA_WIDTH) - 1))
    }
}

impl From<usize> for VirtPageNum {
    fn from(value: usize) -> Self {
        Self(value & ((1 << VPN_WIDTH) - 1))
    }
}

impl From<PhysAddr> for usize {
    fn from(value: PhysAddr) -> Self {
        value.0
    }
}

impl From<PhysPageNum> for usize {
    fn from(value: PhysPageNum) -> Self {
        value.0
    }
}

impl From<VirtAddr> for usize {
    fn from(value: VirtAddr) -> Self {
        value.0
    }
}

impl From<VirtPageNum> for usize {
    fn from(value: VirtPageNum) -> Self {
        value.0
    }
}

impl PhysAddr {
    /// Get the page offset.
    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Checks if the address is frame-aligned.
    pub fn is_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    /// Frame containing this address.
    pub fn to_ppn_by_floor(&self) -> PhysPageNum {
        PhysPageNum(self.0 / PAGE_SIZE)
    }

    /// First frame at or above this address.
    pub fn to_ppn_by_ceil(&self) -> PhysPageNum {
        if self.0 == 0 {
            PhysPageNum(0)
        } else {
            PhysPageNum((self.0 - 1 + PAGE_SIZE) / PAGE_SIZE)
        }
    }
}

impl From<PhysAddr> for PhysPageNum {
    fn from(value: PhysAddr) -> Self {
        assert!(value.is_aligned(), "{value:?} is not frame-aligned");
        value.to_ppn_by_floor()
    }
}

impl From<PhysPageNum> for PhysAddr {
    fn from(value: PhysPageNum) -> Self {
        Self(value.0 << PAGE_SIZE_BITS)
    }
}

impl VirtAddr {
    /// Get the page offset.
    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Checks if the address is page-aligned.
    pub fn is_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    /// Page containing this address.
    pub fn to_vpn_by_floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 / PAGE_SIZE)
    }

    /// First page at or above this address.
    pub fn to_vpn_by_ceil(&self) -> VirtPageNum {
        if self.0 == 0 {
            VirtPageNum(0)
        } else {
            VirtPageNum((self.0 - 1 + PAGE_SIZE) / PAGE_SIZE)
        }
    }
}

impl From<VirtAddr> for VirtPageNum {
    fn from(value: VirtAddr) -> Self {
        assert!(value.is_aligned(), "{value:?} is not page-aligned");
        value.to_vpn_by_floor()
    }
}

impl From<VirtPageNum> for VirtAddr {
    fn from(value: VirtPageNum) -> Self {
        Self(value.0 << PAGE_SIZE_BITS)
    }
}

impl VirtPageNum {
    /// Radix-tree index at each level, most-significant level first.
    pub fn indexes(&self) -> [usize; TABLE_LEVELS] {
        let mask = (1 << INDEX_BITS) - 1;
        [
            (self.0 >> (2 * INDEX_BITS)) & mask,
            (self.0 >> INDEX_BITS) & mask,
            self.0 & mask,
        ]
    }
}

/// Types that can advance to their successor.
pub trait StepByOne {
    /// Advance by one unit.
    fn step(&mut self);
}

impl StepByOne for VirtPageNum {
    fn step(&mut self) {
        self.0 += 1;
    }
}

/// A half-open range of steppable values.
#[derive(Copy, Clone)]
pub struct SimpleRange<T>
where
    T: Copy + PartialEq + PartialOrd + Debug,
{
    start: T,
    end: T,
}

impl<T> SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    /// Build `start..end`.
    pub fn new(start: T, end: T) -> Self {
        assert!(start <= end, "start {start:?} > end {end:?}!");
        Self { start, end }
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> T {
        self.start
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> T {
        self.end
    }
}

impl<T> IntoIterator for SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    type Item = T;
    type IntoIter = SimpleRangeIterator<T>;
    fn into_iter(self) -> Self::IntoIter {
        SimpleRangeIterator {
            current: self.start,
            end: self.end,
        }
    }
}

/// Iterator over a [`SimpleRange`].
pub struct SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    current: T,
    end: T,
}

impl<T> Iterator for SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    type Item = T;
    fn next(&mut self) -> Option<Self::Item> {
        if self.current == self.end {
            None
        } else {
            let t = self.current;
            self.current.step();
            Some(t)
        }
    }
}

/// A range of virtual page numbers.
pub type VpnRange = SimpleRange<VirtPageNum>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(VirtAddr(0).to_vpn_by_ceil(), VirtPageNum(0));
        assert_eq!(VirtAddr(1).to_vpn_by_ceil(), VirtPageNum(1));
        assert_eq!(VirtAddr(PAGE_SIZE).to_vpn_by_ceil(), VirtPageNum(1));
        assert_eq!(VirtAddr(PAGE_SIZE + 1).to_vpn_by_floor(), VirtPageNum(1));
        assert!(PhysAddr(2 * PAGE_SIZE).is_aligned());
        assert!(!PhysAddr(2 * PAGE_SIZE + 8).is_aligned());
    }

    #[test]
    fn index_split() {
        // vpn = (1 << 18) | (2 << 9) | 3 splits into [1, 2, 3].
        let vpn = VirtPageNum((1 << 18) | (2 << 9) | 3);
        assert_eq!(vpn.indexes(), [1, 2, 3]);
    }

    #[test]
    fn vpn_range_iterates_half_open() {
        let r = VpnRange::new(VirtPageNum(4), VirtPageNum(7));
        let got: alloc::vec::Vec<usize> = r.into_iter().map(|v| v.0).collect();
        assert_eq!(got, [4, 5, 6]);
        assert!(VpnRange::new(VirtPageNum(4), VirtPageNum(4))
            .into_iter()
            .next()
            .is_none());
    }

    #[test]
    #[should_panic(expected = "is not frame-aligned")]
    fn misaligned_frame_conversion_panics() {
        let _ = PhysPageNum::from(PhysAddr(PAGE_SIZE + 16));
    }
}
