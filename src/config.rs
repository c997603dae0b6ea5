//! Geometry of the paged address space and allocator tuning knobs.

/// Size of one physical frame and one virtual page.
pub const PAGE_SIZE: usize = 4096;
/// Number of bits in a page offset.
pub const PAGE_SIZE_BITS: usize = 12;

/// Number of entries in one page-table frame.
pub const ENTRIES_PER_TABLE: usize = 512;
/// Number of radix-tree levels.
pub const TABLE_LEVELS: usize = 3;
/// Number of virtual-page-number bits consumed per level.
pub const INDEX_BITS: usize = 9;

/// One past the highest usable virtual address.
///
/// Sv39 sign-extends bit 38, so the kernel stays out of the upper half and
/// treats `1 << 38` as the ceiling.
pub const MAX_VA: usize = 1 << 38;
/// Highest virtual page number, exclusive.
pub const MAX_VPN: usize = MAX_VA / PAGE_SIZE;

/// Virtual address of the trampoline page, shared by every mirror table.
pub const TRAMPOLINE: usize = MAX_VA - PAGE_SIZE;

/// User mappings must end strictly below this address.
///
/// The kernel-mirror table maps devices and kernel text/data from here up;
/// letting user growth cross it would collide with those fixed entries.
pub const USER_CEILING: usize = 0x0c00_0000;

/// Byte written over a frame when `allocate` hands it out.
pub const ALLOC_JUNK: u8 = 0x05;
/// Byte written over a frame when its reference count reaches zero.
pub const FREE_JUNK: u8 = 0x01;

/// Number of shards in the frame reference-count table.
pub const REFCOUNT_SHARDS: usize = 16;
