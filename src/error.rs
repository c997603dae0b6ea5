//! Recoverable error types.
//!
//! Only resource exhaustion and user-address faults are `Result` errors;
//! contract violations (double release, remap, unmap of an absent page)
//! are caller bugs and panic, as in [`crate::page_table::PageTable::map`].

use thiserror::Error;

use crate::address::VirtAddr;

/// Every free list was empty.
///
/// Recoverable: the caller rejects the request and keeps its prior state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("out of physical frames")]
pub struct OutOfFrames;

/// Failure to extend an address space.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowError {
    /// Frame allocation failed partway; the address space was rolled back.
    #[error(transparent)]
    OutOfFrames(#[from] OutOfFrames),
    /// The requested top would cross into the fixed kernel mappings.
    #[error("requested top {0:#x} exceeds the user ceiling")]
    AboveCeiling(usize),
}

/// Fault while moving bytes across an address-space boundary.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyError {
    /// No valid translation for this address.
    #[error("{0:?} is not mapped")]
    Unmapped(VirtAddr),
    /// Translation exists but is not user-accessible.
    #[error("{0:?} is not user accessible")]
    NotUser(VirtAddr),
    /// Destination page is not writable.
    #[error("{0:?} is not writable")]
    NotWritable(VirtAddr),
    /// Source page is not readable.
    #[error("{0:?} is not readable")]
    NotReadable(VirtAddr),
    /// No terminator byte within the allowed length.
    #[error("no terminator within {0} bytes")]
    Unterminated(usize),
}

/// Failure to load a program segment into mapped pages.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// A destination page in the segment range is unmapped.
    #[error("{0:?} is not mapped")]
    Unmapped(VirtAddr),
    /// The image source ran out before the segment was filled.
    #[error("image source ended {0} bytes early")]
    SourceTruncated(usize),
}
