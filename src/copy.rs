//! Byte transfer across an address-space boundary.
//!
//! Two resolution modes walk the same page-chunked loops. *User* mode
//! walks a user table directly and insists on the user-accessible bit,
//! for code handed a raw table. *Kernel* mode walks a kernel-mirror
//! table, where the user bit is stripped on purpose and the caller has
//! already bounds-checked the range against the address-space size.

use crate::{
    address::VirtAddr,
    config::PAGE_SIZE,
    error::CopyError,
    page_table::{PageTable, PageTableEntry},
};

#[derive(Copy, Clone, PartialEq, Eq)]
enum WalkMode {
    User,
    Kernel,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

fn resolve(
    table: &PageTable,
    va: VirtAddr,
    mode: WalkMode,
    access: Access,
) -> Result<PageTableEntry, CopyError> {
    let pte = table
        .translate(va.to_vpn_by_floor())
        .ok_or(CopyError::Unmapped(va))?;
    if mode == WalkMode::User && !pte.is_user() {
        return Err(CopyError::NotUser(va));
    }
    match access {
        Access::Read if !pte.is_readable() => Err(CopyError::NotReadable(va)),
        Access::Write if !pte.is_writable() => Err(CopyError::NotWritable(va)),
        _ => Ok(pte),
    }
}

fn copy_out_with(table: &PageTable, dst: VirtAddr, src: &[u8], mode: WalkMode) -> Result<(), CopyError> {
    let mut done = 0;
    while done < src.len() {
        let va = VirtAddr(dst.0 + done);
        let pte = resolve(table, va, mode, Access::Write)?;
        let offset = va.page_offset();
        let n = (PAGE_SIZE - offset).min(src.len() - done);
        let bytes = table.mem().frame_bytes(pte.ppn());
        bytes[offset..offset + n].copy_from_slice(&src[done..done + n]);
        done += n;
    }
    Ok(())
}

fn copy_in_with(table: &PageTable, dst: &mut [u8], src: VirtAddr, mode: WalkMode) -> Result<(), CopyError> {
    let mut done = 0;
    while done < dst.len() {
        let va = VirtAddr(src.0 + done);
        let pte = resolve(table, va, mode, Access::Read)?;
        let offset = va.page_offset();
        let n = (PAGE_SIZE - offset).min(dst.len() - done);
        let bytes = table.mem().frame_bytes(pte.ppn());
        dst[done..done + n].copy_from_slice(&bytes[offset..offset + n]);
        done += n;
    }
    Ok(())
}

fn copy_in_string_with(
    table: &PageTable,
    dst: &mut [u8],
    src: VirtAddr,
    mode: WalkMode,
) -> Result<usize, CopyError> {
    let mut done = 0;
    while done < dst.len() {
        let va = VirtAddr(src.0 + done);
        let pte = resolve(table, va, mode, Access::Read)?;
        let offset = va.page_offset();
        let n = (PAGE_SIZE - offset).min(dst.len() - done);
        let bytes = &table.mem().frame_bytes(pte.ppn())[offset..offset + n];
        for (i, &b) in bytes.iter().enumerate() {
            dst[done + i] = b;
            if b == 0 {
                return Ok(done + i + 1);
            }
        }
        done += n;
    }
    Err(CopyError::Unterminated(dst.len()))
}

/// Copy `src` into user memory at `dst`, walking `table` as a user table.
///
/// Every touched page must be valid, user-accessible, and writable. Stops
/// at the first faulting page; earlier pages stay written.
pub fn copy_out(table: &PageTable, dst: VirtAddr, src: &[u8]) -> Result<(), CopyError> {
    copy_out_with(table, dst, src, WalkMode::User)
}

/// Fill `dst` from user memory at `src`, walking `table` as a user table.
///
/// Every touched page must be valid, user-accessible, and readable.
pub fn copy_in(table: &PageTable, dst: &mut [u8], src: VirtAddr) -> Result<(), CopyError> {
    copy_in_with(table, dst, src, WalkMode::User)
}

/// Copy a zero-terminated byte string from user memory at `src`.
///
/// The terminator is copied and counted. Fails with
/// [`CopyError::Unterminated`] if none appears within `dst.len()` bytes.
pub fn copy_in_string(table: &PageTable, dst: &mut [u8], src: VirtAddr) -> Result<usize, CopyError> {
    copy_in_string_with(table, dst, src, WalkMode::User)
}

pub(crate) fn copy_out_kernel(table: &PageTable, dst: VirtAddr, src: &[u8]) -> Result<(), CopyError> {
    copy_out_with(table, dst, src, WalkMode::Kernel)
}

pub(crate) fn copy_in_kernel(table: &PageTable, dst: &mut [u8], src: VirtAddr) -> Result<(), CopyError> {
    copy_in_with(table, dst, src, WalkMode::Kernel)
}

pub(crate) fn copy_in_string_kernel(
    table: &PageTable,
    dst: &mut [u8],
    src: VirtAddr,
) -> Result<usize, CopyError> {
    copy_in_string_with(table, dst, src, WalkMode::Kernel)
}
