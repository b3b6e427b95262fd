//! Syscall-side user-buffer validation and pinning (§4.6): the thin slice
//! of syscall glue this core owns — everything past "here is a validated,
//! resident, pinned range of pages" (argument marshaling, syscall dispatch
//! itself) is plumbing above this crate's scope.

use crate::frame::FrameTable;
use crate::spt::Spt;
use crate::swap::SwapDevice;
use kcore::{BlockDevice, KernelError, PageTable, PhysicalAllocator, Result, Va, PAGE_SIZE};
use std::sync::Arc;

/// Validates and pins every page touched by a `len`-byte user buffer at
/// `va`, faulting in missing pages (or growing the stack) as needed.
/// Returns the page-aligned addresses pinned, in order, so the caller can
/// unpin the same set on syscall exit. On any failure, already-pinned pages
/// from this call are unpinned before returning the error — callers never
/// have to clean up a partial pin themselves.
pub fn pin_range<PT: PageTable, A: PhysicalAllocator, D: BlockDevice>(
    spt: &Arc<Spt<PT>>,
    frames: &FrameTable<PT, A, D>,
    allocator: &A,
    swap: &SwapDevice<D>,
    phys_base: Va,
    esp: Va,
    va: Va,
    len: usize,
    is_write: bool,
) -> Result<Vec<Va>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let first = va.round_down();
    let last = Va(va.0 + (len as u64 - 1)).round_down();
    let mut pinned = Vec::new();
    let mut page = first;
    loop {
        match check_and_pin_addr(spt, frames, allocator, swap, phys_base, esp, page, is_write) {
            Ok(()) => pinned.push(page),
            Err(e) => {
                for p in &pinned {
                    unpin(spt, *p);
                }
                return Err(e);
            }
        }
        if page == last {
            break;
        }
        page = Va(page.0 + PAGE_SIZE as u64);
    }
    Ok(pinned)
}

/// Validates a single user virtual address: it must resolve to an existing
/// SPT entry (faulting it in synchronously if not resident) or qualify for
/// stack growth. A write additionally requires the page be writable.
/// Anything else is a bad address, and the caller is expected to kill the
/// faulting process (the spec's boundary behavior: "kills the process with
/// −1").
pub fn check_and_pin_addr<PT: PageTable, A: PhysicalAllocator, D: BlockDevice>(
    spt: &Arc<Spt<PT>>,
    frames: &FrameTable<PT, A, D>,
    allocator: &A,
    swap: &SwapDevice<D>,
    phys_base: Va,
    esp: Va,
    va: Va,
    is_write: bool,
) -> Result<()> {
    let va = va.round_down();
    if !spt.contains(va) && !spt.try_stack_growth(phys_base, esp, va)? {
        return Err(KernelError::BadAddress);
    }
    if !spt.is_present(va) {
        spt.load(frames, allocator, swap, va)?;
    }
    if is_write && !spt.is_writable(va) {
        return Err(KernelError::InvalidAccess);
    }
    spt.set_pinned(va, true);
    Ok(())
}

/// Releases the pin taken by `check_and_pin_addr`/`pin_range` on syscall
/// exit, making the page eligible for eviction again.
pub fn unpin<PT: PageTable>(spt: &Spt<PT>, va: Va) {
    spt.set_pinned(va.round_down(), false);
}
