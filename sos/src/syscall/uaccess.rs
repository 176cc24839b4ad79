//! User-buffer access.
//!
//! System calls that touch user memory go through here. A user buffer is
//! resolved page by page through the same path a hardware fault takes, so
//! a `read` into an untouched heap page allocates it, and a `write` from a
//! paged-out buffer pages it back in.
//!
//! Permissions are validated for the whole buffer before a single byte
//! moves: a copy never partially succeeds past a permission violation.
//! The direction decides the check — copying into user memory needs
//! write permission on the regions, copying out of it needs read.

use crate::KernelError;
use crate::addressing::{PAGE_SIZE, Va};
use crate::coro::Coro;
use crate::kernel::Kernel;
use crate::mm::fault::{FaultAccess, ensure_mapping};
use crate::mm::frame_table::FrameRef;
use crate::mm::page_table::Pte;
use crate::proc::Pid;
use alloc::vec::Vec;

pub(crate) fn check_range(addr: usize, len: usize) -> Result<(), KernelError> {
    let end = addr.checked_add(len).ok_or(KernelError::BadAddress)?;
    if len > 0 {
        Va::new(addr).ok_or(KernelError::BadAddress)?;
        Va::new(end - 1).ok_or(KernelError::BadAddress)?;
    }
    Ok(())
}

/// Fault in every page of the buffer with the required access, before any
/// data moves.
async fn prefault(
    k: &Kernel,
    coro: &Coro,
    pid: Pid,
    addr: usize,
    len: usize,
    access: FaultAccess,
) -> Result<(), KernelError> {
    let mut cur = addr & !(PAGE_SIZE - 1);
    while cur < addr + len {
        ensure_mapping(k, coro, pid, cur, access).await?;
        cur += PAGE_SIZE;
    }
    Ok(())
}

/// Resolve one page to its resident frame, re-faulting if it was evicted
/// between resolution and use.
async fn resolve_frame(
    k: &Kernel,
    coro: &Coro,
    pid: Pid,
    page: Va,
    access: FaultAccess,
) -> Result<FrameRef, KernelError> {
    loop {
        ensure_mapping(k, coro, pid, page.into_usize(), access).await?;
        let w = k.world_mut();
        let Some(aspace) = w.procs.addrspace(pid) else {
            return Err(KernelError::BadAddress);
        };
        match aspace.page_table().lookup(page) {
            Some(Pte::InMemory { frame, .. }) | Some(Pte::Shared { frame, .. }) => {
                return Ok(*frame);
            }
            Some(Pte::Device { .. }) => return Err(KernelError::BadAddress),
            // Evicted again already; go around.
            _ => {}
        }
    }
}

/// Copy `bytes` into user memory at `addr`.
pub(crate) async fn copy_out(
    k: &Kernel,
    coro: &Coro,
    pid: Pid,
    addr: usize,
    bytes: &[u8],
) -> Result<(), KernelError> {
    check_range(addr, bytes.len())?;
    prefault(k, coro, pid, addr, bytes.len(), FaultAccess::Write).await?;
    let mut off = 0;
    while off < bytes.len() {
        let cur = addr + off;
        let page = Va::new(cur).ok_or(KernelError::BadAddress)?.page_align_down();
        let in_page = PAGE_SIZE - (cur - page.into_usize());
        let n = in_page.min(bytes.len() - off);
        let fr = resolve_frame(k, coro, pid, page, FaultAccess::Write).await?;
        let mut w = k.world_mut();
        let start = cur - page.into_usize();
        w.frames.frame_mut(fr).data_mut()[start..start + n]
            .copy_from_slice(&bytes[off..off + n]);
        off += n;
    }
    Ok(())
}

/// Copy `len` bytes out of user memory at `addr`.
pub(crate) async fn copy_in(
    k: &Kernel,
    coro: &Coro,
    pid: Pid,
    addr: usize,
    len: usize,
) -> Result<Vec<u8>, KernelError> {
    check_range(addr, len)?;
    prefault(k, coro, pid, addr, len, FaultAccess::Read).await?;
    // Grows with the data actually copied; `len` comes from user registers
    // and must not size an allocation by itself.
    let mut out = Vec::new();
    while out.len() < len {
        let cur = addr + out.len();
        let page = Va::new(cur).ok_or(KernelError::BadAddress)?.page_align_down();
        let in_page = PAGE_SIZE - (cur - page.into_usize());
        let n = in_page.min(len - out.len());
        let fr = resolve_frame(k, coro, pid, page, FaultAccess::Read).await?;
        let w = k.world_mut();
        let start = cur - page.into_usize();
        out.extend_from_slice(&w.frames.frame(fr).data()[start..start + n]);
    }
    Ok(out)
}
