//! Fault resolution.
//!
//! [`ensure_mapping`] is the heart of the pager: given a faulting address,
//! make the page usable or say why it cannot be. The walk is a loop,
//! because almost every step can suspend — allocating a frame may evict,
//! paging in does I/O, and a page already on its way out must be waited
//! for. After any suspension the world is re-resolved from the region
//! lookup down; nothing cached across a suspension point is trusted.
//!
//! Page-ins are single-flight: the first continuation to find a `PagedOut`
//! entry claims it in the pending table, and everyone else (faults and
//! releases alike) parks until the claim is dropped.

use crate::KernelError;
use crate::addressing::{PAGE_SIZE, Va};
use crate::coro::{Coro, WaitQueue};
use crate::kernel::{Kernel, World};
use crate::machine::map_page_retrying;
use crate::mm::frame_table::alloc_frame;
use crate::mm::page_table::Pte;
use crate::mm::{PageKey, Permission, pagefile};
use crate::proc::Pid;
use alloc::boxed::Box;
use alloc::rc::Rc;

/// What the faulting instruction was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
}

/// A hardware fault as reported by the kernel.
#[derive(Debug, Clone, Copy)]
pub struct VmFault {
    pub addr: usize,
    pub access: FaultAccess,
    /// The mapping existed but forbade the access. Always fatal: the
    /// subsystem never maps with fewer rights than the region grants.
    pub is_permission: bool,
}

enum Step {
    Done,
    Wait(Rc<WaitQueue>),
    Missing { perms: Permission },
    PageIn { slot: usize, perms: Permission, guard: Rc<WaitQueue> },
}

/// Make the page at `addr` present and mapped for `pid`, or fail.
///
/// Errors: `BadAddress` for an address no region covers (after stack
/// growth), `InvalidAccess` for an access the region forbids, `NoMemory`
/// when neither growth nor eviction can produce a frame, `IOError` for a
/// failed backing-store transfer, `Interrupted` when the process was
/// killed while this continuation was suspended.
pub(crate) async fn ensure_mapping(
    k: &Kernel,
    coro: &Coro,
    pid: Pid,
    addr: usize,
    access: FaultAccess,
) -> Result<(), KernelError> {
    let va = Va::new(addr).ok_or(KernelError::BadAddress)?;
    let page = va.page_align_down();
    let key = PageKey {
        pid,
        vpn: page.vpn(),
    };
    loop {
        coro.check()?;
        let step = {
            let mut w = k.world_mut();
            let region = {
                let aspace = w.procs.addrspace_mut(pid).ok_or(KernelError::BadAddress)?;
                aspace.resolve_fault(addr).ok_or(KernelError::BadAddress)?
            };
            match access {
                FaultAccess::Read if !region.perms().contains(Permission::READ) => {
                    return Err(KernelError::InvalidAccess);
                }
                FaultAccess::Write if !region.perms().contains(Permission::WRITE) => {
                    return Err(KernelError::InvalidAccess);
                }
                _ => {}
            }
            if let Some(guard) = w.pending_pageins.get(&key) {
                Step::Wait(guard.clone())
            } else {
                let World {
                    procs,
                    machine,
                    frames,
                    pending_pageins,
                    ..
                } = &mut *w;
                let aspace = procs.addrspace_mut(pid).ok_or(KernelError::BadAddress)?;
                let vspace = aspace.vspace();
                match aspace.page_table_mut().lookup_mut(page) {
                    None => Step::Missing {
                        perms: region.perms(),
                    },
                    Some(Pte::InMemory { frame, mapping }) => {
                        let fr = *frame;
                        if mapping.is_none() {
                            let cap = frames.frame(fr).cap();
                            let handle = map_page_retrying(
                                machine.as_mut(),
                                vspace,
                                cap,
                                page,
                                region.perms(),
                            )?;
                            *mapping = Some(handle);
                        }
                        frames.frame_mut(fr).set_referenced(true);
                        Step::Done
                    }
                    Some(Pte::PagingOut { waiters, .. }) => Step::Wait(waiters.clone()),
                    Some(Pte::PagedOut { slot }) => {
                        let slot = *slot;
                        let guard = Rc::new(WaitQueue::new());
                        pending_pageins.insert(key, guard.clone());
                        Step::PageIn {
                            slot,
                            perms: region.perms(),
                            guard,
                        }
                    }
                    Some(Pte::Device { cap, mapping }) => {
                        if mapping.is_none() {
                            let cap = *cap;
                            let handle = map_page_retrying(
                                machine.as_mut(),
                                vspace,
                                cap,
                                page,
                                region.perms(),
                            )?;
                            *mapping = Some(handle);
                        }
                        Step::Done
                    }
                    Some(Pte::Shared { frame, mapping }) => {
                        if mapping.is_none() {
                            let cap = frames.frame(*frame).cap();
                            let handle = map_page_retrying(
                                machine.as_mut(),
                                vspace,
                                cap,
                                page,
                                region.perms(),
                            )?;
                            *mapping = Some(handle);
                        }
                        Step::Done
                    }
                }
            }
        };
        match step {
            Step::Done => return Ok(()),
            Step::Wait(wq) => {
                coro.wait_on(&wq).await?;
            }
            Step::Missing { perms } => {
                if alloc_map_page(k, coro, pid, page, key, perms).await? {
                    return Ok(());
                }
                // Raced with another continuation; resolve afresh.
            }
            Step::PageIn { slot, perms, guard } => {
                let result = page_in(k, coro, pid, page, key, slot, perms).await;
                k.world_mut().pending_pageins.remove(&key);
                guard.wake_all();
                return result;
            }
        }
    }
}

/// Complete the node path down to `page`'s leaf table, allocating pinned
/// frames for missing nodes. Nodes are linked as soon as they exist.
pub(crate) async fn ensure_node_path(
    k: &Kernel,
    coro: &Coro,
    pid: Pid,
    page: Va,
) -> Result<(), KernelError> {
    loop {
        {
            let w = k.world_mut();
            let aspace = w.procs.addrspace(pid).ok_or(KernelError::BadAddress)?;
            if aspace.page_table().first_missing_level(page).is_none() {
                return Ok(());
            }
        }
        let fr = alloc_frame(k, coro).await?;
        let mut w = k.world_mut();
        let World { procs, frames, .. } = &mut *w;
        match procs.addrspace_mut(pid) {
            Some(aspace) if aspace.page_table().first_missing_level(page).is_some() => {
                aspace.page_table_mut().install_node(page, fr);
            }
            Some(_) => {
                frames.unpin(fr);
                frames.release(fr);
            }
            None => {
                frames.unpin(fr);
                frames.release(fr);
                return Err(KernelError::BadAddress);
            }
        }
    }
}

/// First touch of a page: back it with a zeroed frame and map it.
/// Returns `Ok(false)` when another continuation got there first.
async fn alloc_map_page(
    k: &Kernel,
    coro: &Coro,
    pid: Pid,
    page: Va,
    key: PageKey,
    perms: Permission,
) -> Result<bool, KernelError> {
    ensure_node_path(k, coro, pid, page).await?;
    let fr = alloc_frame(k, coro).await?;
    let mut w = k.world_mut();
    let World {
        procs,
        machine,
        frames,
        ..
    } = &mut *w;
    let Some(aspace) = procs.addrspace_mut(pid) else {
        frames.unpin(fr);
        frames.release(fr);
        return Err(KernelError::BadAddress);
    };
    if aspace.page_table().lookup(page).is_some()
        || aspace.page_table().first_missing_level(page).is_some()
        || aspace.region_containing(page.into_usize()).is_none()
    {
        frames.unpin(fr);
        frames.release(fr);
        return Ok(false);
    }
    let vspace = aspace.vspace();
    let cap = frames.frame(fr).cap();
    let handle = match map_page_retrying(machine.as_mut(), vspace, cap, page, perms) {
        Ok(handle) => handle,
        Err(e) => {
            frames.unpin(fr);
            frames.release(fr);
            return Err(e);
        }
    };
    aspace.page_table_mut().insert(
        page,
        Pte::InMemory {
            frame: fr,
            mapping: Some(handle),
        },
    );
    aspace.note_page_mapped();
    let f = frames.frame_mut(fr);
    f.set_owner(Some(key));
    f.set_referenced(true);
    frames.unpin(fr);
    Ok(true)
}

/// Bring a paged-out page back: allocate a frame, read the slot, map the
/// frame, free the slot. The caller holds the single-flight claim.
async fn page_in(
    k: &Kernel,
    coro: &Coro,
    pid: Pid,
    page: Va,
    key: PageKey,
    slot: usize,
    perms: Permission,
) -> Result<(), KernelError> {
    let fr = alloc_frame(k, coro).await?;
    let vnode = k.world_mut().pagefile.vnode();
    let mut buf = Box::new([0u8; PAGE_SIZE]);
    let io = pagefile::read_page(vnode, slot, &mut buf).await;

    let mut w = k.world_mut();
    if let Err(e) = io {
        w.frames.unpin(fr);
        w.free_frame(fr);
        return Err(e);
    }
    // Killed while the read was in flight: the entry stays paged out and
    // keeps its slot; only the frame claimed for it goes back.
    if coro.check().is_err() {
        w.frames.unpin(fr);
        w.free_frame(fr);
        return Err(KernelError::Interrupted);
    }
    let World {
        procs,
        machine,
        frames,
        pagefile,
        ..
    } = &mut *w;
    let Some(aspace) = procs.addrspace_mut(pid) else {
        frames.unpin(fr);
        frames.release(fr);
        return Err(KernelError::BadAddress);
    };
    let vspace = aspace.vspace();
    match aspace.page_table_mut().lookup_mut(page) {
        Some(pte) => {
            // Single-flight claim: nobody else may have touched the entry.
            debug_assert!(matches!(pte, Pte::PagedOut { .. }));
            *frames.frame_mut(fr).data_mut() = *buf;
            let cap = frames.frame(fr).cap();
            match map_page_retrying(machine.as_mut(), vspace, cap, page, perms) {
                Ok(handle) => {
                    *pte = Pte::InMemory {
                        frame: fr,
                        mapping: Some(handle),
                    };
                    pagefile.free_slot(slot);
                    let f = frames.frame_mut(fr);
                    f.set_owner(Some(key));
                    f.set_referenced(true);
                    frames.unpin(fr);
                    log::debug!(
                        "page in pid {} vpn {:#x} from slot {} into frame {}",
                        pid,
                        key.vpn,
                        slot,
                        fr.index()
                    );
                    Ok(())
                }
                // Entry stays paged out; the slot keeps the contents.
                Err(e) => {
                    frames.unpin(fr);
                    frames.release(fr);
                    Err(e)
                }
            }
        }
        None => {
            frames.unpin(fr);
            frames.release(fr);
            Err(KernelError::BadAddress)
        }
    }
}

/// Release whatever backs the page at `addr`: frame and hardware mapping,
/// pagefile slot, or device window. Waits out an in-flight eviction or
/// page-in of the same page first.
pub(crate) async fn unalloc_page(
    k: &Kernel,
    coro: &Coro,
    pid: Pid,
    addr: usize,
) -> Result<(), KernelError> {
    let va = Va::new(addr).ok_or(KernelError::BadAddress)?;
    let page = va.page_align_down();
    let key = PageKey {
        pid,
        vpn: page.vpn(),
    };
    loop {
        let wait = {
            let mut w = k.world_mut();
            if let Some(guard) = w.pending_pageins.get(&key) {
                guard.clone()
            } else {
                let World {
                    procs,
                    machine,
                    frames,
                    pagefile,
                    ..
                } = &mut *w;
                let Some(aspace) = procs.addrspace_mut(pid) else {
                    return Ok(());
                };
                let vspace = aspace.vspace();
                if let Some(Pte::PagingOut { waiters, .. }) = aspace.page_table().lookup(page) {
                    waiters.clone()
                } else {
                    match aspace.page_table_mut().remove(page) {
                        None => return Ok(()),
                        Some(Pte::InMemory { frame, mapping }) => {
                            if let Some(handle) = mapping {
                                machine.unmap_page(vspace, handle);
                            }
                            frames.frame_mut(frame).set_owner(None);
                            frames.release(frame);
                        }
                        Some(Pte::PagedOut { slot }) => pagefile.free_slot(slot),
                        Some(Pte::Device { cap, mapping }) => {
                            if let Some(handle) = mapping {
                                machine.unmap_page(vspace, handle);
                            }
                            machine.free_object(cap);
                        }
                        Some(Pte::Shared { frame, mapping }) => {
                            if let Some(handle) = mapping {
                                machine.unmap_page(vspace, handle);
                            }
                            let remaining = frames.frame_mut(frame).drop_share();
                            frames.unpin(frame);
                            let f = frames.frame(frame);
                            if remaining == 0 && f.owner().is_none() && f.pin_count() == 0 {
                                frames.release(frame);
                            }
                        }
                        Some(Pte::PagingOut { .. }) => unreachable!(),
                    }
                    aspace.note_page_released();
                    return Ok(());
                }
            }
        };
        coro.wait_on(&wait).await?;
    }
}
