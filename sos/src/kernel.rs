//! The root task's long-lived state and entry points.
//!
//! [`Kernel`] owns everything: the machine seam, the frame arena, the
//! pagefile, the process table, and the run queue. There are no global
//! singletons; tests build as many kernels as they like, each against its
//! own emulated machine.
//!
//! The serving discipline mirrors the main loop of a root task: an
//! inbound fault or syscall spawns a continuation
//! ([`Kernel::handle_vm_fault`], [`Kernel::handle_syscall`]);
//! [`Kernel::run`] drives every runnable continuation until all are done
//! or parked; completions surface as [`Event`]s in arrival order.

use crate::KernelError;
use crate::addressing::{PAGE_SIZE, Va};
use crate::config::Config;
use crate::coro::{Cancellation, Coro, Scheduler, WaitQueue};
use crate::machine::{Machine, ObjectKind, map_page_retrying};
use crate::mm::addrspace::AddrSpace;
use crate::mm::fault::{VmFault, ensure_mapping, ensure_node_path};
use crate::mm::frame_table::{FrameTable, alloc_frame};
use crate::mm::page_table::Pte;
use crate::mm::pagefile::Pagefile;
use crate::mm::{PageKey, Permission};
use crate::proc::{Pid, ProcState, ProcessTable};
use crate::syscall::{Syscall, dispatch};
use crate::vfs::Vfs;
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{RefCell, RefMut};
use core::future::Future;

/// Name of the backing-store file opened at boot.
const PAGEFILE_NAME: &str = "pagefile";

/// Every table the subsystem owns. Continuations borrow the world for
/// bounded synchronous stretches and never across a suspension point.
pub struct World {
    pub(crate) config: Config,
    pub(crate) machine: Box<dyn Machine>,
    pub(crate) frames: FrameTable,
    pub(crate) pagefile: Pagefile,
    pub(crate) procs: ProcessTable,
    pub(crate) vfs: Vfs,
    /// Single-flight page-in claims, keyed by page.
    pub(crate) pending_pageins: BTreeMap<PageKey, Rc<WaitQueue>>,
}

impl World {
    /// The live entry a frame's back-reference names, if the owner still
    /// exists.
    pub(crate) fn pte_mut(&mut self, key: PageKey) -> Option<&mut Pte> {
        self.procs
            .addrspace_mut(key.pid)?
            .page_table_mut()
            .lookup_mut(Va::from_vpn(key.vpn))
    }
}

/// Something a served request produced, in completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    FaultResolved { pid: Pid, addr: usize },
    SyscallReply { pid: Pid, value: isize },
    ProcessKilled { pid: Pid },
}

/// Where a user page currently lives, as reported to diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Resident with a live hardware mapping.
    Resident,
    /// Resident, hardware mapping invalidated by the clock.
    ResidentUnmapped,
    PagingOut,
    PagedOut,
    Device,
    Shared,
}

pub struct Kernel {
    world: RefCell<World>,
    sched: Scheduler,
    events: RefCell<VecDeque<Event>>,
}

impl Kernel {
    /// Boot the subsystem: open the pagefile and stand up empty tables.
    pub fn new(config: Config, machine: Box<dyn Machine>) -> Result<Rc<Kernel>, KernelError> {
        let mut vfs = Vfs::new();
        let vnode = vfs.open(PAGEFILE_NAME, true)?;
        let pagefile = Pagefile::new(config.pagefile_pages, vnode);
        let frames = FrameTable::new(config.frame_limit);
        Ok(Rc::new(Kernel {
            world: RefCell::new(World {
                config,
                machine,
                frames,
                pagefile,
                procs: ProcessTable::new(),
                vfs,
                pending_pageins: BTreeMap::new(),
            }),
            sched: Scheduler::new(),
            events: RefCell::new(VecDeque::new()),
        }))
    }

    pub(crate) fn world_mut(&self) -> RefMut<'_, World> {
        self.world.borrow_mut()
    }

    /// Drive every runnable continuation until all are done or parked.
    pub fn run(&self) {
        self.sched.run();
    }

    /// Continuations that exist but have not completed.
    pub fn live_continuations(&self) -> usize {
        self.sched.live()
    }

    /// Spawn `fut`, run to quiescence, return its result. `None` means it
    /// is still parked. Test harness convenience.
    pub fn block_on<T: 'static>(&self, fut: impl Future<Output = T> + 'static) -> Option<T> {
        self.sched.block_on(fut)
    }

    fn push_event(&self, event: Event) {
        self.events.borrow_mut().push_back(event);
    }

    /// Drain the completions recorded so far.
    pub fn take_events(&self) -> Vec<Event> {
        self.events.borrow_mut().drain(..).collect()
    }

    /// Create a process with an empty address space: a stack, an empty
    /// heap, and nothing resident.
    pub async fn create_process(&self) -> Result<Pid, KernelError> {
        let (pid, stack_top, stack_size, heap_base, mmap_base) = {
            let mut w = self.world_mut();
            let max_files = w.config.max_open_files;
            let pid = w.procs.create(max_files);
            (
                pid,
                w.config.stack_top,
                w.config.stack_size,
                w.config.heap_base,
                w.config.mmap_base,
            )
        };
        let root = match alloc_frame(self, &Coro::detached()).await {
            Ok(root) => root,
            Err(e) => {
                self.world_mut().procs.remove(pid);
                return Err(e);
            }
        };
        let mut w = self.world_mut();
        let vspace = match w.machine.create_vspace() {
            Ok(vspace) => vspace,
            Err(e) => {
                w.frames.unpin(root);
                w.free_frame(root);
                w.procs.remove(pid);
                return Err(e);
            }
        };
        let mut aspace = AddrSpace::new(vspace, root, mmap_base);
        let layout = aspace
            .define_stack(stack_top, stack_size)
            .and_then(|()| aspace.define_heap(heap_base));
        if let Err(e) = layout {
            w.machine.destroy_vspace(vspace);
            w.frames.unpin(root);
            w.free_frame(root);
            w.procs.remove(pid);
            return Err(e);
        }
        let p = w.procs.get_mut(pid).unwrap_or_else(|| {
            panic!("process slot {pid} vanished during creation");
        });
        p.addrspace = Some(aspace);
        p.state = ProcState::Running;
        log::debug!("created pid {pid}");
        Ok(pid)
    }

    /// Register a continuation for `pid`. `None` refuses service: the
    /// process is gone or already being killed.
    fn register_coro(&self, pid: Pid) -> Option<Rc<Cancellation>> {
        let mut w = self.world_mut();
        let p = w.procs.get_mut(pid)?;
        if p.state == ProcState::ToBeKilled {
            return None;
        }
        let cancel = Rc::new(Cancellation::new());
        p.live_coros += 1;
        p.kill_hooks.push(cancel.clone());
        Some(cancel)
    }

    fn coro_finished(&self, pid: Pid, cancel: &Rc<Cancellation>) {
        let wake = {
            let mut w = self.world_mut();
            let Some(p) = w.procs.get_mut(pid) else {
                return;
            };
            debug_assert!(p.live_coros > 0);
            p.live_coros -= 1;
            p.kill_hooks.retain(|c| !Rc::ptr_eq(c, cancel));
            (p.live_coros == 0 && p.state == ProcState::ToBeKilled).then(|| p.exit_wq.clone())
        };
        if let Some(wq) = wake {
            wq.wake_all();
        }
    }

    /// Serve a hardware fault: spawn a continuation that resolves the
    /// page (or kills the process) and records the outcome.
    pub fn handle_vm_fault(self: &Rc<Self>, pid: Pid, fault: VmFault) {
        let Some(cancel) = self.register_coro(pid) else {
            return;
        };
        let k = self.clone();
        self.sched.spawn(async move {
            let coro = Coro::new(cancel.clone());
            if fault.is_permission {
                log::warn!("pid {pid}: permission fault at {:#x}", fault.addr);
                k.kill(pid);
            } else {
                match ensure_mapping(&k, &coro, pid, fault.addr, fault.access).await {
                    Ok(()) => k.push_event(Event::FaultResolved {
                        pid,
                        addr: fault.addr,
                    }),
                    Err(KernelError::Interrupted) => {}
                    Err(e) => {
                        log::warn!("pid {pid}: unrecoverable fault at {:#x}: {e:?}", fault.addr);
                        k.kill(pid);
                    }
                }
            }
            k.coro_finished(pid, &cancel);
        });
    }

    /// Serve a system call: spawn a continuation and record the reply.
    pub fn handle_syscall(self: &Rc<Self>, pid: Pid, call: Syscall) {
        let Some(cancel) = self.register_coro(pid) else {
            return;
        };
        {
            let mut w = self.world_mut();
            if let Some(p) = w.procs.get_mut(pid) {
                if p.state == ProcState::Running {
                    p.state = ProcState::Blocked;
                }
            }
        }
        let k = self.clone();
        self.sched.spawn(async move {
            let coro = Coro::new(cancel.clone());
            let value = dispatch(&k, &coro, pid, call).await;
            {
                let mut w = k.world_mut();
                if let Some(p) = w.procs.get_mut(pid) {
                    if p.state == ProcState::Blocked {
                        p.state = ProcState::Running;
                    }
                }
            }
            if !coro.killed() {
                k.push_event(Event::SyscallReply { pid, value });
            }
            k.coro_finished(pid, &cancel);
        });
    }

    /// Kill a process: fire every kill hook, then tear the address space
    /// down once the last of its continuations has unwound.
    pub fn kill(self: &Rc<Self>, pid: Pid) {
        let hooks = {
            let mut w = self.world_mut();
            let Some(p) = w.procs.get_mut(pid) else {
                return;
            };
            if p.state == ProcState::ToBeKilled {
                return;
            }
            p.state = ProcState::ToBeKilled;
            core::mem::take(&mut p.kill_hooks)
        };
        log::debug!("killing pid {pid} ({} continuations in flight)", hooks.len());
        for hook in &hooks {
            hook.cancel();
        }
        let k = self.clone();
        self.sched.spawn(async move {
            loop {
                let wq = {
                    let w = k.world_mut();
                    let Some(p) = w.procs.get(pid) else {
                        return;
                    };
                    if p.live_coros == 0 {
                        break;
                    }
                    p.exit_wq.clone()
                };
                wq.wait().await;
            }
            k.teardown(pid);
            k.push_event(Event::ProcessKilled { pid });
        });
    }

    /// Release everything a dead process owned. Runs with no continuation
    /// of that process live; an eviction started by some other process may
    /// still hold one of its frames, and cleans up after itself when it
    /// finds the owner gone.
    fn teardown(&self, pid: Pid) {
        let mut w = self.world_mut();
        let Some(aspace) = w.procs.get_mut(pid).and_then(|p| p.addrspace.take()) else {
            w.procs.remove(pid);
            return;
        };
        let vspace = aspace.vspace();
        let (node_frames, entries) = aspace.into_page_table().into_parts();
        for (_, pte) in entries {
            match pte {
                Pte::InMemory { frame, .. } => {
                    // Hardware mappings die with the vspace below.
                    let f = w.frames.frame_mut(frame);
                    f.set_owner(None);
                    if f.shares() == 0 {
                        w.frames.drop_pins(frame);
                        w.free_frame(frame);
                    }
                    // Otherwise the frame outlives us; the last sharing
                    // peer frees it.
                }
                Pte::PagedOut { slot } => w.pagefile.free_slot(slot),
                // The in-flight evictor owns the frame and the slot; it
                // will find the owner gone and release both.
                Pte::PagingOut { .. } => {}
                Pte::Device { cap, .. } => w.machine.free_object(cap),
                Pte::Shared { frame, .. } => {
                    let remaining = w.frames.frame_mut(frame).drop_share();
                    w.frames.unpin(frame);
                    let f = w.frames.frame(frame);
                    if remaining == 0 && f.owner().is_none() && f.pin_count() == 0 {
                        w.free_frame(frame);
                    }
                }
            }
        }
        for fr in node_frames {
            w.frames.drop_pins(fr);
            w.free_frame(fr);
        }
        w.machine.destroy_vspace(vspace);
        w.procs.remove(pid);
        log::debug!("tore down pid {pid}");
    }

    /// Map a device window at `addr`, eagerly and permanently resident.
    pub async fn map_device(&self, pid: Pid, addr: usize, paddr: usize) -> Result<(), KernelError> {
        let va = Va::new(addr).ok_or(KernelError::InvalidArgument)?;
        if !va.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        let perms = Permission::READ | Permission::WRITE;
        {
            let mut w = self.world_mut();
            w.procs
                .addrspace_mut(pid)
                .ok_or(KernelError::BadAddress)?
                .define_region(addr, PAGE_SIZE, perms, false)?;
        }
        ensure_node_path(self, &Coro::detached(), pid, va).await?;
        let mut w = self.world_mut();
        let World { procs, machine, .. } = &mut *w;
        let aspace = procs.addrspace_mut(pid).ok_or(KernelError::BadAddress)?;
        let vspace = aspace.vspace();
        let cap = machine.alloc_object(ObjectKind::DeviceFrame { paddr })?;
        let handle = match map_page_retrying(machine.as_mut(), vspace, cap, va, perms) {
            Ok(handle) => handle,
            Err(e) => {
                machine.free_object(cap);
                return Err(e);
            }
        };
        aspace.page_table_mut().insert(
            va,
            Pte::Device {
                cap,
                mapping: Some(handle),
            },
        );
        aspace.note_page_mapped();
        Ok(())
    }

    /// Map a resident page of `owner` into `peer`'s address space at
    /// `peer_addr`, backed by the same frame. The frame is pinned for the
    /// lifetime of the share, so it is never evicted; it survives the
    /// owner's death until the last sharing peer releases it.
    pub async fn share_page(
        &self,
        owner: Pid,
        owner_addr: usize,
        peer: Pid,
        peer_addr: usize,
        perms: Permission,
    ) -> Result<(), KernelError> {
        let src = Va::new(owner_addr)
            .ok_or(KernelError::BadAddress)?
            .page_align_down();
        let dst = Va::new(peer_addr).ok_or(KernelError::InvalidArgument)?;
        if !dst.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        {
            let mut w = self.world_mut();
            w.procs
                .addrspace_mut(peer)
                .ok_or(KernelError::BadAddress)?
                .define_region(peer_addr, PAGE_SIZE, perms, false)?;
        }
        // The pin belongs to the share from here on.
        self.pin_user_page(owner, owner_addr).await?;
        if let Err(e) = ensure_node_path(self, &Coro::detached(), peer, dst).await {
            self.unpin_user_page(owner, owner_addr).ok();
            return Err(e);
        }
        let mut w = self.world_mut();
        let World {
            procs,
            machine,
            frames,
            ..
        } = &mut *w;
        // Pinned above, so the entry is still resident. Sharing an already
        // shared page fans the same frame out further.
        let frame = match procs.addrspace(owner).and_then(|a| a.page_table().lookup(src)) {
            Some(Pte::InMemory { frame, .. }) | Some(Pte::Shared { frame, .. }) => *frame,
            _ => return Err(KernelError::BadAddress),
        };
        let Some(aspace) = procs.addrspace_mut(peer) else {
            frames.unpin(frame);
            return Err(KernelError::BadAddress);
        };
        let vspace = aspace.vspace();
        let cap = frames.frame(frame).cap();
        let handle = match map_page_retrying(machine.as_mut(), vspace, cap, dst, perms) {
            Ok(handle) => handle,
            Err(e) => {
                frames.unpin(frame);
                return Err(e);
            }
        };
        aspace.page_table_mut().insert(
            dst,
            Pte::Shared {
                frame,
                mapping: Some(handle),
            },
        );
        aspace.note_page_mapped();
        frames.frame_mut(frame).add_share();
        log::debug!(
            "shared pid {owner} page {:#x} into pid {peer} at {:#x}",
            src.into_usize(),
            dst.into_usize()
        );
        Ok(())
    }

    /// Touch user memory the way a store from the process would,
    /// demand-paging as needed. Test and loader support.
    pub async fn poke_user(&self, pid: Pid, addr: usize, bytes: &[u8]) -> Result<(), KernelError> {
        crate::syscall::uaccess::copy_out(self, &Coro::detached(), pid, addr, bytes).await
    }

    /// Read user memory the way a load from the process would.
    pub async fn peek_user(
        &self,
        pid: Pid,
        addr: usize,
        len: usize,
    ) -> Result<Vec<u8>, KernelError> {
        crate::syscall::uaccess::copy_in(self, &Coro::detached(), pid, addr, len).await
    }

    /// Wire a user page: make it resident and exclude it from eviction
    /// until [`Kernel::unpin_user_page`]. Device windows are not memory
    /// and cannot be wired.
    pub async fn pin_user_page(&self, pid: Pid, addr: usize) -> Result<(), KernelError> {
        let coro = Coro::detached();
        ensure_mapping(self, &coro, pid, addr, crate::mm::fault::FaultAccess::Read).await?;
        let mut w = self.world_mut();
        let page = Va::new(addr).ok_or(KernelError::BadAddress)?.page_align_down();
        // No suspension since the resolution, so the entry is still in the
        // terminal state it resolved to.
        let frame = match w
            .procs
            .addrspace(pid)
            .ok_or(KernelError::BadAddress)?
            .page_table()
            .lookup(page)
        {
            Some(Pte::InMemory { frame, .. }) | Some(Pte::Shared { frame, .. }) => *frame,
            _ => return Err(KernelError::BadAddress),
        };
        w.frames.pin(frame);
        Ok(())
    }

    pub fn unpin_user_page(&self, pid: Pid, addr: usize) -> Result<(), KernelError> {
        let mut w = self.world_mut();
        let page = Va::new(addr).ok_or(KernelError::BadAddress)?.page_align_down();
        let frame = match w
            .procs
            .addrspace(pid)
            .ok_or(KernelError::BadAddress)?
            .page_table()
            .lookup(page)
        {
            Some(Pte::InMemory { frame, .. }) | Some(Pte::Shared { frame, .. }) => *frame,
            _ => return Err(KernelError::BadAddress),
        };
        w.frames.unpin(frame);
        Ok(())
    }

    // Diagnostics, the `ps`-style reporting surface.

    pub fn process_state(&self, pid: Pid) -> Option<ProcState> {
        self.world.borrow().procs.get(pid).map(|p| p.state())
    }

    /// Pages currently wired into a process.
    pub fn process_pages(&self, pid: Pid) -> Option<usize> {
        self.world.borrow().procs.addrspace(pid).map(|a| a.pages())
    }

    pub fn page_state(&self, pid: Pid, addr: usize) -> Option<PageState> {
        let va = Va::new(addr)?.page_align_down();
        let w = self.world.borrow();
        let pte = w.procs.addrspace(pid)?.page_table().lookup(va)?;
        Some(match pte {
            Pte::InMemory { mapping: Some(_), .. } => PageState::Resident,
            Pte::InMemory { mapping: None, .. } => PageState::ResidentUnmapped,
            Pte::PagingOut { .. } => PageState::PagingOut,
            Pte::PagedOut { .. } => PageState::PagedOut,
            Pte::Device { .. } => PageState::Device,
            Pte::Shared { .. } => PageState::Shared,
        })
    }

    /// `(base, size, mmaped)` for every region, ascending.
    pub fn regions_of(&self, pid: Pid) -> Option<Vec<(usize, usize, bool)>> {
        let w = self.world.borrow();
        let aspace = w.procs.addrspace(pid)?;
        Some(
            aspace
                .regions()
                .map(|r| (r.base(), r.size(), r.is_mmaped()))
                .collect(),
        )
    }

    pub fn frames_total(&self) -> usize {
        self.world.borrow().frames.total()
    }

    pub fn frames_free(&self) -> usize {
        self.world.borrow().frames.free_count()
    }

    pub fn pagefile_used(&self) -> usize {
        self.world.borrow().pagefile.used_slots()
    }

    /// Run the frame/entry cross-checks that must hold whenever no
    /// continuation is suspended mid-operation. Panics on violation.
    pub fn check_consistency(&self) {
        let mut w = self.world_mut();
        let World { procs, frames, .. } = &mut *w;
        let mut owned = alloc::collections::BTreeSet::new();
        let mut slots = alloc::collections::BTreeSet::new();
        for pid in procs.pids() {
            let Some(aspace) = procs.addrspace(pid) else {
                continue;
            };
            aspace.page_table().for_each(|vpn, pte| match pte {
                Pte::InMemory { frame, .. } | Pte::PagingOut { frame, .. } => {
                    let key = PageKey { pid, vpn };
                    assert_eq!(
                        frames.frame(*frame).owner(),
                        Some(key),
                        "frame back-reference mismatch for pid {pid} vpn {vpn:#x}"
                    );
                    assert!(owned.insert(*frame), "frame {} owned twice", frame.index());
                }
                Pte::PagedOut { slot } => {
                    assert!(slots.insert(*slot), "pagefile slot {slot} owned twice");
                }
                _ => {}
            });
        }
    }
}
