//! The frame table: the arena of physical frames and the eviction policy.
//!
//! Frames are the only real memory the subsystem has. [`FrameTable`] is a
//! dense arena indexed by [`FrameRef`]; index 0 is a reserved null
//! sentinel. The arena grows lazily, one kernel object at a time, up to
//! `Config::frame_limit`; once neither the free list nor the machine can
//! supply a frame, the clock comes out.
//!
//! The clock hand is the rotation point of the allocated list. Each step
//! pops the front frame and pushes it to the back. Pinned frames are
//! skipped outright. A frame seen with its reference bit set loses the bit
//! and its hardware mapping, so the owner faults (cheaply) if it is still
//! using the page. A frame seen with the bit already clear is the victim.
//! Memory is truly exhausted only when a whole lap of the hand finds no
//! unpinned frame at all.
//!
//! Eviction writes the victim's contents to a pagefile slot with the frame
//! pinned for the whole transfer, and parks any fault for the same page on
//! the entry's wait queue until the transfer settles one way or the other.

use crate::KernelError;
use crate::addressing::{PAGE_SIZE, Va};
use crate::coro::{Coro, WaitQueue};
use crate::kernel::{Kernel, World};
use crate::machine::{CapHandle, ObjectKind};
use crate::mm::PageKey;
use crate::mm::page_table::Pte;
use crate::mm::pagefile;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;

/// Index of a frame in the arena. Never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameRef(usize);

impl FrameRef {
    pub(crate) fn from_raw(idx: usize) -> FrameRef {
        debug_assert!(idx != 0);
        FrameRef(idx)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// One physical frame: its kernel object, its contents as seen through the
/// root task's own window, and the eviction bookkeeping.
pub struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    cap: CapHandle,
    pin: u32,
    referenced: bool,
    owner: Option<PageKey>,
    /// `Shared` entries in other address spaces backed by this frame. Each
    /// share also holds a pin; the frame outlives its owner until the last
    /// share is released.
    shares: u32,
}

impl Frame {
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    pub fn cap(&self) -> CapHandle {
        self.cap
    }

    pub fn owner(&self) -> Option<PageKey> {
        self.owner
    }

    pub fn set_owner(&mut self, owner: Option<PageKey>) {
        self.owner = owner;
    }

    pub fn referenced(&self) -> bool {
        self.referenced
    }

    pub fn set_referenced(&mut self, referenced: bool) {
        self.referenced = referenced;
    }

    pub fn pin_count(&self) -> u32 {
        self.pin
    }

    pub fn shares(&self) -> u32 {
        self.shares
    }

    pub(crate) fn add_share(&mut self) {
        self.shares += 1;
    }

    /// Drop one share, returning how many remain.
    pub(crate) fn drop_share(&mut self) -> u32 {
        debug_assert!(self.shares > 0);
        self.shares -= 1;
        self.shares
    }
}

/// The frame arena. Entry 0 is the null sentinel and never holds a frame.
pub struct FrameTable {
    entries: Vec<Option<Frame>>,
    free: Vec<FrameRef>,
    allocated: VecDeque<FrameRef>,
    limit: usize,
}

impl FrameTable {
    pub fn new(limit: usize) -> Self {
        let mut entries = Vec::with_capacity(limit + 1);
        entries.push(None);
        FrameTable {
            entries,
            free: Vec::new(),
            allocated: VecDeque::new(),
            limit,
        }
    }

    /// Frames the arena has claimed so far.
    pub fn total(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn frame(&self, fr: FrameRef) -> &Frame {
        self.entries[fr.0].as_ref().unwrap_or_else(|| {
            panic!("frame table hole at {}", fr.0);
        })
    }

    pub fn frame_mut(&mut self, fr: FrameRef) -> &mut Frame {
        self.entries[fr.0].as_mut().unwrap_or_else(|| {
            panic!("frame table hole at {}", fr.0);
        })
    }

    /// Exclude a frame from eviction. Counts nest.
    pub fn pin(&mut self, fr: FrameRef) {
        self.frame_mut(fr).pin += 1;
    }

    pub fn unpin(&mut self, fr: FrameRef) {
        let f = self.frame_mut(fr);
        debug_assert!(f.pin > 0, "unpin of unpinned frame {}", fr.0);
        f.pin -= 1;
    }

    /// Discard every pin on `fr`. Teardown only; pin holders for a dead
    /// process never touch the frame again.
    pub(crate) fn drop_pins(&mut self, fr: FrameRef) {
        self.frame_mut(fr).pin = 0;
    }

    /// Reuse a frame off the free list, zeroed, placed at the back of the
    /// allocated list.
    pub(crate) fn pop_free(&mut self) -> Option<FrameRef> {
        let fr = self.free.pop()?;
        let f = self.frame_mut(fr);
        f.data.fill(0);
        f.pin = 0;
        f.referenced = false;
        f.owner = None;
        f.shares = 0;
        self.allocated.push_back(fr);
        Some(fr)
    }

    /// Whether the arena may still claim fresh kernel objects.
    pub(crate) fn can_grow(&self) -> bool {
        self.total() < self.limit
    }

    /// Take ownership of a freshly allocated frame object.
    pub(crate) fn adopt(&mut self, cap: CapHandle) -> FrameRef {
        debug_assert!(self.can_grow());
        let fr = FrameRef(self.entries.len());
        self.entries.push(Some(Frame {
            data: Box::new([0; PAGE_SIZE]),
            cap,
            pin: 0,
            referenced: false,
            owner: None,
            shares: 0,
        }));
        self.allocated.push_back(fr);
        fr
    }

    /// Return an allocated frame to the free list. The frame must be
    /// unpinned and unowned; its kernel object is retained for reuse.
    pub(crate) fn release(&mut self, fr: FrameRef) {
        {
            let f = self.frame_mut(fr);
            debug_assert!(f.pin == 0, "release of pinned frame {}", fr.0);
            debug_assert!(f.shares == 0, "release of shared frame {}", fr.0);
            f.owner = None;
            f.referenced = false;
        }
        let pos = self.allocated.iter().position(|&x| x == fr);
        debug_assert!(pos.is_some(), "release of frame {} not allocated", fr.0);
        if let Some(pos) = pos {
            self.allocated.remove(pos);
        }
        self.free.push(fr);
    }

    /// Advance the clock hand one step, returning the frame it passed over.
    fn clock_rotate(&mut self) -> Option<FrameRef> {
        let fr = self.allocated.pop_front()?;
        self.allocated.push_back(fr);
        Some(fr)
    }
}

impl World {
    /// Select an eviction victim with the clock policy.
    ///
    /// Returns `None` only after a full lap of the hand saw no unpinned
    /// frame. A frame whose reference bit was cleared earlier in this same
    /// scan is evicted when the hand reaches it again.
    pub(crate) fn find_victim(&mut self) -> Option<FrameRef> {
        let n = self.frames.allocated_count();
        if n == 0 {
            return None;
        }
        let mut lap_unpinned = false;
        for step in 1..=2 * n {
            let fr = self.frames.clock_rotate()?;
            let f = self.frames.frame(fr);
            if f.pin == 0 {
                lap_unpinned = true;
                if !f.referenced {
                    return Some(fr);
                }
                let owner = f.owner;
                self.frames.frame_mut(fr).set_referenced(false);
                if let Some(key) = owner {
                    self.invalidate_mapping(key);
                }
            }
            if step % n == 0 {
                if !lap_unpinned {
                    return None;
                }
                lap_unpinned = false;
            }
        }
        None
    }

    /// Drop the hardware mapping of a resident page, leaving the entry
    /// `InMemory`. The owner takes a cheap fault if it touches the page
    /// again.
    fn invalidate_mapping(&mut self, key: PageKey) {
        let World { procs, machine, .. } = self;
        let Some(aspace) = procs.addrspace_mut(key.pid) else {
            return;
        };
        let vspace = aspace.vspace();
        if let Some(Pte::InMemory { mapping, .. }) =
            aspace.page_table_mut().lookup_mut(Va::from_vpn(key.vpn))
        {
            if let Some(handle) = mapping.take() {
                machine.unmap_page(vspace, handle);
            }
        }
    }

    /// Return a frame to the free pool. Sync path for unmapped, unpinned,
    /// unowned frames.
    pub(crate) fn free_frame(&mut self, fr: FrameRef) {
        self.frames.release(fr);
    }
}

/// Allocate a frame: free list first, then arena growth, then eviction.
///
/// The returned frame is pinned; the caller unpins it once it is wired
/// into a page table (or keeps the pin, for paging-structure frames).
/// Suspends only when eviction I/O is needed.
pub(crate) async fn alloc_frame(kernel: &Kernel, coro: &Coro) -> Result<FrameRef, KernelError> {
    coro.check()?;
    {
        let mut w = kernel.world_mut();
        if let Some(fr) = w.frames.pop_free() {
            w.frames.pin(fr);
            return Ok(fr);
        }
        if w.frames.can_grow() {
            match w.machine.alloc_object(ObjectKind::Frame) {
                Ok(cap) => {
                    let fr = w.frames.adopt(cap);
                    w.frames.pin(fr);
                    return Ok(fr);
                }
                Err(_) => {
                    log::debug!("object allocator exhausted below frame limit; evicting");
                }
            }
        }
    }
    let fr = page_out_victim(kernel).await?;
    if coro.check().is_err() {
        let mut w = kernel.world_mut();
        w.frames.unpin(fr);
        w.free_frame(fr);
        return Err(KernelError::Interrupted);
    }
    Ok(fr)
}

/// Evict one page to the pagefile and hand back its frame, pinned and
/// zeroed.
///
/// The victim's entry goes `PagingOut` for the duration of the transfer;
/// anything faulting on that page parks on the entry's wait queue and
/// re-resolves once woken. On a failed transfer the entry reverts to
/// `InMemory` (unmapped) and the waiters are woken all the same.
async fn page_out_victim(kernel: &Kernel) -> Result<FrameRef, KernelError> {
    let (fr, key, waiters, slot, vnode, buf) = {
        let mut w = kernel.world_mut();
        let fr = match w.find_victim() {
            Some(fr) => fr,
            None => {
                log::warn!("out of memory: no evictable frame");
                return Err(KernelError::NoMemory);
            }
        };
        w.frames.pin(fr);
        let key = match w.frames.frame(fr).owner() {
            Some(key) => key,
            None => {
                // Unowned allocated frames are pinned by construction.
                debug_assert!(false, "unowned frame {} selected as victim", fr.index());
                w.frames.frame_mut(fr).data.fill(0);
                return Ok(fr);
            }
        };
        let slot = match w.pagefile.alloc_slot() {
            Ok(slot) => slot,
            Err(e) => {
                w.frames.unpin(fr);
                return Err(e);
            }
        };
        let waiters = Rc::new(WaitQueue::new());
        let moved = {
            let World { procs, machine, .. } = &mut *w;
            match procs.addrspace_mut(key.pid) {
                Some(aspace) => {
                    let vspace = aspace.vspace();
                    match aspace.page_table_mut().lookup_mut(Va::from_vpn(key.vpn)) {
                        Some(pte) => {
                            if let Pte::InMemory { mapping, .. } = pte {
                                if let Some(handle) = mapping.take() {
                                    machine.unmap_page(vspace, handle);
                                }
                                *pte = Pte::PagingOut {
                                    frame: fr,
                                    waiters: waiters.clone(),
                                };
                                true
                            } else {
                                false
                            }
                        }
                        None => false,
                    }
                }
                None => false,
            }
        };
        if !moved {
            // The owner back-reference always names a resident entry.
            debug_assert!(false, "victim owner entry out of sync");
            w.pagefile.free_slot(slot);
            w.frames.unpin(fr);
            return Err(KernelError::NoMemory);
        }
        let vnode = w.pagefile.vnode();
        let buf = Box::new(*w.frames.frame(fr).data());
        (fr, key, waiters, slot, vnode, buf)
    };

    log::debug!(
        "page out pid {} vpn {:#x} (frame {}) to slot {}",
        key.pid,
        key.vpn,
        fr.index(),
        slot
    );
    let io = pagefile::write_page(vnode, slot, &buf).await;

    let mut w = kernel.world_mut();
    match io {
        Ok(()) => {
            let settled = match w.pte_mut(key) {
                Some(pte) => {
                    debug_assert!(matches!(pte, Pte::PagingOut { .. }));
                    *pte = Pte::PagedOut { slot };
                    true
                }
                None => false,
            };
            if !settled {
                // The owner was torn down while we held the frame; nobody
                // needs the slot contents.
                w.pagefile.free_slot(slot);
            }
            let f = w.frames.frame_mut(fr);
            f.set_owner(None);
            f.set_referenced(false);
            f.data.fill(0);
            waiters.wake_all();
            Ok(fr)
        }
        Err(e) => {
            w.pagefile.free_slot(slot);
            let restored = match w.pte_mut(key) {
                Some(pte) => {
                    debug_assert!(matches!(pte, Pte::PagingOut { .. }));
                    *pte = Pte::InMemory {
                        frame: fr,
                        mapping: None,
                    };
                    true
                }
                None => false,
            };
            if restored {
                w.frames.frame_mut(fr).set_referenced(true);
                w.frames.unpin(fr);
            } else {
                w.frames.frame_mut(fr).set_owner(None);
                w.frames.unpin(fr);
                w.free_frame(fr);
            }
            waiters.wake_all();
            log::warn!("page out to slot {slot} failed: {e:?}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::EmulatedMachine;

    fn table_with_frames(n: usize) -> (FrameTable, EmulatedMachine) {
        use crate::machine::Machine;
        let mut machine = EmulatedMachine::new(64);
        let mut ft = FrameTable::new(n);
        for _ in 0..n {
            let cap = machine.alloc_object(ObjectKind::Frame).unwrap();
            ft.adopt(cap);
        }
        (ft, machine)
    }

    #[test]
    fn grow_release_reuse() {
        let (mut ft, _m) = table_with_frames(2);
        assert_eq!(ft.total(), 2);
        assert!(!ft.can_grow());
        assert_eq!(ft.allocated_count(), 2);

        let fr = FrameRef::from_raw(1);
        ft.frame_mut(fr).data_mut()[0] = 0xaa;
        ft.release(fr);
        assert_eq!(ft.free_count(), 1);

        let again = ft.pop_free().unwrap();
        assert_eq!(again, fr);
        // Reused frames come back zeroed.
        assert_eq!(ft.frame(again).data()[0], 0);
        assert_eq!(ft.free_count(), 0);
    }

    #[test]
    fn pins_nest() {
        let (mut ft, _m) = table_with_frames(1);
        let fr = FrameRef::from_raw(1);
        ft.pin(fr);
        ft.pin(fr);
        ft.unpin(fr);
        assert_eq!(ft.frame(fr).pin_count(), 1);
        ft.unpin(fr);
        assert_eq!(ft.frame(fr).pin_count(), 0);
    }

    #[test]
    fn clock_rotation_is_a_cycle() {
        let (mut ft, _m) = table_with_frames(3);
        let first = ft.clock_rotate().unwrap();
        let second = ft.clock_rotate().unwrap();
        let third = ft.clock_rotate().unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(ft.clock_rotate().unwrap(), first);
    }
}
