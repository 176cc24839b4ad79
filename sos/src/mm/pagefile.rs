//! The pagefile: backing-store slots for evicted pages.
//!
//! The pagefile is a flat file divided into page-sized slots. [`Pagefile`]
//! owns the slot bitmap; a `PagedOut` page-table entry owns exactly one
//! slot, and a slot is owned by at most one entry. Slots are reclaimed on
//! page-in and when a paged-out entry is destroyed.
//!
//! The transfers themselves are free functions over a [`VnodeRef`] rather
//! than methods, so callers can drop every borrow of subsystem state before
//! suspending around the I/O.

use crate::KernelError;
use crate::addressing::PAGE_SIZE;
use crate::coro;
use crate::vfs::VnodeRef;
use alloc::vec;
use alloc::vec::Vec;

/// Slot allocator over the pagefile.
pub struct Pagefile {
    bitmap: Vec<u64>,
    slots: usize,
    used: usize,
    /// Where the next first-fit scan starts. Advances past each allocation
    /// and wraps.
    hint: usize,
    vnode: VnodeRef,
}

impl Pagefile {
    pub fn new(slots: usize, vnode: VnodeRef) -> Self {
        Pagefile {
            bitmap: vec![0; slots.div_ceil(64)],
            slots,
            used: 0,
            hint: 0,
            vnode,
        }
    }

    /// The vnode transfers go through.
    pub fn vnode(&self) -> VnodeRef {
        self.vnode.clone()
    }

    #[inline]
    fn is_used(&self, slot: usize) -> bool {
        self.bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// Claim a free slot, scanning first-fit from the last allocation point
    /// with wraparound.
    pub fn alloc_slot(&mut self) -> Result<usize, KernelError> {
        for i in 0..self.slots {
            let slot = (self.hint + i) % self.slots;
            if !self.is_used(slot) {
                self.bitmap[slot / 64] |= 1 << (slot % 64);
                self.used += 1;
                self.hint = (slot + 1) % self.slots;
                return Ok(slot);
            }
        }
        log::warn!("pagefile full ({} slots)", self.slots);
        Err(KernelError::NoSpace)
    }

    /// Return a slot to the free pool.
    pub fn free_slot(&mut self, slot: usize) {
        debug_assert!(self.is_used(slot), "free of free pagefile slot {slot}");
        self.bitmap[slot / 64] &= !(1 << (slot % 64));
        self.used -= 1;
    }

    /// Whether `slot` is currently claimed. Test support.
    pub fn slot_in_use(&self, slot: usize) -> bool {
        self.is_used(slot)
    }

    /// Number of claimed slots.
    pub fn used_slots(&self) -> usize {
        self.used
    }
}

/// Write one page into `slot`. Suspends the running continuation around
/// the transfer.
pub async fn write_page(
    vnode: VnodeRef,
    slot: usize,
    data: &[u8; PAGE_SIZE],
) -> Result<(), KernelError> {
    coro::yield_now().await;
    let n = vnode.borrow_mut().write_at(data, slot * PAGE_SIZE)?;
    if n != PAGE_SIZE {
        return Err(KernelError::IOError);
    }
    Ok(())
}

/// Read one page back from `slot`. Suspends the running continuation
/// around the transfer.
pub async fn read_page(
    vnode: VnodeRef,
    slot: usize,
    data: &mut [u8; PAGE_SIZE],
) -> Result<(), KernelError> {
    coro::yield_now().await;
    let n = vnode.borrow_mut().read_at(data, slot * PAGE_SIZE)?;
    if n != PAGE_SIZE {
        return Err(KernelError::IOError);
    }
    Ok(())
}
