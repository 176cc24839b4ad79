//! Address spaces and region tracking.
//!
//! An [`AddrSpace`] names which spans of virtual memory a process may
//! touch: a stack that grows down on demand, a heap adjusted by `brk`, and
//! anonymous `mmap` segments. Regions live in an ordered map keyed by base
//! address and never overlap; every operation re-establishes that
//! invariant before it returns.
//!
//! The region set is pure bookkeeping. Vacating pages (on `brk` shrink,
//! `munmap`, region destruction) is reported back to the caller as a list
//! of page addresses; releasing the frames, slots, and mappings behind
//! them is the fault layer's business, since it may need to wait out an
//! in-flight eviction.

use crate::KernelError;
use crate::addressing::{PAGE_SIZE, Va, page_round_up};
use crate::machine::VspaceId;
use crate::mm::Permission;
use crate::mm::frame_table::FrameRef;
use crate::mm::page_table::PageTable;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// One contiguous span of valid user addresses.
#[derive(Clone, Copy)]
pub struct Region {
    base: usize,
    size: usize,
    perms: Permission,
    /// Set for anonymous `mmap` regions; `munmap` refuses anything else.
    mmaped: bool,
}

impl Region {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last valid address.
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn perms(&self) -> Permission {
        self.perms
    }

    pub fn is_mmaped(&self) -> bool {
        self.mmaped
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.base <= addr && addr < self.end()
    }
}

/// The memory map of one process.
pub struct AddrSpace {
    vspace: VspaceId,
    page_table: PageTable,
    regions: BTreeMap<usize, Region>,
    stack_base: Option<usize>,
    heap_base: Option<usize>,
    mmap_cursor: usize,
    pagecount: usize,
}

impl AddrSpace {
    /// Build an empty address space over `vspace`, its page-table root
    /// backed by `root_frame` (pinned by the caller).
    pub fn new(vspace: VspaceId, root_frame: FrameRef, mmap_base: usize) -> Self {
        AddrSpace {
            vspace,
            page_table: PageTable::new(root_frame),
            regions: BTreeMap::new(),
            stack_base: None,
            heap_base: None,
            mmap_cursor: mmap_base,
            pagecount: 0,
        }
    }

    pub fn vspace(&self) -> VspaceId {
        self.vspace
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    /// Frames currently wired into this address space.
    pub fn pages(&self) -> usize {
        self.pagecount
    }

    pub(crate) fn note_page_mapped(&mut self) {
        self.pagecount += 1;
    }

    pub(crate) fn note_page_released(&mut self) {
        debug_assert!(self.pagecount > 0);
        self.pagecount -= 1;
    }

    /// Consume the address space for teardown, yielding the page table.
    pub(crate) fn into_page_table(self) -> PageTable {
        self.page_table
    }

    /// The region containing `addr`, if any.
    pub fn region_containing(&self, addr: usize) -> Option<&Region> {
        let (_, region) = self.regions.range(..=addr).next_back()?;
        region.contains(addr).then_some(region)
    }

    /// All regions in ascending base order. Test support.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    fn insert_region(&mut self, region: Region) -> Result<(), KernelError> {
        if region.base.checked_add(region.size).is_none() || Va::new(region.base).is_none() {
            return Err(KernelError::InvalidArgument);
        }
        if region.size > 0 && Va::new(region.end() - 1).is_none() {
            return Err(KernelError::InvalidArgument);
        }
        if let Some((_, prev)) = self.regions.range(..=region.base).next_back() {
            if prev.end() > region.base {
                return Err(KernelError::InvalidArgument);
            }
        }
        if let Some((_, next)) = self.regions.range(region.base..).next() {
            if region.end() > next.base {
                return Err(KernelError::InvalidArgument);
            }
        }
        self.regions.insert(region.base, region);
        Ok(())
    }

    /// Add a region covering `[addr, addr + size)`, widened to page
    /// boundaries. Overlap with an existing region is refused.
    pub fn define_region(
        &mut self,
        addr: usize,
        size: usize,
        perms: Permission,
        mmaped: bool,
    ) -> Result<(), KernelError> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let base = addr & !(PAGE_SIZE - 1);
        let size = page_round_up(size + (addr - base));
        self.insert_region(Region {
            base,
            size,
            perms,
            mmaped,
        })
    }

    /// Define the stack: `size` bytes ending at `top`, read-write, growing
    /// down on demand.
    pub fn define_stack(&mut self, top: usize, size: usize) -> Result<(), KernelError> {
        debug_assert!(self.stack_base.is_none());
        let base = top - size;
        self.define_region(base, size, Permission::READ | Permission::WRITE, false)?;
        self.stack_base = Some(base);
        Ok(())
    }

    /// Define an empty heap at `base`; `brk` gives it size.
    pub fn define_heap(&mut self, base: usize) -> Result<(), KernelError> {
        debug_assert!(self.heap_base.is_none());
        self.insert_region(Region {
            base,
            size: 0,
            perms: Permission::READ | Permission::WRITE,
            mmaped: false,
        })?;
        self.heap_base = Some(base);
        Ok(())
    }

    pub fn stack_base(&self) -> Option<usize> {
        self.stack_base
    }

    /// Current program break: one past the heap.
    pub fn brk_end(&self) -> Option<usize> {
        let base = self.heap_base?;
        Some(self.regions.get(&base).map_or(base, |r| r.end()))
    }

    /// Resolve a faulting address to its region, extending the stack when
    /// the address falls in the gap between the stack base and the
    /// preceding region. The stack base only ever moves down.
    pub fn resolve_fault(&mut self, addr: usize) -> Option<Region> {
        if let Some(region) = self.region_containing(addr) {
            return Some(*region);
        }
        let stack_base = self.stack_base?;
        if addr >= stack_base {
            return None;
        }
        let gap_floor = self
            .regions
            .range(..stack_base)
            .next_back()
            .map_or(0, |(_, r)| r.end());
        if addr < gap_floor {
            return None;
        }
        let new_base = addr & !(PAGE_SIZE - 1);
        let mut region = self.regions.remove(&stack_base)?;
        region.size += stack_base - new_base;
        region.base = new_base;
        self.regions.insert(new_base, region);
        self.stack_base = Some(new_base);
        log::trace!("stack extended down to {new_base:#x}");
        Some(region)
    }

    /// Move the program break. Returns the resulting break and the pages
    /// vacated by a shrink; an unacceptable request leaves the heap alone
    /// and returns the current break.
    ///
    /// The request must be page aligned and stay between the heap base and
    /// the next region.
    pub fn brk(&mut self, addr: usize) -> (usize, Vec<usize>) {
        let Some(base) = self.heap_base else {
            return (0, Vec::new());
        };
        let current = self.brk_end().unwrap_or(base);
        if addr & (PAGE_SIZE - 1) != 0 || addr < base {
            return (current, Vec::new());
        }
        let ceiling = self
            .regions
            .range(base + 1..)
            .next()
            .map_or(usize::MAX, |(_, r)| r.base);
        if addr > ceiling {
            return (current, Vec::new());
        }
        let vacated: Vec<usize> = (addr..current).step_by(PAGE_SIZE).collect();
        if let Some(region) = self.regions.get_mut(&base) {
            region.size = addr - base;
        }
        (addr, vacated)
    }

    /// Pick a placement for an anonymous mapping of `len` bytes. The
    /// cursor never moves back, so successive mappings never collide with
    /// each other.
    pub fn place_mmap(&mut self, len: usize) -> usize {
        let base = self.mmap_cursor;
        self.mmap_cursor += page_round_up(len);
        base
    }

    /// Release `[addr, addr + len)`, which must be page aligned and lie
    /// entirely within `mmap` regions with no gaps. Covered regions are
    /// shrunk, split, or destroyed; on any validation failure nothing
    /// changes. Returns the vacated page addresses.
    pub fn munmap(&mut self, addr: usize, len: usize) -> Result<Vec<usize>, KernelError> {
        if len == 0 || addr & (PAGE_SIZE - 1) != 0 || len & (PAGE_SIZE - 1) != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let end = addr.checked_add(len).ok_or(KernelError::InvalidArgument)?;

        // Validate full coverage before touching anything.
        let mut cursor = addr;
        let first_base = match self.region_containing(addr) {
            Some(r) if r.is_mmaped() => r.base(),
            _ => return Err(KernelError::InvalidArgument),
        };
        for (_, region) in self.regions.range(first_base..) {
            if region.base >= end {
                break;
            }
            if region.base > cursor || !region.mmaped {
                return Err(KernelError::InvalidArgument);
            }
            cursor = region.end().min(end);
            if cursor == end {
                break;
            }
        }
        if cursor != end {
            return Err(KernelError::InvalidArgument);
        }

        let affected: Vec<Region> = self
            .regions
            .range(first_base..)
            .map(|(_, r)| *r)
            .take_while(|r| r.base < end)
            .collect();
        for region in affected {
            self.regions.remove(&region.base);
            if region.base < addr {
                let mut left = region;
                left.size = addr - region.base;
                self.regions.insert(left.base, left);
            }
            if region.end() > end {
                let mut right = region;
                right.base = end;
                right.size = region.end() - end;
                self.regions.insert(right.base, right);
            }
        }
        Ok((addr..end).step_by(PAGE_SIZE).collect())
    }
}
