//! Memory management.
//!
//! The paging engine in four layers: the frame arena and its eviction
//! policy ([`frame_table`]), the backing-store slot allocator
//! ([`pagefile`]), the per-process software page table ([`page_table`]),
//! and the region tracker ([`addrspace`]). Fault resolution, which ties the
//! layers together, lives in [`fault`].

pub mod addrspace;
pub mod fault;
pub mod frame_table;
pub mod page_table;
pub mod pagefile;

use crate::proc::Pid;

bitflags::bitflags! {
    /// Access rights of a region and of the hardware mappings under it.
    pub struct Permission: u8 {
        /// Read permission.
        const READ = 1 << 0;
        /// Write permission.
        const WRITE = 1 << 1;
        /// Execute permission.
        const EXECUTE = 1 << 2;
    }
}

/// Identity of a user page: the owning process and its virtual page number.
///
/// Frames carry one of these instead of a pointer into the page table, so a
/// frame's owning entry is always re-resolved through the live process
/// table and can never dangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageKey {
    pub pid: Pid,
    pub vpn: usize,
}
