//! The process table.
//!
//! A pid-indexed slot table. Each live process owns its address space and
//! open-file table, and tracks the continuations currently running on its
//! behalf: killing a process fires every registered kill hook, then
//! teardown waits until the last of those continuations has unwound.
//! Nothing is torn down under a running continuation's feet.

use crate::coro::{Cancellation, WaitQueue};
use crate::mm::addrspace::AddrSpace;
use crate::vfs::VnodeRef;
use alloc::rc::Rc;
use alloc::vec::Vec;

pub type Pid = usize;

/// Lifecycle of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Slot claimed, address space not yet in place.
    Creating,
    /// Alive and servable.
    Running,
    /// Parked in a system call.
    Blocked,
    /// Kill requested; continuations are draining, teardown is pending.
    ToBeKilled,
}

/// An open file: a vnode and a cursor.
pub struct OpenFile {
    pub vnode: VnodeRef,
    pub offset: usize,
}

pub struct Process {
    pid: Pid,
    pub(crate) state: ProcState,
    pub(crate) addrspace: Option<AddrSpace>,
    files: Vec<Option<OpenFile>>,
    pub(crate) live_coros: usize,
    pub(crate) kill_hooks: Vec<Rc<Cancellation>>,
    pub(crate) exit_wq: Rc<WaitQueue>,
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn addrspace(&self) -> Option<&AddrSpace> {
        self.addrspace.as_ref()
    }

    /// Claim the lowest free descriptor.
    pub fn install_file(&mut self, file: OpenFile) -> Option<usize> {
        if let Some(fd) = self.files.iter().position(Option::is_none) {
            self.files[fd] = Some(file);
            Some(fd)
        } else {
            None
        }
    }

    pub fn file_mut(&mut self, fd: usize) -> Option<&mut OpenFile> {
        self.files.get_mut(fd)?.as_mut()
    }

    pub fn take_file(&mut self, fd: usize) -> Option<OpenFile> {
        self.files.get_mut(fd)?.take()
    }
}

/// All process slots. Pids are slot indices; a freed slot is reused.
pub struct ProcessTable {
    slots: Vec<Option<Process>>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable { slots: Vec::new() }
    }

    /// Claim a slot in `Creating` state.
    pub fn create(&mut self, max_open_files: usize) -> Pid {
        let pid = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.slots.push(None);
                self.slots.len() - 1
            });
        let mut files = Vec::with_capacity(max_open_files);
        files.resize_with(max_open_files, || None);
        self.slots[pid] = Some(Process {
            pid,
            state: ProcState::Creating,
            addrspace: None,
            files,
            live_coros: 0,
            kill_hooks: Vec::new(),
            exit_wq: Rc::new(WaitQueue::new()),
        });
        pid
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid)?.as_ref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid)?.as_mut()
    }

    pub fn addrspace(&self, pid: Pid) -> Option<&AddrSpace> {
        self.get(pid)?.addrspace.as_ref()
    }

    pub fn addrspace_mut(&mut self, pid: Pid) -> Option<&mut AddrSpace> {
        self.get_mut(pid)?.addrspace.as_mut()
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.slots.get_mut(pid)?.take()
    }

    /// Live pids, ascending. `ps` support.
    pub fn pids(&self) -> Vec<Pid> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|p| p.pid))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemVnode;
    use core::cell::RefCell;

    #[test]
    fn slots_are_reused() {
        let mut t = ProcessTable::new();
        let a = t.create(4);
        let b = t.create(4);
        assert_eq!((a, b), (0, 1));
        t.remove(a);
        assert_eq!(t.create(4), 0);
        assert_eq!(t.pids(), alloc::vec![0, 1]);
    }

    #[test]
    fn fd_table_lowest_free() {
        let mut t = ProcessTable::new();
        let pid = t.create(2);
        let p = t.get_mut(pid).unwrap();
        let vnode: VnodeRef = Rc::new(RefCell::new(MemVnode::new()));
        let fd0 = p
            .install_file(OpenFile {
                vnode: vnode.clone(),
                offset: 0,
            })
            .unwrap();
        let fd1 = p
            .install_file(OpenFile {
                vnode: vnode.clone(),
                offset: 0,
            })
            .unwrap();
        assert_eq!((fd0, fd1), (0, 1));
        assert!(
            p.install_file(OpenFile {
                vnode: vnode.clone(),
                offset: 0
            })
            .is_none()
        );
        p.take_file(fd0).unwrap();
        assert_eq!(
            p.install_file(OpenFile { vnode, offset: 0 }).unwrap(),
            0
        );
    }
}
