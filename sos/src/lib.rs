//! # SOS: a root-task virtual-memory subsystem
//!
//! This crate is the memory-management core of a root task running on a
//! delegating microkernel: the kernel resolves nothing by itself, so every
//! page of user memory exists only because this library created a kernel
//! object for it, mapped it, and remembered where it lives. The subsystem
//! provides demand paging over a fixed frame budget, backed by a pagefile,
//! for many user processes at once.
//!
//! The moving parts:
//!
//! - [`mm::frame_table`] — a dense arena of physical frames with a clock
//!   eviction policy. Frames are the only currency; everything else borrows
//!   them.
//! - [`mm::page_table`] — a 4-level software radix tree per address space,
//!   recording for every user page whether it is resident, on its way out,
//!   on disk, or a device window.
//! - [`mm::addrspace`] — the region tracker: stack, heap, and `mmap`
//!   segments, non-overlapping, resolved on every fault.
//! - [`coro`] — cooperative continuations. A page fault that needs disk I/O
//!   suspends; the main loop keeps serving other processes meanwhile.
//! - [`machine`] — the seam to the kernel proper: object allocation and
//!   hardware mapping, abstract enough that tests drive the whole subsystem
//!   against an emulated machine.
//!
//! Everything is single-threaded and cooperatively scheduled: state is
//! consistent at every suspension point, and a resumed continuation
//! re-validates whatever it looked at before suspending.
//!
//! The crate is freestanding (`no_std` + `alloc`) outside of tests.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod addressing;
pub mod config;
pub mod coro;
pub mod kernel;
pub mod machine;
pub mod mm;
pub mod proc;
pub mod syscall;
pub mod vfs;

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// while resolving a fault or serving a system call. These errors can be
/// returned to the user program to indicate the nature of the failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// Interrupted operation; the process is being killed. (EINTR)
    Interrupted,
    /// IO Error. (EIO)
    IOError,
    /// Bad file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
}

impl KernelError {
    /// Converts the [`KernelError`] into the corresponding negative errno
    /// value, for use as a system-call return value.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::OperationNotPermitted => -1,
            KernelError::NoSuchEntry => -2,
            KernelError::Interrupted => -4,
            KernelError::IOError => -5,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::NoSpace => -28,
            KernelError::NoSuchSyscall => -38,
        }
    }
}
