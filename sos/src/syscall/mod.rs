//! System calls.
//!
//! Each call is served by its own continuation; the dispatcher here is the
//! body of that continuation. Returns follow the errno convention: a
//! non-negative value on success, a negative [`KernelError`] code on
//! failure.

pub mod uaccess;

use crate::KernelError;
use crate::addressing::PAGE_SIZE;
use crate::coro::{self, Coro};
use crate::kernel::Kernel;
use crate::mm::Permission;
use crate::mm::fault::unalloc_page;
use crate::proc::{OpenFile, Pid};
use crate::vfs::VnodeRef;
use alloc::string::String;
use alloc::vec::Vec;
use uaccess::{copy_in, copy_out};

/// A decoded system call.
pub enum Syscall {
    /// Move the program break.
    Brk { addr: usize },
    /// Map an anonymous region. `addr == 0` asks for automatic placement.
    Mmap {
        addr: usize,
        len: usize,
        perms: Permission,
    },
    /// Unmap previously mmapped pages.
    Munmap { addr: usize, len: usize },
    /// Open a file by name.
    Open { path: String, create: bool },
    /// Close a descriptor.
    Close { fd: usize },
    /// Read from a file into a user buffer.
    Read { fd: usize, buf: usize, len: usize },
    /// Write a user buffer to a file.
    Write { fd: usize, buf: usize, len: usize },
}

pub(crate) async fn dispatch(k: &Kernel, coro: &Coro, pid: Pid, call: Syscall) -> isize {
    match do_call(k, coro, pid, call).await {
        Ok(value) => value,
        Err(e) => e.into_isize(),
    }
}

async fn do_call(k: &Kernel, coro: &Coro, pid: Pid, call: Syscall) -> Result<isize, KernelError> {
    match call {
        Syscall::Brk { addr } => {
            let (end, vacated) = {
                let mut w = k.world_mut();
                w.procs
                    .addrspace_mut(pid)
                    .ok_or(KernelError::BadAddress)?
                    .brk(addr)
            };
            for page in vacated {
                unalloc_page(k, coro, pid, page).await?;
            }
            Ok(end as isize)
        }
        Syscall::Mmap { addr, len, perms } => {
            if len == 0 {
                return Err(KernelError::InvalidArgument);
            }
            let mut w = k.world_mut();
            let aspace = w.procs.addrspace_mut(pid).ok_or(KernelError::BadAddress)?;
            let base = if addr == 0 {
                aspace.place_mmap(len)
            } else {
                if addr & (PAGE_SIZE - 1) != 0 {
                    return Err(KernelError::InvalidArgument);
                }
                addr
            };
            aspace.define_region(base, len, perms, true)?;
            Ok(base as isize)
        }
        Syscall::Munmap { addr, len } => {
            let vacated = {
                let mut w = k.world_mut();
                w.procs
                    .addrspace_mut(pid)
                    .ok_or(KernelError::BadAddress)?
                    .munmap(addr, len)?
            };
            for page in vacated {
                unalloc_page(k, coro, pid, page).await?;
            }
            Ok(0)
        }
        Syscall::Open { path, create } => {
            let vnode = k.world_mut().vfs.open(&path, create)?;
            let fd = k
                .world_mut()
                .procs
                .get_mut(pid)
                .ok_or(KernelError::BadAddress)?
                .install_file(OpenFile { vnode, offset: 0 })
                .ok_or(KernelError::TooManyOpenFile)?;
            Ok(fd as isize)
        }
        Syscall::Close { fd } => {
            k.world_mut()
                .procs
                .get_mut(pid)
                .ok_or(KernelError::BadAddress)?
                .take_file(fd)
                .ok_or(KernelError::BadFileDescriptor)?;
            Ok(0)
        }
        // Transfers go a page at a time: `len` comes straight from user
        // registers and must never size a kernel allocation.
        Syscall::Read { fd, buf, len } => {
            let (vnode, offset) = file_of(k, pid, fd)?;
            uaccess::check_range(buf, len)?;
            let mut total = 0;
            while total < len {
                let want = (len - total).min(PAGE_SIZE);
                let mut chunk: Vec<u8> = alloc::vec![0; want];
                coro::yield_now().await;
                coro.check()?;
                let n = vnode.borrow_mut().read_at(&mut chunk, offset + total)?;
                if n == 0 {
                    break;
                }
                copy_out(k, coro, pid, buf + total, &chunk[..n]).await?;
                total += n;
                if n < want {
                    break;
                }
            }
            advance_file(k, pid, fd, total);
            Ok(total as isize)
        }
        Syscall::Write { fd, buf, len } => {
            let (vnode, offset) = file_of(k, pid, fd)?;
            uaccess::check_range(buf, len)?;
            let mut total = 0;
            while total < len {
                let want = (len - total).min(PAGE_SIZE);
                let data = copy_in(k, coro, pid, buf + total, want).await?;
                coro::yield_now().await;
                coro.check()?;
                let n = vnode.borrow_mut().write_at(&data, offset + total)?;
                total += n;
                if n < want {
                    break;
                }
            }
            advance_file(k, pid, fd, total);
            Ok(total as isize)
        }
    }
}

fn file_of(k: &Kernel, pid: Pid, fd: usize) -> Result<(VnodeRef, usize), KernelError> {
    let mut w = k.world_mut();
    let file = w
        .procs
        .get_mut(pid)
        .ok_or(KernelError::BadAddress)?
        .file_mut(fd)
        .ok_or(KernelError::BadFileDescriptor)?;
    Ok((file.vnode.clone(), file.offset))
}

fn advance_file(k: &Kernel, pid: Pid, fd: usize, n: usize) {
    let mut w = k.world_mut();
    if let Some(file) = w.procs.get_mut(pid).and_then(|p| p.file_mut(fd)) {
        file.offset += n;
    }
}
