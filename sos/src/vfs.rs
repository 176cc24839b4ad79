//! File backing.
//!
//! The subsystem needs files for exactly two things: the pagefile, and the
//! `read`/`write` system calls. [`Vnode`] is the narrow seam both go
//! through; [`MemVnode`] is the in-memory implementation backing tests and
//! the default device model. Transport to a real file server is out of
//! scope here.

use crate::KernelError;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;

/// Operations on an open file.
pub trait Vnode {
    /// Read at `offset` into `buf`, returning the number of bytes read.
    /// Short reads happen only at end of file.
    fn read_at(&mut self, buf: &mut [u8], offset: usize) -> Result<usize, KernelError>;

    /// Write `buf` at `offset`, returning the number of bytes written.
    fn write_at(&mut self, buf: &[u8], offset: usize) -> Result<usize, KernelError>;

    /// Current size of the file, in bytes.
    fn len(&self) -> usize;
}

/// Shared handle to an open vnode.
pub type VnodeRef = Rc<RefCell<dyn Vnode>>;

/// A file held entirely in memory. Writes beyond the end grow the file,
/// zero-filling any gap.
#[derive(Default)]
pub struct MemVnode {
    data: Vec<u8>,
}

impl MemVnode {
    pub fn new() -> Self {
        MemVnode { data: Vec::new() }
    }
}

impl Vnode for MemVnode {
    fn read_at(&mut self, buf: &mut [u8], offset: usize) -> Result<usize, KernelError> {
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], offset: usize) -> Result<usize, KernelError> {
        let end = offset + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// A flat name-to-vnode registry.
pub struct Vfs {
    files: BTreeMap<String, VnodeRef>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Vfs {
            files: BTreeMap::new(),
        }
    }

    /// Look up `path`, creating an empty file when `create` is set.
    pub fn open(&mut self, path: &str, create: bool) -> Result<VnodeRef, KernelError> {
        if let Some(vnode) = self.files.get(path) {
            return Ok(vnode.clone());
        }
        if !create {
            return Err(KernelError::NoSuchEntry);
        }
        let vnode: VnodeRef = Rc::new(RefCell::new(MemVnode::new()));
        self.files.insert(String::from(path), vnode.clone());
        Ok(vnode)
    }
}
