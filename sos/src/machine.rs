//! The machine seam.
//!
//! Everything the subsystem needs from the kernel proper goes through the
//! [`Machine`] trait: allocating and retyping kernel objects, creating
//! per-process translation roots, and installing or tearing down hardware
//! mappings. The trait is deliberately narrow so the whole paging engine can
//! run against [`EmulatedMachine`] in tests, with a configurable object
//! quota standing in for untyped-memory exhaustion.
//!
//! Hardware mapping is two-phase, the way a capability kernel exposes it: a
//! page map attempt fails with [`MapError::NeedsPagingStructure`] naming the
//! missing intermediate translation level, the caller allocates and installs
//! that structure, and retries. The retry is bounded by the number of
//! levels.

use crate::KernelError;
use crate::addressing::{PT_LEVEL_BITS, Va};
use crate::mm::Permission;
use alloc::collections::BTreeMap;

/// An opaque handle to a kernel object (a capability slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapHandle(pub u64);

/// Handle to an installed hardware mapping, needed to undo it.
pub type MapHandle = CapHandle;

/// An opaque handle to a hardware translation root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VspaceId(pub u64);

/// Kinds of kernel object the subsystem allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A page-sized frame of ordinary memory.
    Frame,
    /// An intermediate translation structure. Level 0 sits immediately above
    /// leaf entries; higher levels cover wider spans.
    PagingStructure { level: usize },
    /// A window onto device registers at the given physical address.
    DeviceFrame { paddr: usize },
}

/// Why a hardware map attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The translation structure at `level` is missing for this address.
    /// Install one with [`Machine::map_structure`] and retry.
    NeedsPagingStructure { level: usize },
    /// The mapping cannot be installed. Not retryable.
    Fatal,
}

/// Number of intermediate structure levels between the root and a leaf
/// mapping.
pub const STRUCTURE_LEVELS: usize = 3;

/// The kernel-object and mapping interface the paging engine runs against.
pub trait Machine {
    /// Allocate a kernel object of the given kind.
    fn alloc_object(&mut self, kind: ObjectKind) -> Result<CapHandle, KernelError>;

    /// Release a kernel object. The handle must not be used again.
    fn free_object(&mut self, cap: CapHandle);

    /// Create a hardware translation root for a new address space.
    fn create_vspace(&mut self) -> Result<VspaceId, KernelError>;

    /// Tear down a translation root and every structure installed under it.
    fn destroy_vspace(&mut self, vspace: VspaceId);

    /// Map `frame` at `va` in `vspace`. On success returns the handle that
    /// undoes the mapping.
    fn map_page(
        &mut self,
        vspace: VspaceId,
        frame: CapHandle,
        va: Va,
        perms: Permission,
    ) -> Result<MapHandle, MapError>;

    /// Install an intermediate translation structure covering `va` at
    /// `level`.
    fn map_structure(
        &mut self,
        vspace: VspaceId,
        cap: CapHandle,
        va: Va,
        level: usize,
    ) -> Result<(), MapError>;

    /// Remove the mapping previously returned by [`Machine::map_page`].
    fn unmap_page(&mut self, vspace: VspaceId, handle: MapHandle);
}

/// Map `frame` at `va`, installing missing intermediate structures on
/// demand. Structures claimed here belong to the vspace and are released
/// with it.
pub fn map_page_retrying(
    machine: &mut dyn Machine,
    vspace: VspaceId,
    frame: CapHandle,
    va: Va,
    perms: Permission,
) -> Result<MapHandle, KernelError> {
    for _ in 0..=STRUCTURE_LEVELS {
        match machine.map_page(vspace, frame, va, perms) {
            Ok(handle) => return Ok(handle),
            Err(MapError::NeedsPagingStructure { level }) => {
                let cap = machine.alloc_object(ObjectKind::PagingStructure { level })?;
                if machine.map_structure(vspace, cap, va, level).is_err() {
                    machine.free_object(cap);
                    return Err(KernelError::NoMemory);
                }
            }
            Err(MapError::Fatal) => return Err(KernelError::NoMemory),
        }
    }
    // Three installs must satisfy any walk; a fourth miss is a machine bug.
    Err(KernelError::NoMemory)
}

/// Index prefix covered by the structure at `level` for an address.
fn structure_prefix(va: Va, level: usize) -> usize {
    va.vpn() >> (PT_LEVEL_BITS * (level + 1))
}

struct EmuVspace {
    structures: BTreeMap<(usize, usize), CapHandle>,
    maps: BTreeMap<usize, EmuMapping>,
}

struct EmuMapping {
    handle: MapHandle,
    frame: CapHandle,
    perms: Permission,
}

/// A deterministic in-memory machine for tests.
///
/// Objects are numbered handles drawn from a finite quota; mappings demand
/// explicit intermediate structures per level, so callers exercise the same
/// retry dance the real kernel forces.
pub struct EmulatedMachine {
    quota: usize,
    live: BTreeMap<CapHandle, ObjectKind>,
    vspaces: BTreeMap<VspaceId, EmuVspace>,
    next_id: u64,
}

impl EmulatedMachine {
    /// A machine that can hand out at most `quota` live objects.
    pub fn new(quota: usize) -> Self {
        EmulatedMachine {
            quota,
            live: BTreeMap::new(),
            vspaces: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn fresh(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Number of currently live objects.
    pub fn live_objects(&self) -> usize {
        self.live.len()
    }

    /// The frame mapped at `va`, if any. Test support.
    pub fn mapping_at(&self, vspace: VspaceId, va: Va) -> Option<(CapHandle, Permission)> {
        let vs = self.vspaces.get(&vspace)?;
        let m = vs.maps.get(&va.vpn())?;
        Some((m.frame, m.perms))
    }

    /// Number of live hardware mappings in `vspace`. Test support.
    pub fn mapped_pages(&self, vspace: VspaceId) -> usize {
        self.vspaces.get(&vspace).map_or(0, |vs| vs.maps.len())
    }
}

impl Machine for EmulatedMachine {
    fn alloc_object(&mut self, kind: ObjectKind) -> Result<CapHandle, KernelError> {
        if self.live.len() >= self.quota {
            return Err(KernelError::NoMemory);
        }
        let cap = CapHandle(self.fresh());
        self.live.insert(cap, kind);
        Ok(cap)
    }

    fn free_object(&mut self, cap: CapHandle) {
        let present = self.live.remove(&cap).is_some();
        debug_assert!(present, "double free of {cap:?}");
    }

    fn create_vspace(&mut self) -> Result<VspaceId, KernelError> {
        let id = VspaceId(self.fresh());
        self.vspaces.insert(
            id,
            EmuVspace {
                structures: BTreeMap::new(),
                maps: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn destroy_vspace(&mut self, vspace: VspaceId) {
        let vs = self.vspaces.remove(&vspace);
        if let Some(vs) = vs {
            for (_, m) in vs.maps {
                self.live.remove(&m.handle);
            }
            // Structures installed under the root go with it.
            for (_, cap) in vs.structures {
                self.live.remove(&cap);
            }
        }
    }

    fn map_page(
        &mut self,
        vspace: VspaceId,
        frame: CapHandle,
        va: Va,
        perms: Permission,
    ) -> Result<MapHandle, MapError> {
        match self.live.get(&frame) {
            Some(ObjectKind::Frame) | Some(ObjectKind::DeviceFrame { .. }) => {}
            _ => return Err(MapError::Fatal),
        }
        let vs = self.vspaces.get(&vspace).ok_or(MapError::Fatal)?;
        // The walk needs every intermediate level, widest first.
        for level in (0..STRUCTURE_LEVELS).rev() {
            if !vs.structures.contains_key(&(level, structure_prefix(va, level))) {
                return Err(MapError::NeedsPagingStructure { level });
            }
        }
        if vs.maps.contains_key(&va.vpn()) {
            return Err(MapError::Fatal);
        }
        if self.live.len() >= self.quota {
            return Err(MapError::Fatal);
        }
        let handle = CapHandle(self.fresh());
        self.live.insert(handle, ObjectKind::Frame);
        let vs = self.vspaces.get_mut(&vspace).ok_or(MapError::Fatal)?;
        vs.maps.insert(
            va.vpn(),
            EmuMapping {
                handle,
                frame,
                perms,
            },
        );
        Ok(handle)
    }

    fn map_structure(
        &mut self,
        vspace: VspaceId,
        cap: CapHandle,
        va: Va,
        level: usize,
    ) -> Result<(), MapError> {
        match self.live.get(&cap) {
            Some(ObjectKind::PagingStructure { level: l }) if *l == level => {}
            _ => return Err(MapError::Fatal),
        }
        let vs = self.vspaces.get_mut(&vspace).ok_or(MapError::Fatal)?;
        let key = (level, structure_prefix(va, level));
        if vs.structures.contains_key(&key) {
            return Err(MapError::Fatal);
        }
        vs.structures.insert(key, cap);
        Ok(())
    }

    fn unmap_page(&mut self, vspace: VspaceId, handle: MapHandle) {
        if let Some(vs) = self.vspaces.get_mut(&vspace) {
            let vpn = vs
                .maps
                .iter()
                .find(|(_, m)| m.handle == handle)
                .map(|(vpn, _)| *vpn);
            if let Some(vpn) = vpn {
                vs.maps.remove(&vpn);
                self.live.remove(&handle);
                return;
            }
        }
        debug_assert!(false, "unmap of unknown mapping {handle:?}");
    }
}
