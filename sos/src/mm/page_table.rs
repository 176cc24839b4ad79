//! The software page table.
//!
//! A 4-level radix tree per address space, 9 translation bits per level,
//! recording where every touched user page currently lives. The hardware
//! page table (reachable only through the machine seam) is a lossy cache of
//! this one: entries here survive eviction, hardware mappings do not.
//!
//! Nodes are created lazily as pages are touched, each backed by a freshly
//! allocated, pinned frame. Node allocation can suspend (it may evict), so
//! the walk is split: [`PageTable::first_missing_level`] names the next
//! structure hole, the caller allocates a frame for it, and
//! [`PageTable::install_node`] links the node in. A node is linked the
//! moment it exists; there is never a dangling subtree.

use crate::addressing::{PT_FANOUT, PT_LEVELS, Va};
use crate::coro::WaitQueue;
use crate::machine::{CapHandle, MapHandle};
use crate::mm::frame_table::FrameRef;
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;

/// Where a user page lives right now.
pub enum Pte {
    /// Resident. `mapping` is the hardware-mapping handle, absent when the
    /// clock (or a failed eviction) invalidated the mapping without
    /// evicting the page.
    InMemory {
        frame: FrameRef,
        mapping: Option<MapHandle>,
    },
    /// An eviction of this page is in flight. Anyone needing the page
    /// parks on `waiters` and re-resolves after waking.
    PagingOut {
        frame: FrameRef,
        waiters: Rc<WaitQueue>,
    },
    /// Evicted; the contents sit in this pagefile slot.
    PagedOut { slot: usize },
    /// A window onto device registers. Never evicted, never backed by the
    /// frame arena.
    Device {
        cap: CapHandle,
        mapping: Option<MapHandle>,
    },
    /// A page shared with another address space. Never evicted here.
    Shared {
        frame: FrameRef,
        mapping: Option<MapHandle>,
    },
}

enum PtSlot {
    Node(PtNode),
    Entry(Pte),
}

struct PtNode {
    /// The pinned frame modeling this node's backing memory.
    frame: FrameRef,
    slots: Box<[Option<PtSlot>; PT_FANOUT]>,
}

impl PtNode {
    fn new(frame: FrameRef) -> Self {
        PtNode {
            frame,
            slots: Box::new(core::array::from_fn(|_| None)),
        }
    }
}

/// The page table of one address space.
pub struct PageTable {
    root: PtNode,
}

impl PageTable {
    /// Build a page table whose root node is backed by `root_frame` (already
    /// pinned by the caller).
    pub fn new(root_frame: FrameRef) -> Self {
        PageTable {
            root: PtNode::new(root_frame),
        }
    }

    fn node_for(&self, va: Va) -> Option<&PtNode> {
        let mut node = &self.root;
        for level in (1..PT_LEVELS).rev() {
            match node.slots[va.pt_index(level)].as_ref()? {
                PtSlot::Node(child) => node = child,
                PtSlot::Entry(_) => unreachable!("leaf entry above leaf level"),
            }
        }
        Some(node)
    }

    fn node_for_mut(&mut self, va: Va) -> Option<&mut PtNode> {
        let mut node = &mut self.root;
        for level in (1..PT_LEVELS).rev() {
            match node.slots[va.pt_index(level)].as_mut()? {
                PtSlot::Node(child) => node = child,
                PtSlot::Entry(_) => unreachable!("leaf entry above leaf level"),
            }
        }
        Some(node)
    }

    /// The entry for `va`, if the page was ever touched.
    pub fn lookup(&self, va: Va) -> Option<&Pte> {
        match self.node_for(va)?.slots[va.pt_index(0)].as_ref()? {
            PtSlot::Entry(pte) => Some(pte),
            PtSlot::Node(_) => unreachable!("node at leaf level"),
        }
    }

    pub fn lookup_mut(&mut self, va: Va) -> Option<&mut Pte> {
        match self.node_for_mut(va)?.slots[va.pt_index(0)].as_mut()? {
            PtSlot::Entry(pte) => Some(pte),
            PtSlot::Node(_) => unreachable!("node at leaf level"),
        }
    }

    /// The level of the first missing node on the walk to `va`, or `None`
    /// when the path down to the leaf node is complete. Level 2 is just
    /// below the root; level 0 holds leaf entries.
    pub fn first_missing_level(&self, va: Va) -> Option<usize> {
        let mut node = &self.root;
        for level in (1..PT_LEVELS).rev() {
            match node.slots[va.pt_index(level)].as_ref() {
                Some(PtSlot::Node(child)) => node = child,
                Some(PtSlot::Entry(_)) => unreachable!("leaf entry above leaf level"),
                None => return Some(level - 1),
            }
        }
        None
    }

    /// Link a new node, backed by `frame`, at the first missing position on
    /// the walk to `va`. The caller keeps `frame` pinned for the node's
    /// lifetime.
    pub fn install_node(&mut self, va: Va, frame: FrameRef) {
        let mut node = &mut self.root;
        for level in (1..PT_LEVELS).rev() {
            let slot = &mut node.slots[va.pt_index(level)];
            if slot.is_none() {
                *slot = Some(PtSlot::Node(PtNode::new(frame)));
                return;
            }
            match slot.as_mut() {
                Some(PtSlot::Node(child)) => node = child,
                _ => unreachable!("leaf entry above leaf level"),
            }
        }
        panic!("install_node on a complete path");
    }

    /// Set the entry for `va`, which must not already exist. The node path
    /// must be complete.
    pub fn insert(&mut self, va: Va, pte: Pte) {
        let idx = va.pt_index(0);
        let node = self
            .node_for_mut(va)
            .unwrap_or_else(|| panic!("insert without node path for {va:?}"));
        debug_assert!(node.slots[idx].is_none(), "duplicate entry for {va:?}");
        node.slots[idx] = Some(PtSlot::Entry(pte));
    }

    /// Remove and return the entry for `va`.
    pub fn remove(&mut self, va: Va) -> Option<Pte> {
        let idx = va.pt_index(0);
        match self.node_for_mut(va)?.slots[idx].take()? {
            PtSlot::Entry(pte) => Some(pte),
            PtSlot::Node(_) => unreachable!("node at leaf level"),
        }
    }

    /// Visit every entry in ascending page order.
    pub fn for_each(&self, mut f: impl FnMut(usize, &Pte)) {
        fn walk(node: &PtNode, base: usize, level: usize, f: &mut impl FnMut(usize, &Pte)) {
            for (i, slot) in node.slots.iter().enumerate() {
                match slot {
                    None => {}
                    Some(PtSlot::Node(child)) => {
                        debug_assert!(level > 0);
                        walk(child, (base + i) * PT_FANOUT, level - 1, f);
                    }
                    Some(PtSlot::Entry(pte)) => {
                        debug_assert!(level == 0);
                        f(base + i, pte);
                    }
                }
            }
        }
        walk(&self.root, 0, PT_LEVELS - 1, &mut f);
    }

    /// Consume the tree, returning every node frame (root included, in
    /// post-order) and every entry with its virtual page number. The caller
    /// disposes of what the entries own.
    pub fn into_parts(self) -> (Vec<FrameRef>, Vec<(usize, Pte)>) {
        let mut node_frames = Vec::new();
        let mut entries = Vec::new();
        fn walk(
            node: PtNode,
            base: usize,
            node_frames: &mut Vec<FrameRef>,
            entries: &mut Vec<(usize, Pte)>,
        ) {
            let slots = node.slots;
            for (i, slot) in slots.into_iter().enumerate() {
                match slot {
                    None => {}
                    Some(PtSlot::Node(child)) => {
                        walk(child, (base + i) * PT_FANOUT, node_frames, entries)
                    }
                    Some(PtSlot::Entry(pte)) => entries.push((base + i, pte)),
                }
            }
            node_frames.push(node.frame);
        }
        walk(self.root, 0, &mut node_frames, &mut entries);
        (node_frames, entries)
    }
}
