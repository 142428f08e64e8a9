//! In-memory directory-entry cache.
//!
//! A fixed arena of entry slots threaded onto a doubly-linked LRU ring
//! through a sentinel at slot 0; the sentinel doubles as the root
//! directory and is never reclaimed. Identity is the key
//! (device, parent first cluster, filename): two live handles for the
//! same key always point at the same slot.
//!
//! Locking follows the usual two-level scheme. Reference counts, the
//! ring links and the identity keys live under the cache-wide spinlock,
//! which never covers I/O. The entry payload (`EntryInfo`) lives under
//! a per-slot lock that may be held across block-cache operations;
//! holding that lock is what the file and directory layers mean by
//! "the entry is locked".

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut, Drop};
use spin::{Mutex, MutexGuard};

use crate::fs::FileSystem;
use crate::ATTR_DIRECTORY;

pub(crate) const ROOT_SLOT: usize = 0;

/// Entry payload guarded by the per-slot lock.
#[derive(Debug, Clone, Default)]
pub struct EntryInfo {
    pub attribute: u8,
    pub first_cluster: u32,
    pub file_size: u32,
    /// First cluster of the containing directory; 0 only for the root.
    pub parent: u32,
    /// Byte offset of the record's first slot within the parent
    /// directory, long-name entries included.
    pub offset: u32,
}

struct Node {
    prev: usize,
    next: usize,
    ref_count: u32,
    /// Key and payload have been published; stays false from reclaim
    /// until the directory layer fills the slot.
    valid: bool,
    dev: u32,
    parent: u32,
    name: String,
    attribute: u8,
}

impl Node {
    fn unlinked() -> Self {
        Self {
            prev: 0,
            next: 0,
            ref_count: 0,
            valid: false,
            dev: 0,
            parent: 0,
            name: String::new(),
            attribute: 0,
        }
    }
}

struct CacheCtl {
    nodes: Vec<Node>,
}

impl CacheCtl {
    fn detach(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    fn push_mru(&mut self, slot: usize) {
        let first = self.nodes[ROOT_SLOT].next;
        self.nodes[slot].prev = ROOT_SLOT;
        self.nodes[slot].next = first;
        self.nodes[first].prev = slot;
        self.nodes[ROOT_SLOT].next = slot;
    }
}

pub(crate) struct EntryCache {
    ctl: Mutex<CacheCtl>,
    slots: Vec<Mutex<EntryInfo>>,
}

impl EntryCache {
    /// Build the arena: sentinel self-linked, `capacity` free slots
    /// inserted at the MRU side, the sentinel holding the root
    /// directory of the volume.
    pub(crate) fn new(capacity: usize, root_cluster: u32) -> Self {
        let mut nodes = Vec::with_capacity(capacity + 1);
        let mut slots = Vec::with_capacity(capacity + 1);
        for _ in 0..=capacity {
            nodes.push(Node::unlinked());
            slots.push(Mutex::new(EntryInfo::default()));
        }
        nodes[ROOT_SLOT].ref_count = 1;
        nodes[ROOT_SLOT].valid = true;
        nodes[ROOT_SLOT].attribute = ATTR_DIRECTORY;

        let mut ctl = CacheCtl { nodes };
        for slot in 1..=capacity {
            ctl.push_mru(slot);
        }

        slots[ROOT_SLOT] = Mutex::new(EntryInfo {
            attribute: ATTR_DIRECTORY,
            first_cluster: root_cluster,
            file_size: 0,
            parent: 0,
            offset: 0,
        });

        Self {
            ctl: Mutex::new(ctl),
            slots,
        }
    }

    /// Two-pass slot acquisition. Forward from MRU looking for the key;
    /// on a miss, backward from LRU for the first unreferenced slot,
    /// handed out unpublished for the caller to fill. Returns the slot
    /// and whether it was a hit.
    ///
    /// Callers race-protect the fill by serialising on the parent
    /// directory's lock.
    pub(crate) fn get(&self, dev: u32, parent: u32, name: &str) -> (usize, bool) {
        let mut ctl = self.ctl.lock();

        let mut slot = ctl.nodes[ROOT_SLOT].next;
        while slot != ROOT_SLOT {
            let node = &ctl.nodes[slot];
            if node.valid && node.dev == dev && node.parent == parent && node.name == name {
                ctl.nodes[slot].ref_count += 1;
                return (slot, true);
            }
            slot = node.next;
        }

        let mut slot = ctl.nodes[ROOT_SLOT].prev;
        while slot != ROOT_SLOT {
            if ctl.nodes[slot].ref_count == 0 {
                let node = &mut ctl.nodes[slot];
                node.ref_count = 1;
                node.valid = false;
                node.dev = dev;
                node.name.clear();
                return (slot, false);
            }
            slot = ctl.nodes[slot].prev;
        }

        panic!("entry cache exhausted");
    }

    pub(crate) fn dup(&self, slot: usize) {
        self.ctl.lock().nodes[slot].ref_count += 1;
    }

    /// Make a filled slot visible to the identity scan.
    pub(crate) fn publish(&self, slot: usize, parent: u32, name: &str, attribute: u8) {
        let mut ctl = self.ctl.lock();
        let node = &mut ctl.nodes[slot];
        node.parent = parent;
        node.name.clear();
        node.name.push_str(name);
        node.attribute = attribute;
        node.valid = true;
    }

    /// Drop a slot out of the identity space; its payload stays
    /// readable for holders but no lookup will ever hit it again.
    pub(crate) fn invalidate(&self, slot: usize) {
        let mut ctl = self.ctl.lock();
        let node = &mut ctl.nodes[slot];
        node.valid = false;
        node.name.clear();
    }

    /// First half of a handle release. When this is the last reference
    /// to a published slot, the payload lock is taken (guaranteed
    /// uncontended: nobody else holds a reference) and the slot moves
    /// to the MRU position; the caller then flushes the metadata
    /// outside the cache lock. The sentinel never flushes.
    pub(crate) fn begin_release(&self, slot: usize) -> Option<MutexGuard<'_, EntryInfo>> {
        let mut ctl = self.ctl.lock();
        let node = &ctl.nodes[slot];
        if slot != ROOT_SLOT && node.valid && node.ref_count == 1 {
            let guard = self.slots[slot]
                .try_lock()
                .expect("entry still locked at last release");
            ctl.detach(slot);
            ctl.push_mru(slot);
            Some(guard)
        } else {
            None
        }
    }

    /// Second half of a release: drop the reference.
    pub(crate) fn finish_release(&self, slot: usize) {
        let mut ctl = self.ctl.lock();
        debug_assert!(ctl.nodes[slot].ref_count > 0);
        ctl.nodes[slot].ref_count -= 1;
    }

    pub(crate) fn guard_slot(&self, slot: usize) -> MutexGuard<'_, EntryInfo> {
        self.slots[slot].lock()
    }

    pub(crate) fn name_of(&self, slot: usize) -> String {
        self.ctl.lock().nodes[slot].name.clone()
    }

    pub(crate) fn attr_of(&self, slot: usize) -> u8 {
        self.ctl.lock().nodes[slot].attribute
    }
}

/// A counted reference to a cached directory entry.
///
/// Cloning takes another reference; dropping releases it, and the last
/// release flushes the entry's metadata back to its directory record.
pub struct EntryHandle {
    pub(crate) fs: Arc<FileSystem>,
    pub(crate) slot: usize,
}

impl EntryHandle {
    pub(crate) fn new(fs: Arc<FileSystem>, slot: usize) -> Self {
        Self { fs, slot }
    }

    /// Take the entry's lock. All mutation of the payload, and every
    /// operation that reads it consistently, goes through the returned
    /// guard.
    pub fn lock(&self) -> EntryGuard<'_> {
        EntryGuard {
            info: self.fs.ecache.guard_slot(self.slot),
            handle: self,
        }
    }

    /// The filename this entry was resolved under.
    pub fn name(&self) -> String {
        self.fs.ecache.name_of(self.slot)
    }

    pub fn attr(&self) -> u8 {
        self.fs.ecache.attr_of(self.slot)
    }

    pub fn is_dir(&self) -> bool {
        self.attr() & ATTR_DIRECTORY != 0
    }

    pub fn fs(&self) -> &Arc<FileSystem> {
        &self.fs
    }
}

impl core::fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntryHandle")
            .field("slot", &self.slot)
            .field("name", &self.name())
            .finish()
    }
}

impl Clone for EntryHandle {
    fn clone(&self) -> Self {
        self.fs.ecache.dup(self.slot);
        Self {
            fs: Arc::clone(&self.fs),
            slot: self.slot,
        }
    }
}

impl PartialEq for EntryHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fs, &other.fs) && self.slot == other.slot
    }
}

impl Eq for EntryHandle {}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        if let Some(info) = self.fs.ecache.begin_release(self.slot) {
            self.fs.update_entry(&info);
        }
        self.fs.ecache.finish_release(self.slot);
    }
}

/// Exclusive access to an entry's payload; RAII form of the per-entry
/// sleep lock.
pub struct EntryGuard<'a> {
    pub(crate) handle: &'a EntryHandle,
    pub(crate) info: MutexGuard<'a, EntryInfo>,
}

impl EntryGuard<'_> {
    pub fn handle(&self) -> &EntryHandle {
        self.handle
    }

    pub fn is_dir(&self) -> bool {
        self.info.attribute & ATTR_DIRECTORY != 0
    }
}

impl Deref for EntryGuard<'_> {
    type Target = EntryInfo;

    fn deref(&self) -> &EntryInfo {
        &self.info
    }
}

impl DerefMut for EntryGuard<'_> {
    fn deref_mut(&mut self) -> &mut EntryInfo {
        &mut self.info
    }
}

#[cfg(test)]
impl EntryCache {
    /// Walk the ring both ways and check it is a well-formed doubly
    /// linked list through the sentinel. Returns the node count,
    /// sentinel included.
    fn ring_len(&self) -> usize {
        let ctl = self.ctl.lock();
        let cap = ctl.nodes.len();
        let mut forward = 1;
        let mut slot = ctl.nodes[ROOT_SLOT].next;
        while slot != ROOT_SLOT {
            assert_eq!(ctl.nodes[ctl.nodes[slot].next].prev, slot);
            assert_eq!(ctl.nodes[ctl.nodes[slot].prev].next, slot);
            forward += 1;
            assert!(forward <= cap, "ring does not close");
            slot = ctl.nodes[slot].next;
        }
        let mut backward = 1;
        let mut slot = ctl.nodes[ROOT_SLOT].prev;
        while slot != ROOT_SLOT {
            backward += 1;
            slot = ctl.nodes[slot].prev;
        }
        assert_eq!(forward, backward);
        forward
    }

    fn ref_sum(&self) -> u32 {
        let ctl = self.ctl.lock();
        ctl.nodes.iter().map(|n| n.ref_count).sum()
    }

    fn mru(&self) -> usize {
        self.ctl.lock().nodes[ROOT_SLOT].next
    }
}
