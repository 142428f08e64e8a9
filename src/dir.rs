//! Directory decoding and on-disk record maintenance.
//!
//! Directory layout on disk (low address -> high address):
//! fileA_lfn_n
//! fileA_lfn_n-1
//! ...
//! fileA_lfn_1
//! fileA_sfn
//! fileB_lfn_n
//! ...
//!
//! The `.` and `..` records carry no long entries at all, so a record
//! is located by its first slot and the short entry found by reading
//! that slot's ordinal (or finding none).

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::debug;

use crate::ecache::{EntryGuard, EntryHandle, EntryInfo, ROOT_SLOT};
use crate::entry::{lfn_chunk, name_to_utf16, short_name_alias, LongDirEntry, ShortDirEntry};
use crate::fat::FatError;
use crate::fs::FileSystem;
use crate::vfs::FileKind;
use crate::{
    is_illegal, lfn_count, ATTR_LONG_NAME, DIRENT_SIZE, DIR_ENTRY_LAST_AND_UNUSED,
    DIR_ENTRY_UNUSED, END_OF_CLUSTER, LAST_LONG_ENTRY, MAX_FILENAME,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirError {
    NotDir,
    InvalidName,
    NoSpace,
}

impl From<FatError> for DirError {
    fn from(_: FatError) -> Self {
        DirError::NoSpace
    }
}

/// One decoded directory record.
#[derive(Debug, Clone)]
pub struct DirRecord {
    pub name: String,
    pub attribute: u8,
    pub first_cluster: u32,
    /// Offset of the slot following this record; feed it back in to
    /// continue the listing.
    pub next_off: u32,
}

/// Slot-granular walker over a directory's cluster chain.
struct DirCursor<'a> {
    fs: &'a FileSystem,
    cluster: u32,
    off_in_cluster: u32,
    /// linear byte offset within the directory
    pos: u32,
}

impl<'a> DirCursor<'a> {
    fn new(fs: &'a FileSystem, first_cluster: u32) -> Self {
        Self {
            fs,
            cluster: first_cluster,
            off_in_cluster: 0,
            pos: 0,
        }
    }

    /// The walk ran off the end of the chain.
    fn at_end(&self) -> bool {
        !(2..END_OF_CLUSTER).contains(&self.cluster)
    }

    fn load(&self, slot: &mut [u8; DIRENT_SIZE]) {
        self.fs
            .read_cluster(self.cluster, &mut slot[..], 0, self.off_in_cluster, DIRENT_SIZE as u32);
    }

    fn advance(&mut self, slots: u32) {
        let bpc = self.fs.bpb().bytes_per_cluster();
        self.pos += slots * DIRENT_SIZE as u32;
        self.off_in_cluster += slots * DIRENT_SIZE as u32;
        while self.off_in_cluster >= bpc && !self.at_end() {
            self.cluster = self.fs.read_fat(self.cluster);
            self.off_in_cluster -= bpc;
        }
    }
}

impl FileSystem {
    /// Scan the directory starting at cluster `parent` for `name`.
    ///
    /// Long records are matched chunk-wise against the UCS-2 form of
    /// `name`; a bare short entry is matched byte-wise against the raw
    /// name, which is how `.` and `..` resolve.
    pub(crate) fn lookup_dir(&self, parent: u32, name: &str) -> Option<EntryInfo> {
        let wname = name_to_utf16(name);
        let entcnt = lfn_count(wname.len());
        let mut cur = DirCursor::new(self, parent);
        let mut matched = false;
        let mut record_start = None;
        let mut slot = [0u8; DIRENT_SIZE];

        loop {
            if cur.at_end() {
                return None;
            }
            cur.load(&mut slot);
            match slot[0] {
                DIR_ENTRY_LAST_AND_UNUSED => return None,
                DIR_ENTRY_UNUSED => {
                    matched = false;
                    record_start = None;
                    cur.advance(1);
                }
                _ if slot[11] == ATTR_LONG_NAME => {
                    let lde = LongDirEntry::from_bytes(&slot);
                    let count = lde.order() as usize;
                    if count == 0 || count > entcnt || (lde.is_last() && count != entcnt) {
                        // wrong length for the target: step over the
                        // rest of this record, short entry included
                        cur.advance(count as u32 + 1);
                        matched = false;
                        record_start = None;
                    } else if lde.name_chunk() == lfn_chunk(&wname, count - 1) {
                        if lde.is_last() {
                            record_start = Some(cur.pos);
                        }
                        if count == 1 {
                            matched = true;
                        }
                        cur.advance(1);
                    } else {
                        cur.advance(count as u32 + 1);
                        matched = false;
                        record_start = None;
                    }
                }
                _ => {
                    let sde = ShortDirEntry::from_bytes(&slot);
                    if matched {
                        return Some(EntryInfo {
                            attribute: sde.attr(),
                            first_cluster: sde.first_cluster(),
                            file_size: sde.file_size(),
                            parent,
                            offset: record_start.unwrap(),
                        });
                    }
                    let (short, len) = sde.name_8_3();
                    if &short[..len] == name.as_bytes() {
                        return Some(EntryInfo {
                            attribute: sde.attr(),
                            first_cluster: sde.first_cluster(),
                            file_size: sde.file_size(),
                            parent,
                            offset: cur.pos,
                        });
                    }
                    record_start = None;
                    cur.advance(1);
                }
            }
        }
    }

    /// Write the LFN run + short entry for a new name and hand back the
    /// in-memory payload. Directories get a zeroed first cluster; files
    /// start with none.
    fn write_new_entry(
        &self,
        parent: u32,
        name: &str,
        kind: FileKind,
    ) -> Result<EntryInfo, DirError> {
        let wname = name_to_utf16(name);
        let entcnt = lfn_count(wname.len());
        let start = self.free_slot_run(parent, entcnt as u32 + 1)?;

        let attribute = kind as u8;
        let first_cluster = match kind {
            FileKind::Dir => self.alloc_clus()?,
            FileKind::File => 0,
        };

        let alias = short_name_alias(name);
        let sde = ShortDirEntry::new(&alias, attribute, first_cluster);
        let checksum = sde.checksum();

        // reverse order on disk: the last chunk goes first and carries
        // the terminator bit
        for i in 0..entcnt {
            let mut ord = (entcnt - i) as u8;
            if i == 0 {
                ord |= LAST_LONG_ENTRY;
            }
            let chunk = lfn_chunk(&wname, entcnt - 1 - i);
            let lde = LongDirEntry::new(ord, &chunk, checksum);
            self.write_dir_slot(parent, start + (i * DIRENT_SIZE) as u32, lde.as_bytes())?;
        }
        self.write_dir_slot(parent, start + (entcnt * DIRENT_SIZE) as u32, sde.as_bytes())?;

        Ok(EntryInfo {
            attribute,
            first_cluster,
            file_size: 0,
            parent,
            offset: start,
        })
    }

    /// Offset of the first slot of a free run of `needed` slots,
    /// growing the directory when the scan runs off its chain.
    fn free_slot_run(&self, parent: u32, needed: u32) -> Result<u32, DirError> {
        let mut cur = DirCursor::new(self, parent);
        let mut run_start: Option<u32> = None;
        let mut run_len = 0u32;
        let mut slot = [0u8; DIRENT_SIZE];

        loop {
            if cur.at_end() {
                // everything past the chain is free once extended
                return Ok(run_start.unwrap_or(cur.pos));
            }
            cur.load(&mut slot);
            match slot[0] {
                DIR_ENTRY_LAST_AND_UNUSED => return Ok(run_start.unwrap_or(cur.pos)),
                DIR_ENTRY_UNUSED => {
                    if run_start.is_none() {
                        run_start = Some(cur.pos);
                    }
                    run_len += 1;
                    if run_len == needed {
                        return Ok(run_start.unwrap());
                    }
                    cur.advance(1);
                }
                _ => {
                    run_start = None;
                    run_len = 0;
                    cur.advance(1);
                }
            }
        }
    }

    /// Write one 32-byte slot at a linear directory offset, allocating
    /// chain clusters on the way as needed.
    fn write_dir_slot(&self, dir_first: u32, off: u32, bytes: &[u8]) -> Result<(), DirError> {
        let bpc = self.bpb.bytes_per_cluster();
        let mut cluster = dir_first;
        for _ in 0..off / bpc {
            cluster = self.next_or_grow(cluster)?;
        }
        // slots are 32-byte aligned and never straddle a cluster
        self.write_cluster(cluster, bytes, 0, off % bpc, bytes.len() as u32);
        Ok(())
    }

    /// Linear offset of the record's short entry. The record's leading
    /// slot says how many long entries precede it; a record opening
    /// with a short entry has none.
    fn record_sfn_offset(&self, info: &EntryInfo) -> Option<u32> {
        let bpc = self.bpb.bytes_per_cluster();
        let cluster = self.walk_chain(info.parent, info.offset / bpc);
        if !(2..END_OF_CLUSTER).contains(&cluster) {
            return None;
        }
        let mut slot = [0u8; DIRENT_SIZE];
        self.read_cluster(cluster, &mut slot[..], 0, info.offset % bpc, DIRENT_SIZE as u32);
        let entcnt = if slot[11] == ATTR_LONG_NAME {
            (slot[0] & !LAST_LONG_ENTRY) as u32
        } else {
            0
        };
        Some(info.offset + entcnt * DIRENT_SIZE as u32)
    }

    /// Persist an entry's metadata (size and first cluster) into its
    /// short record.
    pub(crate) fn update_entry(&self, info: &EntryInfo) {
        // the sentinel root has no record of its own
        if info.parent == 0 {
            return;
        }
        let bpc = self.bpb.bytes_per_cluster();
        let sfn_off = match self.record_sfn_offset(info) {
            Some(off) => off,
            None => return,
        };
        let cluster = self.walk_chain(info.parent, sfn_off / bpc);
        if !(2..END_OF_CLUSTER).contains(&cluster) {
            return;
        }
        let mut slot = [0u8; DIRENT_SIZE];
        self.read_cluster(cluster, &mut slot[..], 0, sfn_off % bpc, DIRENT_SIZE as u32);
        let mut sde = ShortDirEntry::from_bytes(&slot);
        sde.set_first_cluster(info.first_cluster);
        sde.set_file_size(info.file_size);
        self.write_cluster(cluster, sde.as_bytes(), 0, sfn_off % bpc, DIRENT_SIZE as u32);
    }

    /// Flag every slot of the record, long entries and short entry
    /// alike, as deleted.
    fn erase_record(&self, info: &EntryInfo) {
        let bpc = self.bpb.bytes_per_cluster();
        let sfn_off = match self.record_sfn_offset(info) {
            Some(off) => off,
            None => return,
        };
        let mut off = info.offset;
        while off <= sfn_off {
            let cluster = self.walk_chain(info.parent, off / bpc);
            if !(2..END_OF_CLUSTER).contains(&cluster) {
                return;
            }
            self.write_cluster(cluster, &[DIR_ENTRY_UNUSED][..], 0, off % bpc, 1);
            off += DIRENT_SIZE as u32;
        }
    }

    /// Decode one record at linear offset `off` of the directory at
    /// `dir_first`, skipping deleted slots.
    fn read_dir_record(&self, dir_first: u32, off: u32) -> Option<DirRecord> {
        let mut cur = DirCursor::new(self, dir_first);
        cur.advance(off / DIRENT_SIZE as u32);
        let mut slot = [0u8; DIRENT_SIZE];
        let mut chunks: Vec<[u16; crate::LONG_NAME_LEN]> = Vec::new();

        loop {
            if cur.at_end() {
                return None;
            }
            cur.load(&mut slot);
            match slot[0] {
                DIR_ENTRY_LAST_AND_UNUSED => return None,
                DIR_ENTRY_UNUSED => {
                    chunks.clear();
                    cur.advance(1);
                }
                _ if slot[11] == ATTR_LONG_NAME => {
                    let lde = LongDirEntry::from_bytes(&slot);
                    if lde.is_last() {
                        chunks.clear();
                    }
                    chunks.push(lde.name_chunk());
                    cur.advance(1);
                }
                _ => {
                    let sde = ShortDirEntry::from_bytes(&slot);
                    let name = if chunks.is_empty() {
                        let (short, len) = sde.name_8_3();
                        short[..len].iter().map(|&b| b as char).collect()
                    } else {
                        // chunks arrived last-first
                        let units: Vec<u16> = chunks
                            .iter()
                            .rev()
                            .flatten()
                            .copied()
                            .take_while(|&u| u != 0x0000 && u != 0xFFFF)
                            .collect();
                        core::char::decode_utf16(units)
                            .map(|r| r.unwrap_or(core::char::REPLACEMENT_CHARACTER))
                            .collect()
                    };
                    return Some(DirRecord {
                        name,
                        attribute: sde.attr(),
                        first_cluster: sde.first_cluster(),
                        next_off: cur.pos + DIRENT_SIZE as u32,
                    });
                }
            }
        }
    }
}

impl EntryGuard<'_> {
    /// Look `name` up in this directory: entry-cache hit first, disk
    /// scan on a miss. `None` when the name does not exist or this
    /// entry is not a directory.
    pub fn find(&self, name: &str) -> Option<EntryHandle> {
        if !self.is_dir() {
            return None;
        }
        let fs = Arc::clone(&self.handle.fs);
        let (slot, hit) = fs.ecache.get(fs.dev, self.first_cluster, name);
        let handle = EntryHandle::new(Arc::clone(&fs), slot);
        if hit {
            return Some(handle);
        }
        match fs.lookup_dir(self.first_cluster, name) {
            Some(info) => {
                let attribute = info.attribute;
                *fs.ecache.guard_slot(slot) = info;
                fs.ecache.publish(slot, self.first_cluster, name, attribute);
                Some(handle)
            }
            None => {
                // dropping the handle hands the reserved slot back
                drop(handle);
                None
            }
        }
    }

    /// Create `name` in this directory.
    ///
    /// The caller must have checked, under this same guard, that the
    /// name is not already present; creating over a cached live entry
    /// is a bug and panics.
    pub fn create(&mut self, name: &str, kind: FileKind) -> Result<EntryHandle, DirError> {
        if !self.is_dir() {
            return Err(DirError::NotDir);
        }
        if name.is_empty() || name.len() > MAX_FILENAME || is_illegal(name) {
            return Err(DirError::InvalidName);
        }
        let fs = Arc::clone(&self.handle.fs);
        let (slot, hit) = fs.ecache.get(fs.dev, self.first_cluster, name);
        if hit {
            panic!("create: entry already cached");
        }
        let handle = EntryHandle::new(Arc::clone(&fs), slot);
        match fs.write_new_entry(self.first_cluster, name, kind) {
            Ok(info) => {
                debug!(
                    "create {:?} '{}' in directory cluster {}",
                    kind, name, self.first_cluster
                );
                let attribute = info.attribute;
                *fs.ecache.guard_slot(slot) = info;
                fs.ecache.publish(slot, self.first_cluster, name, attribute);
                Ok(handle)
            }
            Err(e) => Err(e),
        }
    }

    /// Mark this entry's record deleted on disk and free its cluster
    /// chain. The handle stays usable only for release.
    pub fn truncate(&mut self) {
        if self.handle.slot == ROOT_SLOT {
            panic!("truncate: root directory");
        }
        let fs = Arc::clone(&self.handle.fs);
        debug!(
            "truncate entry at parent cluster {} offset {}",
            self.info.parent, self.info.offset
        );
        fs.erase_record(&self.info);
        fs.ecache.invalidate(self.handle.slot);

        let mut cluster = self.info.first_cluster;
        while (2..END_OF_CLUSTER).contains(&cluster) {
            let next = fs.read_fat(cluster);
            let _ = fs.free_clus(cluster);
            cluster = next;
        }
        self.info.first_cluster = 0;
        self.info.file_size = 0;
    }

    /// Decode one record of this directory starting at byte `off`;
    /// `None` past the last record. Deleted slots are skipped.
    pub fn read_dir_at(&self, off: u32) -> Option<DirRecord> {
        if !self.is_dir() {
            return None;
        }
        self.handle.fs.read_dir_record(self.first_cluster, off)
    }
}
