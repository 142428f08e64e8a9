//! Pathname resolution over the entry cache.

use alloc::string::String;
use alloc::sync::Arc;

use crate::ecache::{EntryGuard, EntryHandle};
use crate::fs::FileSystem;
use crate::{ATTR_ARCHIVE, ATTR_DIRECTORY, MAX_FILENAME};

/// What to create. The discriminants are the on-disk attribute bits a
/// fresh record receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    File = ATTR_ARCHIVE,
    Dir = ATTR_DIRECTORY,
}

/// Metadata snapshot of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: u32,
    /// Synthetic inode number: the entry's first cluster.
    pub ino: u32,
    pub attribute: u8,
    pub size: u32,
}

impl EntryGuard<'_> {
    pub fn stat(&self) -> Stat {
        Stat {
            dev: self.handle.fs.dev,
            ino: self.first_cluster,
            attribute: self.attribute,
            size: self.file_size,
        }
    }
}

/// Split the next element off `path`: strip leading slashes, take up
/// to the next slash, cap overlong names at `MAX_FILENAME` bytes
/// (backing off to a character boundary). `None` once exhausted.
fn skip_elem(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    let (elem, rest) = match path.find('/') {
        Some(i) => (&path[..i], &path[i..]),
        None => (path, ""),
    };
    let elem = if elem.len() > MAX_FILENAME {
        let mut end = MAX_FILENAME;
        while !elem.is_char_boundary(end) {
            end -= 1;
        }
        &elem[..end]
    } else {
        elem
    };
    Some((elem, rest))
}

fn path_exhausted(path: &str) -> bool {
    path.trim_start_matches('/').is_empty()
}

impl FileSystem {
    /// Walk `path` from `start` (or from the root when absolute),
    /// locking each directory for the duration of its lookup and
    /// releasing it before descending.
    ///
    /// In parent mode the walk stops one element short: the enclosing
    /// directory comes back still referenced, together with the final
    /// name, for the caller to create or unlink under its own lock.
    fn lookup_path(
        self: &Arc<Self>,
        start: EntryHandle,
        path: &str,
        parent: bool,
    ) -> Option<(EntryHandle, String)> {
        let mut entry = if path.starts_with('/') {
            self.root()
        } else {
            start
        };
        let mut rest = path;
        let mut last = String::new();

        while let Some((name, r)) = skip_elem(rest) {
            rest = r;
            let guard = entry.lock();
            if !guard.is_dir() {
                return None;
            }
            if parent && path_exhausted(rest) {
                drop(guard);
                return Some((entry, String::from(name)));
            }
            let next = match guard.find(name) {
                Some(next) => next,
                None => return None,
            };
            drop(guard);
            last.clear();
            last.push_str(name);
            entry = next;
        }
        if parent {
            // a path with no final component has no parent to give
            return None;
        }
        Some((entry, last))
    }

    /// Resolve a full path; relative paths start at the root.
    pub fn get_entry(self: &Arc<Self>, path: &str) -> Option<EntryHandle> {
        let start = self.root();
        self.lookup_path(start, path, false).map(|(entry, _)| entry)
    }

    /// Resolve a full path; relative paths start at `cwd`.
    pub fn get_entry_from(self: &Arc<Self>, cwd: &EntryHandle, path: &str) -> Option<EntryHandle> {
        self.lookup_path(cwd.clone(), path, false)
            .map(|(entry, _)| entry)
    }

    /// Resolve the directory that holds `path`'s final component;
    /// returns the directory and that component.
    pub fn get_parent(self: &Arc<Self>, path: &str) -> Option<(EntryHandle, String)> {
        let start = self.root();
        self.lookup_path(start, path, true)
    }

    /// Like [`FileSystem::get_parent`], with relative paths starting
    /// at `cwd`.
    pub fn get_parent_from(
        self: &Arc<Self>,
        cwd: &EntryHandle,
        path: &str,
    ) -> Option<(EntryHandle, String)> {
        self.lookup_path(cwd.clone(), path, true)
    }
}
