#![no_std]
pub mod bpb;
pub mod cache;
pub mod device;
pub mod dir;
pub mod ecache;
pub mod entry;
pub mod fat;
pub mod file;
pub mod fs;
pub mod vfs;

pub use bpb::{BiosParameterBlock, MountError};
pub use device::{BlockDevice, DeviceErr};
pub use dir::{DirError, DirRecord};
pub use ecache::{EntryGuard, EntryHandle, EntryInfo};
pub use fat::FatError;
pub use file::{CopyFault, CopyIn, CopyOut, FileError};
pub use fs::FileSystem;
pub use vfs::{FileKind, Stat};

use core::convert::TryInto;

extern crate alloc;

#[cfg(test)]
extern crate std;

pub const FREE_CLUSTER: u32 = 0x0000_0000;
pub const BAD_CLUSTER: u32 = 0x0FFF_FFF7;
/// EOC: End of Cluster Chain
///
/// Any FAT value at or above this threshold terminates a chain; the
/// cluster holding such a value is still in use, it merely has no
/// successor.
pub const END_OF_CLUSTER: u32 = 0x0FFF_FFF8;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

pub const DIRENT_SIZE: usize = 32;
/// UCS-2 characters carried by one long-name directory entry.
pub const LONG_NAME_LEN: usize = 13;
/// Longest accepted filename, in bytes.
pub const MAX_FILENAME: usize = 255;

/// BPB Bytes Per Sector; must match what the mounted volume reports.
pub const BLOCK_SIZE: usize = 512;
pub const BLOCK_CACHE_LIMIT: usize = 64;
/// Fixed number of in-memory directory-entry slots, sentinel excluded.
pub const ENTRY_CACHE_SIZE: usize = 50;

/// For Short Directory Entry Name[0] and Long Directory Entry Ord
///
/// Deleted
pub const DIR_ENTRY_UNUSED: u8 = 0xE5;
/// For Short Directory Entry Name[0]: free, and no allocated entry follows.
pub const DIR_ENTRY_LAST_AND_UNUSED: u8 = 0x00;
/// For Long Directory Entry Ord as the last entry mask
///
/// This mask is or'd into the ordinal of the final long-name entry of a
/// single record (the one written first on disk), not into some global
/// directory counter.
pub const LAST_LONG_ENTRY: u8 = 0x40;

// Charactor
pub const SPACE: u8 = 0x20;
pub const DOT: u8 = 0x2E;

pub(crate) fn read_le_u16(input: &[u8]) -> u16 {
    let (int_bytes, _) = input.split_at(core::mem::size_of::<u16>());
    u16::from_le_bytes(int_bytes.try_into().unwrap())
}

pub(crate) fn read_le_u32(input: &[u8]) -> u32 {
    let (int_bytes, _) = input.split_at(core::mem::size_of::<u32>());
    u32::from_le_bytes(int_bytes.try_into().unwrap())
}

pub(crate) fn is_illegal(chs: &str) -> bool {
    let illegal_char = "\\/:*?\"<>|";
    for ch in illegal_char.chars() {
        if chs.contains(ch) {
            return true;
        }
    }
    false
}

/// Number of long-name entries needed to store a name of this many
/// UCS-2 characters.
pub(crate) fn lfn_count(name_utf16_len: usize) -> usize {
    if name_utf16_len % LONG_NAME_LEN == 0 {
        name_utf16_len / LONG_NAME_LEN
    } else {
        name_utf16_len / LONG_NAME_LEN + 1
    }
}
