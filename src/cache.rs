//! Write-back sector cache between the filesystem layers and the device.
//!
//! Every FAT, directory and data access goes through here; a sector is
//! read once, mutated in place and flushed when evicted, dropped or
//! explicitly synced.

use alloc::{sync::Arc, vec, vec::Vec};
use core::ops::{Drop, FnOnce};
use lru::LruCache;
use spin::{Mutex, RwLock};

use super::device::BlockDevice;
use super::{BLOCK_CACHE_LIMIT, BLOCK_SIZE};

pub trait Cache {
    /// The read-only mapper to the block cache
    ///
    /// - `offset`: offset in cache
    /// - `f`: a closure to read
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V;
    /// The mutable mapper to the block cache
    ///
    /// - `offset`: offset in cache
    /// - `f`: a closure to write
    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V;
    /// Tell cache to write back
    fn sync(&mut self);
}

pub struct BlockCache {
    cache: Vec<u8>,
    // the sector id on the device, not within any cluster
    block_id: usize,
    block_device: Arc<dyn BlockDevice>,
    modified: bool,
}

impl BlockCache {
    // load a sector from the device
    pub fn new(block_id: usize, block_device: Arc<dyn BlockDevice>) -> Self {
        let mut cache = vec![0u8; BLOCK_SIZE];
        block_device
            .read_blocks(&mut cache, block_id * BLOCK_SIZE, 1)
            .unwrap();
        Self {
            cache,
            block_id,
            block_device,
            modified: false,
        }
    }

    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.cache[offset] as *const _ as usize
    }

    fn get_ref<T>(&self, offset: usize) -> &T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= BLOCK_SIZE);
        let addr = self.addr_of_offset(offset);
        unsafe { &*(addr as *const T) }
    }

    fn get_mut<T>(&mut self, offset: usize) -> &mut T
    where
        T: Sized,
    {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= BLOCK_SIZE);
        self.modified = true;
        let addr = self.addr_of_offset(offset);
        unsafe { &mut *(addr as *mut T) }
    }
}

impl Cache for BlockCache {
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    // write the content back to the device
    fn sync(&mut self) {
        if self.modified {
            self.modified = false;
            self.block_device
                .write_blocks(&self.cache, self.block_id * BLOCK_SIZE, 1)
                .unwrap();
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.sync()
    }
}

/// Per-volume pool of cached sectors.
///
/// One instance lives inside each mounted `FileSystem`, so two mounts
/// never alias each other's sectors.
pub struct BlockCacheManager {
    lru: Mutex<LruCache<usize, Arc<RwLock<BlockCache>>>>,
}

impl BlockCacheManager {
    pub fn new() -> Self {
        Self {
            // never evicts on its own; see get_block_cache
            lru: Mutex::new(LruCache::unbounded()),
        }
    }

    // get a cached sector by id, loading it on a miss
    pub fn get_block_cache(
        &self,
        block_id: usize,
        block_device: Arc<dyn BlockDevice>,
    ) -> Arc<RwLock<BlockCache>> {
        let mut lru = self.lru.lock();
        if let Some(pair) = lru.get(&block_id) {
            Arc::clone(pair)
        } else {
            let block_cache = Arc::new(RwLock::new(BlockCache::new(
                block_id,
                Arc::clone(&block_device),
            )));

            // over the limit, drop the oldest sector nobody holds;
            // its Drop impl writes it back if dirty
            if lru.len() >= BLOCK_CACHE_LIMIT {
                if let Some((_, peek_cache)) = lru.peek_lru() {
                    if Arc::strong_count(peek_cache) == 1 {
                        lru.pop_lru();
                    }
                }
            }
            lru.put(block_id, Arc::clone(&block_cache));
            block_cache
        }
    }

    pub fn sync_all(&self) {
        let lru = self.lru.lock();
        for (_, block_cache) in lru.iter() {
            block_cache.write().sync();
        }
    }
}

impl Default for BlockCacheManager {
    fn default() -> Self {
        Self::new()
    }
}
