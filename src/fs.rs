//! Mounting and the volume handle everything else hangs off.

use alloc::sync::Arc;
use log::{error, info};
use spin::{Mutex, RwLock};

use crate::bpb::{BiosParameterBlock, MountError};
use crate::cache::{BlockCache, BlockCacheManager, Cache};
use crate::device::BlockDevice;
use crate::ecache::{EntryCache, EntryHandle, ROOT_SLOT};
use crate::{BLOCK_SIZE, ENTRY_CACHE_SIZE};

/// A mounted FAT32 volume.
///
/// Owns the device, the sector cache, the volume geometry and the
/// directory-entry cache; handles out of the resolver keep it alive
/// through an `Arc`.
impl core::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileSystem").finish()
    }
}

pub struct FileSystem {
    pub(crate) device: Arc<dyn BlockDevice>,
    /// Device id; always 0 in this design, kept as part of the entry
    /// identity key for future multi-device use.
    pub(crate) dev: u32,
    pub(crate) bpb: BiosParameterBlock,
    pub(crate) cache: BlockCacheManager,
    /// Serialises cluster allocation over the whole scan-claim-zero
    /// sequence.
    pub(crate) alloc_lock: Mutex<()>,
    pub(crate) ecache: EntryCache,
}

impl FileSystem {
    /// Read the Boot Parameter Block of logical sector 0 and bring up
    /// the caches.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>, MountError> {
        let cache = BlockCacheManager::new();
        let parsed = cache
            .get_block_cache(0, Arc::clone(&device))
            .read()
            .read(0, |sector: &[u8; BLOCK_SIZE]| {
                BiosParameterBlock::parse(sector)
            });
        let bpb = match parsed {
            Ok(bpb) => bpb,
            Err(e) => {
                error!("mount failed: {:?}", e);
                return Err(e);
            }
        };
        info!(
            "mounted FAT32 volume: {} sectors, {} bytes/cluster, {} data clusters, root at {}",
            bpb.total_sectors,
            bpb.bytes_per_cluster(),
            bpb.data_cluster_count(),
            bpb.root_cluster
        );

        Ok(Arc::new(Self {
            device,
            dev: 0,
            ecache: EntryCache::new(ENTRY_CACHE_SIZE, bpb.root_cluster),
            bpb,
            cache,
            alloc_lock: Mutex::new(()),
        }))
    }

    pub fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    /// Fetch a sector through the write-back cache.
    pub(crate) fn block(&self, sector: u32) -> Arc<RwLock<BlockCache>> {
        self.cache
            .get_block_cache(sector as usize, Arc::clone(&self.device))
    }

    /// A counted handle to the root directory sentinel.
    pub fn root(self: &Arc<Self>) -> EntryHandle {
        self.ecache.dup(ROOT_SLOT);
        EntryHandle::new(Arc::clone(self), ROOT_SLOT)
    }

    /// Flush every dirty cached sector to the device.
    pub fn sync(&self) {
        self.cache.sync_all();
    }
}
