//! # Block cache layer
//!
//! Every access to the volume goes through an in-memory copy of the
//! block being operated on. The cache is write-back: a modified block is
//! flushed when [`BlockCacheManager::sync_all`] runs, when the cache is
//! evicted, or when it is dropped. Operations that need a durability
//! ordering (the copy-on-write path) call `sync_all` at their pivots.
//!
//! The manager is owned by the mount session; two mounted volumes never
//! share cached blocks.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use spin::Mutex;

use crate::BlockDevice;
use crate::BLOCK_SIZE;

/// Keeps the cached bytes 8-aligned so typed views at 8-aligned offsets
/// are valid for every on-disk struct.
#[repr(C, align(8))]
struct Buffer([u8; BLOCK_SIZE]);

/// One cached block.
pub struct BlockCache {
    data: Buffer,
    block_id: usize,
    block_device: Arc<dyn BlockDevice>,
    modified: bool,
}

impl BlockCache {
    pub fn new(block_id: usize, block_device: Arc<dyn BlockDevice>) -> Self {
        let mut data = Buffer([0; BLOCK_SIZE]);
        block_device.read_block(block_id, &mut data.0);

        Self {
            data,
            block_id,
            block_device,
            modified: false,
        }
    }

    pub fn sync(&mut self) {
        if self.modified {
            self.modified = false;
            self.block_device.write_block(self.block_id, &self.data.0);
        }
    }

    pub fn get<T: Sized>(&self, offset: usize) -> &T {
        assert!(mem::size_of::<T>() + offset <= BLOCK_SIZE);
        assert_eq!(offset % mem::align_of::<T>(), 0);
        let addr = self.offset(offset).cast();
        unsafe { &*addr }
    }

    pub fn get_mut<T: Sized>(&mut self, offset: usize) -> &mut T {
        assert!(mem::size_of::<T>() + offset <= BLOCK_SIZE);
        assert_eq!(offset % mem::align_of::<T>(), 0);
        self.modified = true;
        let addr = self.offset(offset).cast_mut().cast();
        unsafe { &mut *addr }
    }

    #[inline]
    pub fn map<T: Sized, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get(offset))
    }

    #[inline]
    pub fn map_mut<T: Sized, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }
}

impl BlockCache {
    #[inline]
    fn offset(&self, count: usize) -> *const u8 {
        &self.data.0[count]
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.sync();
    }
}

/// Pool of cached blocks for one device.
pub struct BlockCacheManager {
    queue: Vec<(usize, Arc<Mutex<BlockCache>>)>,
    device: Arc<dyn BlockDevice>,
}

impl BlockCacheManager {
    /// Upper bound on simultaneously cached blocks.
    const CAPACITY: usize = 16;

    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            queue: Vec::new(),
            device,
        }
    }

    /// Eviction policy: drop an idle block, writing it back if dirty.
    pub fn get(&mut self, block_id: usize) -> Arc<Mutex<BlockCache>> {
        if let Some(cache) = self
            .queue
            .iter()
            .find_map(|(id, cache)| (block_id == *id).then_some(cache))
        {
            return Arc::clone(cache);
        }

        if self.queue.len() == Self::CAPACITY {
            let index = self
                .queue
                .iter()
                .position(|(_, cache)| Arc::strong_count(cache) == 1)
                .expect("run out of block cache");
            self.queue.remove(index);
        }

        let block_cache = Arc::new(Mutex::new(BlockCache::new(block_id, self.device.clone())));
        self.queue.push((block_id, block_cache.clone()));

        block_cache
    }

    pub fn sync_all(&self) {
        self.queue.iter().for_each(|(_, cache)| cache.lock().sync());
    }
}
