//! # Disk manager layer
//!
//! [`MicaFileSystem`] owns everything that touches blocks: geometry,
//! formatting, the superblock copy, the occupancy bitvector, and typed
//! access to descriptors, index blocks and data blocks through the cache.
//! The operation engine above it never handles raw buffers.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{info, trace};
use spin::Mutex;

use crate::bitmap::{region_blocks, Bitvector};
use crate::block_cache::{BlockCache, BlockCacheManager};
use crate::layout::{
    BlockTag, Descriptor, DescriptorKind, IndexBlock, SuperBlock, INDEX_PAYLOAD_SLOTS,
};
use crate::session::Ctx;
use crate::{
    BlockDevice, BlockRef, Clock, FsError, RawBlock, Result, BLOCK_SIZE, MAX_BLOCKS, NULL_REF,
    PAYLOAD_SIZE, TAG_BYTES,
};

/// Outcome of scanning an index chain for a free payload slot.
pub enum SlotSearch {
    Found { block: BlockRef, slot: usize },
    /// Every payload slot across the chain is taken; `last` is the tail
    /// block a fresh index block would be linked onto.
    Full { last: BlockRef },
}

pub struct MicaFileSystem {
    cache: Mutex<BlockCacheManager>,
    superblock: SuperBlock,
    bitmap: Bitvector,
}

impl MicaFileSystem {
    /// Lays a fresh volume onto `device`: bitvector region, superblock,
    /// root folder descriptor and the root's first index block, in the
    /// fixed on-disk order. The root takes identifier 0 and is owned by
    /// the formatting caller.
    pub fn format(
        device: Arc<dyn BlockDevice>,
        clock: &dyn Clock,
        ctx: &Ctx,
        total_blocks: usize,
    ) -> Result<Self> {
        let region = region_blocks(total_blocks);
        let root_ref = (region + 1) as BlockRef;
        let root_index = region + 2;
        // region + superblock + root descriptor + root index + storage
        if total_blocks > MAX_BLOCKS || total_blocks < region + 4 || device.num_blocks() < total_blocks {
            return Err(FsError::System);
        }

        let mut fs = Self {
            cache: Mutex::new(BlockCacheManager::new(device)),
            superblock: SuperBlock::new(total_blocks as u32, root_ref),
            bitmap: Bitvector::formatted(total_blocks),
        };
        for block in 0..root_index + 1 {
            fs.bitmap.set(block);
        }

        let mut root = Descriptor::new(
            fs.superblock.take_identifier(),
            DescriptorKind::Folder,
            "/",
            ctx.uid,
            ctx.umask,
            clock.now(),
            root_ref,
            root_ref,
        );
        root.content_ref = root_index as BlockRef;

        fs.write_descriptor(&root);
        fs.init_index_block(root_index as BlockRef);
        fs.sync_superblock();
        for region_block in 0..region {
            fs.write_bitvector_block(region_block);
        }
        // touch the last block so the device is committed to full size
        fs.block(total_blocks - 1)
            .lock()
            .map_mut(0, |block: &mut RawBlock| block.fill(0));
        fs.sync_all();

        info!(
            "formatted volume: {} blocks of {} bytes, root at {}",
            total_blocks, BLOCK_SIZE, root_ref
        );
        Ok(fs)
    }

    /// Loads the durable state of a formatted volume: superblock copy
    /// plus the bitvector mirror.
    pub fn load(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let total_blocks = device.num_blocks().min(MAX_BLOCKS);
        let region = region_blocks(total_blocks);
        let cache = Mutex::new(BlockCacheManager::new(device));

        let superblock = cache
            .lock()
            .get(region)
            .lock()
            .map(0, |sb: &SuperBlock| sb.clone());
        if !superblock.is_valid() || superblock.total_blocks as usize != total_blocks {
            return Err(FsError::System);
        }

        let mut bits = Vec::with_capacity(region * BLOCK_SIZE);
        for region_block in 0..region {
            cache
                .lock()
                .get(region_block)
                .lock()
                .map(0, |block: &RawBlock| bits.extend_from_slice(block));
        }

        info!(
            "loaded volume: {} blocks, next identifier {}",
            total_blocks,
            superblock.next_identifier()
        );
        Ok(Self {
            cache,
            superblock,
            bitmap: Bitvector::from_bytes(bits, total_blocks),
        })
    }

    #[inline]
    pub fn total_blocks(&self) -> usize {
        self.superblock.total_blocks as usize
    }

    #[inline]
    pub fn root_ref(&self) -> BlockRef {
        self.superblock.root_ref
    }

    #[inline]
    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    fn superblock_ref(&self) -> usize {
        region_blocks(self.total_blocks())
    }

    /// Next unique identifier; the superblock is pushed to the device
    /// before the identifier is ever used.
    pub fn take_identifier(&mut self) -> u64 {
        let identifier = self.superblock.take_identifier();
        self.sync_superblock();
        identifier
    }

    /// Write-through persist of the superblock copy.
    pub fn sync_superblock(&self) {
        let cache = self.block(self.superblock_ref());
        let mut cache = cache.lock();
        cache.map_mut(0, |sb: &mut SuperBlock| *sb = self.superblock.clone());
        cache.sync();
    }

    /// Flushes every dirty cached block.
    pub fn sync_all(&self) {
        self.cache.lock().sync_all();
    }

    pub(crate) fn block(&self, block_id: usize) -> Arc<Mutex<BlockCache>> {
        self.cache.lock().get(block_id)
    }
}

/* block allocation */

impl MicaFileSystem {
    pub fn free_blocks(&self) -> usize {
        self.bitmap.free_count()
    }

    /// Claims the first free block. Only the bitvector block containing
    /// the toggled bit is written back.
    pub fn alloc_block(&mut self) -> Result<BlockRef> {
        let index = self.bitmap.find_free()?;
        self.bitmap.set(index as usize);
        self.write_bitvector_block(Bitvector::block_of(index as usize));
        trace!("alloc block {index}");
        Ok(index)
    }

    /// Releases a block. The content is left in place; only the
    /// occupancy bit changes.
    pub fn free_block(&mut self, index: BlockRef) {
        self.bitmap.clear(index as usize);
        self.write_bitvector_block(Bitvector::block_of(index as usize));
        trace!("free block {index}");
    }

    pub fn block_in_use(&self, index: BlockRef) -> bool {
        self.bitmap.is_set(index as usize)
    }

    fn write_bitvector_block(&self, region_block: usize) {
        let bytes = self.bitmap.block_bytes(region_block);
        self.block(region_block)
            .lock()
            .map_mut(0, |block: &mut RawBlock| block.copy_from_slice(bytes));
    }
}

/* typed block access */

impl MicaFileSystem {
    pub fn read_tag(&self, block: BlockRef) -> Result<BlockTag> {
        let raw = self.block(block as usize).lock().map(0, |tag: &u16| *tag);
        BlockTag::from_raw(raw)
    }

    /// Descriptor stored in `block`; the tag must say one is there.
    pub fn read_descriptor(&self, block: BlockRef) -> Result<Descriptor> {
        match self.read_tag(block)? {
            BlockTag::Folder | BlockTag::File => Ok(self
                .block(block as usize)
                .lock()
                .map(TAG_BYTES, |descriptor: &Descriptor| descriptor.clone())),
            _ => Err(FsError::System),
        }
    }

    /// Persists `descriptor` into its own block, tag included.
    pub fn write_descriptor(&self, descriptor: &Descriptor) {
        let cache = self.block(descriptor.self_ref as usize);
        let mut cache = cache.lock();
        cache.map_mut(0, |tag: &mut u16| *tag = descriptor.kind().tag() as u16);
        cache.map_mut(TAG_BYTES, |slot: &mut Descriptor| *slot = descriptor.clone());
    }

    pub fn map_index<V>(&self, block: BlockRef, f: impl FnOnce(&IndexBlock) -> V) -> Result<V> {
        if self.read_tag(block)? != BlockTag::Index {
            return Err(FsError::System);
        }
        Ok(self.block(block as usize).lock().map(TAG_BYTES, f))
    }

    pub fn map_index_mut<V>(
        &self,
        block: BlockRef,
        f: impl FnOnce(&mut IndexBlock) -> V,
    ) -> Result<V> {
        if self.read_tag(block)? != BlockTag::Index {
            return Err(FsError::System);
        }
        Ok(self.block(block as usize).lock().map_mut(TAG_BYTES, f))
    }

    /// Allocates and initializes an empty index block.
    pub fn new_index_block(&mut self) -> Result<BlockRef> {
        let block = self.alloc_block()?;
        self.init_index_block(block);
        Ok(block)
    }

    fn init_index_block(&self, block: BlockRef) {
        let cache = self.block(block as usize);
        let mut cache = cache.lock();
        cache.map_mut(0, |tag: &mut u16| *tag = BlockTag::Index as u16);
        cache.map_mut(TAG_BYTES, |index: &mut IndexBlock| index.init());
    }

    /// Allocates a data block holding `bytes` (at most one payload).
    pub fn write_data_block(&mut self, bytes: &[u8]) -> Result<BlockRef> {
        debug_assert!(bytes.len() <= PAYLOAD_SIZE);
        let block = self.alloc_block()?;
        let cache = self.block(block as usize);
        let mut cache = cache.lock();
        cache.map_mut(0, |tag: &mut u16| *tag = BlockTag::Data as u16);
        cache.map_mut(TAG_BYTES, |payload: &mut [u8; PAYLOAD_SIZE]| {
            payload[..bytes.len()].copy_from_slice(bytes);
            payload[bytes.len()..].fill(0);
        });
        Ok(block)
    }

    /// Appends the first `len` payload bytes of a data block to `out`.
    pub fn read_data_block(&self, block: BlockRef, len: usize, out: &mut Vec<u8>) -> Result<()> {
        if self.read_tag(block)? != BlockTag::Data {
            return Err(FsError::Read);
        }
        self.block(block as usize)
            .lock()
            .map(TAG_BYTES, |payload: &[u8; PAYLOAD_SIZE]| {
                out.extend_from_slice(&payload[..len])
            });
        Ok(())
    }
}

/* index chains */

impl MicaFileSystem {
    /// Lazy sequence of the payload references reachable from `head`,
    /// in chain order. Restartable: call again with the same head.
    pub fn chain_refs(&self, head: BlockRef) -> ChainRefs<'_> {
        ChainRefs {
            fs: self,
            block: head,
            slot: 0,
            chained: 0,
        }
    }

    /// Walks the whole chain at once: payload references and the index
    /// blocks that carry them.
    pub fn collect_chain(&self, head: BlockRef) -> Result<(Vec<BlockRef>, Vec<BlockRef>)> {
        let mut payload = Vec::new();
        let mut indexes = Vec::new();
        let mut current = head;
        while current != NULL_REF {
            if indexes.len() >= self.total_blocks() {
                return Err(FsError::System);
            }
            indexes.push(current);
            let next = self.map_index(current, |index| {
                payload.extend(index.entries());
                index.next()
            })?;
            current = next.unwrap_or(NULL_REF);
        }
        Ok((payload, indexes))
    }

    /// Builds a fresh chain holding `refs` and returns its head
    /// (`NULL_REF` for no refs).
    pub fn build_chain(&mut self, refs: &[BlockRef]) -> Result<BlockRef> {
        if refs.is_empty() {
            return Ok(NULL_REF);
        }
        let mut blocks = Vec::with_capacity(refs.len().div_ceil(INDEX_PAYLOAD_SLOTS));
        for _ in 0..refs.len().div_ceil(INDEX_PAYLOAD_SLOTS) {
            blocks.push(self.new_index_block()?);
        }
        for (i, chunk) in refs.chunks(INDEX_PAYLOAD_SLOTS).enumerate() {
            let next = blocks.get(i + 1).copied();
            self.map_index_mut(blocks[i], |index| {
                for (slot, &r) in chunk.iter().enumerate() {
                    index.set(slot, r);
                }
                if let Some(next) = next {
                    index.set_next(next);
                }
            })?;
        }
        Ok(blocks[0])
    }

    /// First free payload slot across the chain starting at `head`.
    pub fn find_free_slot(&self, head: BlockRef) -> Result<SlotSearch> {
        let mut current = head;
        let mut seen = 0;
        loop {
            seen += 1;
            if seen > self.total_blocks() {
                return Err(FsError::System);
            }
            let (free, next) = self.map_index(current, |index| (index.first_free(), index.next()))?;
            if let Some(slot) = free {
                return Ok(SlotSearch::Found {
                    block: current,
                    slot,
                });
            }
            match next {
                Some(next) => current = next,
                None => return Ok(SlotSearch::Full { last: current }),
            }
        }
    }
}

/// See [`MicaFileSystem::chain_refs`].
pub struct ChainRefs<'a> {
    fs: &'a MicaFileSystem,
    block: BlockRef,
    slot: usize,
    chained: usize,
}

impl Iterator for ChainRefs<'_> {
    type Item = Result<BlockRef>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.block == NULL_REF {
                return None;
            }
            if self.slot == INDEX_PAYLOAD_SLOTS {
                self.chained += 1;
                if self.chained > self.fs.total_blocks() {
                    return Some(Err(FsError::System));
                }
                match self.fs.map_index(self.block, |index| index.next()) {
                    Ok(next) => {
                        self.block = next.unwrap_or(NULL_REF);
                        self.slot = 0;
                        continue;
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
            let slot = self.slot;
            self.slot += 1;
            match self.fs.map_index(self.block, |index| index.get(slot)) {
                Ok(Some(r)) => return Some(Ok(r)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
