//! # Operation engine layer
//!
//! [`Volume`] is the mount session: the disk manager plus the in-memory
//! acceleration structures (registry, process table), serving the calls
//! a driver forwards one at a time. Every call is a single transaction;
//! all preconditions are validated before the first block is touched, so
//! a failed call leaves no partial on-disk mutation behind.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use enumflags2::BitFlags;
use log::{debug, info};

use crate::layout::{AccessFlag, Descriptor, DescriptorKind, INDEX_PAYLOAD_SLOTS};
use crate::mfs::{MicaFileSystem, SlotSearch};
use crate::registry::{self, Entry, Handle, Registry};
use crate::session::{Ctx, OpenFile, ProcessTable};
use crate::{BlockDevice, BlockRef, Clock, FsError, Result, NAME_LENGTH, NULL_REF, PAYLOAD_SIZE};

pub struct Volume {
    fs: MicaFileSystem,
    registry: Registry,
    sessions: ProcessTable,
    clock: Arc<dyn Clock>,
    root: Handle,
}

impl Volume {
    /// Lays a fresh filesystem onto the device and closes it again. The
    /// formatting caller becomes the owner of the root folder.
    pub fn format(
        device: Arc<dyn BlockDevice>,
        clock: &dyn Clock,
        ctx: &Ctx,
        total_blocks: usize,
    ) -> Result<()> {
        MicaFileSystem::format(device, clock, ctx, total_blocks)?;
        Ok(())
    }

    /// Loads durable state and builds the registry by a full pre-order
    /// traversal from the root: parents are inserted before their
    /// children so every child can hold its parent's handle.
    pub fn mount(device: Arc<dyn BlockDevice>, clock: Arc<dyn Clock>) -> Result<Self> {
        let fs = MicaFileSystem::load(device)?;
        let mut registry = Registry::new();

        let root_descriptor = fs.read_descriptor(fs.root_ref())?;
        if !root_descriptor.is_folder() {
            return Err(FsError::System);
        }
        let root_content = root_descriptor.content_ref;
        let root = registry.insert(root_descriptor, None);

        let mut queue = VecDeque::new();
        queue.push_back((root, root_content));
        let mut cataloged = 1usize;
        while let Some((parent, head)) = queue.pop_front() {
            if head == NULL_REF {
                continue;
            }
            for child_ref in fs.collect_chain(head)?.0 {
                let descriptor = fs.read_descriptor(child_ref)?;
                let is_folder = descriptor.is_folder();
                let content = descriptor.content_ref;
                let handle = registry.insert(descriptor, Some(parent));
                cataloged += 1;
                if is_folder {
                    queue.push_back((handle, content));
                }
            }
        }
        info!("mounted volume, {cataloged} descriptors cataloged");

        Ok(Self {
            fs,
            registry,
            sessions: ProcessTable::new(root),
            clock,
            root,
        })
    }

    /// Flushes durable state and tears the session down.
    pub fn unmount(mut self) -> Result<()> {
        self.sessions.clear();
        self.fs.sync_superblock();
        self.fs.sync_all();
        info!("unmounted volume");
        Ok(())
    }

    #[inline]
    pub fn root(&self) -> Handle {
        self.root
    }

    pub fn free_blocks(&self) -> usize {
        self.fs.free_blocks()
    }

    #[inline]
    fn now(&self) -> u64 {
        self.clock.now()
    }

    fn resolve(&self, ctx: &Ctx, path: &str) -> Result<Handle> {
        self.registry
            .lookup_path(self.root, self.sessions.cwd(ctx.pid), path)
    }

    fn entry(&self, handle: Handle) -> Result<&Entry> {
        self.registry.get(handle).ok_or(FsError::System)
    }

    /// Persists a descriptor and updates its registry row in the same
    /// transaction; the cache stays a write-through mirror.
    fn update_descriptor(&mut self, handle: Handle, descriptor: Descriptor) {
        self.fs.write_descriptor(&descriptor);
        self.registry.mutate(handle, descriptor);
    }
}

/* the seven calls */

impl Volume {
    /// Creates a file or folder at `path`. The parent folder must be
    /// held open by the calling process, and the leaf name must be
    /// unique among its siblings.
    pub fn create(&mut self, ctx: &Ctx, path: &str, kind: DescriptorKind) -> Result<()> {
        debug!("create {path} pid={}", ctx.pid);
        let (parent_path, name) = registry::split_leaf(path)?;
        if name == "." || name == ".." || name.len() >= NAME_LENGTH {
            return Err(FsError::System);
        }

        let parent = self.resolve(ctx, parent_path)?;
        let parent_descriptor = self.entry(parent)?.descriptor.clone();
        if !parent_descriptor.is_folder() {
            return Err(FsError::Access);
        }
        if !self.sessions.has_open(ctx.pid, parent_descriptor.identifier) {
            return Err(FsError::Open);
        }
        if self.registry.lookup_child(parent, name).is_some() {
            return Err(FsError::Duplicate);
        }

        // all blocks this call can possibly claim, checked up front
        let slot = self.fs.find_free_slot(parent_descriptor.content_ref)?;
        let needed = 1
            + (kind == DescriptorKind::Folder) as usize
            + matches!(slot, SlotSearch::Full { .. }) as usize;
        if self.fs.free_blocks() < needed {
            return Err(FsError::Alloc);
        }

        let now = self.now();
        let identifier = self.fs.take_identifier();
        let self_ref = self.fs.alloc_block()?;
        let mut descriptor = Descriptor::new(
            identifier,
            kind,
            name,
            ctx.uid,
            ctx.umask,
            now,
            self_ref,
            parent_descriptor.self_ref,
        );
        if kind == DescriptorKind::Folder {
            descriptor.content_ref = self.fs.new_index_block()?;
        }
        self.fs.write_descriptor(&descriptor);

        match slot {
            SlotSearch::Found { block, slot } => {
                self.fs.map_index_mut(block, |index| index.set(slot, self_ref))?;
            }
            SlotSearch::Full { last } => {
                let fresh = self.fs.new_index_block()?;
                self.fs.map_index_mut(last, |index| index.set_next(fresh))?;
                self.fs.map_index_mut(fresh, |index| index.set(0, self_ref))?;
            }
        }

        let mut parent_descriptor = parent_descriptor;
        parent_descriptor.size += 1;
        parent_descriptor.modified = now;
        self.update_descriptor(parent, parent_descriptor);

        self.registry.insert(descriptor, Some(parent));
        self.fs.sync_all();
        Ok(())
    }

    /// Deletes the entry at `path`, returning every block it held to the
    /// allocator. Open entries and non-empty folders are refused.
    pub fn remove(&mut self, ctx: &Ctx, path: &str) -> Result<()> {
        debug!("remove {path} pid={}", ctx.pid);
        let handle = self.resolve(ctx, path)?;
        if handle == self.root {
            return Err(FsError::Access);
        }
        let entry = self.entry(handle)?;
        if entry.ref_count > 0 {
            return Err(FsError::InUse);
        }
        let descriptor = entry.descriptor.clone();
        let parent = entry.parent.ok_or(FsError::System)?;
        if descriptor.is_folder() && descriptor.size > 0 {
            return Err(FsError::NotEmpty);
        }
        if !descriptor.grants(ctx.uid, AccessFlag::Write.into()) {
            return Err(FsError::Access);
        }

        if descriptor.content_ref != NULL_REF {
            let (payload, indexes) = self.fs.collect_chain(descriptor.content_ref)?;
            for block in payload.into_iter().chain(indexes) {
                self.fs.free_block(block);
            }
        }
        self.fs.free_block(descriptor.self_ref);

        let mut parent_descriptor = self.entry(parent)?.descriptor.clone();
        self.clear_parent_slot(parent_descriptor.content_ref, descriptor.self_ref)?;
        parent_descriptor.size = parent_descriptor.size.saturating_sub(1);
        parent_descriptor.modified = self.now();
        self.update_descriptor(parent, parent_descriptor);

        self.registry.remove(handle)?;
        self.fs.sync_all();
        Ok(())
    }

    /// Opens `path` with the requested access. One opener per entry
    /// volume-wide; the grant must be within what the rights mask allows
    /// the caller.
    pub fn open(&mut self, ctx: &Ctx, path: &str, access: BitFlags<AccessFlag>) -> Result<Handle> {
        debug!("open {path} pid={} access={access:?}", ctx.pid);
        let handle = self.resolve(ctx, path)?;
        if self.sessions.is_open_by_any(handle.identifier()) {
            return Err(FsError::Open);
        }
        let entry = self.entry(handle)?;
        if !entry.descriptor.grants(ctx.uid, access) {
            return Err(FsError::Access);
        }

        self.registry.acquire(handle);
        self.sessions.open_file(
            ctx.pid,
            OpenFile {
                handle,
                granted: access,
            },
        );
        Ok(handle)
    }

    /// Closes a handle previously returned to this process by `open`.
    pub fn close(&mut self, ctx: &Ctx, handle: Handle) -> Result<()> {
        debug!("close pid={}", ctx.pid);
        let open = self.sessions.close_file(ctx.pid, handle)?;
        self.registry.release(open.handle);
        Ok(())
    }

    /// Descriptor copy for `path`, straight from the registry.
    pub fn stat(&self, ctx: &Ctx, path: &str) -> Result<Descriptor> {
        let handle = self.resolve(ctx, path)?;
        Ok(self.entry(handle)?.descriptor.clone())
    }

    /// Replaces the whole content of an open file, copy-on-write: the
    /// new chain is built and made durable next to the old one, the
    /// descriptor swap is the single durability pivot, and only then is
    /// the old chain returned to the allocator. A failure before the
    /// swap leaves the previous content fully intact.
    pub fn write(&mut self, ctx: &Ctx, handle: Handle, bytes: &[u8]) -> Result<()> {
        debug!("write {} bytes pid={}", bytes.len(), ctx.pid);
        let open = *self
            .sessions
            .find_open(ctx.pid, handle)
            .ok_or(FsError::Access)?;
        if !open.granted.contains(AccessFlag::Write) {
            return Err(FsError::Access);
        }
        let descriptor = self.entry(handle)?.descriptor.clone();
        if descriptor.is_folder() {
            return Err(FsError::Access);
        }

        let data_blocks = bytes.len().div_ceil(PAYLOAD_SIZE);
        let index_blocks = if data_blocks == 0 {
            0
        } else {
            data_blocks.div_ceil(INDEX_PAYLOAD_SLOTS)
        };
        if self.fs.free_blocks() < data_blocks + index_blocks {
            return Err(FsError::Alloc);
        }

        let mut data_refs = Vec::with_capacity(data_blocks);
        for chunk in bytes.chunks(PAYLOAD_SIZE) {
            data_refs.push(self.fs.write_data_block(chunk)?);
        }
        let head = self.fs.build_chain(&data_refs)?;
        self.fs.sync_all(); // new content durable before the swap

        let old_head = descriptor.content_ref;
        let now = self.now();
        let mut descriptor = descriptor;
        descriptor.content_ref = head;
        descriptor.size = bytes.len() as u64;
        descriptor.modified = now;
        descriptor.accessed = now;
        self.update_descriptor(handle, descriptor);
        self.fs.sync_all(); // the swap itself

        if old_head != NULL_REF {
            let (payload, indexes) = self
                .fs
                .collect_chain(old_head)
                .map_err(|_| FsError::Write)?;
            for block in payload.into_iter().chain(indexes) {
                self.fs.free_block(block);
            }
        }
        self.fs.sync_all();
        Ok(())
    }

    /// The whole content of an open file, data blocks concatenated in
    /// chain order.
    pub fn read(&mut self, ctx: &Ctx, handle: Handle) -> Result<Vec<u8>> {
        debug!("read pid={}", ctx.pid);
        let open = *self
            .sessions
            .find_open(ctx.pid, handle)
            .ok_or(FsError::Access)?;
        if !open.granted.contains(AccessFlag::Read) {
            return Err(FsError::Access);
        }
        let descriptor = self.entry(handle)?.descriptor.clone();
        if descriptor.is_folder() {
            return Err(FsError::Access);
        }

        let mut out = Vec::with_capacity(descriptor.size as usize);
        let mut remaining = descriptor.size as usize;
        if descriptor.content_ref != NULL_REF {
            for block in self.fs.chain_refs(descriptor.content_ref) {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(PAYLOAD_SIZE);
                let block = block.map_err(|_| FsError::Read)?;
                self.fs.read_data_block(block, take, &mut out)?;
                remaining -= take;
            }
        }
        if remaining > 0 {
            return Err(FsError::Read);
        }

        let mut descriptor = descriptor;
        descriptor.accessed = self.now();
        self.update_descriptor(handle, descriptor);
        self.fs.sync_all();
        Ok(out)
    }

    /// Repoints the caller's current directory.
    pub fn change_dir(&mut self, ctx: &Ctx, path: &str) -> Result<()> {
        let handle = self.resolve(ctx, path)?;
        if !self.entry(handle)?.descriptor.is_folder() {
            return Err(FsError::Access);
        }
        self.sessions.set_cwd(ctx.pid, handle);
        Ok(())
    }
}

impl Volume {
    fn clear_parent_slot(&self, head: BlockRef, child: BlockRef) -> Result<()> {
        let mut current = head;
        let mut seen = 0;
        while current != NULL_REF {
            seen += 1;
            if seen > self.fs.total_blocks() {
                return Err(FsError::System);
            }
            let (found, next) =
                self.fs
                    .map_index(current, |index| (index.position_of(child), index.next()))?;
            if let Some(slot) = found {
                self.fs.map_index_mut(current, |index| index.clear(slot))?;
                return Ok(());
            }
            current = next.unwrap_or(NULL_REF);
        }
        Err(FsError::System)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ram_volume, FixedClock, CTX};
    use std::sync::Arc;

    fn mounted(blocks: usize) -> Volume {
        let (device, clock) = ram_volume(blocks);
        Volume::format(device.clone(), &clock, &CTX, blocks).unwrap();
        Volume::mount(device, Arc::new(FixedClock(clock.0))).unwrap()
    }

    fn rw() -> BitFlags<AccessFlag> {
        AccessFlag::Read | AccessFlag::Write
    }

    #[test]
    fn create_requires_the_parent_to_be_open() {
        let mut vol = mounted(128);
        assert_eq!(
            vol.create(&CTX, "/a", DescriptorKind::File),
            Err(FsError::Open)
        );
        let root = vol.open(&CTX, "/", rw()).unwrap();
        vol.create(&CTX, "/a", DescriptorKind::File).unwrap();
        assert_eq!(vol.stat(&CTX, "/").unwrap().size, 1);
        vol.close(&CTX, root).unwrap();
    }

    #[test]
    fn sibling_names_must_be_unique() {
        let mut vol = mounted(128);
        vol.open(&CTX, "/", rw()).unwrap();
        vol.create(&CTX, "/a", DescriptorKind::Folder).unwrap();
        assert_eq!(
            vol.create(&CTX, "/a", DescriptorKind::File),
            Err(FsError::Duplicate)
        );
        // the same leaf under another folder is fine
        let a = vol.open(&CTX, "/a", rw()).unwrap();
        vol.create(&CTX, "/a/a", DescriptorKind::File).unwrap();
        vol.close(&CTX, a).unwrap();
    }

    #[test]
    fn identifiers_are_never_shared() {
        let mut vol = mounted(256);
        vol.open(&CTX, "/", rw()).unwrap();
        let mut seen = std::collections::BTreeSet::new();
        assert!(seen.insert(vol.stat(&CTX, "/").unwrap().identifier));
        for i in 0..10 {
            let path = format!("/f{i}");
            vol.create(&CTX, &path, DescriptorKind::File).unwrap();
            assert!(seen.insert(vol.stat(&CTX, &path).unwrap().identifier));
        }
        assert_eq!(vol.stat(&CTX, "/").unwrap().identifier, 0);
    }

    #[test]
    fn create_then_delete_restores_free_space() {
        let mut vol = mounted(128);
        vol.open(&CTX, "/", rw()).unwrap();
        let before = vol.free_blocks();
        vol.create(&CTX, "/tmp", DescriptorKind::Folder).unwrap();
        assert_eq!(vol.free_blocks(), before - 2);
        vol.remove(&CTX, "/tmp").unwrap();
        assert_eq!(vol.free_blocks(), before);
        assert_eq!(vol.stat(&CTX, "/").unwrap().size, 0);
        assert_eq!(vol.stat(&CTX, "/tmp"), Err(FsError::NotFound));
    }

    #[test]
    fn open_entries_cannot_be_deleted() {
        let mut vol = mounted(128);
        vol.open(&CTX, "/", rw()).unwrap();
        vol.create(&CTX, "/f", DescriptorKind::File).unwrap();
        let f = vol.open(&CTX, "/f", rw()).unwrap();
        assert_eq!(vol.remove(&CTX, "/f"), Err(FsError::InUse));
        vol.close(&CTX, f).unwrap();
        vol.remove(&CTX, "/f").unwrap();
    }

    #[test]
    fn folders_with_children_cannot_be_deleted() {
        let mut vol = mounted(128);
        vol.open(&CTX, "/", rw()).unwrap();
        vol.create(&CTX, "/d", DescriptorKind::Folder).unwrap();
        let d = vol.open(&CTX, "/d", rw()).unwrap();
        vol.create(&CTX, "/d/x", DescriptorKind::File).unwrap();
        vol.close(&CTX, d).unwrap();
        assert_eq!(vol.remove(&CTX, "/d"), Err(FsError::NotEmpty));
        vol.remove(&CTX, "/d/x").unwrap();
        vol.remove(&CTX, "/d").unwrap();
    }

    #[test]
    fn single_opener_policy() {
        let mut vol = mounted(128);
        vol.open(&CTX, "/", rw()).unwrap();
        vol.create(&CTX, "/f", DescriptorKind::File).unwrap();
        vol.open(&CTX, "/f", rw()).unwrap();

        let other = Ctx { pid: 2, ..CTX };
        assert_eq!(vol.open(&other, "/f", rw()), Err(FsError::Open));
        // a second grab by the same process is refused as well
        assert_eq!(vol.open(&CTX, "/f", rw()), Err(FsError::Open));
    }

    #[test]
    fn access_is_checked_against_owner_and_mask() {
        let mut vol = mounted(128);
        vol.open(&CTX, "/", rw()).unwrap();
        // CTX carries umask 0o022: others lose write
        vol.create(&CTX, "/f", DescriptorKind::File).unwrap();

        let stranger = Ctx { uid: 999, pid: 3, ..CTX };
        assert_eq!(vol.open(&stranger, "/f", rw()), Err(FsError::Access));
        let h = vol.open(&stranger, "/f", AccessFlag::Read.into()).unwrap();
        assert_eq!(vol.write(&stranger, h, b"no"), Err(FsError::Access));
        vol.close(&stranger, h).unwrap();
    }

    #[test]
    fn write_then_read_round_trips_across_blocks() {
        let mut vol = mounted(256);
        vol.open(&CTX, "/", rw()).unwrap();
        vol.create(&CTX, "/blob", DescriptorKind::File).unwrap();
        let h = vol.open(&CTX, "/blob", rw()).unwrap();

        let content: Vec<u8> = (0..500u16).map(|i| i as u8).collect();
        vol.write(&CTX, h, &content).unwrap();
        let stat = vol.stat(&CTX, "/blob").unwrap();
        assert_eq!(stat.size, 500);
        assert_eq!(vol.read(&CTX, h).unwrap(), content);

        // rewriting replaces, never appends
        vol.write(&CTX, h, b"short").unwrap();
        assert_eq!(vol.read(&CTX, h).unwrap(), b"short");
        vol.write(&CTX, h, b"").unwrap();
        assert_eq!(vol.read(&CTX, h).unwrap(), b"");
        vol.close(&CTX, h).unwrap();
    }

    #[test]
    fn rewriting_does_not_leak_blocks() {
        let mut vol = mounted(256);
        vol.open(&CTX, "/", rw()).unwrap();
        vol.create(&CTX, "/f", DescriptorKind::File).unwrap();
        let h = vol.open(&CTX, "/f", rw()).unwrap();

        vol.write(&CTX, h, &[7u8; 1000]).unwrap();
        let occupied = vol.free_blocks();
        vol.write(&CTX, h, &[9u8; 1000]).unwrap();
        assert_eq!(vol.free_blocks(), occupied);
        vol.write(&CTX, h, b"").unwrap();
        vol.close(&CTX, h).unwrap();
    }

    #[test]
    fn oversized_write_fails_fast_and_keeps_old_content() {
        let mut vol = mounted(64);
        vol.open(&CTX, "/", rw()).unwrap();
        vol.create(&CTX, "/f", DescriptorKind::File).unwrap();
        let h = vol.open(&CTX, "/f", rw()).unwrap();
        vol.write(&CTX, h, b"keep me").unwrap();

        let free = vol.free_blocks();
        let huge = vec![0u8; (free + 1) * PAYLOAD_SIZE];
        assert_eq!(vol.write(&CTX, h, &huge), Err(FsError::Alloc));
        assert_eq!(vol.free_blocks(), free);
        assert_eq!(vol.read(&CTX, h).unwrap(), b"keep me");
    }

    #[test]
    fn folder_fanout_grows_past_one_index_block() {
        let mut vol = mounted(2048);
        vol.open(&CTX, "/", rw()).unwrap();
        let count = INDEX_PAYLOAD_SLOTS + 5;
        for i in 0..count {
            vol.create(&CTX, &format!("/n{i}"), DescriptorKind::File)
                .unwrap();
        }
        assert_eq!(vol.stat(&CTX, "/").unwrap().size, count as u64);
        for i in 0..count {
            assert!(vol.stat(&CTX, &format!("/n{i}")).is_ok());
        }
        // shrink back below the boundary
        for i in 0..count {
            vol.remove(&CTX, &format!("/n{i}")).unwrap();
        }
        assert_eq!(vol.stat(&CTX, "/").unwrap().size, 0);
    }

    #[test]
    fn relative_paths_follow_the_current_directory() {
        let mut vol = mounted(128);
        vol.open(&CTX, "/", rw()).unwrap();
        vol.create(&CTX, "/d", DescriptorKind::Folder).unwrap();
        vol.change_dir(&CTX, "/d").unwrap();
        let d = vol.open(&CTX, ".", rw()).unwrap();
        vol.create(&CTX, "x", DescriptorKind::File).unwrap();
        assert!(vol.stat(&CTX, "/d/x").is_ok());
        assert!(vol.stat(&CTX, "x").is_ok());
        assert_eq!(vol.stat(&CTX, "../d/x").unwrap().identifier,
                   vol.stat(&CTX, "x").unwrap().identifier);
        vol.close(&CTX, d).unwrap();
    }

    #[test]
    fn reads_and_writes_on_folders_are_refused() {
        let mut vol = mounted(128);
        let root = vol.open(&CTX, "/", rw()).unwrap();
        assert_eq!(vol.write(&CTX, root, b"x"), Err(FsError::Access));
        assert_eq!(vol.read(&CTX, root), Err(FsError::Access));
    }

    #[test]
    fn timestamps_move_with_operations() {
        let (device, clock) = ram_volume(128);
        Volume::format(device.clone(), &clock, &CTX, 128).unwrap();
        let mut vol = Volume::mount(device, Arc::new(FixedClock(2_000_000))).unwrap();

        vol.open(&CTX, "/", rw()).unwrap();
        vol.create(&CTX, "/f", DescriptorKind::File).unwrap();
        let created = vol.stat(&CTX, "/f").unwrap();
        assert_eq!(created.created, 2_000_000);
        assert_eq!(vol.stat(&CTX, "/").unwrap().modified, 2_000_000);
    }
}
