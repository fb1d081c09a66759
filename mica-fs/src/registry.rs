//! # Registry cache
//!
//! In-memory mirror of every descriptor in the volume, built by a full
//! traversal at mount and kept write-through afterwards: any operation
//! that persists a descriptor updates the matching row in the same
//! transaction.
//!
//! Rows are hashed by leaf name into a fixed table; colliding names chain
//! in insertion order and are told apart by identifier. Path lookup walks
//! a segment at a time, matching each child by name under its parent.

use alloc::vec::Vec;

use crate::layout::Descriptor;
use crate::{FsError, Result};

/// Buckets in the hash table. Prime, so short names spread decently.
const BUCKETS: usize = 4099;

/// Opaque reference to one registry row, valid for the life of a mount.
/// Numeric contents are not stable across mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    bucket: u32,
    identifier: u64,
}

impl Handle {
    /// Identifier of the descriptor this handle resolves to.
    #[inline]
    pub fn identifier(&self) -> u64 {
        self.identifier
    }
}

/// One cached descriptor.
pub struct Entry {
    pub descriptor: Descriptor,
    /// Registry row of the owning folder; `None` only for the root.
    pub parent: Option<Handle>,
    /// Open references; a row with holders cannot be deleted.
    pub ref_count: u32,
}

pub struct Registry {
    buckets: Vec<Vec<Entry>>,
}

/// djb2 with xor, reduced to a bucket index.
fn hash(name: &str) -> usize {
    let mut h: u64 = 5381;
    for &c in name.as_bytes() {
        h = (h << 5).wrapping_add(h) ^ c as u64;
    }
    (h % BUCKETS as u64) as usize
}

impl Registry {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKETS);
        buckets.resize_with(BUCKETS, Vec::new);
        Self { buckets }
    }

    pub fn insert(&mut self, descriptor: Descriptor, parent: Option<Handle>) -> Handle {
        let bucket = hash(descriptor.name());
        let handle = Handle {
            bucket: bucket as u32,
            identifier: descriptor.identifier,
        };
        self.buckets[bucket].push(Entry {
            descriptor,
            parent,
            ref_count: 0,
        });
        handle
    }

    pub fn get(&self, handle: Handle) -> Option<&Entry> {
        self.buckets[handle.bucket as usize]
            .iter()
            .find(|e| e.descriptor.identifier == handle.identifier)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        self.buckets[handle.bucket as usize]
            .iter_mut()
            .find(|e| e.descriptor.identifier == handle.identifier)
    }

    pub fn remove(&mut self, handle: Handle) -> Result<()> {
        let bucket = &mut self.buckets[handle.bucket as usize];
        let at = bucket
            .iter()
            .position(|e| e.descriptor.identifier == handle.identifier)
            .ok_or(FsError::NotFound)?;
        bucket.remove(at);
        Ok(())
    }

    /// Write-through update after the on-disk descriptor changed. Renames
    /// do not come through here; the name must hash to the same bucket.
    pub fn mutate(&mut self, handle: Handle, descriptor: Descriptor) {
        debug_assert_eq!(hash(descriptor.name()), handle.bucket as usize);
        if let Some(entry) = self.get_mut(handle) {
            entry.descriptor = descriptor;
        }
    }

    pub fn acquire(&mut self, handle: Handle) {
        if let Some(entry) = self.get_mut(handle) {
            entry.ref_count += 1;
        }
    }

    pub fn release(&mut self, handle: Handle) {
        if let Some(entry) = self.get_mut(handle) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    /// Child of `parent` named `name`: one hash of the leaf, then a scan
    /// of the chain with parenthood as the tie-breaker.
    pub fn lookup_child(&self, parent: Handle, name: &str) -> Option<Handle> {
        let bucket = hash(name);
        self.buckets[bucket]
            .iter()
            .find(|e| e.parent == Some(parent) && e.descriptor.name() == name)
            .map(|e| Handle {
                bucket: bucket as u32,
                identifier: e.descriptor.identifier,
            })
    }

    /// Resolve `path` segment by segment. Absolute paths start at `root`,
    /// anything else at `cwd`.
    pub fn lookup_path(&self, root: Handle, cwd: Handle, path: &str) -> Result<Handle> {
        let mut current = if path.starts_with('/') { root } else { cwd };
        for segment in segments(path) {
            current = match segment {
                "." => current,
                ".." => self
                    .get(current)
                    .ok_or(FsError::NotFound)?
                    .parent
                    .unwrap_or(current),
                name => self.lookup_child(current, name).ok_or(FsError::NotFound)?,
            };
        }
        Ok(current)
    }
}

pub fn segments(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Splits a path into its parent and leaf name.
pub fn split_leaf(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let leaf = segments(trimmed).next_back().ok_or(FsError::NotFound)?;
    let parent = &trimmed[..trimmed.len() - leaf.len()];
    let parent = if parent.is_empty() { "." } else { parent };
    Ok((parent, leaf))
}
