use enumflags2::{bitflags, BitFlags};
use static_assertions::const_assert;

use super::BlockTag;
use crate::{BlockRef, NAME_LENGTH, NULL_REF, PAYLOAD_SIZE};

/// One permission bit. A rights mask is two rwx triads packed in the
/// descriptor's `mode` word: bits 5..3 apply to the owner, bits 2..0 to
/// everyone else.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFlag {
    Read = 0b100,
    Write = 0b010,
    Exec = 0b001,
}

const TRIAD: u16 = 0b111;

/// What a descriptor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Folder,
    File,
}

impl DescriptorKind {
    #[inline]
    pub fn tag(self) -> BlockTag {
        match self {
            DescriptorKind::Folder => BlockTag::Folder,
            DescriptorKind::File => BlockTag::File,
        }
    }
}

/// Metadata record for one folder or file, payload of a `Folder` or
/// `File` block.
///
/// For files `size` counts content bytes and `content_ref` points at the
/// head index block of the data chain (`NULL_REF` while empty). For
/// folders `size` counts children and `content_ref` points at the folder's
/// index block, which exists from creation on.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct Descriptor {
    /// Globally unique, assigned once, never reused.
    pub identifier: u64,
    pub created: u64,
    pub accessed: u64,
    pub modified: u64,
    pub size: u64,
    name: [u8; NAME_LENGTH],
    pub owner: u32,
    mode: u16,
    kind: u16,
    pub content_ref: BlockRef,
    /// Descriptor block of the owning folder; the root points at itself.
    pub parent_ref: BlockRef,
    /// This descriptor's own block, for back-navigation.
    pub self_ref: BlockRef,
}

const_assert!(core::mem::size_of::<Descriptor>() <= PAYLOAD_SIZE);

impl Descriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identifier: u64,
        kind: DescriptorKind,
        name: &str,
        owner: u32,
        umask: u16,
        now: u64,
        self_ref: BlockRef,
        parent_ref: BlockRef,
    ) -> Self {
        let bytes = name.as_bytes();
        debug_assert!(bytes.len() < NAME_LENGTH);
        let mut buf = [0; NAME_LENGTH];
        buf[..bytes.len()].copy_from_slice(bytes);

        Self {
            identifier,
            created: now,
            accessed: now,
            modified: now,
            size: 0,
            name: buf,
            owner,
            mode: mode_from_umask(kind, umask),
            kind: kind.tag() as u16,
            content_ref: NULL_REF,
            parent_ref,
            self_ref,
        }
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(NAME_LENGTH);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    #[inline]
    pub fn kind(&self) -> DescriptorKind {
        match BlockTag::from_raw(self.kind) {
            Ok(BlockTag::Folder) => DescriptorKind::Folder,
            _ => DescriptorKind::File,
        }
    }

    #[inline]
    pub fn is_folder(&self) -> bool {
        self.kind == BlockTag::Folder as u16
    }

    /// Whether `uid` may access this entry with every flag in `want`.
    /// The owner triad applies iff `uid` matches the owner.
    pub fn grants(&self, uid: u32, want: BitFlags<AccessFlag>) -> bool {
        let triad = if uid == self.owner {
            self.mode >> 3
        } else {
            self.mode
        };
        BitFlags::from_bits_truncate((triad & TRIAD) as u8).contains(want)
    }

    #[inline]
    pub fn mode(&self) -> u16 {
        self.mode
    }
}

/// Rights granted to a fresh entry: everything the kind supports, minus
/// whatever the caller's umask withholds. Only the user and other classes
/// of a POSIX-shaped umask are honored.
fn mode_from_umask(kind: DescriptorKind, umask: u16) -> u16 {
    let full: u16 = match kind {
        DescriptorKind::Folder => 0b111_111,
        DescriptorKind::File => 0b110_110,
    };
    let withheld = (((umask >> 6) & TRIAD) << 3) | (umask & TRIAD);
    full & !withheld
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        let d = Descriptor::new(7, DescriptorKind::File, "notes.txt", 100, 0, 5, 9, 3);
        assert_eq!(d.name(), "notes.txt");
        assert_eq!(d.identifier, 7);
        assert_eq!(d.self_ref, 9);
        assert_eq!(d.parent_ref, 3);
        assert_eq!(d.content_ref, NULL_REF);
    }

    #[test]
    fn owner_and_other_triads() {
        // umask 0o022 withholds write from the other class
        let d = Descriptor::new(0, DescriptorKind::File, "f", 100, 0o022, 0, 1, 0);
        assert!(d.grants(100, AccessFlag::Read | AccessFlag::Write));
        assert!(d.grants(200, AccessFlag::Read.into()));
        assert!(!d.grants(200, AccessFlag::Write.into()));
    }

    #[test]
    fn mode_superset_is_refused() {
        let d = Descriptor::new(0, DescriptorKind::File, "f", 100, 0o200, 0, 1, 0);
        // owner lost write through the umask
        assert!(!d.grants(100, AccessFlag::Write.into()));
        assert!(d.grants(100, AccessFlag::Read.into()));
    }

    #[test]
    fn exec_never_granted_to_files() {
        let d = Descriptor::new(0, DescriptorKind::File, "f", 100, 0, 0, 1, 0);
        assert!(!d.grants(100, AccessFlag::Exec.into()));
        let d = Descriptor::new(0, DescriptorKind::Folder, "d", 100, 0, 0, 1, 0);
        assert!(d.grants(100, AccessFlag::Exec.into()));
    }
}
