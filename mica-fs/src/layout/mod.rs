//! # On-disk data structure layer
//!
//! Linear layout of a volume:
//! occupancy bitvector | superblock | root descriptor | root index | storage
//!
//! Every storage block is a tagged union: a two-byte tag at offset 0
//! selects the interpretation of the payload that starts at
//! [`TAG_BYTES`](crate::TAG_BYTES). Exactly one interpretation is valid
//! per tag, and the tag is validated on every read.

mod super_block;
pub use super_block::SuperBlock;

mod descriptor;
pub use descriptor::{AccessFlag, Descriptor, DescriptorKind};

mod index;
pub use index::{IndexBlock, INDEX_PAYLOAD_SLOTS, INDEX_SLOTS};

use crate::{FsError, Result};

/// Discriminant of the block union.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Folder = 0,
    File = 1,
    Index = 2,
    Data = 3,
    Invalid = 4,
}

impl BlockTag {
    pub fn from_raw(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(BlockTag::Folder),
            1 => Ok(BlockTag::File),
            2 => Ok(BlockTag::Index),
            3 => Ok(BlockTag::Data),
            4 => Ok(BlockTag::Invalid),
            _ => Err(FsError::System),
        }
    }
}
