#![cfg_attr(not(test), no_std)]

extern crate alloc;

/* mica-fs layers, bottom to top */

// Block device interface layer: how the volume is read and written.
mod block_dev;
pub use block_dev::BlockDevice;

// Wall clock interface layer: where descriptor timestamps come from.
mod clock;
pub use clock::Clock;

// Block cache layer: in-memory copies of on-disk blocks.
mod block_cache;

// On-disk data structure layer: the tagged block format.
mod layout;
pub use layout::{AccessFlag, Descriptor, DescriptorKind, SuperBlock};

// Occupancy bitvector: one bit per block, mirrored in memory.
mod bitmap;

// Registry cache: every descriptor of the volume, hashed by name.
mod registry;
pub use registry::Handle;

// Session state: caller identity and per-process open files.
mod session;
pub use session::Ctx;

// Disk manager layer: geometry, format, block allocation.
mod mfs;
pub use mfs::MicaFileSystem;

// Operation engine layer: the filesystem calls served to the driver.
mod vfs;
pub use vfs::Volume;

mod error;
pub use error::{FsError, Result};

#[cfg(test)]
pub(crate) mod testing;

pub const MAGIC: u32 = 0x4d49_4341;
pub const BLOCK_SIZE: usize = 256;

/// Bytes reserved at the head of every content block for the tag.
/// Sized so the payload behind it stays 8-aligned.
pub const TAG_BYTES: usize = 8;
pub const PAYLOAD_SIZE: usize = BLOCK_SIZE - TAG_BYTES;

pub const NAME_LENGTH: usize = 128;

/// Block references are two bytes wide on disk.
pub type BlockRef = u16;

/// Reserved sentinel, one past the largest permissible block index.
pub const NULL_REF: BlockRef = BlockRef::MAX;
pub const MAX_BLOCKS: usize = NULL_REF as usize;

type RawBlock = [u8; BLOCK_SIZE];
