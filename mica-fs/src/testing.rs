//! Test doubles shared by the unit tests: a memory-backed block device
//! and a clock that stands still.

use std::sync::{Arc, Mutex};

use crate::{BlockDevice, Clock, Ctx, BLOCK_SIZE};

pub(crate) struct RamDisk {
    data: Mutex<Vec<u8>>,
    blocks: usize,
}

impl RamDisk {
    pub(crate) fn new(blocks: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; blocks * BLOCK_SIZE]),
            blocks,
        }
    }
}

impl BlockDevice for RamDisk {
    fn num_blocks(&self) -> usize {
        self.blocks
    }

    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert!(block_id < self.blocks, "read past end of ram disk");
        let data = self.data.lock().unwrap();
        buf.copy_from_slice(&data[block_id * BLOCK_SIZE..(block_id + 1) * BLOCK_SIZE]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert!(block_id < self.blocks, "write past end of ram disk");
        let mut data = self.data.lock().unwrap();
        data[block_id * BLOCK_SIZE..(block_id + 1) * BLOCK_SIZE].copy_from_slice(buf);
    }
}

pub(crate) struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0
    }
}

pub(crate) const CTX: Ctx = Ctx {
    uid: 100,
    gid: 100,
    pid: 1,
    umask: 0o022,
};

pub(crate) fn ram_volume(blocks: usize) -> (Arc<RamDisk>, FixedClock) {
    (Arc::new(RamDisk::new(blocks)), FixedClock(1_000_000))
}
