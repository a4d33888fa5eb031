//! On-disk superblock.
//!
//! Disk layout:
//! `[ superblock | inode blocks | log header | log area | bitmap | data ]`
//!
//! Block 0 holds the superblock; its start fields are authoritative for
//! everything behind it.

use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::bio::{AlignedBlock, BlockDevice};
use crate::param::BLOCK_SIZE;

/// Bits covered by one bitmap block.
pub const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct SuperBlock {
    /// Total blocks on the device, including metadata.
    pub num_blocks: u32,

    /// Number of on-disk inode slots.
    pub num_inodes: u32,

    /// First inode block.
    pub inode_start: u32,

    /// Block of the log header; the log area follows it.
    pub log_start: u32,

    /// First bitmap block.
    pub bitmap_start: u32,
}

const_assert!(mem::size_of::<SuperBlock>() <= BLOCK_SIZE);

impl SuperBlock {
    /// Reads the superblock from block 0.
    pub fn load(device: &dyn BlockDevice) -> Self {
        let mut buf = AlignedBlock::zeroed();
        device.read_block(0, &mut buf.0);
        let (sb, _) = LayoutVerified::<_, SuperBlock>::new_from_prefix(&buf.0[..])
            .expect("superblock: short block");
        *sb
    }

    /// The bitmap block covering data block `bno`.
    pub fn bitmap_block(&self, bno: u32) -> u32 {
        self.bitmap_start + bno / BITS_PER_BLOCK
    }

    pub fn num_bitmap_blocks(&self) -> u32 {
        (self.num_blocks + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK
    }
}
