//! The file system: superblock, write-ahead log, inodes and path
//! resolution, layered over the block cache.

pub mod inode;
pub mod log;
pub mod path;
pub mod superblock;

pub use inode::{Dirent, Inode, InodeEntry, InodeGuard, InodeTree, InodeType, RcInode};
pub use log::{Log, Op};
pub use path::FileName;
pub use superblock::SuperBlock;

use zerocopy::{AsBytes, FromBytes};

/// File metadata returned by the stat family.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct Stat {
    pub dev: u32,
    pub ino: u32,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
}

impl Stat {
    pub const S_IFREG: u32 = 0x8000;
    pub const S_IFDIR: u32 = 0x4000;
}

/// Formats a fresh file system and wires the stack over an in-memory
/// disk, for host tests.
#[cfg(test)]
pub(crate) mod testing {
    use zerocopy::AsBytes;

    use super::inode::{Dirent, InodeEntry, InodeTree, InodeType, DIRENT_SIZE, INODE_PER_BLOCK};
    use super::log::Log;
    use super::path::FileName;
    use super::superblock::SuperBlock;
    use crate::bio::testing::MemDisk;
    use crate::bio::{AlignedBlock, Bcache};
    use crate::param::{LOG_MAX_SIZE, ROOT_INODE_NO};

    pub struct FsFixture {
        pub disk: &'static MemDisk,
        pub sb: &'static SuperBlock,
        pub cache: &'static Bcache,
        pub log: &'static Log,
        pub itable: &'static InodeTree,
    }

    /// Lays out `[sb | inodes | log | bitmap | data]` with a root
    /// directory containing "." and "..".
    pub fn mkfs(disk: &MemDisk, num_blocks: u32, num_inodes: u32) -> SuperBlock {
        let inode_blocks = (num_inodes + INODE_PER_BLOCK as u32 - 1) / INODE_PER_BLOCK as u32;
        let inode_start = 1;
        let log_start = inode_start + inode_blocks;
        let bitmap_start = log_start + 1 + LOG_MAX_SIZE as u32;
        let sb = SuperBlock {
            num_blocks,
            num_inodes,
            inode_start,
            log_start,
            bitmap_start,
        };

        let mut buf = AlignedBlock::zeroed();
        buf.0[..core::mem::size_of::<SuperBlock>()].copy_from_slice(sb.as_bytes());
        disk.write_raw(0, &buf.0);

        // Root inode.
        let root_data = bitmap_start + sb.num_bitmap_blocks();
        let mut root = InodeEntry::zeroed();
        root.set_typ(InodeType::Directory);
        root.num_links = 2;
        root.num_bytes = (2 * DIRENT_SIZE) as u32;
        root.addrs[0] = root_data;

        let mut buf = AlignedBlock::zeroed();
        let slot = ROOT_INODE_NO as usize % INODE_PER_BLOCK;
        let entry_size = core::mem::size_of::<InodeEntry>();
        buf.0[slot * entry_size..(slot + 1) * entry_size].copy_from_slice(root.as_bytes());
        disk.write_raw(inode_start + ROOT_INODE_NO / INODE_PER_BLOCK as u32, &buf.0);

        // "." and "..".
        let mut buf = AlignedBlock::zeroed();
        let dot = Dirent::new(ROOT_INODE_NO as u16, &FileName::new(b"."));
        let dotdot = Dirent::new(ROOT_INODE_NO as u16, &FileName::new(b".."));
        buf.0[..DIRENT_SIZE].copy_from_slice(dot.as_bytes());
        buf.0[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(dotdot.as_bytes());
        disk.write_raw(root_data, &buf.0);

        // Mark every metadata block plus the root's data block used.
        let mut buf = AlignedBlock::zeroed();
        for bno in 0..=root_data {
            buf.0[(bno / 8) as usize] |= 1 << (bno % 8);
        }
        disk.write_raw(bitmap_start, &buf.0);

        sb
    }

    pub fn fresh_fs() -> FsFixture {
        let disk = MemDisk::leak(1024);
        let sb: &'static SuperBlock = Box::leak(Box::new(mkfs(disk, 1024, 128)));
        let cache: &'static Bcache = Box::leak(Box::new(Bcache::new(disk)));
        let log: &'static Log = Box::leak(Box::new(Log::new(sb, cache)));
        let itable: &'static InodeTree = Box::leak(Box::new(InodeTree::new(sb, cache, log)));
        FsFixture {
            disk,
            sb,
            cache,
            log,
            itable,
        }
    }
}
