//! Inodes.
//!
//! An inode describes a single unnamed file: type, link count, size, and
//! the block map of its contents. On-disk inodes sit in a fixed array of
//! blocks starting at `SuperBlock::inode_start`; an inode's number is its
//! index there.
//!
//! The in-memory inode table gives every on-disk inode at most one
//! resident copy and a place to synchronize on. Each entry carries
//!
//! * `rc` — how many logical references exist (open files, working
//!   directories, sections). `get` and `Clone` raise it, `put` drops it.
//!   An unlinked inode is freed on disk when its last reference is put.
//! * `valid` — whether `entry` mirrors the disk. The first lock after
//!   `valid` goes false reads it in.
//! * a sleep lock guarding `entry` and all disk I/O for the inode.
//!
//! The typical sequence is `get` for a long-lived reference, then `lock`
//! around each short examine/modify burst.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp;
use core::mem;
use core::sync::atomic::{AtomicIsize, Ordering};

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use super::log::{Log, Op};
use super::path::FileName;
use super::superblock::SuperBlock;
use super::Stat;
use crate::bio::Bcache;
use crate::lock::{SleepLock, SpinLock};
use crate::param::{
    BLOCK_SIZE, INODE_MAX_BLOCKS, INODE_MAX_BYTES, INODE_NUM_DIRECT, NAME_MAX, ROOT_INODE_NO,
};

pub const INODE_PER_BLOCK: usize = BLOCK_SIZE / mem::size_of::<InodeEntry>();

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Invalid,
    Regular,
    Directory,
    Device,
}

/// On-disk inode. `addrs` holds the direct block numbers; `indirect`
/// points at a block of further `u32` block numbers. Zero means
/// unallocated.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct InodeEntry {
    typ: u16,
    pub major: u16,
    pub minor: u16,
    pub num_links: u16,
    pub num_bytes: u32,
    pub addrs: [u32; INODE_NUM_DIRECT],
    pub indirect: u32,
}

const_assert!(mem::size_of::<InodeEntry>() == 64);
const_assert!(BLOCK_SIZE % mem::size_of::<InodeEntry>() == 0);

impl InodeEntry {
    pub const fn zeroed() -> Self {
        Self {
            typ: 0,
            major: 0,
            minor: 0,
            num_links: 0,
            num_bytes: 0,
            addrs: [0; INODE_NUM_DIRECT],
            indirect: 0,
        }
    }

    pub fn typ(&self) -> InodeType {
        match self.typ {
            1 => InodeType::Regular,
            2 => InodeType::Directory,
            3 => InodeType::Device,
            _ => InodeType::Invalid,
        }
    }

    pub fn set_typ(&mut self, typ: InodeType) {
        self.typ = match typ {
            InodeType::Invalid => 0,
            InodeType::Regular => 1,
            InodeType::Directory => 2,
            InodeType::Device => 3,
        };
    }
}

/// On-disk directory entry. `inode_no == 0` marks a free slot.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct Dirent {
    pub inode_no: u16,
    name: [u8; NAME_MAX],
}

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

const_assert!(DIRENT_SIZE == 16);

impl Dirent {
    pub fn new(inode_no: u16, name: &FileName) -> Self {
        let mut de = Self {
            inode_no,
            name: [0; NAME_MAX],
        };
        de.name[..name.as_bytes().len()].copy_from_slice(name.as_bytes());
        de
    }

    /// The stored name, without trailing NULs.
    pub fn name(&self) -> FileName {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
        FileName::new(&self.name[..len])
    }
}

pub struct Inode {
    pub inode_no: u32,

    /// Logical reference count. The table's `Arc` keeps the memory alive
    /// independently.
    rc: AtomicIsize,

    inner: SleepLock<InodeInner>,
}

struct InodeInner {
    /// Does `entry` mirror the disk?
    valid: bool,
    entry: InodeEntry,
}

impl Inode {
    fn new(inode_no: u32) -> Self {
        Self {
            inode_no,
            rc: AtomicIsize::new(0),
            inner: SleepLock::new(
                "inode",
                InodeInner {
                    valid: false,
                    entry: InodeEntry::zeroed(),
                },
            ),
        }
    }

    pub fn rc(&self) -> isize {
        self.rc.load(Ordering::Acquire)
    }
}

pub struct InodeTree {
    sb: &'static SuperBlock,
    cache: &'static Bcache,
    log: &'static Log,

    /// Resident inodes, most recently referenced first.
    shared: SpinLock<Vec<Arc<Inode>>>,
}

impl InodeTree {
    pub fn new(sb: &'static SuperBlock, cache: &'static Bcache, log: &'static Log) -> Self {
        Self {
            sb,
            cache,
            log,
            shared: SpinLock::new("itable", Vec::new()),
        }
    }

    pub fn log(&self) -> &'static Log {
        self.log
    }

    /// The inode block holding inode `ino`.
    pub fn iblock(&self, ino: u32) -> u32 {
        self.sb.inode_start + ino / INODE_PER_BLOCK as u32
    }

    pub fn root(&'static self) -> RcInode {
        self.get(ROOT_INODE_NO)
    }

    /// Finds or creates the resident copy of inode `ino` and takes a
    /// reference. Never touches the disk.
    pub fn get(&'static self, ino: u32) -> RcInode {
        assert!(ino > 0 && ino < self.sb.num_inodes, "iget: bad inode number");
        let ip = {
            let mut list = self.shared.lock();
            match list.iter().position(|i| i.inode_no == ino) {
                Some(pos) => {
                    let ip = list.remove(pos);
                    list.insert(0, Arc::clone(&ip));
                    ip
                }
                None => {
                    let ip = Arc::new(Inode::new(ino));
                    list.insert(0, Arc::clone(&ip));
                    ip
                }
            }
        };
        ip.rc.fetch_add(1, Ordering::AcqRel);
        RcInode { tree: self, ip }
    }

    /// Allocates an on-disk inode of type `typ`: the first `INVALID` slot
    /// past the root. Fails when the table is full.
    pub fn alloc(&'static self, op: &Op, typ: InodeType) -> Result<u32, ()> {
        assert!(typ != InodeType::Invalid);
        let mut ino = ROOT_INODE_NO + 1;
        while ino < self.sb.num_inodes {
            let bno = self.iblock(ino);
            let mut buf = self.cache.acquire(bno)?;
            let mut found = None;
            while ino < self.sb.num_inodes && self.iblock(ino) == bno {
                let slot = ino as usize % INODE_PER_BLOCK;
                if entries(buf.data())[slot].typ() == InodeType::Invalid {
                    found = Some(slot);
                    break;
                }
                ino += 1;
            }
            if let Some(slot) = found {
                let e = &mut entries_mut(buf.data_mut())[slot];
                *e = InodeEntry::zeroed();
                e.set_typ(typ);
                op.sync(buf);
                return Ok(ino);
            }
        }
        Err(())
    }

    /// Drops one reference. When the last reference to an unlinked inode
    /// goes away, its contents and its on-disk slot are freed inside
    /// `op`.
    fn put_inner(&'static self, op: &Op, ip: &Arc<Inode>) {
        // The lock is unalertable: releasing references is cleanup that
        // must run even for a killed process.
        mem::forget(ip.inner.lock_unalertable());
        let mut guard = InodeGuard {
            tree: self,
            ip,
            no: ip.inode_no,
        };
        if !guard.valid() && guard.load().is_err() {
            drop(guard);
            ip.rc.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        if ip.rc() == 1 && guard.entry().num_links == 0 && guard.entry().typ() != InodeType::Invalid
        {
            let freed = guard.truncate(op).is_ok();
            if freed {
                guard.entry_mut().set_typ(InodeType::Invalid);
                let _ = guard.sync(op);
                let mut list = self.shared.lock();
                if let Some(pos) = list.iter().position(|i| Arc::ptr_eq(i, ip)) {
                    list.remove(pos);
                }
            }
        }
        drop(guard);
        ip.rc.fetch_sub(1, Ordering::AcqRel);
    }
}

fn entries(data: &[u8; BLOCK_SIZE]) -> &[InodeEntry] {
    LayoutVerified::new_slice(&data[..])
        .expect("inode block: bad layout")
        .into_slice()
}

fn entries_mut(data: &mut [u8; BLOCK_SIZE]) -> &mut [InodeEntry] {
    LayoutVerified::new_slice(&mut data[..])
        .expect("inode block: bad layout")
        .into_mut_slice()
}

/// A counted reference to a resident inode. Cloning shares it; dropping
/// without an explicit `put` opens a short transaction of its own.
pub struct RcInode {
    tree: &'static InodeTree,
    ip: Arc<Inode>,
}

impl Clone for RcInode {
    fn clone(&self) -> Self {
        self.ip.rc.fetch_add(1, Ordering::AcqRel);
        Self {
            tree: self.tree,
            ip: Arc::clone(&self.ip),
        }
    }
}

impl core::ops::Deref for RcInode {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.ip
    }
}

impl RcInode {
    pub fn tree(&self) -> &'static InodeTree {
        self.tree
    }

    /// Locks the inode, reading it from disk on the first lock after the
    /// resident copy went stale. Fails if the process is killed while
    /// waiting.
    pub fn lock(&self) -> Result<InodeGuard<'_>, ()> {
        let guard = self.ip.inner.lock()?;
        mem::forget(guard);
        let mut guard = InodeGuard {
            tree: self.tree,
            ip: &self.ip,
            no: self.ip.inode_no,
        };
        if !guard.valid() {
            guard.load()?;
        }
        Ok(guard)
    }

    /// Drops this reference inside `op`.
    pub fn put(self, op: &Op) {
        self.tree.put_inner(op, &self.ip);
        mem::forget(self);
    }
}

impl Drop for RcInode {
    fn drop(&mut self) {
        let op = self.tree.log.begin_op_unalertable();
        self.tree.put_inner(&op, &self.ip);
    }
}

/// A locked inode. Derefs to nothing: use `entry()`/`entry_mut()` and the
/// content accessors, all of which require the lock this guard proves.
pub struct InodeGuard<'a> {
    tree: &'static InodeTree,
    ip: &'a Inode,
    no: u32,
}

impl Drop for InodeGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard holds the lock by construction.
        unsafe { self.ip.inner.unlock() };
    }
}

impl InodeGuard<'_> {
    pub fn inode_no(&self) -> u32 {
        self.no
    }

    fn valid(&self) -> bool {
        // SAFETY: the guard holds the inode's sleep lock.
        unsafe { (*self.ip.inner.get_mut_raw()).valid }
    }

    pub fn entry(&self) -> &InodeEntry {
        // SAFETY: the guard holds the inode's sleep lock.
        unsafe { &(*self.ip.inner.get_mut_raw()).entry }
    }

    pub fn entry_mut(&mut self) -> &mut InodeEntry {
        // SAFETY: the guard holds the lock and `&mut self` is exclusive.
        unsafe { &mut (*self.ip.inner.get_mut_raw()).entry }
    }

    /// Reads the on-disk entry into the resident copy.
    fn load(&mut self) -> Result<(), ()> {
        let buf = self.tree.cache.acquire(self.tree.iblock(self.no))?;
        let slot = self.no as usize % INODE_PER_BLOCK;
        // SAFETY: the guard holds the lock and `&mut self` is exclusive.
        let inner = unsafe { &mut *self.ip.inner.get_mut_raw() };
        inner.entry = entries(buf.data())[slot];
        inner.valid = true;
        Ok(())
    }

    /// Copies the resident entry to its inode block and journals it.
    /// Must be called after every change to the entry that should reach
    /// the disk.
    pub fn sync(&self, op: &Op) -> Result<(), ()> {
        assert!(self.valid(), "inode sync: stale entry");
        let mut buf = self.tree.cache.acquire(self.tree.iblock(self.no))?;
        let slot = self.no as usize % INODE_PER_BLOCK;
        entries_mut(buf.data_mut())[slot] = *self.entry();
        op.sync(buf);
        Ok(())
    }

    /// The data block holding byte `off`, allocating it (and the indirect
    /// block) when `op` is given. Without `op`, returns 0 for unallocated
    /// positions.
    pub fn map(&mut self, op: Option<&Op>, off: usize) -> Result<u32, ()> {
        let idx = off / BLOCK_SIZE;
        assert!(idx < INODE_MAX_BLOCKS, "inode map: offset beyond max file");

        if idx < INODE_NUM_DIRECT {
            let mut addr = self.entry().addrs[idx];
            if addr == 0 {
                match op {
                    Some(op) => {
                        addr = op.alloc_block()?;
                        self.entry_mut().addrs[idx] = addr;
                    }
                    None => return Ok(0),
                }
            }
            return Ok(addr);
        }

        let idx = idx - INODE_NUM_DIRECT;
        let mut ib = self.entry().indirect;
        if ib == 0 {
            match op {
                Some(op) => {
                    ib = op.alloc_block()?;
                    self.entry_mut().indirect = ib;
                }
                None => return Ok(0),
            }
        }
        let mut buf = self.tree.cache.acquire(ib)?;
        let addr = block_addrs(buf.data())[idx];
        if addr != 0 {
            return Ok(addr);
        }
        match op {
            Some(op) => {
                let addr = op.alloc_block()?;
                block_addrs_mut(buf.data_mut())[idx] = addr;
                op.sync(buf);
                Ok(addr)
            }
            None => Ok(0),
        }
    }

    /// Copies file contents at `off` into `dst`. Reads past end-of-file
    /// are truncated; the byte count actually copied is returned.
    pub fn read_bytes(&mut self, dst: &mut [u8], off: usize) -> Result<usize, ()> {
        let size = self.entry().num_bytes as usize;
        if off >= size {
            return Ok(0);
        }
        let n = cmp::min(dst.len(), size - off);

        let mut done = 0;
        while done < n {
            let pos = off + done;
            let bno = self.map(None, pos)?;
            assert!(bno != 0, "inode read: unmapped block");
            let buf = self.tree.cache.acquire(bno)?;
            let boff = pos % BLOCK_SIZE;
            let m = cmp::min(n - done, BLOCK_SIZE - boff);
            dst[done..done + m].copy_from_slice(&buf.data()[boff..boff + m]);
            done += m;
        }
        Ok(n)
    }

    /// Reads a fixed-size on-disk record at `off`.
    pub fn read_record<T: AsBytes + FromBytes + Default>(&mut self, off: usize) -> Result<T, ()> {
        let mut v = T::default();
        if self.read_bytes(v.as_bytes_mut(), off)? == mem::size_of::<T>() {
            Ok(v)
        } else {
            Err(())
        }
    }

    /// Writes `src` at `off`, growing the file as needed and journaling
    /// every touched block. The entry is re-journaled when the size
    /// changes.
    pub fn write_bytes(&mut self, op: &Op, src: &[u8], off: usize) -> Result<usize, ()> {
        let end = off + src.len();
        assert!(off <= self.entry().num_bytes as usize, "inode write: hole");
        assert!(end <= INODE_MAX_BYTES, "inode write: beyond max file");

        let mut done = 0;
        while done < src.len() {
            let pos = off + done;
            let bno = self.map(Some(op), pos)?;
            let mut buf = self.tree.cache.acquire(bno)?;
            let boff = pos % BLOCK_SIZE;
            let m = cmp::min(src.len() - done, BLOCK_SIZE - boff);
            buf.data_mut()[boff..boff + m].copy_from_slice(&src[done..done + m]);
            op.sync(buf);
            done += m;
        }

        if end > self.entry().num_bytes as usize {
            self.entry_mut().num_bytes = end as u32;
        }
        self.sync(op)?;
        Ok(src.len())
    }

    /// Frees all content blocks (direct, indirect, and the indirect block
    /// itself) and journals the emptied entry.
    pub fn truncate(&mut self, op: &Op) -> Result<(), ()> {
        for i in 0..INODE_NUM_DIRECT {
            let addr = self.entry().addrs[i];
            if addr != 0 {
                op.free_block(addr)?;
                self.entry_mut().addrs[i] = 0;
            }
        }
        let ib = self.entry().indirect;
        if ib != 0 {
            {
                let buf = self.tree.cache.acquire(ib)?;
                for &addr in block_addrs(buf.data()).iter() {
                    if addr != 0 {
                        op.free_block(addr)?;
                    }
                }
            }
            op.free_block(ib)?;
            self.entry_mut().indirect = 0;
        }
        self.entry_mut().num_bytes = 0;
        self.sync(op)
    }

    pub fn stat(&self) -> Stat {
        let entry = self.entry();
        Stat {
            dev: 1,
            ino: self.no,
            mode: match entry.typ() {
                InodeType::Regular => Stat::S_IFREG,
                InodeType::Directory => Stat::S_IFDIR,
                _ => 0,
            },
            nlink: entry.num_links as u32,
            size: entry.num_bytes as u64,
        }
    }

    // Directory content. All of these go through read/write, so they are
    // journaled like any other file data.

    fn num_dirents(&self) -> usize {
        self.entry().num_bytes as usize / DIRENT_SIZE
    }

    /// Scans for `name`; returns its inode number and entry index.
    pub fn dir_lookup(&mut self, name: &FileName) -> Result<Option<(u32, usize)>, ()> {
        assert_eq!(self.entry().typ(), InodeType::Directory, "dir_lookup: not a directory");
        for i in 0..self.num_dirents() {
            let de: Dirent = self.read_record(i * DIRENT_SIZE)?;
            if de.inode_no != 0 && de.name() == *name {
                return Ok(Some((de.inode_no as u32, i)));
            }
        }
        Ok(None)
    }

    /// Appends the entry `(name, ino)`; fails if `name` is present.
    pub fn dir_insert(&mut self, op: &Op, name: &FileName, ino: u32) -> Result<(), ()> {
        if self.dir_lookup(name)?.is_some() {
            return Err(());
        }
        let de = Dirent::new(ino as u16, name);
        let off = self.entry().num_bytes as usize;
        self.write_bytes(op, de.as_bytes(), off)?;
        Ok(())
    }

    /// Removes entry `index` by moving the last entry into its place and
    /// shrinking the directory by one record.
    pub fn dir_remove(&mut self, op: &Op, index: usize) -> Result<(), ()> {
        assert_eq!(self.entry().typ(), InodeType::Directory, "dir_remove: not a directory");
        let count = self.num_dirents();
        if index >= count {
            return Err(());
        }
        if index < count - 1 {
            let last: Dirent = self.read_record((count - 1) * DIRENT_SIZE)?;
            self.write_bytes(op, last.as_bytes(), index * DIRENT_SIZE)?;
        }
        self.entry_mut().num_bytes -= DIRENT_SIZE as u32;
        self.sync(op)
    }

    /// Is the directory empty except for "." and ".."?
    pub fn is_dir_empty(&mut self) -> Result<bool, ()> {
        for i in 2..self.num_dirents() {
            let de: Dirent = self.read_record(i * DIRENT_SIZE)?;
            if de.inode_no != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn block_addrs(data: &[u8; BLOCK_SIZE]) -> &[u32] {
    LayoutVerified::new_slice(&data[..])
        .expect("indirect block: bad layout")
        .into_slice()
}

fn block_addrs_mut(data: &mut [u8; BLOCK_SIZE]) -> &mut [u32] {
    LayoutVerified::new_slice(&mut data[..])
        .expect("indirect block: bad layout")
        .into_mut_slice()
}

#[cfg(test)]
mod tests {
    use super::super::testing::fresh_fs;
    use super::*;

    fn name(s: &str) -> FileName {
        FileName::new(s.as_bytes())
    }

    /// Creates a linked regular file in the root directory and returns
    /// its inode number.
    fn create_file(fx: &super::super::testing::FsFixture, fname: &str) -> u32 {
        let op = fx.log.begin_op().unwrap();
        let ino = fx.itable.alloc(&op, InodeType::Regular).unwrap();
        let ip = fx.itable.get(ino);
        {
            let mut g = ip.lock().unwrap();
            g.entry_mut().num_links = 1;
            g.sync(&op).unwrap();
        }
        let root = fx.itable.root();
        {
            let mut g = root.lock().unwrap();
            g.dir_insert(&op, &name(fname), ino).unwrap();
        }
        root.put(&op);
        ip.put(&op);
        ino
    }

    #[test]
    fn write_then_read_roundtrip() {
        let fx = fresh_fs();
        let ino = create_file(&fx, "a");

        {
            let op = fx.log.begin_op().unwrap();
            let ip = fx.itable.get(ino);
            let mut g = ip.lock().unwrap();
            assert_eq!(g.write_bytes(&op, b"hello", 0).unwrap(), 5);
            drop(g);
            ip.put(&op);
        }

        let ip = fx.itable.get(ino);
        let mut g = ip.lock().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(g.read_bytes(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        // Reads beyond end-of-file are truncated.
        assert_eq!(g.read_bytes(&mut buf, 5).unwrap(), 0);
        assert_eq!(g.read_bytes(&mut buf, 3).unwrap(), 2);
    }

    #[test]
    fn contents_survive_cache_and_remount() {
        let fx = fresh_fs();
        let ino = create_file(&fx, "a");
        {
            let op = fx.log.begin_op().unwrap();
            let ip = fx.itable.get(ino);
            let mut g = ip.lock().unwrap();
            g.write_bytes(&op, b"persist me", 0).unwrap();
            drop(g);
            ip.put(&op);
        }

        // Remount: a fresh cache and inode table over the same disk.
        let cache: &'static crate::bio::Bcache =
            Box::leak(Box::new(crate::bio::Bcache::new(fx.disk)));
        let log: &'static Log = Box::leak(Box::new(Log::new(fx.sb, cache)));
        let itable: &'static InodeTree = Box::leak(Box::new(InodeTree::new(fx.sb, cache, log)));

        let ip = itable.get(ino);
        let mut g = ip.lock().unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(g.read_bytes(&mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"persist me");
    }

    #[test]
    fn indirect_blocks_extend_the_map() {
        let fx = fresh_fs();
        let ino = create_file(&fx, "big");
        let chunk = [0x5au8; BLOCK_SIZE];

        // Two blocks past the direct window, written one op per block to
        // stay inside the log budget.
        let blocks = INODE_NUM_DIRECT + 2;
        for i in 0..blocks {
            let op = fx.log.begin_op().unwrap();
            let ip = fx.itable.get(ino);
            let mut g = ip.lock().unwrap();
            g.write_bytes(&op, &chunk, i * BLOCK_SIZE).unwrap();
            drop(g);
            ip.put(&op);
        }

        let ip = fx.itable.get(ino);
        let mut g = ip.lock().unwrap();
        assert_eq!(g.entry().num_bytes as usize, blocks * BLOCK_SIZE);
        assert_ne!(g.entry().indirect, 0);
        let mut buf = [0u8; 8];
        g.read_bytes(&mut buf, (INODE_NUM_DIRECT + 1) * BLOCK_SIZE + 100)
            .unwrap();
        assert_eq!(buf, [0x5a; 8]);
    }

    #[test]
    fn truncate_returns_blocks_to_the_bitmap() {
        let fx = fresh_fs();
        let ino = create_file(&fx, "t");

        let first = {
            let op = fx.log.begin_op().unwrap();
            let ip = fx.itable.get(ino);
            let mut g = ip.lock().unwrap();
            g.write_bytes(&op, &[1u8; BLOCK_SIZE], 0).unwrap();
            let first = g.entry().addrs[0];
            drop(g);
            ip.put(&op);
            first
        };
        assert_ne!(first, 0);

        {
            let op = fx.log.begin_op().unwrap();
            let ip = fx.itable.get(ino);
            let mut g = ip.lock().unwrap();
            g.truncate(&op).unwrap();
            assert_eq!(g.entry().num_bytes, 0);
            drop(g);
            ip.put(&op);
        }

        // The freed block is the allocator's next pick.
        let op = fx.log.begin_op().unwrap();
        assert_eq!(op.alloc_block().unwrap(), first);
        op.free_block(first).unwrap();
    }

    #[test]
    fn unlinked_inode_is_freed_on_last_put() {
        let fx = fresh_fs();
        let ino = create_file(&fx, "gone");
        {
            let op = fx.log.begin_op().unwrap();
            let ip = fx.itable.get(ino);
            {
                let mut g = ip.lock().unwrap();
                g.write_bytes(&op, b"x", 0).unwrap();
                g.entry_mut().num_links = 0;
                g.sync(&op).unwrap();
            }
            ip.put(&op);
        }
        // The slot reads INVALID again, so alloc can reuse it.
        let op = fx.log.begin_op().unwrap();
        assert_eq!(fx.itable.alloc(&op, InodeType::Regular).unwrap(), ino);
    }

    #[test]
    fn dir_insert_lookup_remove() {
        let fx = fresh_fs();
        let a = create_file(&fx, "a");
        let b = create_file(&fx, "b");

        let root = fx.itable.root();
        {
            let mut g = root.lock().unwrap();
            assert_eq!(g.dir_lookup(&name("a")).unwrap().unwrap().0, a);
            let (ino_b, idx_b) = g.dir_lookup(&name("b")).unwrap().unwrap();
            assert_eq!(ino_b, b);
            assert!(g.dir_lookup(&name("c")).unwrap().is_none());

            let op = fx.log.begin_op().unwrap();
            // Duplicate names are rejected.
            assert!(g.dir_insert(&op, &name("a"), a).is_err());
            g.dir_remove(&op, idx_b).unwrap();
            assert!(g.dir_lookup(&name("b")).unwrap().is_none());
            assert_eq!(g.dir_lookup(&name("a")).unwrap().unwrap().0, a);
        }
    }

    #[test]
    fn dir_empty_check_ignores_dot_entries() {
        let fx = fresh_fs();
        let root = fx.itable.root();
        let mut g = root.lock().unwrap();
        assert!(g.is_dir_empty().unwrap());
        drop(g);
        create_file(&fx, "x");
        let mut g = root.lock().unwrap();
        assert!(!g.is_dir_empty().unwrap());
    }

    #[test]
    fn namex_walks_directories() {
        let fx = fresh_fs();

        // Build /sub/f by hand.
        let op = fx.log.begin_op().unwrap();
        let sub = fx.itable.alloc(&op, InodeType::Directory).unwrap();
        let sub_ip = fx.itable.get(sub);
        {
            let mut g = sub_ip.lock().unwrap();
            g.entry_mut().num_links = 2;
            g.sync(&op).unwrap();
            g.dir_insert(&op, &name("."), sub).unwrap();
            g.dir_insert(&op, &name(".."), ROOT_INODE_NO).unwrap();
        }
        let f = fx.itable.alloc(&op, InodeType::Regular).unwrap();
        let f_ip = fx.itable.get(f);
        {
            let mut g = f_ip.lock().unwrap();
            g.entry_mut().num_links = 1;
            g.sync(&op).unwrap();
        }
        {
            let root = fx.itable.root();
            let mut g = root.lock().unwrap();
            g.dir_insert(&op, &name("sub"), sub).unwrap();
            drop(g);
            root.put(&op);
        }
        {
            let mut g = sub_ip.lock().unwrap();
            g.dir_insert(&op, &name("f"), f).unwrap();
        }

        let found = fx.itable.namei(b"/sub/f", None, &op).unwrap();
        assert_eq!(found.inode_no, f);
        found.put(&op);

        // Relative resolution from /sub.
        let rel = fx.itable.namei(b"f", Some(&sub_ip), &op).unwrap();
        assert_eq!(rel.inode_no, f);
        rel.put(&op);

        let (parent, last) = fx.itable.nameiparent(b"/sub/f", None, &op).unwrap();
        assert_eq!(parent.inode_no, sub);
        assert_eq!(last.as_bytes(), b"f");
        parent.put(&op);

        // "/" resolves to the root but has no parent.
        let root = fx.itable.namei(b"/", None, &op).unwrap();
        assert_eq!(root.inode_no, ROOT_INODE_NO);
        root.put(&op);
        assert!(fx.itable.nameiparent(b"/", None, &op).is_err());

        assert!(fx.itable.namei(b"/absent", None, &op).is_err());

        sub_ip.put(&op);
        f_ip.put(&op);
    }
}
