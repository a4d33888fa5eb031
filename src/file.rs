//! Open file objects.
//!
//! A `File` is the per-open state behind a file descriptor: what it is
//! (inode, pipe end, socket), whether it may read or write, and the
//! offset for inode-backed files. Handles are shared by `Arc`; the last
//! drop closes the underlying object. A small global table only enforces
//! the system-wide open file limit.

use alloc::sync::Arc;
use core::cmp;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::console;
use crate::fs::{InodeType, RcInode, Stat};
use crate::lock::SpinLock;
use crate::param::{BLOCK_SIZE, CONSOLE_MAJOR, INODE_MAX_BYTES, NFILE, OP_MAX_NUM_BLOCKS};
use crate::pipe::Pipe;
use crate::socket::Socket;

pub enum FileType {
    /// A file or directory (or device node) in the file system, with the
    /// read/write offset.
    Inode { ip: RcInode, off: AtomicUsize },
    Pipe { pipe: Arc<Pipe> },
    Socket { socket: Arc<Socket> },
}

pub struct File {
    table: &'static FTable,
    pub readable: bool,
    pub writable: bool,
    pub typ: FileType,
}

/// Bytes moved per transaction when writing through an inode: half the
/// log budget, leaving room for the inode, the indirect block, bitmap
/// updates and unaligned edges.
const WRITE_CHUNK: usize = OP_MAX_NUM_BLOCKS * BLOCK_SIZE / 2;

impl File {
    /// Reads from the file into `dst` at the current offset.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }
        match &self.typ {
            FileType::Inode { ip, off } => {
                let mut guard = ip.lock()?;
                if guard.entry().typ() == InodeType::Device {
                    let major = guard.entry().major;
                    drop(guard);
                    return device_read(major, dst);
                }
                let cur = off.load(Ordering::Relaxed);
                let n = guard.read_bytes(dst, cur)?;
                off.store(cur + n, Ordering::Relaxed);
                Ok(n)
            }
            FileType::Pipe { pipe } => pipe.read(dst),
            FileType::Socket { socket } => socket.recv(dst),
        }
    }

    /// Writes `src` at the current offset. Inode writes are split over
    /// several transactions and clamp at the maximum file size; the count
    /// actually written is returned, and zero available space is an
    /// error.
    pub fn write(&self, src: &[u8]) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }
        match &self.typ {
            FileType::Inode { ip, off } => {
                {
                    let guard = ip.lock()?;
                    if guard.entry().typ() == InodeType::Device {
                        let major = guard.entry().major;
                        drop(guard);
                        return device_write(major, src);
                    }
                }
                let cur = off.load(Ordering::Relaxed);
                let n = self.inode_write_at(ip, src, cur)?;
                off.store(cur + n, Ordering::Relaxed);
                Ok(n)
            }
            FileType::Pipe { pipe } => pipe.write(src),
            FileType::Socket { socket } => socket.send(src),
        }
    }

    /// Positioned read for file-backed memory sections; does not move the
    /// offset.
    pub fn pread(&self, dst: &mut [u8], off: usize) -> Result<usize, ()> {
        match &self.typ {
            FileType::Inode { ip, .. } => {
                let mut guard = ip.lock()?;
                guard.read_bytes(dst, off)
            }
            _ => Err(()),
        }
    }

    /// Positioned write for flushing shared mappings; does not move the
    /// offset.
    pub fn pwrite(&self, src: &[u8], off: usize) -> Result<usize, ()> {
        match &self.typ {
            FileType::Inode { ip, .. } => self.inode_write_at(ip, src, off),
            _ => Err(()),
        }
    }

    fn inode_write_at(&self, ip: &RcInode, src: &[u8], off: usize) -> Result<usize, ()> {
        if off >= INODE_MAX_BYTES {
            return Err(());
        }
        let total = cmp::min(src.len(), INODE_MAX_BYTES - off);
        if total == 0 && !src.is_empty() {
            return Err(());
        }

        let log = ip.tree().log();
        let mut done = 0;
        while done < total {
            let n = cmp::min(total - done, WRITE_CHUNK);
            let op = log.begin_op()?;
            let mut guard = ip.lock()?;
            guard.write_bytes(&op, &src[done..done + n], off + done)?;
            drop(guard);
            done += n;
        }
        Ok(total)
    }

    pub fn stat(&self) -> Result<Stat, ()> {
        match &self.typ {
            FileType::Inode { ip, .. } => Ok(ip.lock()?.stat()),
            _ => Err(()),
        }
    }

    /// The backing inode, for exec and mmap.
    pub fn inode(&self) -> Option<&RcInode> {
        match &self.typ {
            FileType::Inode { ip, .. } => Some(ip),
            _ => None,
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        *self.table.count.lock() -= 1;
        match &self.typ {
            FileType::Pipe { pipe } => pipe.close(self.writable),
            FileType::Socket { socket } => socket.on_file_close(),
            // The inode reference releases itself (a short transaction of
            // its own).
            FileType::Inode { .. } => {}
        }
    }
}

fn device_read(major: u16, dst: &mut [u8]) -> Result<usize, ()> {
    match major {
        CONSOLE_MAJOR => console::console().ok_or(())?.read(dst),
        _ => Err(()),
    }
}

fn device_write(major: u16, src: &[u8]) -> Result<usize, ()> {
    match major {
        CONSOLE_MAJOR => Ok(console::console().ok_or(())?.write(src)),
        _ => Err(()),
    }
}

/// The global file table: an allocation cap, not a pool.
pub struct FTable {
    count: SpinLock<usize>,
}

impl FTable {
    pub const fn new() -> Self {
        Self {
            count: SpinLock::new("ftable", 0),
        }
    }

    /// Allocates a file object, failing once `NFILE` are open.
    pub fn alloc(
        &'static self,
        typ: FileType,
        readable: bool,
        writable: bool,
    ) -> Result<Arc<File>, ()> {
        {
            let mut count = self.count.lock();
            if *count >= NFILE {
                return Err(());
            }
            *count += 1;
        }
        Ok(Arc::new(File {
            table: self,
            readable,
            writable,
            typ,
        }))
    }

    /// Allocates the two ends of a fresh pipe.
    pub fn alloc_pipe(&'static self) -> Result<(Arc<File>, Arc<File>), ()> {
        let pipe = Pipe::new();
        let read_end = self.alloc(
            FileType::Pipe {
                pipe: Arc::clone(&pipe),
            },
            true,
            false,
        )?;
        let write_end = self.alloc(FileType::Pipe { pipe }, false, true)?;
        Ok((read_end, write_end))
    }

    pub fn open_files(&self) -> usize {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::fresh_fs;
    use crate::fs::InodeTree;

    fn ftable() -> &'static FTable {
        Box::leak(Box::new(FTable::new()))
    }

    fn open_file(
        ft: &'static FTable,
        itable: &'static InodeTree,
        name: &str,
        readable: bool,
        writable: bool,
    ) -> Arc<File> {
        let op = itable.log().begin_op().unwrap();
        let ino = itable.alloc(&op, InodeType::Regular).unwrap();
        let ip = itable.get(ino);
        {
            let mut g = ip.lock().unwrap();
            g.entry_mut().num_links = 1;
            g.sync(&op).unwrap();
        }
        let root = itable.root();
        {
            let mut g = root.lock().unwrap();
            g.dir_insert(&op, &crate::fs::FileName::new(name.as_bytes()), ino)
                .unwrap();
        }
        root.put(&op);
        drop(op);
        ft.alloc(
            FileType::Inode {
                ip,
                off: AtomicUsize::new(0),
            },
            readable,
            writable,
        )
        .unwrap()
    }

    #[test]
    fn write_read_through_separate_opens() {
        let fx = fresh_fs();
        let ft = ftable();
        let f = open_file(ft, fx.itable, "a", true, true);
        assert_eq!(f.write(b"hello").unwrap(), 5);
        drop(f);

        // Re-open: resolve the path and read back.
        let op = fx.log.begin_op().unwrap();
        let ip = fx.itable.namei(b"/a", None, &op).unwrap();
        drop(op);
        let f = ft
            .alloc(
                FileType::Inode {
                    ip,
                    off: AtomicUsize::new(0),
                },
                true,
                false,
            )
            .unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn offsets_advance_per_read() {
        let fx = fresh_fs();
        let ft = ftable();
        let f = open_file(ft, fx.itable, "seq", true, true);
        f.write(b"abcdef").unwrap();
        drop(f);

        let op = fx.log.begin_op().unwrap();
        let ip = fx.itable.namei(b"/seq", None, &op).unwrap();
        drop(op);
        let f = ft
            .alloc(
                FileType::Inode {
                    ip,
                    off: AtomicUsize::new(0),
                },
                true,
                false,
            )
            .unwrap();
        let mut buf = [0u8; 2];
        f.read(&mut buf).unwrap();
        assert_eq!(&buf, b"ab");
        f.read(&mut buf).unwrap();
        assert_eq!(&buf, b"cd");
    }

    #[test]
    fn permissions_are_enforced() {
        let fx = fresh_fs();
        let ft = ftable();
        let f = open_file(ft, fx.itable, "ro", true, false);
        assert!(f.write(b"no").is_err());
        let f = open_file(ft, fx.itable, "wo", false, true);
        let mut buf = [0u8; 4];
        assert!(f.read(&mut buf).is_err());
    }

    #[test]
    fn giant_write_truncates_at_max_file_size() {
        let fx = fresh_fs();
        let ft = ftable();
        let f = open_file(ft, fx.itable, "big", true, true);
        let src = vec![1u8; INODE_MAX_BYTES + 1];
        // Only the bytes up to the limit are accepted.
        assert_eq!(f.write(&src).unwrap(), INODE_MAX_BYTES);
        assert_eq!(f.stat().unwrap().size as usize, INODE_MAX_BYTES);
        // The offset sits at the limit; nothing more fits.
        assert!(f.write(b"x").is_err());
    }

    #[test]
    fn nfile_cap_is_enforced() {
        let ft = ftable();
        let mut files = Vec::new();
        for _ in 0..NFILE {
            files.push(ft.alloc_pipe().map(|(r, _w)| r));
        }
        assert!(ft.open_files() <= NFILE);
        // At least the final allocation must have failed.
        assert!(files.iter().any(|f| f.is_err()));
        files.clear();
        assert_eq!(ft.open_files(), 0);
    }
}
