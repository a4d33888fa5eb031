//! File-system system calls: mostly argument checking, then calls into
//! the file table, the inode layer and the socket module.

use alloc::sync::Arc;
use core::convert::TryInto;
use core::sync::atomic::AtomicUsize;

use zerocopy::AsBytes;

use super::{user_path, user_slice, AT_FDCWD};
use crate::cpu;
use crate::file::{File, FileType};
use crate::fs::{FileName, InodeType, Op, RcInode, Stat};
use crate::kernel;
use crate::proc::ProcData;
use crate::socket::{InetAddr, Socket};
use crate::vm::Prot;

pub const O_RDONLY: u64 = 0x0;
pub const O_WRONLY: u64 = 0x1;
pub const O_RDWR: u64 = 0x2;
pub const O_CREAT: u64 = 0x40;

pub const MAP_SHARED: u64 = 0x1;
pub const MAP_PRIVATE: u64 = 0x2;

const TIOCGWINSZ: u64 = 0x5413;

fn this_data() -> Result<&'static mut ProcData, ()> {
    let p = cpu::current().ok_or(())?;
    // SAFETY: we are the running owner; the reference lives only for the
    // duration of one syscall.
    Ok(unsafe { &mut *(p.data() as *mut ProcData) })
}

fn fd2file(fd: u64) -> Result<Arc<File>, ()> {
    this_data()?.oftable.get(fd as i64 as i32).ok_or(())
}

fn fd2socket(fd: u64) -> Result<Arc<Socket>, ()> {
    match &fd2file(fd)?.typ {
        FileType::Socket { socket } => Ok(Arc::clone(socket)),
        _ => Err(()),
    }
}

pub fn sys_ioctl(_fd: u64, request: u64) -> Result<usize, ()> {
    // The only request user programs issue is the terminal size probe;
    // pretend it worked.
    if request != TIOCGWINSZ {
        return Err(());
    }
    Ok(0)
}

pub fn sys_dup(fd: u64) -> Result<usize, ()> {
    let f = fd2file(fd)?;
    let fd = this_data()?.oftable.alloc_fd(f)?;
    Ok(fd as usize)
}

pub fn sys_read(fd: u64, buf: u64, count: u64) -> Result<usize, ()> {
    let f = fd2file(fd)?;
    if count == 0 {
        return Err(());
    }
    let dst = user_slice(buf, count as usize, true)?;
    f.read(dst)
}

pub fn sys_write(fd: u64, buf: u64, count: u64) -> Result<usize, ()> {
    let f = fd2file(fd)?;
    if count == 0 {
        return Err(());
    }
    let src = user_slice(buf, count as usize, false)?;
    f.write(src)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IoVec {
    base: u64,
    len: u64,
}

pub fn sys_writev(fd: u64, iov: u64, iovcnt: u64) -> Result<usize, ()> {
    let f = fd2file(fd)?;
    if iovcnt == 0 || iovcnt > 64 {
        return Err(());
    }
    let raw = user_slice(iov, iovcnt as usize * core::mem::size_of::<IoVec>(), false)?;
    let mut total = 0;
    for chunk in raw.chunks_exact(core::mem::size_of::<IoVec>()) {
        let base = u64::from_le_bytes(chunk[..8].try_into().map_err(|_| ())?);
        let len = u64::from_le_bytes(chunk[8..].try_into().map_err(|_| ())?);
        let src = user_slice(base, len as usize, false)?;
        total += f.write(src)?;
    }
    Ok(total)
}

pub fn sys_close(fd: u64) -> Result<usize, ()> {
    let data = this_data()?;
    let fd = fd as i64 as i32;
    if !(0..crate::param::NOFILE as i32).contains(&fd) {
        return Err(());
    }
    // Closing an empty slot is tolerated.
    let _ = data.oftable.close(fd);
    Ok(0)
}

fn copy_stat_out(st: Stat, addr: u64) -> Result<usize, ()> {
    let dst = user_slice(addr, core::mem::size_of::<Stat>(), true)?;
    dst.copy_from_slice(st.as_bytes());
    Ok(0)
}

pub fn sys_fstat(fd: u64, st: u64) -> Result<usize, ()> {
    let f = fd2file(fd)?;
    copy_stat_out(f.stat()?, st)
}

pub fn sys_newfstatat(dirfd: u64, path: u64, st: u64, flags: u64) -> Result<usize, ()> {
    if dirfd as i64 as i32 != AT_FDCWD || flags != 0 {
        return Err(());
    }
    let path = user_path(path)?;
    let data = this_data()?;
    let itable = kernel::itable();
    let op = itable.log().begin_op()?;
    let ip = itable.namei(path, data.cwd.as_ref(), &op)?;
    let stat = match ip.lock() {
        Ok(guard) => guard.stat(),
        Err(()) => {
            ip.put(&op);
            return Err(());
        }
    };
    ip.put(&op);
    drop(op);
    copy_stat_out(stat, st)
}

/// Creates (or finds) the inode at `path`. For a fresh directory, "."
/// and ".." are linked and the parent's link count goes up.
fn create(
    path: &[u8],
    typ: InodeType,
    major: u16,
    minor: u16,
    cwd: Option<&RcInode>,
    op: &Op,
) -> Result<RcInode, ()> {
    let itable = kernel::itable();
    let (parent, name) = itable.nameiparent(path, cwd, op)?;
    let mut pguard = match parent.lock() {
        Ok(g) => g,
        Err(()) => {
            parent.put(op);
            return Err(());
        }
    };

    if let Ok(Some((ino, _))) = pguard.dir_lookup(&name) {
        drop(pguard);
        parent.put(op);
        return Ok(itable.get(ino));
    }

    let result = (|| -> Result<RcInode, ()> {
        let ino = itable.alloc(op, typ)?;
        let ip = itable.get(ino);
        {
            let mut guard = ip.lock()?;
            guard.entry_mut().major = major;
            guard.entry_mut().minor = minor;
            guard.entry_mut().num_links = 1;
            if typ == InodeType::Directory {
                guard.entry_mut().num_links = 2;
                guard.dir_insert(op, &FileName::new(b"."), ino)?;
                guard.dir_insert(op, &FileName::new(b".."), pguard.inode_no())?;
                // ".." links the parent.
                pguard.entry_mut().num_links += 1;
                pguard.sync(op)?;
            }
            guard.sync(op)?;
        }
        pguard.dir_insert(op, &name, ino)?;
        Ok(ip)
    })();

    drop(pguard);
    parent.put(op);
    result
}

pub fn sys_openat(dirfd: u64, path: u64, omode: u64) -> Result<usize, ()> {
    if dirfd as i64 as i32 != AT_FDCWD {
        return Err(());
    }
    let path = user_path(path)?;
    let data = this_data()?;
    let itable = kernel::itable();

    let op = itable.log().begin_op()?;
    let ip = if omode & O_CREAT != 0 {
        create(path, InodeType::Regular, 0, 0, data.cwd.as_ref(), &op)?
    } else {
        itable.namei(path, data.cwd.as_ref(), &op)?
    };
    drop(op);

    let readable = omode & O_WRONLY == 0;
    let writable = omode & (O_WRONLY | O_RDWR) != 0;
    let f = kernel::ftable().alloc(
        FileType::Inode {
            ip,
            off: AtomicUsize::new(0),
        },
        readable,
        writable,
    )?;
    let fd = data.oftable.alloc_fd(f)?;
    Ok(fd as usize)
}

pub fn sys_mkdirat(dirfd: u64, path: u64, mode: u64) -> Result<usize, ()> {
    if dirfd as i64 as i32 != AT_FDCWD || mode != 0 {
        return Err(());
    }
    let path = user_path(path)?;
    let data = this_data()?;
    let op = kernel::itable().log().begin_op()?;
    let ip = create(path, InodeType::Directory, 0, 0, data.cwd.as_ref(), &op)?;
    ip.put(&op);
    Ok(0)
}

pub fn sys_mknodat(dirfd: u64, path: u64, _mode: u64, dev: u64) -> Result<usize, ()> {
    if dirfd as i64 as i32 != AT_FDCWD {
        return Err(());
    }
    let path = user_path(path)?;
    let major = (dev >> 8) as u16;
    let minor = (dev & 0xff) as u16;
    let data = this_data()?;
    let op = kernel::itable().log().begin_op()?;
    let ip = create(path, InodeType::Device, major, minor, data.cwd.as_ref(), &op)?;
    ip.put(&op);
    Ok(0)
}

pub fn sys_unlinkat(dirfd: u64, path: u64, flags: u64) -> Result<usize, ()> {
    if dirfd as i64 as i32 != AT_FDCWD || flags != 0 {
        return Err(());
    }
    let path = user_path(path)?;
    let data = this_data()?;
    let itable = kernel::itable();
    let op = itable.log().begin_op()?;

    let (parent, name) = itable.nameiparent(path, data.cwd.as_ref(), &op)?;
    let mut pguard = match parent.lock() {
        Ok(g) => g,
        Err(()) => {
            parent.put(&op);
            return Err(());
        }
    };

    if name.as_bytes() == b"." || name.as_bytes() == b".." {
        drop(pguard);
        parent.put(&op);
        return Err(());
    }
    let (ino, index) = match pguard.dir_lookup(&name) {
        Ok(Some(found)) => found,
        _ => {
            drop(pguard);
            parent.put(&op);
            return Err(());
        }
    };
    let ip = itable.get(ino);
    let mut guard = match ip.lock() {
        Ok(g) => g,
        Err(()) => {
            ip.put(&op);
            drop(pguard);
            parent.put(&op);
            return Err(());
        }
    };
    assert!(guard.entry().num_links >= 1, "unlink: no links");

    if guard.entry().typ() == InodeType::Directory && !guard.is_dir_empty().unwrap_or(false) {
        drop(guard);
        ip.put(&op);
        drop(pguard);
        parent.put(&op);
        return Err(());
    }

    if pguard.dir_remove(&op, index).is_err() {
        drop(guard);
        ip.put(&op);
        drop(pguard);
        parent.put(&op);
        return Err(());
    }
    if guard.entry().typ() == InodeType::Directory {
        // The removed ".." no longer links the parent.
        pguard.entry_mut().num_links -= 1;
        pguard.sync(&op)?;
    }
    drop(pguard);
    parent.put(&op);

    guard.entry_mut().num_links -= 1;
    guard.sync(&op)?;
    drop(guard);
    ip.put(&op);
    Ok(0)
}

pub fn sys_chdir(path: u64) -> Result<usize, ()> {
    let path = user_path(path)?;
    let data = this_data()?;
    let itable = kernel::itable();
    let op = itable.log().begin_op()?;
    let ip = itable.namei(path, data.cwd.as_ref(), &op)?;
    match ip.lock() {
        Ok(guard) if guard.entry().typ() == InodeType::Directory => drop(guard),
        other => {
            drop(other);
            ip.put(&op);
            return Err(());
        }
    }
    if let Some(old) = data.cwd.take() {
        old.put(&op);
    }
    data.cwd = Some(ip);
    Ok(0)
}

pub fn sys_pipe2(fds: u64, _flags: u64) -> Result<usize, ()> {
    let data = this_data()?;
    let (read_end, write_end) = kernel::ftable().alloc_pipe()?;
    let fd0 = data.oftable.alloc_fd(read_end)?;
    let fd1 = match data.oftable.alloc_fd(write_end) {
        Ok(fd) => fd,
        Err(()) => {
            let _ = data.oftable.close(fd0);
            return Err(());
        }
    };
    let out = user_slice(fds, 8, true);
    match out {
        Ok(dst) => {
            dst[..4].copy_from_slice(&fd0.to_le_bytes());
            dst[4..].copy_from_slice(&fd1.to_le_bytes());
            Ok(0)
        }
        Err(()) => {
            let _ = data.oftable.close(fd0);
            let _ = data.oftable.close(fd1);
            Err(())
        }
    }
}

pub fn sys_mmap(
    addr: u64,
    length: u64,
    prot: u64,
    flags: u64,
    fd: u64,
    offset: u64,
) -> Result<usize, ()> {
    if length == 0 || (flags != MAP_SHARED && flags != MAP_PRIVATE) {
        return Err(());
    }
    let prot = Prot::from_bits(prot as u32).ok_or(())?;
    let f = fd2file(fd)?;
    let data = this_data()?;
    data.pgdir.mmap(
        addr as usize,
        length as usize,
        prot,
        flags == MAP_SHARED,
        f,
        offset as usize,
    )
}

pub fn sys_munmap(addr: u64, length: u64) -> Result<usize, ()> {
    let data = this_data()?;
    data.pgdir.munmap(addr as usize, length as usize)?;
    Ok(0)
}

// Sockets.

fn read_user_addr(addr: u64, addrlen: u64) -> Result<InetAddr, ()> {
    if addrlen as usize != core::mem::size_of::<InetAddr>() {
        return Err(());
    }
    let raw = user_slice(addr, core::mem::size_of::<InetAddr>(), false)?;
    Ok(InetAddr {
        addr: u32::from_le_bytes(raw[..4].try_into().map_err(|_| ())?),
        port: u16::from_le_bytes(raw[4..6].try_into().map_err(|_| ())?),
    })
}

fn write_user_addr(a: InetAddr, addr: u64) -> Result<(), ()> {
    let dst = user_slice(addr, core::mem::size_of::<InetAddr>(), true)?;
    dst[..4].copy_from_slice(&a.addr.to_le_bytes());
    dst[4..6].copy_from_slice(&a.port.to_le_bytes());
    Ok(())
}

pub fn sys_socket(family: u64, typ: u64, protocol: u64) -> Result<usize, ()> {
    let sk = Socket::new(
        kernel::ports(),
        family as i64 as i32,
        typ as i64 as i32,
        protocol as i64 as i32,
    )?;
    let f = kernel::ftable().alloc(FileType::Socket { socket: sk }, true, true)?;
    let fd = this_data()?.oftable.alloc_fd(f)?;
    Ok(fd as usize)
}

pub fn sys_bind(sd: u64, addr: u64, addrlen: u64) -> Result<usize, ()> {
    let sk = fd2socket(sd)?;
    let bind_to = if addr == 0 {
        None
    } else {
        Some(read_user_addr(addr, addrlen)?)
    };
    sk.bind(bind_to)?;
    Ok(0)
}

pub fn sys_listen(sd: u64, _backlog: u64) -> Result<usize, ()> {
    fd2socket(sd)?.listen();
    Ok(0)
}

pub fn sys_accept(sd: u64, addr: u64, addrlen: u64) -> Result<usize, ()> {
    let sk = fd2socket(sd)?;
    let pair = sk.accept()?;
    if addr != 0 {
        if let Some(peer) = pair.bound_addr() {
            write_user_addr(peer, addr)?;
        }
        if addrlen != 0 {
            let dst = user_slice(addrlen, 4, true)?;
            dst.copy_from_slice(&(core::mem::size_of::<InetAddr>() as u32).to_le_bytes());
        }
    }
    let f = kernel::ftable().alloc(FileType::Socket { socket: pair }, true, true)?;
    let fd = this_data()?.oftable.alloc_fd(f)?;
    Ok(fd as usize)
}

pub fn sys_connect(sd: u64, addr: u64, addrlen: u64) -> Result<usize, ()> {
    let sk = fd2socket(sd)?;
    let to = read_user_addr(addr, addrlen)?;
    sk.connect(to)?;
    Ok(0)
}

pub fn sys_sendto(
    sd: u64,
    buf: u64,
    len: u64,
    _flags: u64,
    dest: u64,
    _destlen: u64,
) -> Result<usize, ()> {
    if dest != 0 {
        // Unconnected datagrams have no defined loopback semantics.
        return Err(());
    }
    let sk = fd2socket(sd)?;
    let src = user_slice(buf, len as usize, false)?;
    sk.send(src)
}

pub fn sys_recvfrom(
    sd: u64,
    buf: u64,
    len: u64,
    _flags: u64,
    src_addr: u64,
    _srclen: u64,
) -> Result<usize, ()> {
    if src_addr != 0 {
        // As with sendto: only the connected form exists.
        return Err(());
    }
    let sk = fd2socket(sd)?;
    let dst = user_slice(buf, len as usize, true)?;
    sk.recv(dst)
}

pub fn sys_closesocket(sd: u64) -> Result<usize, ()> {
    let sk = fd2socket(sd)?;
    sk.close();
    let _ = this_data()?.oftable.close(sd as i64 as i32);
    Ok(0)
}
