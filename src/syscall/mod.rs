//! System call dispatch.
//!
//! The trap layer hands the user context here with the call number in
//! x8 and arguments in x0..x5; the result goes back in x0, with every
//! failure flattened to -1. All pointer arguments are validated against
//! the caller's sections before they are touched.

mod file;
mod proc;

use crate::cpu;
use crate::proc::UserContext;

pub const SYS_DUP: usize = 23;
pub const SYS_IOCTL: usize = 29;
pub const SYS_MKNODAT: usize = 33;
pub const SYS_MKDIRAT: usize = 34;
pub const SYS_UNLINKAT: usize = 35;
pub const SYS_CHDIR: usize = 49;
pub const SYS_OPENAT: usize = 56;
pub const SYS_CLOSE: usize = 57;
pub const SYS_PIPE2: usize = 59;
pub const SYS_READ: usize = 63;
pub const SYS_WRITE: usize = 64;
pub const SYS_WRITEV: usize = 66;
pub const SYS_NEWFSTATAT: usize = 79;
pub const SYS_FSTAT: usize = 80;
pub const SYS_EXIT: usize = 93;
pub const SYS_KILL: usize = 129;
pub const SYS_SOCKET: usize = 198;
pub const SYS_BIND: usize = 200;
pub const SYS_LISTEN: usize = 201;
pub const SYS_ACCEPT: usize = 202;
pub const SYS_CONNECT: usize = 203;
pub const SYS_SENDTO: usize = 206;
pub const SYS_RECVFROM: usize = 207;
pub const SYS_CLOSESOCKET: usize = 210;
pub const SYS_SBRK: usize = 214;
pub const SYS_MUNMAP: usize = 215;
pub const SYS_FORK: usize = 220;
pub const SYS_EXECVE: usize = 221;
pub const SYS_MMAP: usize = 222;
pub const SYS_WAIT: usize = 260;

/// The only supported `dirfd`.
pub const AT_FDCWD: i32 = -100;

/// Decodes the trap frame, runs the call, stores the result in x0.
pub fn syscall_entry(ctx: &mut UserContext) {
    let id = ctx.x[8] as usize;
    let a = [ctx.x[0], ctx.x[1], ctx.x[2], ctx.x[3], ctx.x[4], ctx.x[5]];
    let ret = dispatch(id, &a);
    ctx.x[0] = match ret {
        Ok(v) => v as u64,
        Err(()) => u64::MAX,
    };
}

fn dispatch(id: usize, a: &[u64; 6]) -> Result<usize, ()> {
    match id {
        SYS_DUP => file::sys_dup(a[0]),
        SYS_IOCTL => file::sys_ioctl(a[0], a[1]),
        SYS_MKNODAT => file::sys_mknodat(a[0], a[1], a[2], a[3]),
        SYS_MKDIRAT => file::sys_mkdirat(a[0], a[1], a[2]),
        SYS_UNLINKAT => file::sys_unlinkat(a[0], a[1], a[2]),
        SYS_CHDIR => file::sys_chdir(a[0]),
        SYS_OPENAT => file::sys_openat(a[0], a[1], a[2]),
        SYS_CLOSE => file::sys_close(a[0]),
        SYS_PIPE2 => file::sys_pipe2(a[0], a[1]),
        SYS_READ => file::sys_read(a[0], a[1], a[2]),
        SYS_WRITE => file::sys_write(a[0], a[1], a[2]),
        SYS_WRITEV => file::sys_writev(a[0], a[1], a[2]),
        SYS_NEWFSTATAT => file::sys_newfstatat(a[0], a[1], a[2], a[3]),
        SYS_FSTAT => file::sys_fstat(a[0], a[1]),
        SYS_EXIT => proc::sys_exit(a[0]),
        SYS_KILL => proc::sys_kill(a[0]),
        SYS_SOCKET => file::sys_socket(a[0], a[1], a[2]),
        SYS_BIND => file::sys_bind(a[0], a[1], a[2]),
        SYS_LISTEN => file::sys_listen(a[0], a[1]),
        SYS_ACCEPT => file::sys_accept(a[0], a[1], a[2]),
        SYS_CONNECT => file::sys_connect(a[0], a[1], a[2]),
        SYS_SENDTO => file::sys_sendto(a[0], a[1], a[2], a[3], a[4], a[5]),
        SYS_RECVFROM => file::sys_recvfrom(a[0], a[1], a[2], a[3], a[4], a[5]),
        SYS_CLOSESOCKET => file::sys_closesocket(a[0]),
        SYS_SBRK => proc::sys_sbrk(a[0]),
        SYS_MUNMAP => file::sys_munmap(a[0], a[1]),
        SYS_FORK => proc::sys_fork(),
        SYS_EXECVE => proc::sys_execve(a[0], a[1], a[2]),
        SYS_MMAP => file::sys_mmap(a[0], a[1], a[2], a[3], a[4], a[5]),
        SYS_WAIT => proc::sys_wait(a[0]),
        _ => Err(()),
    }
}

/// A user buffer as a kernel slice, after checking it sits inside one
/// section with the right permission. User memory stays mapped while the
/// kernel runs, so the slice is directly usable.
fn user_slice(addr: u64, len: usize, write: bool) -> Result<&'static mut [u8], ()> {
    if len == 0 {
        return Ok(&mut []);
    }
    let p = cpu::current().ok_or(())?;
    // SAFETY: we are the running owner.
    let pd = unsafe { &p.data().pgdir };
    let ok = if write {
        pd.user_writeable(addr as usize, len)
    } else {
        pd.user_readable(addr as usize, len)
    };
    if !ok {
        return Err(());
    }
    // SAFETY: just validated against the section list.
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

/// A NUL-terminated user string of at most 255 bytes, without the
/// terminator.
fn user_path(addr: u64) -> Result<&'static [u8], ()> {
    let p = cpu::current().ok_or(())?;
    // SAFETY: we are the running owner.
    let pd = unsafe { &p.data().pgdir };
    let n = pd.user_strlen(addr as usize, 256);
    if n == 0 {
        return Err(());
    }
    let bytes =
        // SAFETY: `user_strlen` validated the range including the NUL.
        unsafe { core::slice::from_raw_parts(addr as *const u8, n) };
    let cstr = cstr_core::CStr::from_bytes_with_nul(bytes).map_err(|_| ())?;
    Ok(cstr.to_bytes())
}
