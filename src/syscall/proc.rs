//! Process system calls.

use alloc::vec::Vec;
use core::convert::TryInto;

use super::{user_path, user_slice};
use crate::cpu;
use crate::exec;
use crate::kernel;
use crate::param::MAX_ARGS;

pub fn sys_fork() -> Result<usize, ()> {
    kernel::ptree().fork().map(|pid| pid as usize)
}

pub fn sys_exit(code: u64) -> Result<usize, ()> {
    kernel::ptree().exit(code as i64 as i32)
}

pub fn sys_wait(status: u64) -> Result<usize, ()> {
    let (pid, code) = kernel::ptree().wait()?;
    if status != 0 {
        let dst = user_slice(status, 4, true)?;
        dst.copy_from_slice(&code.to_le_bytes());
    }
    Ok(pid as usize)
}

pub fn sys_kill(pid: u64) -> Result<usize, ()> {
    kernel::ptree().kill(pid as i64 as i32).map(|_| 0)
}

pub fn sys_sbrk(delta: u64) -> Result<usize, ()> {
    let p = cpu::current().ok_or(())?;
    // SAFETY: we are the running owner.
    let pd = unsafe { &p.data().pgdir };
    pd.sbrk(delta as i64 as isize)
}

/// Reads a NULL-terminated vector of user string pointers.
fn user_str_vec(addr: u64) -> Result<Vec<Vec<u8>>, ()> {
    let mut out = Vec::new();
    if addr == 0 {
        return Ok(out);
    }
    for i in 0..MAX_ARGS {
        let raw = user_slice(addr + (i * 8) as u64, 8, false)?;
        let p = u64::from_le_bytes(raw[..8].try_into().map_err(|_| ())?);
        if p == 0 {
            return Ok(out);
        }
        out.push(user_path(p)?.to_vec());
    }
    // Too many arguments.
    Err(())
}

pub fn sys_execve(path: u64, argv: u64, envp: u64) -> Result<usize, ()> {
    let path = user_path(path)?.to_vec();
    let argv = user_str_vec(argv)?;
    let envp = user_str_vec(envp)?;
    exec::execve(&path, &argv, &envp)?;
    Ok(0)
}
