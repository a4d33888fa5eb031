//! Processes.
//!
//! A process is a kernel stack, a user address space, an open-file table
//! and a seat in the scheduler. The pieces have different owners:
//!
//! * `sch` (state, MLFQ level, remaining slice, saved kernel context) is
//!   read and written only under the scheduler lock.
//! * `data` (pgdir, kernel stack, files, cwd) belongs to the process
//!   itself; fork, exec, and the reaper touch it only while the process
//!   provably cannot run.
//! * everything else is atomic.

mod tree;

pub use tree::ProcTree;

use core::cell::UnsafeCell;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use alloc::sync::Arc;
use array_macro::array;

use crate::file::File;
use crate::fs::RcInode;
use crate::kalloc;
use crate::param::{time_slice_ms, NOFILE, PAGE_SIZE};
use crate::sem::Semaphore;
use crate::vm::Pgdir;

pub type Pid = i32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Runnable,
    Running,
    Sleeping,
    /// Sleeping and immune to `kill`; used across commits and handshakes
    /// that must not be broken mid-way.
    DeepSleeping,
    Zombie,
}

/// Saved user registers, living at the top of the kernel stack. The trap
/// entry and exit assembly read and write this layout.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UserContext {
    pub spsr: u64,
    pub elr: u64,
    pub sp: u64,
    pub tpidr: u64,
    pub q0: [u64; 2],
    pub x: [u64; 31],
}

impl UserContext {
    pub const fn zeroed() -> Self {
        Self {
            spsr: 0,
            elr: 0,
            sp: 0,
            tpidr: 0,
            q0: [0; 2],
            x: [0; 31],
        }
    }
}

/// Saved callee-saved registers for the in-kernel context switch.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct KernelContext {
    pub lr: u64,
    pub x0: u64,
    pub x1: u64,
    /// x19 through x29.
    pub x: [u64; 11],
}

impl KernelContext {
    pub const fn zeroed() -> Self {
        Self {
            lr: 0,
            x0: 0,
            x1: 0,
            x: [0; 11],
        }
    }
}

/// A process's kernel stack: one page, with the user context at the top
/// and the initial kernel context right below it.
pub struct KStack {
    base: usize,
}

impl KStack {
    pub fn new() -> Result<Self, ()> {
        let base = kalloc::alloc_page().ok_or(())?;
        // SAFETY: the page is fresh and exclusively ours.
        unsafe { core::ptr::write_bytes(base as *mut u8, 0, PAGE_SIZE) };
        Ok(Self { base })
    }

    pub fn ucontext(&self) -> *mut UserContext {
        (self.base + PAGE_SIZE - 16 - mem::size_of::<UserContext>()) as *mut UserContext
    }

    pub fn kcontext(&self) -> *mut KernelContext {
        (self.ucontext() as usize - mem::size_of::<KernelContext>()) as *mut KernelContext
    }
}

impl Drop for KStack {
    fn drop(&mut self) {
        kalloc::free_page(self.base);
    }
}

/// The per-process file descriptor table.
pub struct OpenFiles([Option<Arc<File>>; NOFILE]);

impl OpenFiles {
    pub fn new() -> Self {
        Self(array![None; NOFILE])
    }

    /// Hands `f` the lowest free descriptor.
    pub fn alloc_fd(&mut self, f: Arc<File>) -> Result<i32, ()> {
        for (fd, slot) in self.0.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(f);
                return Ok(fd as i32);
            }
        }
        Err(())
    }

    pub fn get(&self, fd: i32) -> Option<Arc<File>> {
        if fd < 0 || fd as usize >= NOFILE {
            return None;
        }
        self.0[fd as usize].clone()
    }

    pub fn close(&mut self, fd: i32) -> Result<(), ()> {
        if fd < 0 || fd as usize >= NOFILE {
            return Err(());
        }
        self.0[fd as usize].take().map(|_| ()).ok_or(())
    }

    pub fn set(&mut self, fd: usize, f: Arc<File>) {
        self.0[fd] = Some(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<File>)> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(fd, slot)| slot.as_ref().map(|f| (fd, f)))
    }

    pub fn clear(&mut self) {
        for slot in self.0.iter_mut() {
            *slot = None;
        }
    }
}

/// Scheduler-owned process state. Guarded by the scheduler lock.
pub struct SchInfo {
    pub state: ProcState,

    /// Current MLFQ level.
    pub level: usize,

    /// Milliseconds left in the current slice.
    pub slice_left: u64,

    /// Saved kernel context while not running.
    pub context: *mut KernelContext,
}

/// Process-owned state: only the process itself (or someone holding it
/// provably off-CPU) touches this.
pub struct ProcData {
    pub pgdir: Pgdir,
    pub kstack: KStack,
    pub oftable: OpenFiles,
    pub cwd: Option<RcInode>,
}

pub struct Proc {
    pub pid: Pid,
    pub idle: bool,

    killed: AtomicBool,
    exitcode: AtomicI32,

    /// Posted by exiting children.
    pub childexit: Semaphore,

    sch: UnsafeCell<SchInfo>,
    data: UnsafeCell<ProcData>,
}

// SAFETY: `sch` is only touched under the scheduler lock and `data` only
// by whoever exclusively runs or holds the process; see the module doc.
unsafe impl Send for Proc {}
unsafe impl Sync for Proc {}

impl Proc {
    pub(crate) fn new(pid: Pid, idle: bool, cwd: Option<RcInode>) -> Result<Arc<Self>, ()> {
        let kstack = KStack::new()?;
        let pgdir = Pgdir::new()?;
        let context = kstack.kcontext();
        Ok(Arc::new(Self {
            pid,
            idle,
            killed: AtomicBool::new(false),
            exitcode: AtomicI32::new(0),
            childexit: Semaphore::new("childexit", 0),
            sch: UnsafeCell::new(SchInfo {
                state: ProcState::Unused,
                level: 0,
                slice_left: time_slice_ms(0),
                context,
            }),
            data: UnsafeCell::new(ProcData {
                pgdir,
                kstack,
                oftable: OpenFiles::new(),
                cwd,
            }),
        }))
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn set_killed(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn exit_code(&self) -> i32 {
        self.exitcode.load(Ordering::Acquire)
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exitcode.store(code, Ordering::Release);
    }

    /// Scheduler-owned state.
    ///
    /// # Safety
    ///
    /// The caller must hold the scheduler lock, or otherwise know that no
    /// one else can touch the process (e.g. before its first activation).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn sch(&self) -> &mut SchInfo {
        unsafe { &mut *self.sch.get() }
    }

    /// Process-owned state.
    ///
    /// # Safety
    ///
    /// Only the process itself may call this while running; anyone else
    /// must hold the process provably off-CPU (unstarted or zombie).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    /// The trap frame at the top of the kernel stack.
    pub fn user_context(&self) -> *mut UserContext {
        // SAFETY: only the address is taken.
        unsafe { (*self.data.get()).kstack.ucontext() }
    }
}
