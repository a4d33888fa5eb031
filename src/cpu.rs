//! Per-CPU state.

use core::cell::UnsafeCell;

use alloc::sync::Arc;

use crate::arch::{Arch, TargetArch};
use crate::param::NCPU;
use crate::proc::Proc;

pub struct Cpu {
    /// The process running on this core. `None` until the scheduler starts.
    thisproc: UnsafeCell<Option<Arc<Proc>>>,

    /// This core's idle task.
    idle: UnsafeCell<Option<Arc<Proc>>>,

    /// Depth of `push_off` nesting.
    noff: UnsafeCell<i32>,

    /// Were interrupts enabled before the outermost `push_off`?
    intena: UnsafeCell<bool>,
}

// SAFETY: every field is only accessed from the owning core, either with
// interrupts disabled or (for `thisproc`) under the scheduler lock.
unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new() -> Self {
        Self {
            thisproc: UnsafeCell::new(None),
            idle: UnsafeCell::new(None),
            noff: UnsafeCell::new(0),
            intena: UnsafeCell::new(false),
        }
    }
}

const CPU_INIT: Cpu = Cpu::new();
static CPUS: [Cpu; NCPU] = [CPU_INIT; NCPU];

fn this() -> &'static Cpu {
    &CPUS[TargetArch::cpu_id()]
}

/// The process currently running on this core.
pub fn current() -> Option<Arc<Proc>> {
    // SAFETY: the slot is written only by this core, inside the scheduler.
    unsafe { (*this().thisproc.get()).clone() }
}

/// Replaces this core's current process. Returns the previous one.
///
/// # Safety
///
/// Must be called with the scheduler lock held.
pub(crate) unsafe fn set_current(p: Option<Arc<Proc>>) -> Option<Arc<Proc>> {
    unsafe { core::mem::replace(&mut *this().thisproc.get(), p) }
}

/// The process currently running on core `id`.
///
/// # Safety
///
/// Must be called with the scheduler lock held: the slots are written
/// under it.
pub(crate) unsafe fn current_of(id: usize) -> Option<Arc<Proc>> {
    unsafe { (*CPUS[id].thisproc.get()).clone() }
}

/// This core's idle task. Panics before `set_idle`.
pub(crate) fn idle() -> Arc<Proc> {
    // SAFETY: written once at boot, before the scheduler runs.
    unsafe { (*this().idle.get()).clone().expect("cpu: idle task not installed") }
}

/// Installs the idle task for core `id`.
///
/// # Safety
///
/// Must be called once per core during boot, before scheduling starts.
pub(crate) unsafe fn set_idle(id: usize, p: Arc<Proc>) {
    unsafe { *CPUS[id].idle.get() = Some(p) };
}

/// Like `intr_off`, but nestable: it takes as many `pop_off`s as `push_off`s
/// to restore the interrupt state. On the host stand-in interrupts do not
/// exist and both are no-ops.
pub fn push_off() {
    let old = TargetArch::intr_get();
    // SAFETY: paired with the `pop_off` below.
    unsafe { TargetArch::intr_off() };

    #[cfg(all(target_arch = "aarch64", not(test)))]
    {
        let c = this();
        // SAFETY: interrupts are off, so only this core touches its counters.
        unsafe {
            if *c.noff.get() == 0 {
                *c.intena.get() = old;
            }
            *c.noff.get() += 1;
        }
    }
    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    let _ = old;
}

/// Undo one `push_off`.
pub fn pop_off() {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    {
        let c = this();
        assert!(!TargetArch::intr_get(), "pop_off: interruptible");
        // SAFETY: interrupts are off, so only this core touches its counters.
        unsafe {
            assert!(*c.noff.get() >= 1, "pop_off");
            *c.noff.get() -= 1;
            if *c.noff.get() == 0 && *c.intena.get() {
                TargetArch::intr_on();
            }
        }
    }
}
