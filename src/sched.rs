//! The scheduler.
//!
//! A multi-level feedback queue: `NLEVEL` FIFO ready queues, level 0
//! strongest. A process starts at level 0 with a 5 ms slice; each level
//! down doubles up the slice by another 5 ms. Burning a whole slice
//! demotes a process one level; blocking keeps its level. Once a second
//! everything queued (and running) is promoted back to level 0 so nothing
//! starves, with one core per round responsible for the countdown.
//!
//! One global spinlock serializes all scheduler state, including every
//! process's `SchInfo`. A context switch hands the lock over to the
//! resumed thread, which releases it on its way out.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use array_macro::array;
use spin::Lazy;

use crate::arch::{Arch, TargetArch};
use crate::cpu;
use crate::lock::{SpinLock, SpinLockGuard};
use crate::param::{time_slice_ms, NCPU, NLEVEL, SCHED_TICK_MS, TIME_TO_LEVEL_UP_MS};
use crate::proc::{Proc, ProcState};

pub struct Mlfq {
    queues: [VecDeque<Arc<Proc>>; NLEVEL],

    /// Which core owns the level-up countdown this round.
    levelup_owner: usize,
    levelup_left_ms: u64,
}

impl Mlfq {
    pub fn new() -> Self {
        Self {
            queues: array![VecDeque::new(); NLEVEL],
            levelup_owner: 0,
            levelup_left_ms: TIME_TO_LEVEL_UP_MS,
        }
    }

    /// Queues `p` at the tail of its level. Caller is responsible for
    /// `p`'s state.
    fn enqueue(&mut self, p: &Arc<Proc>) {
        // SAFETY: we are reached only through the scheduler lock.
        let level = unsafe { p.sch().level };
        self.queues[level].push_back(Arc::clone(p));
    }

    /// The first runnable process, scanning strong levels first.
    fn pick_next(&mut self) -> Option<Arc<Proc>> {
        for queue in self.queues.iter_mut() {
            if let Some(p) = queue.pop_front() {
                return Some(p);
            }
        }
        None
    }

    /// Moves every queued process back to level 0, preserving FIFO order.
    fn promote_all(&mut self) {
        for i in 1..NLEVEL {
            let moved = core::mem::take(&mut self.queues[i]);
            for p in moved {
                // SAFETY: as in `enqueue`.
                unsafe { p.sch().level = 0 };
                self.queues[0].push_back(p);
            }
        }
    }

    #[cfg(test)]
    fn level_len(&self, level: usize) -> usize {
        self.queues[level].len()
    }
}

static SCHED: Lazy<SpinLock<Mlfq>> = Lazy::new(|| SpinLock::new("sched", Mlfq::new()));

/// Makes `p` runnable if it is sleeping (or not yet started). Returns
/// whether anything changed.
pub fn activate(p: &Arc<Proc>) -> bool {
    activate_inner(p, false)
}

/// Like `activate`, but as a kill notification: deep sleepers are left
/// alone.
pub fn alert(p: &Arc<Proc>) -> bool {
    activate_inner(p, true)
}

fn activate_inner(p: &Arc<Proc>, on_alert: bool) -> bool {
    let mut q = SCHED.lock();
    // SAFETY: the scheduler lock is held.
    let sch = unsafe { p.sch() };
    match sch.state {
        ProcState::Running | ProcState::Runnable | ProcState::Zombie => false,
        ProcState::Sleeping | ProcState::Unused => {
            sch.state = ProcState::Runnable;
            q.enqueue(p);
            true
        }
        ProcState::DeepSleeping => {
            if on_alert {
                false
            } else {
                sch.state = ProcState::Runnable;
                q.enqueue(p);
                true
            }
        }
    }
}

pub fn state(p: &Arc<Proc>) -> ProcState {
    let _q = SCHED.lock();
    // SAFETY: the scheduler lock is held.
    unsafe { p.sch().state }
}

pub fn is_zombie(p: &Arc<Proc>) -> bool {
    state(p) == ProcState::Zombie
}

pub fn is_unused(p: &Arc<Proc>) -> bool {
    state(p) == ProcState::Unused
}

/// Suspends the current process in `state`, atomically with releasing
/// `guard`. Returns once the process is scheduled again.
pub fn sleep<T>(guard: SpinLockGuard<'_, T>, state: ProcState) {
    assert!(
        matches!(state, ProcState::Sleeping | ProcState::DeepSleeping),
        "sleep: bad target state"
    );
    let q = SCHED.lock();
    // No wakeup can be lost: whoever posts must take the scheduler lock
    // to activate us, and we hold it until our state is set.
    drop(guard);
    switch_away(q, state, None);
}

/// Voluntarily gives up the CPU, staying runnable.
pub fn yield_now() {
    let q = SCHED.lock();
    switch_away(q, ProcState::Runnable, None);
}

/// Becomes a zombie and schedules away for good, posting the parent's
/// `childexit` once the state is committed.
pub fn exit_to_zombie(parent: Option<Arc<Proc>>) -> ! {
    let q = SCHED.lock();
    switch_away(q, ProcState::Zombie, parent);
    unreachable!("zombie was rescheduled");
}

fn switch_away(
    mut q: SpinLockGuard<'static, Mlfq>,
    new_state: ProcState,
    notify: Option<Arc<Proc>>,
) {
    let this = cpu::current().expect("scheduler: no current process");
    // SAFETY: the scheduler lock is held.
    let sch = unsafe { this.sch() };
    assert_eq!(sch.state, ProcState::Running, "scheduler: not running");

    // A killed process gets to keep the CPU until it reaches exit.
    if this.killed() && new_state != ProcState::Zombie {
        return;
    }

    sch.state = new_state;
    if sch.slice_left == 0 {
        // Slice burnt without blocking: demote.
        if sch.level < NLEVEL - 1 {
            sch.level += 1;
        }
        sch.slice_left = time_slice_ms(sch.level);
    }
    if new_state == ProcState::Runnable && !this.idle {
        q.enqueue(&this);
    }
    if let Some(parent) = notify {
        q.reacquire_after(|| parent.childexit.post());
    }

    let next = q.pick_next().unwrap_or_else(cpu::idle);
    if Arc::ptr_eq(&next, &this) {
        // SAFETY: the scheduler lock is held.
        unsafe { next.sch().state = ProcState::Running };
        drop(q);
    } else {
        // SAFETY: the scheduler lock is held.
        let (next_ctx, old_slot) = unsafe {
            let next_sch = next.sch();
            assert_eq!(
                next_sch.state,
                ProcState::Runnable,
                "scheduler: picked a non-runnable process"
            );
            next_sch.state = ProcState::Running;
            (next_sch.context, &mut this.sch().context as *mut _)
        };
        // SAFETY: the scheduler lock is held.
        let prev = unsafe { cpu::set_current(Some(next)) };
        // Drop every local handle before switching: a stack that is never
        // resumed (a zombie's) must not freeze reference counts. The
        // queues, wait lists and the process tree keep `this` and `next`
        // alive.
        drop(prev);
        drop(this);
        core::mem::forget(q);
        // SAFETY: both contexts live on valid kernel stacks; the lock is
        // transferred to whoever `next_ctx` resumes.
        unsafe { TargetArch::context_switch(next_ctx, old_slot) };
        // Back on this stack: someone transferred the lock to us.
        // SAFETY: see above.
        unsafe { SCHED.unlock() };
    }
    resume_housekeeping();
}

/// After getting the CPU: attach our address space and restart the slice
/// clock.
fn resume_housekeeping() {
    if let Some(this) = cpu::current() {
        if !this.idle {
            // SAFETY: we are the process itself.
            unsafe { this.data() }.pgdir.attach();
            TargetArch::set_cpu_timer(SCHED_TICK_MS);
        }
    }
}

/// Signature of a new process's first function.
pub type ProcEntry = extern "C" fn(usize) -> !;

/// Every new process resumes here from its seeded kernel context, with
/// the scheduler lock still held.
pub extern "C" fn proc_entry(entry: ProcEntry, arg: usize) -> ! {
    // SAFETY: the context switch transferred the lock to us.
    unsafe { SCHED.unlock() };
    resume_housekeeping();
    entry(arg)
}

/// Scheduler clock: charges the running slice, runs the level-up
/// countdown on the designated core, and preempts when the slice is
/// gone. Called from the per-core timer interrupt.
pub fn clock_tick() {
    let id = TargetArch::cpu_id();
    let mut preempt = false;
    {
        let mut q = SCHED.lock();
        if q.levelup_owner == id {
            q.levelup_left_ms = q.levelup_left_ms.saturating_sub(SCHED_TICK_MS);
            if q.levelup_left_ms == 0 {
                q.promote_all();
                for other in 0..NCPU {
                    // SAFETY: the scheduler lock is held.
                    if let Some(p) = unsafe { cpu::current_of(other) } {
                        if !p.idle {
                            unsafe { p.sch().level = 0 };
                        }
                    }
                }
                q.levelup_left_ms = TIME_TO_LEVEL_UP_MS;
            }
            q.levelup_owner = (q.levelup_owner + 1) % NCPU;
        }

        if let Some(p) = cpu::current() {
            if !p.idle {
                // SAFETY: the scheduler lock is held.
                let sch = unsafe { p.sch() };
                sch.slice_left = sch.slice_left.saturating_sub(SCHED_TICK_MS);
                preempt = sch.slice_left == 0;
            }
        }
    }
    if preempt {
        yield_now();
    } else {
        TargetArch::set_cpu_timer(SCHED_TICK_MS);
    }
}

/// Builds this core's idle task and makes it current. Called once per
/// core during boot, before interrupts.
///
/// # Safety
///
/// Must run exactly once per core, before this core schedules anything.
pub unsafe fn init_this_cpu() -> Result<(), ()> {
    let idle = Proc::new(0, true, None)?;
    // SAFETY: the idle task is not visible to anyone yet.
    unsafe { idle.sch().state = ProcState::Running };
    unsafe { cpu::set_idle(TargetArch::cpu_id(), Arc::clone(&idle)) };
    unsafe { cpu::set_current(Some(idle)) };
    Ok(())
}

/// The idle loop every core falls back to.
pub fn idle_loop() -> ! {
    loop {
        yield_now();
        if crate::printf::PANICKED.load(core::sync::atomic::Ordering::Relaxed) {
            break;
        }
        TargetArch::wait_for_interrupt();
    }
    loop {
        TargetArch::wait_for_interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::Pid;

    fn proc_at_level(pid: Pid, level: usize) -> Arc<Proc> {
        crate::kalloc::test_pool::init();
        let p = Proc::new(pid, false, None).unwrap();
        // SAFETY: the process is not shared yet.
        unsafe { p.sch().level = level };
        p
    }

    #[test]
    fn queues_are_fifo_within_a_level() {
        let mut q = Mlfq::new();
        let a = proc_at_level(101, 0);
        let b = proc_at_level(102, 0);
        q.enqueue(&a);
        q.enqueue(&b);
        assert_eq!(q.pick_next().unwrap().pid, 101);
        assert_eq!(q.pick_next().unwrap().pid, 102);
        assert!(q.pick_next().is_none());
    }

    #[test]
    fn strong_levels_run_first() {
        let mut q = Mlfq::new();
        let slow = proc_at_level(201, 2);
        let mid = proc_at_level(202, 1);
        let fast = proc_at_level(203, 0);
        q.enqueue(&slow);
        q.enqueue(&mid);
        q.enqueue(&fast);
        assert_eq!(q.pick_next().unwrap().pid, 203);
        assert_eq!(q.pick_next().unwrap().pid, 202);
        assert_eq!(q.pick_next().unwrap().pid, 201);
    }

    #[test]
    fn promotion_resets_every_queued_level() {
        let mut q = Mlfq::new();
        let a = proc_at_level(301, 2);
        let b = proc_at_level(302, 1);
        q.enqueue(&a);
        q.enqueue(&b);
        q.promote_all();
        assert_eq!(q.level_len(0), 2);
        assert_eq!(q.level_len(1), 0);
        assert_eq!(q.level_len(2), 0);
        // SAFETY: single-threaded test, nothing else references them.
        unsafe {
            assert_eq!(a.sch().level, 0);
            assert_eq!(b.sch().level, 0);
        }
    }

    #[test]
    fn activation_state_machine() {
        let p = proc_at_level(401, 0);
        assert!(is_unused(&p));
        assert!(activate(&p));
        assert_eq!(state(&p), ProcState::Runnable);
        // Already runnable: no-op.
        assert!(!activate(&p));

        // A sleeper wakes on activate and on alert alike.
        unsafe { p.sch().state = ProcState::Sleeping };
        assert!(alert(&p));
        assert_eq!(state(&p), ProcState::Runnable);

        // Deep sleep shrugs alerts off but honors posts.
        let q = proc_at_level(402, 0);
        unsafe { q.sch().state = ProcState::DeepSleeping };
        assert!(!alert(&q));
        assert_eq!(state(&q), ProcState::DeepSleeping);
        assert!(activate(&q));
        assert_eq!(state(&q), ProcState::Runnable);
    }

    #[test]
    fn zombies_stay_down() {
        let p = proc_at_level(403, 0);
        unsafe { p.sch().state = ProcState::Zombie };
        assert!(!activate(&p));
        assert!(!alert(&p));
        assert!(is_zombie(&p));
    }
}
