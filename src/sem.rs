//! Counting semaphores, the kernel's only suspension primitive.
//!
//! `wait` is alertable: it returns `false` when the process was killed
//! while queued, so callers can unwind and exit. `wait_unalertable` parks
//! the process in `DeepSleeping`, which `kill` cannot disturb; commits and
//! other critical handshakes use it so they are never broken mid-way.
//!
//! A post with no waiter is remembered in the value, so a waiter that
//! checked its condition, dropped the protecting spinlock and then called
//! `wait` does not miss a wakeup that raced in between. All blocking call
//! sites re-check their condition in a loop.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::cpu;
use crate::lock::SpinLock;
use crate::proc::{Proc, ProcState};
use crate::sched;

pub struct Semaphore {
    inner: SpinLock<SemInner>,
}

struct SemInner {
    value: isize,
    waiters: VecDeque<Arc<Proc>>,
}

impl Semaphore {
    pub fn new(name: &'static str, value: isize) -> Self {
        Self {
            inner: SpinLock::new(
                name,
                SemInner {
                    value,
                    waiters: VecDeque::new(),
                },
            ),
        }
    }

    /// Takes one unit without blocking; `false` if none is available.
    pub fn try_wait(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            true
        } else {
            false
        }
    }

    /// Takes one unit, blocking if necessary. Returns `false` if the
    /// process was killed before the unit arrived.
    pub fn wait(&self) -> bool {
        self.wait_inner(true)
    }

    /// Takes one unit, blocking in `DeepSleeping` if necessary. Immune to
    /// `kill`.
    pub fn wait_unalertable(&self) {
        self.wait_inner(false);
    }

    fn wait_inner(&self, alertable: bool) -> bool {
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            return true;
        }

        let p = cpu::current().expect("semaphore: wait without a process");
        if alertable && p.killed() {
            return false;
        }
        inner.waiters.push_back(Arc::clone(&p));
        let state = if alertable {
            ProcState::Sleeping
        } else {
            ProcState::DeepSleeping
        };
        // Atomically releases the semaphore lock and suspends; returns
        // once a post or an alert made us runnable again.
        sched::sleep(inner, state);

        let mut inner = self.inner.lock();
        match inner.waiters.iter().position(|w| Arc::ptr_eq(w, &p)) {
            // Still queued: the wakeup was an alert, not a post.
            Some(idx) => {
                inner.waiters.remove(idx);
                false
            }
            None => true,
        }
    }

    /// Releases one unit, waking the longest waiter if there is one.
    pub fn post(&self) {
        let mut inner = self.inner.lock();
        match inner.waiters.pop_front() {
            Some(p) => {
                sched::activate(&p);
            }
            None => inner.value += 1,
        }
    }

    /// Wakes every waiter. With no waiters, one unit is remembered so a
    /// racing `wait` returns immediately and re-checks its condition.
    pub fn post_all(&self) {
        let mut inner = self.inner.lock();
        if inner.waiters.is_empty() {
            inner.value += 1;
            return;
        }
        while let Some(p) = inner.waiters.pop_front() {
            sched::activate(&p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting() {
        let s = Semaphore::new("test", 2);
        assert!(s.try_wait());
        assert!(s.try_wait());
        assert!(!s.try_wait());
        s.post();
        assert!(s.try_wait());
    }

    #[test]
    fn uncontended_wait_never_blocks() {
        let s = Semaphore::new("test", 1);
        assert!(s.wait());
        s.post();
        s.wait_unalertable();
        s.post();
    }

    #[test]
    fn post_all_remembers_a_unit() {
        let s = Semaphore::new("test", 0);
        s.post_all();
        assert!(s.try_wait());
        assert!(!s.try_wait());
    }
}
