//! Sleep locks.
//!
//! Long-term mutual exclusion for resources whose holder may block, such
//! as cached disk blocks and inodes. A sleep lock is a binary semaphore
//! plus the data it guards; acquiring one is an alertable wait, so it
//! fails if the process is killed while queued.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::sem::Semaphore;

pub struct SleepLock<T> {
    sem: Semaphore,
    data: UnsafeCell<T>,
}

// SAFETY: the semaphore provides the necessary synchronization.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub fn new(name: &'static str, data: T) -> Self {
        Self {
            sem: Semaphore::new(name, 1),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock; fails if the process is killed while waiting.
    pub fn lock(&self) -> Result<SleepLockGuard<'_, T>, ()> {
        if self.sem.wait() {
            Ok(SleepLockGuard { lock: self })
        } else {
            Err(())
        }
    }

    /// Acquires the lock, ignoring kills. For cleanup paths that must not
    /// be interrupted.
    pub fn lock_unalertable(&self) -> SleepLockGuard<'_, T> {
        self.sem.wait_unalertable();
        SleepLockGuard { lock: self }
    }

    /// Returns a pointer to the inner data.
    ///
    /// The caller must ensure that accessing the pointer does not race;
    /// usually that means the lock is held with its guard forgotten.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Releases the lock without a guard.
    ///
    /// # Safety
    ///
    /// Use only when the lock was acquired and its guard was forgotten.
    pub unsafe fn unlock(&self) {
        self.sem.post();
    }
}

pub struct SleepLockGuard<'s, T> {
    lock: &'s SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the lock is held and `&mut self` is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.sem.post();
    }
}
