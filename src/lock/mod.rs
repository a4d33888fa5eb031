//! The lock module.
//!
//! Two flavors of mutual exclusion: spin locks, which busy-wait with
//! interrupts disabled and must never be held across a suspension point,
//! and sleep locks, whose holder may block.

mod sleeplock;
mod spinlock;

pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinlock, SpinLock, SpinLockGuard};
