//! A lock that parks the caller with the OS scheduler instead of spinning.
//!
//! `SleepLock<T>` guards a buffer's content (`data` and `valid`). Acquiring it may block the
//! calling thread for as long as another thread holds it, including across a device I/O call, so
//! it must never be acquired while any [`crate::spinlock::SpinLock`] guard is live.
//!
//! This stands in for the teacher's `proc::sleep`/`proc::wakeup` process-channel mechanism: here
//! the "channel" is a `Condvar` owned by the lock itself, and parking/waking is delegated to the
//! standard library rather than a hand-rolled scheduler.

use std::cell::UnsafeCell;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Inner state of a `SleepLock`, guarded by a plain `Mutex` (acquiring it is never expected to
/// be contended for long, since the only work done under it is flipping a bool and possibly
/// waiting on the condvar).
struct SleepLockState {
    locked: bool,
}

/// A lock that causes the caller to block while waiting.
pub struct SleepLock<T> {
    name: &'static str,
    state: Mutex<SleepLockState>,
    available: Condvar,
    data: UnsafeCell<T>,
}

/// A guard that releases the `SleepLock` and wakes one waiter when dropped.
pub struct SleepLockGuard<'a, T: 'a> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(SleepLockState { locked: false }),
            available: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Blocks the calling thread until the lock is free, then takes it.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut state = recover(self.state.lock());

        while state.locked {
            state = recover(self.available.wait(state));
        }
        state.locked = true;
        drop(state);

        SleepLockGuard { lock: self }
    }

    /// Consumes the lock and returns the inner data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a reference to the inner data, bypassing the lock.
    ///
    /// # Safety
    /// The caller must ensure that the lock is held (or otherwise that no other thread can
    /// concurrently access the data).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

/// A poisoned lock (a prior holder panicked while holding it) is still structurally sound here,
/// since the cache's own invariants, not the mutex's, are what matter, so we just recover the guard.
fn recover<G>(result: std::sync::LockResult<G>) -> G {
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<'a, T: 'a> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        let mut state: MutexGuard<'_, SleepLockState> = recover(self.lock.state.lock());
        state.locked = false;
        drop(state);

        // Wake up one waiter, if any, now that the state lock has been released.
        self.lock.available.notify_one();
    }
}

impl<T> std::ops::Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> std::ops::DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

// Safety: the inner data is only reachable through a `SleepLockGuard`, of which at most one can
// exist at a time. So `SleepLock<T>` is safe to share across threads as long as `T` is safe to
// send across threads.
unsafe impl<T> Sync for SleepLock<T> where T: Send {}
unsafe impl<T> Send for SleepLock<T> where T: Send {}
