//! A busy-waiting exclusive lock for short critical sections.
//!
//! `SpinLock<T>` guards cache metadata (bucket lists, the eviction arbiter) that is only ever
//! held for O(bucket size) work and never across a suspension point. Unlike the sleep-capable
//! content lock, it never parks the calling thread with the OS scheduler; callers that might
//! block for a while (disk I/O, a contended per-buffer content lock) must drop every
//! `SpinLock` guard first.

use std::cell::UnsafeCell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// An exclusive lock implemented as a CAS loop over an `AtomicBool`.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: `UnsafeCell<T>` is not `Sync`, but it is only ever reachable through a `SpinLockGuard`,
// of which at most one can exist at a time. So `SpinLock<T>` is safe to share across threads as
// long as `T` is safe to send across threads.
unsafe impl<T> Sync for SpinLock<T> where T: Send {}
unsafe impl<T> Send for SpinLock<T> where T: Send {}

/// A guard that releases the spin lock when dropped.
pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spins until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }

            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Consumes the lock and returns the inner data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a reference to the inner data, bypassing the lock.
    ///
    /// # Safety
    /// The caller must ensure no other thread holds (or will concurrently take) a guard.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
