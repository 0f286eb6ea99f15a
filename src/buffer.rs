//! Per-slot state: the bucket-lock-protected identity/list metadata, and the content-lock-
//! protected data payload, plus the guard type that proves the content lock is held.

use crate::sleeplock::SleepLockGuard;

/// Identity, reference count, recency, and list linkage for one pool slot.
///
/// Protected by the owning bucket's spin lock, except during reassignment on eviction where the
/// arbiter lock is additionally required (I6). Also used, at indices `N..N+B`, as the per-bucket
/// sentinel: for a sentinel, only `prev`/`next` are meaningful (the head/tail of that bucket's
/// circular list).
pub(crate) struct SlotMeta {
    pub dev: u32,
    pub blockno: u64,
    pub refcnt: usize,
    pub timestamp: u64,
    pub prev: usize,
    pub next: usize,
}

impl SlotMeta {
    pub(crate) const fn empty() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            timestamp: 0,
            prev: 0,
            next: 0,
        }
    }
}

/// The payload guarded by a slot's content lock: the cached bytes and whether they currently
/// reflect the device.
pub(crate) struct SlotData<const BSIZE: usize> {
    pub valid: bool,
    pub data: [u8; BSIZE],
}

impl<const BSIZE: usize> SlotData<BSIZE> {
    pub(crate) const fn empty() -> Self {
        Self {
            valid: false,
            data: [0u8; BSIZE],
        }
    }
}

/// A handle to a cached block whose content lock is held.
///
/// Owning one of these is the only way to read or write a block's bytes: the sleep-lock guard
/// inside it is the proof, checked by the compiler rather than at runtime, that the lock backing
/// `dev`/`blockno` is held by the current thread.
pub struct BufGuard<'a, const BSIZE: usize> {
    pub(crate) slot: usize,
    pub(crate) dev: u32,
    pub(crate) blockno: u64,
    pub(crate) guard: SleepLockGuard<'a, SlotData<BSIZE>>,
}

impl<const BSIZE: usize> BufGuard<'_, BSIZE> {
    /// The device this buffer was loaded from.
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// The block number this buffer holds.
    pub fn blockno(&self) -> u64 {
        self.blockno
    }

    /// The cached block's bytes. Reflects the device once `read` has returned.
    pub fn data(&self) -> &[u8] {
        &self.guard.data
    }

    /// Mutable access to the cached block's bytes, for callers that want to modify them before
    /// a subsequent `write`.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard.data
    }
}
