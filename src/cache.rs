//! The lookup/admit engine: turns a (dev, block) request into a locked buffer, either by hit,
//! double-checked rescue, or eviction and (possibly) a rehash move into a different bucket.

use std::cell::UnsafeCell;

use tracing::{debug, trace, warn};

use crate::buffer::{BufGuard, SlotData, SlotMeta};
use crate::device::{BlockDevice, TickSource};
use crate::error::CacheError;
use crate::spinlock::{SpinLock, SpinLockGuard};

/// A concurrent, bucket-sharded block buffer cache of `N` fixed-size slots.
///
/// `B` is the number of hash buckets (a small prime, conventionally 13, mirroring the teacher's
/// `BUCKET_SIZE`) and `BSIZE` is the block size in bytes. All three are compile-time tunables,
/// following `param.rs`'s compile-time-constant convention rather than a runtime config struct.
pub struct Cache<D, T, const N: usize, const B: usize, const BSIZE: usize> {
    device: D,
    ticks: T,
    /// Serializes eviction decisions across buckets. Acquired strictly before any bucket lock.
    arbiter: SpinLock<()>,
    /// One spin lock per bucket, guarding that bucket's circular list (including its sentinel,
    /// stored at `meta[N + i]`).
    buckets: [SpinLock<()>; B],
    /// Identity/refcnt/timestamp/list-linkage for every slot, plus one sentinel per bucket at
    /// indices `N..N + B`. Mutated only while holding the lock(s) documented on `meta`/`meta_mut`.
    meta: UnsafeCell<Vec<SlotMeta>>,
    /// Per-slot content: data bytes and validity, each behind its own sleep-capable lock.
    contents: [crate::sleeplock::SleepLock<SlotData<BSIZE>>; N],
}

// Safety: `meta` is only read or written through `meta`/`meta_mut`, both of which require the
// caller to already hold the bucket (and, during reassignment, the arbiter) lock that governs the
// slot in question, the same discipline the rest of this module follows by convention, mirroring
// `SpinLock::get_mut_unchecked`. So `Cache` is safe to share across threads whenever its injected
// collaborators are.
unsafe impl<D, T, const N: usize, const B: usize, const BSIZE: usize> Sync
    for Cache<D, T, N, B, BSIZE>
where
    D: Sync,
    T: Sync,
{
}

impl<D, T, const N: usize, const B: usize, const BSIZE: usize> Cache<D, T, N, B, BSIZE> {
    /// Builds a cache with all `N` buffers initially threaded onto bucket 0's list, unreferenced
    /// and invalid.
    pub fn new(device: D, ticks: T) -> Self {
        assert!(N > 0, "cache must have at least one buffer");
        assert!(B > 0, "cache must have at least one bucket");

        let mut meta = Vec::with_capacity(N + B);
        meta.extend((0..N).map(|_| SlotMeta::empty()));
        for j in 0..B {
            let sentinel = N + j;
            meta.push(SlotMeta {
                prev: sentinel,
                next: sentinel,
                ..SlotMeta::empty()
            });
        }

        let sentinel0 = N;
        for k in 0..N {
            meta[k].prev = if k == 0 { sentinel0 } else { k - 1 };
            meta[k].next = if k == N - 1 { sentinel0 } else { k + 1 };
        }
        meta[sentinel0].next = 0;
        meta[sentinel0].prev = N - 1;

        debug!(n = N, b = B, bsize = BSIZE, "block cache initialized");

        Self {
            device,
            ticks,
            arbiter: SpinLock::new((), "bcache.arbiter"),
            buckets: std::array::from_fn(|_| SpinLock::new((), "bcache.bucket")),
            meta: UnsafeCell::new(meta),
            contents: std::array::from_fn(|_| {
                crate::sleeplock::SleepLock::new(SlotData::empty(), "bcache.content")
            }),
        }
    }

    fn bucket_of(&self, blockno: u64) -> usize {
        (blockno % B as u64) as usize
    }

    /// # Safety
    /// The caller must hold the spin lock (bucket, or arbiter + bucket during reassignment) that
    /// governs slot `idx`.
    unsafe fn meta(&self, idx: usize) -> &SlotMeta {
        unsafe { &(*self.meta.get())[idx] }
    }

    /// # Safety
    /// Same requirement as [`Self::meta`].
    #[allow(clippy::mut_from_ref)]
    unsafe fn meta_mut(&self, idx: usize) -> &mut SlotMeta {
        unsafe { &mut (*self.meta.get())[idx] }
    }

    /// # Safety
    /// Caller must hold `buckets[bucket]`.
    unsafe fn find_in_bucket(&self, bucket: usize, dev: u32, blockno: u64) -> Option<usize> {
        let sentinel = N + bucket;
        let mut cur = unsafe { self.meta(sentinel).next };
        while cur != sentinel {
            let m = unsafe { self.meta(cur) };
            if m.dev == dev && m.blockno == blockno {
                return Some(cur);
            }
            cur = m.next;
        }
        None
    }

    /// # Safety
    /// Caller must hold the bucket lock owning `idx`'s current list membership.
    unsafe fn unlink(&self, idx: usize) {
        let (prev, next) = unsafe {
            let m = self.meta(idx);
            (m.prev, m.next)
        };
        unsafe {
            self.meta_mut(prev).next = next;
            self.meta_mut(next).prev = prev;
        }
    }

    /// # Safety
    /// Caller must hold the bucket lock owning `sentinel`.
    unsafe fn insert_after_sentinel(&self, sentinel: usize, idx: usize) {
        let head = unsafe { self.meta(sentinel).next };
        unsafe {
            self.meta_mut(idx).prev = sentinel;
            self.meta_mut(idx).next = head;
            self.meta_mut(sentinel).next = idx;
            self.meta_mut(head).prev = idx;
        }
    }

    /// The lookup/admit engine (§4.4). Returns a guard with the content lock held; panics if the
    /// pool is exhausted.
    fn get(&self, dev: u32, blockno: u64) -> BufGuard<'_, BSIZE> {
        let i = self.bucket_of(blockno);

        // Phase A: fast hit.
        {
            let bl = self.buckets[i].lock();
            if let Some(slot) = unsafe { self.find_in_bucket(i, dev, blockno) } {
                unsafe {
                    self.meta_mut(slot).refcnt += 1;
                }
                drop(bl);
                trace!(dev, blockno, slot, "bucket hit");
                let guard = self.contents[slot].lock();
                return BufGuard {
                    slot,
                    dev,
                    blockno,
                    guard,
                };
            }
        }

        // Phase B: arbitrated miss.
        let arb = self.arbiter.lock();
        {
            let bl = self.buckets[i].lock();
            if let Some(slot) = unsafe { self.find_in_bucket(i, dev, blockno) } {
                unsafe {
                    self.meta_mut(slot).refcnt += 1;
                }
                drop(bl);
                drop(arb);
                debug!(dev, blockno, slot, "rescued by concurrent admitter");
                let guard = self.contents[slot].lock();
                return BufGuard {
                    slot,
                    dev,
                    blockno,
                    guard,
                };
            }
        }

        trace!(dev, blockno, bucket = i, "victim scan starting");

        let mut victim: Option<usize> = None;
        let mut victim_bucket: Option<usize> = None;
        let mut best_ts = u64::MAX;
        let mut retained: Option<SpinLockGuard<'_, ()>> = None;

        for j in 0..B {
            let bl = self.buckets[j].lock();
            let sentinel = N + j;
            let mut cur = unsafe { self.meta(sentinel).next };
            let mut found_here = false;

            while cur != sentinel {
                let (refcnt, ts, next) = unsafe {
                    let m = self.meta(cur);
                    (m.refcnt, m.timestamp, m.next)
                };
                if refcnt == 0 && ts < best_ts {
                    best_ts = ts;
                    victim = Some(cur);
                    victim_bucket = Some(j);
                    found_here = true;
                }
                cur = next;
            }

            if found_here {
                // Drops whatever bucket lock was previously retained.
                retained = Some(bl);
            }
        }

        let (t_lock, victim_idx, t) = match (retained, victim, victim_bucket) {
            (Some(lock), Some(idx), Some(bucket)) => (lock, idx, bucket),
            _ => {
                drop(arb);
                panic!("block cache exhausted: no evictable buffer for ({dev}, {blockno})");
            }
        };

        debug!(
            dev,
            blockno,
            slot = victim_idx,
            from_bucket = t,
            to_bucket = i,
            "evicting victim"
        );

        // Safety: refcnt was 0 under t_lock, so no other thread holds or can acquire this slot's
        // content lock until we raise refcnt below; mutating the content-lock-protected `valid`
        // flag ahead of formally taking the lock is the same escape hatch `SleepLock` documents.
        unsafe {
            self.contents[victim_idx].get_mut_unchecked().valid = false;
        }
        unsafe {
            let m = self.meta_mut(victim_idx);
            m.dev = dev;
            m.blockno = blockno;
            m.refcnt = 1;
        }

        if t != i {
            unsafe {
                self.unlink(victim_idx);
            }
        }
        drop(t_lock);

        if t != i {
            warn!(dev, blockno, slot = victim_idx, from_bucket = t, to_bucket = i, "rehash move");
            let bl_i = self.buckets[i].lock();
            unsafe {
                self.insert_after_sentinel(N + i, victim_idx);
            }
            drop(bl_i);
        }

        drop(arb);

        let guard = self.contents[victim_idx].lock();
        BufGuard {
            slot: victim_idx,
            dev,
            blockno,
            guard,
        }
    }

    /// Decrements `refcnt` for `slot`; if it reaches zero, stamps `timestamp` with the current
    /// tick. Used by `release`, which retires the buffer into the LRU pool.
    fn drop_ref_timestamped(&self, slot: usize, dev: u32, blockno: u64)
    where
        T: TickSource,
    {
        let bucket = self.bucket_of(blockno);
        let bl = self.buckets[bucket].lock();
        let refcnt = unsafe {
            let m = self.meta_mut(slot);
            m.refcnt -= 1;
            m.refcnt
        };
        if refcnt == 0 {
            let now = self.ticks.now();
            unsafe {
                self.meta_mut(slot).timestamp = now;
            }
            trace!(dev, blockno, slot, "buffer now unreferenced");
        }
        drop(bl);
    }

    /// Decrements `refcnt` for `slot` without touching `timestamp`. Used by `unpin`: the buffer
    /// may still be held by the caller's own outstanding guard.
    fn unpin_ref(&self, slot: usize, blockno: u64) {
        let bucket = self.bucket_of(blockno);
        let bl = self.buckets[bucket].lock();
        unsafe {
            self.meta_mut(slot).refcnt -= 1;
        }
        drop(bl);
    }

    /// Increments `refcnt` for `slot` under its owning bucket's lock, without touching the
    /// content lock.
    fn add_ref(&self, slot: usize, blockno: u64) {
        let bucket = self.bucket_of(blockno);
        let bl = self.buckets[bucket].lock();
        unsafe {
            self.meta_mut(slot).refcnt += 1;
        }
        drop(bl);
    }

    /// Reads the current `refcnt` for (dev, blockno), for tests that need to observe it directly.
    #[cfg(test)]
    pub(crate) fn debug_refcnt(&self, dev: u32, blockno: u64) -> usize {
        let bucket = self.bucket_of(blockno);
        let bl = self.buckets[bucket].lock();
        let slot = unsafe { self.find_in_bucket(bucket, dev, blockno) }
            .expect("buffer must be resident");
        let refcnt = unsafe { self.meta(slot).refcnt };
        drop(bl);
        refcnt
    }
}

impl<D, T, const N: usize, const B: usize, const BSIZE: usize> Cache<D, T, N, B, BSIZE>
where
    D: BlockDevice,
    D::Error: std::error::Error + 'static,
    T: TickSource,
{
    /// Returns a handle for (dev, block) with its content lock held, loading from the device if
    /// this is the first time the block has been cached.
    pub fn read(&self, dev: u32, blockno: u64) -> Result<BufGuard<'_, BSIZE>, CacheError<D::Error>> {
        let mut guard = self.get(dev, blockno);
        if !guard.guard.valid {
            if let Err(err) = self.device.read_block(dev, blockno, &mut guard.guard.data) {
                // The caller never receives this guard, so nobody can call `release` on it.
                // Drop the content lock and undo the refcnt bump `get` made, or the slot would
                // stay pinned forever on a transient device error.
                let slot = guard.slot;
                drop(guard.guard);
                self.drop_ref_timestamped(slot, dev, blockno);
                return Err(CacheError::Device(err));
            }
            guard.guard.valid = true;
        }
        Ok(guard)
    }

    /// Flushes the guarded block's bytes to the device. The content lock is held by construction
    /// of `guard`, so there is no runtime check to fail here.
    pub fn write(&self, guard: &BufGuard<'_, BSIZE>) -> Result<(), CacheError<D::Error>> {
        self.device
            .write_block(guard.dev, guard.blockno, &guard.guard.data)
            .map_err(CacheError::Device)
    }

    /// Releases the content lock and decrements `refcnt`. `guard` is consumed so it cannot be
    /// used afterward.
    pub fn release(&self, guard: BufGuard<'_, BSIZE>) {
        let (slot, dev, blockno) = (guard.slot, guard.dev, guard.blockno);
        drop(guard.guard);
        self.drop_ref_timestamped(slot, dev, blockno);
    }

    /// Raises `refcnt` without touching the content lock, keeping the buffer resident even once
    /// the caller's own guard is released.
    pub fn pin(&self, guard: &BufGuard<'_, BSIZE>) {
        self.add_ref(guard.slot, guard.blockno);
    }

    /// Lowers `refcnt` without touching the content lock.
    pub fn unpin(&self, guard: &BufGuard<'_, BSIZE>) {
        self.unpin_ref(guard.slot, guard.blockno);
    }
}
