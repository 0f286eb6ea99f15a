//! End-to-end scenarios exercised against an in-memory device fake, in the spirit of the
//! retrieval pack's own `MockBlockDevice`-backed block cache tests.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, Once};

use crate::{BlockDevice, Cache, SystemTicks};

const BSIZE: usize = 512;

static TRACING_INIT: Once = Once::new();

/// Makes the trace/debug/warn events emitted by `cache.rs` visible under `cargo test -- --nocapture`
/// (filtered by `RUST_LOG`), matching how the teacher's own `main.rs` set up `printf` once at boot.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

struct FakeDeviceInner {
    storage: Mutex<HashMap<(u32, u64), [u8; BSIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

#[derive(Clone)]
struct FakeDevice(Arc<FakeDeviceInner>);

impl FakeDevice {
    fn new() -> Self {
        Self(Arc::new(FakeDeviceInner {
            storage: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }))
    }

    fn read_count(&self) -> usize {
        self.0.reads.load(Ordering::SeqCst)
    }
}

impl BlockDevice for FakeDevice {
    type Error = Infallible;

    fn read_block(&self, dev: u32, blockno: u64, buf: &mut [u8]) -> Result<(), Infallible> {
        self.0.reads.fetch_add(1, Ordering::SeqCst);
        let storage = self.0.storage.lock().unwrap();
        match storage.get(&(dev, blockno)) {
            Some(block) => buf.copy_from_slice(block),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, dev: u32, blockno: u64, buf: &[u8]) -> Result<(), Infallible> {
        self.0.writes.fetch_add(1, Ordering::SeqCst);
        let mut block = [0u8; BSIZE];
        block.copy_from_slice(buf);
        self.0.storage.lock().unwrap().insert((dev, blockno), block);
        Ok(())
    }
}

type TestCache<const N: usize, const B: usize> = Cache<FakeDevice, SystemTicks, N, B, BSIZE>;

#[derive(Debug, thiserror::Error)]
#[error("simulated device failure")]
struct FailingDeviceError;

/// A device whose reads always fail, for exercising the error path of `read`.
struct FailingDevice;

impl BlockDevice for FailingDevice {
    type Error = FailingDeviceError;

    fn read_block(&self, _dev: u32, _blockno: u64, _buf: &mut [u8]) -> Result<(), Self::Error> {
        Err(FailingDeviceError)
    }

    fn write_block(&self, _dev: u32, _blockno: u64, _buf: &[u8]) -> Result<(), Self::Error> {
        Err(FailingDeviceError)
    }
}

#[test]
fn hit_path_returns_same_slot_with_written_data() {
    init_tracing();
    let cache = TestCache::<3, 13>::new(FakeDevice::new(), SystemTicks::new());

    let mut h = cache.read(1, 7).unwrap();
    h.data_mut().fill(0xAA);
    cache.write(&h).unwrap();
    let slot = h.slot;
    cache.release(h);

    let h2 = cache.read(1, 7).unwrap();
    assert_eq!(h2.slot, slot, "second read should hit the same slot, not evict");
    assert!(h2.data().iter().all(|&b| b == 0xAA));
    cache.release(h2);
}

#[test]
fn eviction_reuses_oldest_unreferenced_slot_in_same_bucket() {
    init_tracing();
    let cache = TestCache::<3, 13>::new(FakeDevice::new(), SystemTicks::new());

    let h1 = cache.read(1, 1).unwrap();
    let slot1 = h1.slot;
    cache.release(h1);

    let h2 = cache.read(1, 2).unwrap();
    let slot2 = h2.slot;
    cache.release(h2);

    let h3 = cache.read(1, 3).unwrap();
    let slot3 = h3.slot;
    cache.release(h3);

    // (1, 14) hashes to the same bucket as (1, 1): 14 % 13 == 1 == 1 % 13.
    let h4 = cache.read(1, 14).unwrap();
    assert_eq!(h4.slot, slot1, "the oldest unreferenced buffer should be recycled");
    cache.release(h4);

    let h2_again = cache.read(1, 2).unwrap();
    assert_eq!(h2_again.slot, slot2, "unrelated buckets must be untouched by the eviction");
    cache.release(h2_again);

    let h3_again = cache.read(1, 3).unwrap();
    assert_eq!(h3_again.slot, slot3);
    cache.release(h3_again);
}

#[test]
fn eviction_can_move_the_victim_into_a_different_bucket() {
    init_tracing();
    let cache = TestCache::<2, 13>::new(FakeDevice::new(), SystemTicks::new());

    let h1 = cache.read(1, 1).unwrap(); // bucket 1
    let slot1 = h1.slot;
    cache.release(h1);

    let h2 = cache.read(1, 2).unwrap(); // bucket 2, kept pinned for the rest of the test
    let slot2 = h2.slot;
    assert_ne!(slot1, slot2);

    // (3, 26) hashes to bucket 0; the only evictable slot lives in bucket 1.
    let h3 = cache.read(3, 26).unwrap();
    assert_eq!(h3.slot, slot1, "the unreferenced slot from bucket 1 should be relinked into bucket 0");
    cache.release(h3);

    cache.release(h2);
}

#[test]
fn concurrent_misses_on_the_same_block_are_rescued_onto_one_slot() {
    init_tracing();
    let device = FakeDevice::new();
    let probe = device.clone();
    let cache = Arc::new(TestCache::<4, 13>::new(device, SystemTicks::new()));
    let barrier = Arc::new(Barrier::new(2));

    let (c1, b1) = (cache.clone(), barrier.clone());
    let t1 = std::thread::spawn(move || {
        b1.wait();
        c1.read(1, 99).unwrap().slot
    });
    let (c2, b2) = (cache.clone(), barrier.clone());
    let t2 = std::thread::spawn(move || {
        b2.wait();
        c2.read(1, 99).unwrap().slot
    });

    let slot1 = t1.join().unwrap();
    let slot2 = t2.join().unwrap();

    assert_eq!(slot1, slot2, "both threads must end up with the same slot");
    assert_eq!(probe.read_count(), 1, "the device must be read exactly once");
    assert_eq!(cache.debug_refcnt(1, 99), 2);
}

#[test]
#[should_panic(expected = "block cache exhausted")]
fn exhausting_the_pool_panics() {
    init_tracing();
    let cache = TestCache::<2, 13>::new(FakeDevice::new(), SystemTicks::new());

    let h1 = cache.read(1, 1).unwrap();
    let h2 = cache.read(1, 2).unwrap();
    let _h3 = cache.read(1, 3).unwrap(); // no unreferenced slot left to evict

    cache.release(h1);
    cache.release(h2);
}

#[test]
fn pin_keeps_a_buffer_resident_across_its_own_release() {
    init_tracing();
    let cache = TestCache::<2, 13>::new(FakeDevice::new(), SystemTicks::new());

    let h = cache.read(1, 5).unwrap();
    let slot = h.slot;
    cache.pin(&h);
    cache.release(h);

    assert_eq!(cache.debug_refcnt(1, 5), 1, "pin should outlive the matching release");

    let h2 = cache.read(1, 5).unwrap();
    assert_eq!(h2.slot, slot, "no device I/O should be needed to find a still-resident buffer");
    cache.unpin(&h2);
    cache.release(h2);

    assert_eq!(cache.debug_refcnt(1, 5), 0);
}

#[test]
fn failed_read_does_not_leak_a_pinned_slot() {
    init_tracing();
    let cache = Cache::<FailingDevice, SystemTicks, 2, 13, BSIZE>::new(FailingDevice, SystemTicks::new());

    assert!(cache.read(1, 1).is_err());
    assert_eq!(cache.debug_refcnt(1, 1), 0, "a failed read must not leave the slot pinned");

    // The slot must be evictable again, not stuck exhausted by the earlier failure.
    assert!(cache.read(2, 2).is_err());
    assert!(cache.read(3, 3).is_err());
}
