//! External collaborators the cache consumes but does not implement.
//!
//! These trait boundaries stand in for the teacher's `virtio_disk_rw` and the kernel's `ticks`
//! global: the cache only ever calls through them, so tests can swap in an in-memory fake
//! without a disk or interrupt controller.

use std::sync::atomic::{AtomicU64, Ordering};

/// A block-addressable storage device.
///
/// Implementations are expected to block the calling thread until the transfer completes; the
/// cache never calls these from within a spin lock.
pub trait BlockDevice {
    type Error;

    /// Reads block `blockno` of device `dev` into `buf`. `buf.len()` equals the cache's `BSIZE`.
    fn read_block(&self, dev: u32, blockno: u64, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Writes `buf` to block `blockno` of device `dev`.
    fn write_block(&self, dev: u32, blockno: u64, buf: &[u8]) -> Result<(), Self::Error>;
}

/// A monotonically non-decreasing logical clock used to timestamp a buffer's last release.
pub trait TickSource {
    fn now(&self) -> u64;
}

/// A `TickSource` backed by a process-wide atomic counter, incremented on every read.
///
/// Good enough for tests and for embedders with no hardware tick source of their own; it is not
/// wall-clock time, only a strictly-advancing ordering.
#[derive(Debug, Default)]
pub struct SystemTicks {
    counter: AtomicU64,
}

impl SystemTicks {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl TickSource for SystemTicks {
    fn now(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}
