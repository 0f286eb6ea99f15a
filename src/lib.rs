//! A concurrent block buffer cache: a bounded pool of fixed-size block buffers sitting between a
//! filesystem layer and a block device, hashed into spin-locked buckets and evicted by an
//! approximate global LRU under a single eviction arbiter.
//!
//! The two lock kinds at the center of this design, [`spinlock::SpinLock`] for cache metadata and
//! [`sleeplock::SleepLock`] for buffer contents, mirror xv6's bio.c, generalized from a single
//! global list into the bucket-sharded, arbiter-serialized structure implemented in [`cache`].

mod buffer;
mod cache;
mod device;
mod error;
mod sleeplock;
mod spinlock;

pub use buffer::BufGuard;
pub use cache::Cache;
pub use device::{BlockDevice, SystemTicks, TickSource};
pub use error::CacheError;

#[cfg(test)]
mod tests;
