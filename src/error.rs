use thiserror::Error;

/// Errors surfaced across the cache's public API.
///
/// Exhaustion (no evictable buffer) and a content lock held by the wrong caller are programmer
/// errors caught by panics or the type system respectively, not represented here; this enum only
/// wraps what the backing device can legitimately fail to do.
#[derive(Debug, Error)]
pub enum CacheError<E>
where
    E: std::error::Error + 'static,
{
    #[error("block device error: {0}")]
    Device(#[source] E),
}
