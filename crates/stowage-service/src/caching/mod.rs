//! # Caching infrastructure
//!
//! Values that are expensive to produce are cached on two layers:
//!
//! - The [`MemoryCache`] maps a [`CacheKey`] to a computed value, or to the job currently
//!   computing it. It coalesces concurrent requests, so every value is computed at most once per
//!   cache instance. It is not persistent.
//! - The [`DiskCache`] persists byte payloads across process restarts. Inserts go through a
//!   two-phase protocol, so a process dying mid-write never corrupts the cache, and the total
//!   size of each namespace is bounded by evicting the least recently used entries.
//!
//! The layers are connected through [`PersistedJob`], which wraps a job so that it first looks
//! for its output on disk and writes freshly computed outputs back.
//!
//! A request typically goes through these steps:
//! - A [`CachedValue`] handle is [`reset`](CachedValue::reset) to the key.
//! - On miss, [`ensure_loading`](CachedValue::ensure_loading) submits a job, unless another
//!   handle already did.
//! - If that job is a [`PersistedJob`], it tries the disk cache before computing anything.
//! - The owner polls the handle with [`update`](CachedValue::update) until it is ready.
//!
//! ## Errors
//!
//! Caching is strictly an optimization. Every [`CacheError`] can be treated as a miss, and the
//! disk cache may fail entirely without affecting correctness.
//!
//! ## Metrics
//!
//! - `caches.memory.hit`, `caches.memory.coalesced`: Requests served by an existing entry.
//! - `caches.memory.computation`: Jobs submitted by the memory cache.
//! - `caches.memory.abandoned`: Jobs cancelled because no handle waited for them anymore.
//! - `caches.disk.hit`, `caches.disk.miss`: Lookups in the disk cache, tagged with the `prefix`.
//! - `caches.disk.insert`, `caches.disk.entry_size`: Finished inserts and their sizes.
//! - `caches.disk.evicted`, `caches.disk.evicted_bytes`: Entries evicted to honor the size limit.
//! - `caches.disk.corrupt`: Entries whose content did not match their checksum.
//! - `caches.disk.size.files`, `caches.disk.size.bytes`: Gauges reported during idle processing.

mod cache_error;
mod cache_key;
pub(crate) mod cleanup;
pub mod disk;
mod memory;
mod persist;


pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::{CacheKey, CacheKeyBuilder, ToCacheKey};
pub use disk::{DiskCache, IndexRow, IndexStore, IndexTable, JsonIndexStore, SummaryInfo};
pub use memory::{CacheState, CachedValue, MemoryCache};
pub use persist::{DiskCodec, Json, PersistedJob};
