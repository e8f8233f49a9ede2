//! Background execution and multi-tier caching.
//!
//! This crate lets a client request immutable, possibly expensive-to-produce data, have it
//! computed off the calling thread, and pick it up later through a lightweight handle:
//!
//! - [`jobs`] contains the [`BackgroundExecutor`](jobs::BackgroundExecutor), which runs
//!   prioritized [`Job`](jobs::Job)s on per-queue-class worker threads and tracks each one with
//!   a [`JobController`](jobs::JobController). It also contains the
//!   [`ConcurrentJobRunner`](jobs::ConcurrentJobRunner) for synchronous fan-out/fan-in batches.
//! - [`caching`] contains the non-persistent [`MemoryCache`](caching::MemoryCache), which
//!   coalesces concurrent requests per key, and the crash-safe, size-bounded
//!   [`DiskCache`](caching::DiskCache).
//! - [`services`] wires everything together from a [`Config`](config::Config).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod jobs;
pub mod logging;
pub mod services;
pub mod utils;
