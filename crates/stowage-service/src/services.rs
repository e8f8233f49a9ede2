//! Creates the executor and the caches from a [`Config`].
//!
//! [`SharedServices`] is the single bootstrap entry point. It owns the
//! [`BackgroundExecutor`], the [`MemoryCache`] submitting jobs to it, and the [`DiskCache`] if
//! one is configured.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::{DiskCache, MemoryCache};
use crate::config::Config;
use crate::jobs::BackgroundExecutor;
use crate::metrics;

/// The subdirectory of [`Config::cache_dir`] holding the disk cache.
const DISK_CACHE_DIR: &str = "disk";

pub struct SharedServices {
    pub executor: BackgroundExecutor,
    /// `None` when no `cache_dir` is configured.
    pub disk: Option<Arc<DiskCache>>,
    pub memory: MemoryCache,
}

impl SharedServices {
    pub fn create(config: &Config) -> Result<Self> {
        if let Some(statsd) = &config.metrics.statsd {
            metrics::configure_statsd(
                &config.metrics.prefix,
                statsd.as_str(),
                config.metrics.custom_tags.clone(),
            )
            .context("failed to configure statsd")?;
        }

        let executor =
            BackgroundExecutor::new(&config.workers).context("failed to spawn background workers")?;

        let disk = match config.cache_dir(DISK_CACHE_DIR) {
            Some(dir) => {
                let cache = DiskCache::open(&dir, &config.caches.disk)
                    .with_context(|| format!("failed to open disk cache at `{}`", dir.display()))?;
                Some(Arc::new(cache))
            }
            None => {
                tracing::info!("No cache directory configured, nothing will be persisted");
                None
            }
        };

        let memory = MemoryCache::new(&config.caches.in_memory, executor.submitter());

        Ok(Self {
            executor,
            disk,
            memory,
        })
    }

    /// Performs deferred maintenance of the disk cache once it is idle.
    ///
    /// Meant to be called regularly by the owner loop. Failures are logged, never returned.
    pub fn do_idle_processing(&self) {
        let Some(disk) = &self.disk else {
            return;
        };
        match disk.do_idle_processing() {
            Ok(true) => tracing::trace!("Disk cache idle processing done"),
            Ok(false) => {}
            Err(err) => tracing::error!(
                error = &err as &dyn std::error::Error,
                "Disk cache idle processing failed"
            ),
        }
    }
}

impl std::fmt::Debug for SharedServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedServices")
            .field("executor", &self.executor)
            .field("disk", &self.disk)
            .field("memory", &self.memory)
            .finish()
    }
}
