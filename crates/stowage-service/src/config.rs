use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::jobs::QueueClass;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "stowage".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the persistent disk cache.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Namespace for all keys of this cache.
    ///
    /// Multiple logical caches can share one physical directory as long as their prefixes differ.
    pub key_prefix: String,

    /// Upper bound (in bytes) for the total size of all valid entries in this namespace.
    pub size_limit: u64,

    /// How long the cache has to be unused before idle processing kicks in.
    #[serde(with = "humantime_serde")]
    pub idle_after: Duration,

    /// Maximum number of buffered usage records before they are flushed eagerly.
    pub max_pending_usage: usize,

    /// Inserts that have not been finished after this long are considered abandoned.
    #[serde(with = "humantime_serde")]
    pub abandoned_insert_timeout: Duration,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            size_limit: 1024 * 1024 * 1024,
            idle_after: Duration::from_secs(1),
            max_pending_usage: 1024,
            abandoned_insert_timeout: Duration::from_secs(3600),
        }
    }
}

/// Fine-tuning of the in-memory cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Maximum number of computed entries kept in memory.
    ///
    /// Entries that are still being computed do not count towards this limit and are never
    /// evicted.
    pub capacity: u64,

    /// Computed entries that were not accessed for this long are dropped.
    #[serde(with = "humantime_serde")]
    pub time_to_idle: Option<Duration>,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            time_to_idle: Some(Duration::from_secs(3600)),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configure the persistent disk cache.
    pub disk: DiskCacheConfig,
    /// Configure the in-memory cache.
    pub in_memory: InMemoryCacheConfig,
}

/// Sizes of the worker pools, one per [`QueueClass`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Workers for CPU-bound jobs. Defaults to the available hardware concurrency.
    pub compute: Option<usize>,
    /// Workers for jobs that mostly wait on local disk.
    pub disk_io: usize,
    /// Workers for jobs that mostly wait on the network.
    pub network: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            compute: None,
            disk_io: 2,
            network: 4,
        }
    }
}

impl WorkerConfig {
    /// The number of worker threads to spawn for `class`, at least one.
    pub fn workers_for(&self, class: QueueClass) -> usize {
        let configured = match class {
            QueueClass::Compute => self.compute.unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1)
            }),
            QueueClass::DiskIo => self.disk_io,
            QueueClass::Network => self.network,
        };
        configured.max(1)
    }
}

/// The configuration consumed by [`SharedServices`](crate::services::SharedServices).
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the disk cache. Default is not to persist anything.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Fine-tune the caches.
    pub caches: CacheConfigs,

    /// Sizes of the background worker pools.
    pub workers: WorkerConfig,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no caching should happen
    /// and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }

    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(E::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
