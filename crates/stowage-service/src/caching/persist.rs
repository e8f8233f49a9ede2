//! Jobs whose outputs are persisted in a [`DiskCache`].

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::jobs::{Job, JobContext, JobError};

use super::{CacheKey, DiskCache};

/// Conversion of job outputs from and to the bytes stored in a [`DiskCache`].
pub trait DiskCodec: Sized {
    fn encode(&self) -> anyhow::Result<Vec<u8>>;

    fn decode(bytes: Vec<u8>) -> anyhow::Result<Self>;
}

impl DiskCodec for Vec<u8> {
    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn decode(bytes: Vec<u8>) -> anyhow::Result<Self> {
        Ok(bytes)
    }
}

impl DiskCodec for String {
    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: Vec<u8>) -> anyhow::Result<Self> {
        String::from_utf8(bytes).context("cached string is not valid UTF-8")
    }
}

/// Stores any serde-compatible value as JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T: Serialize + DeserializeOwned> DiskCodec for Json<T> {
    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(&self.0).context("failed to serialize cached value")
    }

    fn decode(bytes: Vec<u8>) -> anyhow::Result<Self> {
        serde_json::from_slice(&bytes)
            .map(Json)
            .context("failed to deserialize cached value")
    }
}

/// Wraps a [`Job`] so that its output is read from a [`DiskCache`] when available, and written
/// back to it after computing it otherwise.
///
/// The cache is purely an optimization. Every cache or codec failure is logged and treated as a
/// miss, and failing to write the result back never fails the job.
pub struct PersistedJob<J> {
    key: CacheKey,
    cache: Option<Arc<DiskCache>>,
    inner: J,
}

impl<J> PersistedJob<J>
where
    J: Job,
    J::Output: DiskCodec,
{
    /// Persists the output of `inner` under `key`. Without a `cache`, `inner` simply runs.
    pub fn new(key: CacheKey, cache: Option<Arc<DiskCache>>, inner: J) -> Self {
        Self { key, cache, inner }
    }

    fn load(&self, cache: &DiskCache, disk_key: &str) -> Option<J::Output> {
        let bytes = match cache.read(disk_key) {
            Ok(bytes) => bytes?,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to read `{}` from the disk cache",
                    self.key
                );
                return None;
            }
        };

        match J::Output::decode(bytes) {
            Ok(output) => {
                tracing::trace!("Loaded `{}` from the disk cache", self.key);
                Some(output)
            }
            Err(err) => {
                tracing::warn!("Discarding undecodable cache entry `{}`: {:#}", self.key, err);
                if let Err(err) = cache.remove_entry(disk_key) {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "Failed to remove cache entry"
                    );
                }
                None
            }
        }
    }

    fn store(&self, cache: &DiskCache, disk_key: &str, output: &J::Output) {
        let bytes = match output.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!("Failed to encode `{}`: {:#}", self.key, err);
                return;
            }
        };
        if let Err(err) = cache.insert(disk_key, &bytes) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "Failed to write `{}` to the disk cache",
                self.key
            );
        }
    }
}

impl<J> Job for PersistedJob<J>
where
    J: Job,
    J::Output: DiskCodec,
{
    type Output = J::Output;

    fn execute(&mut self, ctx: &JobContext<'_>) -> Result<Self::Output, JobError> {
        let Some(cache) = self.cache.clone() else {
            return self.inner.execute(ctx);
        };
        let disk_key = self.key.disk_key();

        if let Some(output) = self.load(&cache, &disk_key) {
            return Ok(output);
        }
        ctx.check_in()?;

        let output = self.inner.execute(ctx)?;
        self.store(&cache, &disk_key, &output);
        Ok(output)
    }

    fn name(&self) -> Cow<'static, str> {
        self.inner.name()
    }
}
