//! # Disk cache
//!
//! A persistent, crash-safe and size-bounded store of immutable byte payloads keyed by string.
//!
//! Entries are written with a two-phase insert:
//!
//! 1. [`DiskCache::initiate_insert`] reserves an id together with an *invalid* index row.
//! 2. The caller writes the payload to [`DiskCache::get_path_for_id`], outside of any lock.
//! 3. [`DiskCache::finish_insert`] marks the row valid and records its checksum.
//!
//! Lookups only ever return valid rows. A process dying between steps 1 and 3 leaves an invalid
//! row behind, which is never served and swept the next time the directory is opened.
//!
//! Usage timestamps are buffered in memory and written to the index in batches: when the cache
//! is idle, when the buffer is full, when explicitly asked to, and when the cache is dropped.
//!
//! Multiple caches with different [`key_prefix`](crate::config::DiskCacheConfig::key_prefix)es
//! can share one directory. Within a process they also share one index.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use once_cell::sync::Lazy;

use crate::config::DiskCacheConfig;
use crate::utils::defer::defer;

use super::cleanup::{remove_stale_index_files, select_abandoned, select_evictions, sweep_orphans};
use super::{CacheEntry, CacheError};

mod index;
pub(crate) mod layout;
mod usage;

pub use index::{IndexRow, IndexStore, IndexTable, JsonIndexStore, Namespace};
use layout::{catch_not_found, content_path, persist_tempfile, remove_content_file};
use usage::{ActivityTracker, UsageBuffer, UsageClock, UsageRecord};

/// All directories opened by this process, so that caches sharing a directory share its index.
static DIRECTORIES: Lazy<Mutex<HashMap<PathBuf, Weak<SharedDirectory>>>> =
    Lazy::new(Default::default);

/// The number and total size of the valid entries of a cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SummaryInfo {
    pub entry_count: u64,
    pub total_size: u64,
}

/// Journals shorter than this are never compacted.
const MIN_COMPACTION_JOURNAL_LEN: usize = 1024;

struct IndexState {
    table: IndexTable,
    store: Box<dyn IndexStore>,
}

impl IndexState {
    /// Applies `f` to the table and commits the changes it made.
    ///
    /// When the commit fails, the table is reloaded from the store which undoes `f`.
    fn transaction<R>(&mut self, f: impl FnOnce(&mut IndexTable) -> R) -> CacheEntry<R> {
        let result = f(&mut self.table);
        let changes = self.table.take_changes();
        if changes.is_empty() {
            return Ok(result);
        }
        if let Err(err) = self.store.append(&changes) {
            self.rollback();
            return Err(err);
        }
        Ok(result)
    }

    /// Folds the journal into a fresh snapshot once it outgrows the table.
    fn maybe_compact(&mut self) {
        if self.store.journal_len() > self.table.len().max(MIN_COMPACTION_JOURNAL_LEN) {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let journal_len = self.store.journal_len();
        match self.store.compact(&self.table) {
            Ok(()) => tracing::debug!("Compacted {} journaled index changes", journal_len),
            // the journal stays valid, so this is retried later
            Err(err) => tracing::warn!(
                error = &err as &dyn std::error::Error,
                "Failed to compact cache index"
            ),
        }
    }

    fn rollback(&mut self) {
        match self.store.load() {
            Ok(table) => self.table = table,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to reload cache index, dropping all entries"
                );
                // ids must never be reused, so keep the table and only drop its rows
                self.table.retain(|_| false);
                self.table.take_changes();
            }
        }
    }
}

fn apply_usage(table: &mut IndexTable, records: &[UsageRecord]) {
    for record in records {
        table.update_by_id(record.id, |row| {
            row.last_used = row.last_used.max(record.timestamp);
        });
    }
}

/// The state of one cache directory, shared by all caches opened on it.
struct SharedDirectory {
    dir: PathBuf,
    index: Mutex<IndexState>,
    usage: UsageBuffer,
    clock: UsageClock,
    activity: ActivityTracker,
}

impl SharedDirectory {
    fn open(dir: PathBuf, store: Box<dyn IndexStore>) -> CacheEntry<Self> {
        let table = match store.load() {
            Ok(table) => table,
            Err(CacheError::MalformedIndex(details)) => {
                tracing::warn!(
                    "Discarding malformed cache index in `{}`: {}",
                    dir.display(),
                    details
                );
                IndexTable::default()
            }
            Err(err) => return Err(err),
        };
        let mut state = IndexState { table, store };

        // No insert of a previous process can ever be finished.
        let abandoned = state.transaction(|table| table.retain(|row| row.valid))?;
        state.compact();
        let orphans = match sweep_orphans(&dir, |id| state.table.contains_id(id)) {
            Ok(stats) => stats.removed_files,
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", dir.display().to_string().into()),
                    || tracing::error!("Failed to sweep cache directory: {:?}", e),
                );
                0
            }
        };
        if let Err(e) = remove_stale_index_files(&dir) {
            tracing::warn!("Failed to remove stale index files: {:?}", e);
        }

        tracing::info!(
            "Opened disk cache at `{}`, swept {} abandoned inserts and {} orphaned files",
            dir.display(),
            abandoned.len(),
            orphans
        );

        let clock = UsageClock::new(state.table.latest_timestamp());
        Ok(Self {
            dir,
            index: Mutex::new(state),
            usage: UsageBuffer::default(),
            clock,
            activity: ActivityTracker::new(),
        })
    }
}

enum FinishOutcome {
    Finished { evicted: Vec<IndexRow> },
    AlreadyFinished,
    Missing,
}

/// A persistent cache of byte payloads, see the [module docs](self).
///
/// All operations are internally synchronized, and every one of them may fail with a
/// [`CacheError`]. Callers must be able to fall back to computing a value when that happens.
pub struct DiskCache {
    shared: Arc<SharedDirectory>,
    config: DiskCacheConfig,
}

impl DiskCache {
    /// Opens, or creates, the cache in `dir`.
    ///
    /// The first cache opened on a directory sweeps invalid rows and orphaned content files
    /// left behind by a previous process.
    pub fn open(dir: impl AsRef<Path>, config: &DiskCacheConfig) -> CacheEntry<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let dir = dir.canonicalize()?;

        let mut directories = DIRECTORIES.lock().unwrap_or_else(PoisonError::into_inner);
        directories.retain(|_, shared| shared.strong_count() > 0);
        let shared = match directories.get(&dir).and_then(Weak::upgrade) {
            Some(shared) => shared,
            None => {
                let store = Box::new(JsonIndexStore::new(&dir));
                let shared = Arc::new(SharedDirectory::open(dir.clone(), store)?);
                directories.insert(dir, Arc::downgrade(&shared));
                shared
            }
        };
        drop(directories);

        Ok(Self {
            shared,
            config: config.clone(),
        })
    }

    /// Opens a cache on a custom [`IndexStore`], without sharing the directory state.
    #[cfg(test)]
    pub(crate) fn open_with_store(
        dir: &Path,
        config: &DiskCacheConfig,
        store: Box<dyn IndexStore>,
    ) -> CacheEntry<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            shared: Arc::new(SharedDirectory::open(dir.to_owned(), store)?),
            config: config.clone(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn key_prefix(&self) -> &str {
        &self.config.key_prefix
    }

    fn metric_tag(&self) -> &str {
        match self.key_prefix() {
            "" => "default",
            prefix => prefix,
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.shared
            .index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up the id and checksum of the valid entry for `key`.
    pub fn entry_exists(&self, key: &str) -> CacheEntry<Option<(u64, u32)>> {
        self.shared.activity.touch();
        let found = self
            .lock()
            .table
            .get(self.key_prefix(), key)
            .filter(|row| row.valid)
            .map(|row| (row.id, row.crc32));

        if found.is_some() {
            metric!(counter("caches.disk.hit") += 1, "prefix" => self.metric_tag());
        } else {
            metric!(counter("caches.disk.miss") += 1, "prefix" => self.metric_tag());
        }
        Ok(found)
    }

    /// Reserves an id for a new entry of `key`.
    ///
    /// Any previous entry of `key` is replaced right away. The new entry stays invisible until
    /// [`finish_insert`](Self::finish_insert) is called.
    pub fn initiate_insert(&self, key: &str) -> CacheEntry<u64> {
        self.shared.activity.touch();
        let now = self.shared.clock.now();
        let prefix = self.key_prefix();

        let (id, replaced) = self.lock().transaction(|table| {
            let id = table.allocate_id();
            let row = IndexRow {
                id,
                size: 0,
                crc32: 0,
                valid: false,
                created: now,
                last_used: now,
            };
            (id, table.insert(prefix, key, row))
        })?;

        if let Some(replaced) = replaced {
            tracing::trace!("Replacing cache entry {} of `{}`", replaced.id, key);
            remove_content_file(&self.get_path_for_id(replaced.id));
        }

        let path = self.get_path_for_id(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(id)
    }

    /// The path the content of entry `id` is written to and read from.
    pub fn get_path_for_id(&self, id: u64) -> PathBuf {
        content_path(&self.shared.dir, id)
    }

    /// Makes the entry `id` visible, recording the `crc32` of its content.
    ///
    /// This evicts the least recently used entries until the cache fits into its size limit
    /// again. The entry being finished is never evicted. If the entry no longer exists, because
    /// it was replaced, removed or cleared in the meantime, its content file is deleted and this
    /// fails with [`CacheError::NotFound`].
    pub fn finish_insert(&self, id: u64, crc32: u32) -> CacheEntry<()> {
        self.shared.activity.touch();
        let path = self.get_path_for_id(id);
        let size = match catch_not_found(|| fs::metadata(&path))? {
            Some(metadata) => metadata.len(),
            None => return Err(CacheError::NotFound),
        };

        let pending = self.shared.usage.take();
        let now = self.shared.clock.now();
        let prefix = self.key_prefix();
        let size_limit = self.config.size_limit;

        let outcome = self.lock().transaction(|table| {
            apply_usage(table, &pending);
            if table.locate(id).is_none_or(|(p, _)| p != prefix) {
                return FinishOutcome::Missing;
            }
            match table.get_by_id(id) {
                None => return FinishOutcome::Missing,
                Some(row) if row.valid => return FinishOutcome::AlreadyFinished,
                Some(_) => {}
            }
            table.update_by_id(id, |row| {
                row.valid = true;
                row.size = size;
                row.crc32 = crc32;
                row.last_used = now;
            });

            let evicted = table
                .namespace(prefix)
                .map(|rows| select_evictions(rows, size_limit, Some(id)))
                .unwrap_or_default()
                .into_iter()
                .filter_map(|key| table.remove(prefix, &key))
                .collect();
            FinishOutcome::Finished { evicted }
        })?;

        match outcome {
            FinishOutcome::Missing => {
                tracing::debug!("Cache entry {} vanished before it was finished", id);
                remove_content_file(&path);
                Err(CacheError::NotFound)
            }
            FinishOutcome::AlreadyFinished => Ok(()),
            FinishOutcome::Finished { evicted } => {
                metric!(counter("caches.disk.insert") += 1, "prefix" => self.metric_tag());
                metric!(time_raw("caches.disk.entry_size") = size, "prefix" => self.metric_tag());
                if !evicted.is_empty() {
                    let evicted_bytes: u64 = evicted.iter().map(|row| row.size).sum();
                    tracing::debug!(
                        "Evicted {} entries ({} bytes) from `{}`",
                        evicted.len(),
                        evicted_bytes,
                        self.dir().display()
                    );
                    for row in &evicted {
                        remove_content_file(&self.get_path_for_id(row.id));
                    }
                    metric!(counter("caches.disk.evicted") += evicted.len() as i64, "prefix" => self.metric_tag());
                    metric!(counter("caches.disk.evicted_bytes") += evicted_bytes as i64, "prefix" => self.metric_tag());
                }
                Ok(())
            }
        }
    }

    /// Records that entry `id` was just used.
    ///
    /// The update is buffered, and only written once the cache is idle or the buffer is full.
    pub fn record_usage(&self, id: u64) -> CacheEntry<()> {
        self.shared.activity.touch();
        let record = UsageRecord {
            id,
            timestamp: self.shared.clock.now(),
        };
        if self
            .shared
            .usage
            .push(record, self.config.max_pending_usage.max(1))
        {
            self.write_usage_records()?;
        }
        Ok(())
    }

    /// Writes all buffered usage records to the index.
    pub fn write_usage_records(&self) -> CacheEntry<()> {
        let records = self.shared.usage.take();
        if records.is_empty() {
            return Ok(());
        }
        self.lock()
            .transaction(|table| apply_usage(table, &records))?;
        tracing::trace!("Wrote {} usage records", records.len());
        Ok(())
    }

    /// Performs deferred maintenance once the cache was not used for
    /// [`idle_after`](DiskCacheConfig::idle_after).
    ///
    /// This writes buffered usage records and sweeps inserts that were abandoned for longer
    /// than [`abandoned_insert_timeout`](DiskCacheConfig::abandoned_insert_timeout). Returns
    /// whether the cache was idle.
    pub fn do_idle_processing(&self) -> CacheEntry<bool> {
        if self.shared.activity.idle_for() < self.config.idle_after {
            return Ok(false);
        }
        self.write_usage_records()?;
        self.lock().maybe_compact();

        let now = self.shared.clock.now();
        let prefix = self.key_prefix();
        let abandoned = {
            let mut index = self.lock();
            let keys = index
                .table
                .namespace(prefix)
                .map(|rows| select_abandoned(rows, now, self.config.abandoned_insert_timeout))
                .unwrap_or_default();
            if keys.is_empty() {
                Vec::new()
            } else {
                index.transaction(|table| {
                    keys.iter()
                        .filter_map(|key| table.remove(prefix, key))
                        .collect::<Vec<_>>()
                })?
            }
        };
        if !abandoned.is_empty() {
            tracing::info!("Swept {} abandoned inserts", abandoned.len());
            for row in &abandoned {
                remove_content_file(&self.get_path_for_id(row.id));
            }
        }

        let summary = self.get_summary_info()?;
        metric!(gauge("caches.disk.size.files") = summary.entry_count, "prefix" => self.metric_tag());
        metric!(gauge("caches.disk.size.bytes") = summary.total_size, "prefix" => self.metric_tag());
        Ok(true)
    }

    /// The number and total size of all valid entries.
    pub fn get_summary_info(&self) -> CacheEntry<SummaryInfo> {
        let index = self.lock();
        let mut summary = SummaryInfo::default();
        for row in index
            .table
            .namespace(self.key_prefix())
            .into_iter()
            .flat_map(|rows| rows.values())
            .filter(|row| row.valid)
        {
            summary.entry_count += 1;
            summary.total_size += row.size;
        }
        Ok(summary)
    }

    /// Removes the entry of `key`, returning whether there was one.
    pub fn remove_entry(&self, key: &str) -> CacheEntry<bool> {
        self.shared.activity.touch();
        let prefix = self.key_prefix();
        let removed = {
            let mut index = self.lock();
            if index.table.get(prefix, key).is_none() {
                return Ok(false);
            }
            index.transaction(|table| table.remove(prefix, key))?
        };
        if let Some(row) = removed {
            remove_content_file(&self.get_path_for_id(row.id));
        }
        Ok(removed.is_some())
    }

    /// Removes the row with `id` if `condition` holds for it, along with its content.
    fn remove_id_if(&self, id: u64, condition: impl FnOnce(&IndexRow) -> bool) -> CacheEntry<bool> {
        let removed = {
            let mut index = self.lock();
            let matches = index
                .table
                .get_by_id(id)
                .is_some_and(condition);
            if !matches {
                return Ok(false);
            }
            index.transaction(|table| table.remove_by_id(id))?
        };
        remove_content_file(&self.get_path_for_id(id));
        Ok(removed.is_some())
    }

    /// Removes all entries of this cache and their content.
    pub fn clear(&self) -> CacheEntry<()> {
        self.shared.activity.touch();
        let prefix = self.key_prefix();
        let removed = self
            .lock()
            .transaction(|table| table.clear_namespace(prefix))?;
        for row in &removed {
            remove_content_file(&self.get_path_for_id(row.id));
        }
        tracing::debug!("Cleared {} entries from `{}`", removed.len(), self.dir().display());
        Ok(())
    }

    /// Stores `data` under `key`, running the full two-phase insert.
    pub fn insert(&self, key: &str, data: &[u8]) -> CacheEntry<()> {
        let id = self.initiate_insert(key)?;
        let path = self.get_path_for_id(id);
        let abort = defer(|| {
            if let Err(err) = self.remove_id_if(id, |row| !row.valid) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to abort cache insert"
                );
            }
        });

        let shard = path.parent().unwrap_or(self.dir());
        let mut temp_file = tempfile::Builder::new()
            .prefix(".insert")
            .tempfile_in(shard)?;
        temp_file.write_all(data)?;
        persist_tempfile(temp_file, &path)?;

        self.finish_insert(id, crc32fast::hash(data))?;
        abort.cancel();
        Ok(())
    }

    /// Reads the content stored under `key`, verifying its checksum.
    ///
    /// Entries whose content is missing or corrupt are evicted and reported as a miss.
    pub fn read(&self, key: &str) -> CacheEntry<Option<Vec<u8>>> {
        let Some((id, expected)) = self.entry_exists(key)? else {
            return Ok(None);
        };

        let path = self.get_path_for_id(id);
        let Some(bytes) = catch_not_found(|| fs::read(&path))? else {
            tracing::warn!("Content of cache entry `{}` is missing", key);
            self.remove_id_if(id, |_| true)?;
            return Ok(None);
        };

        let actual = crc32fast::hash(&bytes);
        if actual != expected {
            let err = CacheError::Corrupt {
                id,
                expected,
                actual,
            };
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "Evicting corrupt cache entry `{}`",
                key
            );
            metric!(counter("caches.disk.corrupt") += 1, "prefix" => self.metric_tag());
            self.remove_id_if(id, |_| true)?;
            return Ok(None);
        }

        if let Err(err) = self.record_usage(id) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "Failed to record cache usage"
            );
        }
        Ok(Some(bytes))
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        if let Err(err) = self.write_usage_records() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to write usage records"
            );
        }
    }
}

impl fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCache")
            .field("dir", &self.shared.dir)
            .field("key_prefix", &self.config.key_prefix)
            .field("size_limit", &self.config.size_limit)
            .field("pending_usage", &self.shared.usage.len())
            .finish()
    }
}
