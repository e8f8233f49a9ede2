use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::layout::{catch_not_found, index_path, journal_path, persist_tempfile};
use crate::caching::CacheEntry;

/// The index row of a single disk cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    /// The id of the content file.
    pub id: u64,
    /// Size of the content file in bytes.
    pub size: u64,
    pub crc32: u32,
    /// Invalid rows belong to inserts that were initiated but never finished.
    pub valid: bool,
    /// Nanoseconds since the UNIX epoch.
    pub created: u64,
    /// Nanoseconds since the UNIX epoch.
    pub last_used: u64,
}

/// The rows of one key prefix.
pub type Namespace = BTreeMap<String, IndexRow>;

/// A single change to an [`IndexTable`], as recorded in the journal.
///
/// Every change sets or deletes the row of one key, so replaying changes that a snapshot
/// already contains yields that same snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IndexChange {
    Put {
        prefix: String,
        key: String,
        row: IndexRow,
    },
    Remove {
        prefix: String,
        key: String,
    },
}

/// The complete index of a cache directory, all namespaces included.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexTable {
    next_id: u64,
    namespaces: BTreeMap<String, Namespace>,
    /// Reverse lookup from id to `(prefix, key)`, rebuilt on load.
    #[serde(skip)]
    by_id: HashMap<u64, (String, String)>,
    /// Changes not yet handed to the [`IndexStore`].
    #[serde(skip)]
    changes: Vec<IndexChange>,
}

impl PartialEq for IndexTable {
    fn eq(&self, other: &Self) -> bool {
        self.next_id == other.next_id && self.namespaces == other.namespaces
    }
}

impl IndexTable {
    fn rebuild_ids(&mut self) {
        self.by_id = self
            .namespaces
            .iter()
            .flat_map(|(prefix, rows)| {
                rows.iter()
                    .map(move |(key, row)| (row.id, (prefix.clone(), key.clone())))
            })
            .collect();
        if let Some(max) = self.by_id.keys().max() {
            self.next_id = self.next_id.max(max + 1);
        }
    }

    /// Replays a journaled change.
    fn apply(&mut self, change: IndexChange) {
        match change {
            IndexChange::Put { prefix, key, row } => {
                self.next_id = self.next_id.max(row.id + 1);
                self.insert(&prefix, &key, row);
            }
            IndexChange::Remove { prefix, key } => {
                self.remove(&prefix, &key);
            }
        }
    }

    /// Takes the changes made since the last call.
    pub fn take_changes(&mut self) -> Vec<IndexChange> {
        std::mem::take(&mut self.changes)
    }

    /// Reserves a fresh id.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn namespace(&self, prefix: &str) -> Option<&Namespace> {
        self.namespaces.get(prefix)
    }

    pub fn get(&self, prefix: &str, key: &str) -> Option<&IndexRow> {
        self.namespaces.get(prefix)?.get(key)
    }

    /// The number of rows in all namespaces.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Inserts `row` for `key`, returning the row it replaced.
    pub fn insert(&mut self, prefix: &str, key: &str, row: IndexRow) -> Option<IndexRow> {
        let replaced = self
            .namespaces
            .entry(prefix.to_owned())
            .or_default()
            .insert(key.to_owned(), row);
        if let Some(replaced) = &replaced {
            self.by_id.remove(&replaced.id);
        }
        self.by_id
            .insert(row.id, (prefix.to_owned(), key.to_owned()));
        self.changes.push(IndexChange::Put {
            prefix: prefix.to_owned(),
            key: key.to_owned(),
            row,
        });
        replaced
    }

    pub fn remove(&mut self, prefix: &str, key: &str) -> Option<IndexRow> {
        let rows = self.namespaces.get_mut(prefix)?;
        let row = rows.remove(key)?;
        if rows.is_empty() {
            self.namespaces.remove(prefix);
        }
        self.by_id.remove(&row.id);
        self.changes.push(IndexChange::Remove {
            prefix: prefix.to_owned(),
            key: key.to_owned(),
        });
        Some(row)
    }

    /// The `(prefix, key)` the row with `id` is stored under.
    pub fn locate(&self, id: u64) -> Option<(&str, &str)> {
        self.by_id
            .get(&id)
            .map(|(prefix, key)| (prefix.as_str(), key.as_str()))
    }

    pub fn get_by_id(&self, id: u64) -> Option<&IndexRow> {
        let (prefix, key) = self.by_id.get(&id)?;
        self.get(prefix, key)
    }

    /// Modifies the row with `id` in place.
    pub fn update_by_id<R>(&mut self, id: u64, f: impl FnOnce(&mut IndexRow) -> R) -> Option<R> {
        let (prefix, key) = self.by_id.get(&id)?;
        let row = self.namespaces.get_mut(prefix)?.get_mut(key)?;
        let result = f(row);
        self.changes.push(IndexChange::Put {
            prefix: prefix.clone(),
            key: key.clone(),
            row: *row,
        });
        Some(result)
    }

    pub fn remove_by_id(&mut self, id: u64) -> Option<IndexRow> {
        let (prefix, key) = self.by_id.get(&id)?.clone();
        self.remove(&prefix, &key)
    }

    /// Removes all rows of a namespace.
    pub fn clear_namespace(&mut self, prefix: &str) -> Vec<IndexRow> {
        let rows = self.namespaces.remove(prefix).unwrap_or_default();
        let mut removed = Vec::with_capacity(rows.len());
        for (key, row) in rows {
            self.by_id.remove(&row.id);
            self.changes.push(IndexChange::Remove {
                prefix: prefix.to_owned(),
                key,
            });
            removed.push(row);
        }
        removed
    }

    /// Removes all rows, in any namespace, for which `keep` returns `false`.
    pub fn retain(&mut self, mut keep: impl FnMut(&IndexRow) -> bool) -> Vec<IndexRow> {
        let mut removed = Vec::new();
        for (prefix, rows) in &mut self.namespaces {
            rows.retain(|key, row| {
                let retained = keep(row);
                if !retained {
                    removed.push(*row);
                    self.changes.push(IndexChange::Remove {
                        prefix: prefix.clone(),
                        key: key.clone(),
                    });
                }
                retained
            });
        }
        self.namespaces.retain(|_, rows| !rows.is_empty());
        for row in &removed {
            self.by_id.remove(&row.id);
        }
        removed
    }

    pub fn contains_id(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    /// The most recent timestamp recorded anywhere in the table.
    pub fn latest_timestamp(&self) -> u64 {
        self.namespaces
            .values()
            .flat_map(|rows| rows.values())
            .map(|row| row.created.max(row.last_used))
            .max()
            .unwrap_or(0)
    }
}

/// Persistence of an [`IndexTable`].
///
/// Transactions are appended as batches of [`IndexChange`]s, so committing one costs time in
/// proportion to what it changed. [`compact`](Self::compact) folds everything into a single
/// snapshot. After a crash, loading yields the state after some prefix of the committed
/// transactions, never a part of one.
pub trait IndexStore: Send {
    fn load(&self) -> CacheEntry<IndexTable>;

    /// Durably records the changes of one transaction.
    fn append(&mut self, changes: &[IndexChange]) -> CacheEntry<()>;

    /// Replaces everything stored with `table`.
    fn compact(&mut self, table: &IndexTable) -> CacheEntry<()>;

    /// The number of changes appended since the last compaction.
    fn journal_len(&self) -> usize;
}

/// Stores the index as a JSON snapshot followed by a journal of JSON lines.
///
/// Snapshots are written to a temporary file and renamed into place atomically.
#[derive(Debug)]
pub struct JsonIndexStore {
    dir: PathBuf,
    journal: Option<File>,
    journal_len: usize,
}

impl JsonIndexStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_owned(),
            journal: None,
            journal_len: 0,
        }
    }

    fn open_journal(&self) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal_path(&self.dir))
    }
}

impl IndexStore for JsonIndexStore {
    fn load(&self) -> CacheEntry<IndexTable> {
        let mut table = match catch_not_found(|| fs::read(index_path(&self.dir)))? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => IndexTable::default(),
        };
        table.rebuild_ids();

        if let Some(journal) = catch_not_found(|| fs::read(journal_path(&self.dir)))? {
            let mut skipped = 0;
            for line in journal.split(|b| *b == b'\n').filter(|line| !line.is_empty()) {
                match serde_json::from_slice::<Vec<IndexChange>>(line) {
                    Ok(changes) => changes.into_iter().for_each(|change| table.apply(change)),
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                tracing::warn!("Skipped {} incomplete transactions in the index journal", skipped);
            }
            table.take_changes();
        }
        Ok(table)
    }

    fn append(&mut self, changes: &[IndexChange]) -> CacheEntry<()> {
        // a leading newline keeps a torn previous write on a line of its own
        let mut line = vec![b'\n'];
        serde_json::to_writer(&mut line, changes)?;

        let journal = match self.journal.take() {
            Some(journal) => journal,
            None => self.open_journal()?,
        };
        let journal = self.journal.insert(journal);
        journal.write_all(&line)?;
        journal.sync_data()?;
        self.journal_len += changes.len();
        Ok(())
    }

    fn compact(&mut self, table: &IndexTable) -> CacheEntry<()> {
        let mut temp_file = tempfile::Builder::new()
            .prefix(".index")
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(temp_file.as_file_mut());
            serde_json::to_writer(&mut writer, table)?;
            writer.flush()?;
        }
        temp_file.as_file().sync_data()?;
        persist_tempfile(temp_file, &index_path(&self.dir))?;

        // the snapshot contains everything journaled so far
        self.journal = None;
        catch_not_found(|| fs::remove_file(journal_path(&self.dir)))?;
        self.journal_len = 0;
        Ok(())
    }

    fn journal_len(&self) -> usize {
        self.journal_len
    }
}

/// An [`IndexStore`] that fails on demand, to exercise rollbacks.
#[cfg(test)]
pub(crate) struct FlakyStore {
    pub inner: JsonIndexStore,
    pub fail_commits: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl IndexStore for FlakyStore {
    fn load(&self) -> CacheEntry<IndexTable> {
        self.inner.load()
    }

    fn append(&mut self, changes: &[IndexChange]) -> CacheEntry<()> {
        if self
            .fail_commits
            .load(std::sync::atomic::Ordering::Acquire)
        {
            return Err(crate::caching::CacheError::Io("simulated commit failure".into()));
        }
        self.inner.append(changes)
    }

    fn compact(&mut self, table: &IndexTable) -> CacheEntry<()> {
        self.inner.compact(table)
    }

    fn journal_len(&self) -> usize {
        self.inner.journal_len()
    }
}
