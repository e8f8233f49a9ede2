//! Reclaiming disk space: eviction, abandoned inserts and orphaned content files.

use std::fs::{read_dir, remove_dir};
use std::io;
use std::path::Path;
use std::time::Duration;

use super::disk::layout::{catch_not_found, content_dir, parse_content_file, remove_content_file};
use super::disk::{IndexRow, Namespace};

/// Picks the keys to evict so that the valid entries of `rows` fit into `size_limit`.
///
/// Entries are evicted least recently used first, ties broken by id. Invalid rows are never
/// evicted, neither is the entry with id `keep`. The result may therefore still exceed the limit
/// by the size of that one entry.
pub(crate) fn select_evictions(
    rows: &Namespace,
    size_limit: u64,
    keep: Option<u64>,
) -> Vec<String> {
    let mut total_size: u64 = rows
        .values()
        .filter(|row| row.valid)
        .map(|row| row.size)
        .sum();
    if total_size <= size_limit {
        return Vec::new();
    }

    let mut candidates: Vec<(&String, &IndexRow)> = rows
        .iter()
        .filter(|(_, row)| row.valid && Some(row.id) != keep)
        .collect();
    candidates.sort_by_key(|(_, row)| (row.last_used, row.id));

    let mut evicted = Vec::new();
    for (key, row) in candidates {
        if total_size <= size_limit {
            break;
        }
        total_size -= row.size;
        evicted.push(key.clone());
    }
    evicted
}

/// Picks the keys of inserts that were initiated more than `timeout` before `now`, but never
/// finished.
///
/// Timestamps are in nanoseconds.
pub(crate) fn select_abandoned(rows: &Namespace, now: u64, timeout: Duration) -> Vec<String> {
    let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    rows.iter()
        .filter(|(_, row)| !row.valid && row.created.saturating_add(timeout) <= now)
        .map(|(key, _)| key.clone())
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// Deletes every content file in `dir` whose id is not `is_known`, and any file that does not
/// look like a content file at all.
///
/// Shard directories that end up empty are removed as well.
pub(crate) fn sweep_orphans(
    dir: &Path,
    is_known: impl Fn(u64) -> bool,
) -> io::Result<CleanupStats> {
    let mut stats = CleanupStats::default();
    let root = content_dir(dir);
    let Some(shards) = catch_not_found(|| read_dir(&root))? else {
        return Ok(stats);
    };
    tracing::debug!("Sweeping orphaned files in `{}`", root.display());

    for shard in shards {
        let shard = shard?;
        let shard_path = shard.path();
        if !shard.file_type()?.is_dir() {
            remove_orphan(&shard_path, &mut stats);
            continue;
        }
        let shard_name = shard.file_name();
        let shard_name = shard_name.to_string_lossy();

        let mut is_empty = true;
        for entry in read_dir(&shard_path)? {
            let entry = entry?;
            let path = entry.path();
            let id = parse_content_file(&shard_name, &entry.file_name().to_string_lossy());
            match id {
                Some(id) if is_known(id) => {
                    is_empty = false;
                    stats.retained_files += 1;
                    stats.retained_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
                _ => is_empty &= remove_orphan(&path, &mut stats),
            }
        }

        if is_empty {
            match remove_dir(&shard_path) {
                Ok(()) => stats.removed_dirs += 1,
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", shard_path.display().to_string().into()),
                        || tracing::error!("Failed to clean cache directory: {:?}", e),
                    );
                }
            }
        }
    }

    tracing::debug!(
        "Removed {} directories and {} files, totaling {} bytes",
        stats.removed_dirs,
        stats.removed_files,
        stats.removed_bytes
    );
    Ok(stats)
}

/// Removes index snapshots that were interrupted by a crash.
pub(crate) fn remove_stale_index_files(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(".index") && name.ends_with(".tmp") && remove_content_file(&entry.path())
        {
            removed += 1;
        }
    }
    Ok(removed)
}

fn remove_orphan(path: &Path, stats: &mut CleanupStats) -> bool {
    tracing::debug!("Removing orphaned file `{}`", path.display());
    let size = path.metadata().map(|m| m.len()).unwrap_or(0);
    if path.is_dir() {
        // content files never live in nested directories
        if let Err(e) = std::fs::remove_dir_all(path) {
            tracing::error!("Failed to remove directory `{}`: {:?}", path.display(), e);
            return false;
        }
        stats.removed_dirs += 1;
        return true;
    }
    if remove_content_file(path) {
        stats.removed_files += 1;
        stats.removed_bytes += size;
    }
    !path.exists()
}
