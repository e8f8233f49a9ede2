//! Where things live inside a disk cache directory.
//!
//! ```text
//! <dir>/index.json           a snapshot of the index of all namespaces
//! <dir>/index.journal        changes committed since the snapshot, one transaction per line
//! <dir>/.index*.tmp          a snapshot in progress
//! <dir>/v1/<xx>/<id>         content files, sharded by the lowest byte of the id
//! ```

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

pub(crate) const INDEX_FILE: &str = "index.json";
pub(crate) const JOURNAL_FILE: &str = "index.journal";
pub(crate) const CONTENT_DIR: &str = "v1";

pub(crate) fn index_path(dir: &Path) -> PathBuf {
    dir.join(INDEX_FILE)
}

pub(crate) fn journal_path(dir: &Path) -> PathBuf {
    dir.join(JOURNAL_FILE)
}

pub(crate) fn content_dir(dir: &Path) -> PathBuf {
    dir.join(CONTENT_DIR)
}

/// The path of the content file for `id`.
pub(crate) fn content_path(dir: &Path, id: u64) -> PathBuf {
    content_dir(dir)
        .join(format!("{:02x}", id & 0xff))
        .join(format!("{id:016x}"))
}

/// Parses the id back out of a content file name, verifying it sits in the right shard.
pub(crate) fn parse_content_file(shard: &str, file_name: &str) -> Option<u64> {
    if file_name.len() != 16 || shard.len() != 2 {
        return None;
    }
    let id = u64::from_str_radix(file_name, 16).ok()?;
    let expected_shard = u8::from_str_radix(shard, 16).ok()?;
    (id & 0xff == u64::from(expected_shard)).then_some(id)
}

pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

/// Removes a content file, logging failures instead of returning them.
///
/// Returns `true` if the file existed and was removed.
pub(crate) fn remove_content_file(path: &Path) -> bool {
    match catch_not_found(|| fs::remove_file(path)) {
        Ok(removed) => removed.is_some(),
        Err(e) => {
            sentry::with_scope(
                |scope| scope.set_extra("path", path.display().to_string().into()),
                || tracing::error!("Failed to remove cache file: {:?}", e),
            );
            false
        }
    }
}

/// Atomically moves `temp_file` to `path`, creating missing parent directories.
pub(crate) fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<File> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // Clearing the cache removes shard directories, retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to persist cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}
