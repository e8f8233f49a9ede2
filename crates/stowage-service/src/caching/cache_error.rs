use std::io;

use thiserror::Error;

/// An error raised by one of the caches.
///
/// Caching is strictly an optimization: every one of these can be treated as a cache miss,
/// falling back to computing the value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The entry does not exist (anymore).
    #[error("not found")]
    NotFound,
    /// The contents of an entry do not match its recorded checksum.
    #[error("entry {id} is corrupt: expected crc32 {expected:08x}, got {actual:08x}")]
    Corrupt { id: u64, expected: u32, actual: u32 },
    /// Reading or writing the cache directory failed.
    ///
    /// The attached string contains the underlying error message.
    #[error("cache I/O failed: {0}")]
    Io(String),
    /// The persisted index could not be parsed.
    #[error("malformed cache index: {0}")]
    MalformedIndex(String),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        let message = err.to_string();
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, "Failed to parse cache index");
        Self::MalformedIndex(message)
    }
}

impl CacheError {
    /// Logs `e` and turns it into an [`Io`](Self::Io) error.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::Io(e.to_string())
    }
}

/// An entry in a cache, containing either `Ok(T)` or the reason why it could not be used.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
