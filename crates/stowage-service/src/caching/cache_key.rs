use std::cmp::Ordering;
use std::fmt::{self, Write};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The opaque identity of a cache entry or job.
///
/// A key consists of a `family`, an explicit tag naming the kind of producer, and stable human
/// readable `metadata` describing exactly what is being produced. Keys of different families
/// can live side by side in one cache.
///
/// Keys compare by family first and by metadata second. Cloning is cheap, the metadata is
/// shared immutably.
#[derive(Debug, Clone)]
pub struct CacheKey {
    family: &'static str,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.family == other.family && self.hash == other.hash && self.metadata == other.metadata
    }
}

impl Eq for CacheKey {}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.family
            .cmp(other.family)
            .then_with(|| self.metadata.cmp(&other.metadata))
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.family.hash(state);
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.family)?;
        f.write_char('/')?;
        for b in &self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl CacheKey {
    /// Creates a [`CacheKeyBuilder`] for a key of the given `family`.
    pub fn builder(family: &'static str) -> CacheKeyBuilder {
        CacheKeyBuilder {
            family,
            metadata: String::new(),
        }
    }

    /// Creates a key from already assembled metadata.
    pub fn new(family: &'static str, metadata: impl Into<String>) -> Self {
        CacheKeyBuilder {
            family,
            metadata: metadata.into(),
        }
        .build()
    }

    pub fn family(&self) -> &'static str {
        self.family
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// The string under which this key is stored in a [`DiskCache`](super::DiskCache).
    ///
    /// This is the family followed by the hex-formatted sha-256 of the metadata.
    pub fn disk_key(&self) -> String {
        self.to_string()
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
pub struct CacheKeyBuilder {
    family: &'static str,
    metadata: String,
}

impl CacheKeyBuilder {
    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let digest = Sha256::digest(&self.metadata);
        let mut hash = [0; 32];
        hash.copy_from_slice(&digest);

        CacheKey {
            family: self.family,
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// Implemented by anything that is produced under a [`CacheKey`].
pub trait ToCacheKey {
    /// The family tag shared by all keys of this producer.
    const FAMILY: &'static str;

    /// Writes the stable metadata identifying `self`.
    fn write_key(&self, builder: &mut CacheKeyBuilder) -> fmt::Result;

    fn cache_key(&self) -> CacheKey {
        let mut builder = CacheKey::builder(Self::FAMILY);
        // writing into a `String` does not fail
        self.write_key(&mut builder).ok();
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};

    use super::*;

    struct Tile {
        zoom: u8,
        x: u32,
        y: u32,
    }

    impl ToCacheKey for Tile {
        const FAMILY: &'static str = "tile";

        fn write_key(&self, builder: &mut CacheKeyBuilder) -> fmt::Result {
            writeln!(builder, "tile: {}/{}/{}", self.zoom, self.x, self.y)?;
            writeln!(builder, "format: png")
        }
    }

    #[test]
    fn test_disk_key() {
        let key = Tile { zoom: 3, x: 4, y: 5 }.cache_key();
        assert_eq!(key.family(), "tile");
        assert_eq!(key.metadata(), "tile: 3/4/5\nformat: png\n");
        assert_eq!(
            key.disk_key(),
            "tile/f767680d2c7048c397aabacd3449b6aaf4af5b348aeb90137d36e6de30cf803a"
        );

        let empty = CacheKey::new("empty", "");
        assert_eq!(
            empty.to_string(),
            "empty/e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_equality_and_order() {
        let a = CacheKey::new("mesh", "b");
        let b = CacheKey::new("image", "z");
        let c = CacheKey::new("image", "a");
        let same_metadata = CacheKey::new("image", "b");

        assert_eq!(a, a.clone());
        assert_ne!(a, same_metadata);
        // family first, then metadata
        assert!(c < b);
        assert!(b < a);
        assert!(same_metadata < a);

        let mut map = BTreeMap::new();
        for key in [&a, &b, &c, &same_metadata] {
            map.insert(key.clone(), key.metadata().to_owned());
        }
        let order: Vec<_> = map.keys().map(|k| k.to_string()[..5].to_owned()).collect();
        assert_eq!(order, ["image", "image", "image", "mesh/"]);

        let set: HashSet<_> = [a.clone(), a, b].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_builder_matches_new() {
        let mut builder = CacheKey::builder("image");
        builder.write_str("source: a\n").unwrap();
        writeln!(builder, "size: {}x{}", 10, 20).unwrap();
        assert_eq!(
            builder.build(),
            CacheKey::new("image", "source: a\nsize: 10x20\n")
        );
    }
}
