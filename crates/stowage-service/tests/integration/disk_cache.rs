use std::fs;
use std::sync::Arc;
use std::thread;

use proptest::collection::vec;
use proptest::prelude::*;
use stowage_service::caching::{CacheError, DiskCache, SummaryInfo};
use stowage_service::config::DiskCacheConfig;

#[test]
fn test_round_trip() {
    stowage_test::setup();
    let dir = stowage_test::tempdir();
    let cache = DiskCache::open(dir.path(), &DiskCacheConfig::default()).unwrap();

    for (seed, len) in [(1, 0), (2, 1), (3, 4096), (4, 1 << 20)] {
        let payload = stowage_test::payload(seed, len);
        let key = format!("payload-{seed}");

        let id = cache.initiate_insert(&key).unwrap();
        fs::write(cache.get_path_for_id(id), &payload).unwrap();
        cache.finish_insert(id, crc32fast::hash(&payload)).unwrap();

        let (found, crc32) = cache.entry_exists(&key).unwrap().unwrap();
        assert_eq!(found, id);
        assert_eq!(crc32, crc32fast::hash(&payload));
        assert_eq!(fs::read(cache.get_path_for_id(id)).unwrap(), payload);
    }
    assert_eq!(cache.get_summary_info().unwrap().entry_count, 4);
}

#[test]
fn test_unfinished_insert_is_invisible_after_restart() {
    stowage_test::setup();
    let dir = stowage_test::tempdir();

    {
        let cache = DiskCache::open(dir.path(), &DiskCacheConfig::default()).unwrap();
        let id = cache.initiate_insert("interrupted").unwrap();
        fs::write(cache.get_path_for_id(id), b"partial").unwrap();
        // the process dies here
    }

    let cache = DiskCache::open(dir.path(), &DiskCacheConfig::default()).unwrap();
    assert_eq!(cache.entry_exists("interrupted").unwrap(), None);
    assert_eq!(cache.read("interrupted").unwrap(), None);
    assert_eq!(cache.get_summary_info().unwrap(), SummaryInfo::default());
}

#[test]
fn test_buffered_usage_affects_eviction() {
    stowage_test::setup();
    let dir = stowage_test::tempdir();
    let cache = DiskCache::open(
        dir.path(),
        &DiskCacheConfig {
            size_limit: 30,
            ..Default::default()
        },
    )
    .unwrap();

    for key in ["a", "b", "c"] {
        cache.insert(key, &[0; 10]).unwrap();
    }
    // buffered, but merged before evicting
    assert!(cache.read("a").unwrap().is_some());
    cache.insert("d", &[0; 10]).unwrap();

    assert!(cache.entry_exists("a").unwrap().is_some());
    assert_eq!(cache.entry_exists("b").unwrap(), None);
    assert!(cache.entry_exists("c").unwrap().is_some());
    assert!(cache.entry_exists("d").unwrap().is_some());
    assert_eq!(cache.get_summary_info().unwrap().total_size, 30);
}

#[test]
fn test_oversized_entry_is_kept() {
    stowage_test::setup();
    let dir = stowage_test::tempdir();
    let cache = DiskCache::open(
        dir.path(),
        &DiskCacheConfig {
            size_limit: 10,
            ..Default::default()
        },
    )
    .unwrap();

    cache.insert("small", &[1; 5]).unwrap();
    cache.insert("huge", &[2; 50]).unwrap();
    assert_eq!(cache.entry_exists("small").unwrap(), None);
    assert_eq!(cache.read("huge").unwrap().map(|d| d.len()), Some(50));
}

#[test]
fn test_concurrent_inserts() {
    stowage_test::setup();
    let dir = stowage_test::tempdir();
    let cache = Arc::new(DiskCache::open(dir.path(), &DiskCacheConfig::default()).unwrap());

    let threads: Vec<_> = (0..8)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..20 {
                    let payload = stowage_test::payload(t * 100 + i, 64);
                    cache.insert(&format!("{t}/{i}"), &payload).unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    for t in 0..8 {
        for i in 0..20 {
            let data = cache.read(&format!("{t}/{i}")).unwrap();
            assert_eq!(data, Some(stowage_test::payload(t * 100 + i, 64)));
        }
    }
    assert_eq!(
        cache.get_summary_info().unwrap(),
        SummaryInfo {
            entry_count: 160,
            total_size: 160 * 64,
        }
    );
}

#[test]
fn test_finish_unknown_id() {
    let dir = stowage_test::tempdir();
    let cache = DiskCache::open(dir.path(), &DiskCacheConfig::default()).unwrap();
    assert_eq!(cache.finish_insert(12345, 0), Err(CacheError::NotFound));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Inserting never leaves more than `size_limit` bytes, except for the one entry that was
    /// just inserted, and always evicts the oldest entries first.
    #[test]
    fn prop_eviction_bound(sizes in vec(1usize..200, 1..30), size_limit in 50u64..600) {
        let dir = stowage_test::tempdir();
        let cache = DiskCache::open(
            dir.path(),
            &DiskCacheConfig {
                size_limit,
                ..Default::default()
            },
        )
        .unwrap();

        for (i, size) in sizes.iter().enumerate() {
            cache.insert(&i.to_string(), &vec![0; *size]).unwrap();

            let summary = cache.get_summary_info().unwrap();
            prop_assert!(summary.total_size <= size_limit || summary.entry_count == 1);

            let survivors: Vec<bool> = (0..=i)
                .map(|j| cache.entry_exists(&j.to_string()).unwrap().is_some())
                .collect();
            // survivors are always the most recent inserts
            let first = survivors.iter().position(|alive| *alive).unwrap();
            prop_assert!(survivors[first..].iter().all(|alive| *alive));
        }
    }
}
