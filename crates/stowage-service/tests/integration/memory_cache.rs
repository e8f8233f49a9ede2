use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use stowage_service::caching::{CacheKey, CacheState, CachedValue, MemoryCache, ToCacheKey};
use stowage_service::config::WorkerConfig;
use stowage_service::jobs::{BackgroundExecutor, Priority, QueueClass, job_fn};

struct Render {
    scene: &'static str,
    width: u32,
}

impl ToCacheKey for Render {
    const FAMILY: &'static str = "render";

    fn write_key(&self, builder: &mut stowage_service::caching::CacheKeyBuilder) -> std::fmt::Result {
        use std::fmt::Write;
        writeln!(builder, "scene: {}", self.scene)?;
        writeln!(builder, "width: {}", self.width)
    }
}

#[test]
fn test_at_most_once_computation() {
    stowage_test::setup();
    let executor = BackgroundExecutor::new(&WorkerConfig {
        compute: Some(4),
        disk_io: 1,
        network: 1,
    })
    .unwrap();
    let cache = MemoryCache::new(&Default::default(), executor.submitter());
    let key = Render {
        scene: "teapot",
        width: 640,
    }
    .cache_key();

    let runs = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));
    let callers = 8;
    let barrier = Arc::new(Barrier::new(callers));

    let threads: Vec<_> = (0..callers)
        .map(|_| {
            let cache = cache.clone();
            let key = key.clone();
            let runs = Arc::clone(&runs);
            let release = Arc::clone(&release);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut handle: CachedValue<Vec<u8>> = cache.handle();
                barrier.wait();
                let started = handle.reset_with(key, QueueClass::Compute, Priority::NORMAL, || {
                    job_fn(move |ctx| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        while !release.load(Ordering::Acquire) {
                            ctx.check_in()?;
                            thread::sleep(Duration::from_millis(1));
                        }
                        Ok(vec![1, 2, 3])
                    })
                });
                (started, handle)
            })
        })
        .collect();
    let mut handles: Vec<(bool, CachedValue<Vec<u8>>)> =
        threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(handles.iter().filter(|(started, _)| *started).count(), 1);
    let controller = handles[0].1.controller().unwrap();
    for (_, handle) in &handles {
        assert_eq!(handle.state(), CacheState::Loading);
        assert_eq!(handle.controller().as_ref(), Some(&controller));
    }

    release.store(true, Ordering::Release);
    for (_, handle) in &mut handles {
        assert!(stowage_test::wait_until(Duration::from_secs(10), || {
            handle.update() == Ok(CacheState::Ready)
        }));
    }

    let first = handles[0].1.get().unwrap();
    assert_eq!(*first, [1, 2, 3]);
    for (_, handle) in &handles {
        assert!(Arc::ptr_eq(&first, &handle.get().unwrap()));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(cache.state(&key), CacheState::Ready);
}

#[test]
fn test_distinct_keys_compute_separately() {
    stowage_test::setup();
    let executor = BackgroundExecutor::new(&WorkerConfig {
        compute: Some(2),
        disk_io: 1,
        network: 1,
    })
    .unwrap();
    let cache = MemoryCache::new(&Default::default(), executor.submitter());

    let mut handles: Vec<CachedValue<u32>> = [320, 640, 1280]
        .into_iter()
        .map(|width| {
            let mut handle = cache.handle();
            let key = Render {
                scene: "teapot",
                width,
            }
            .cache_key();
            assert!(handle.reset_with(key, QueueClass::Compute, Priority::NORMAL, || {
                job_fn(move |_| Ok(width * 2))
            }));
            handle
        })
        .collect();

    for handle in &mut handles {
        assert!(stowage_test::wait_until(Duration::from_secs(10), || {
            handle.update() == Ok(CacheState::Ready)
        }));
    }
    let values: Vec<u32> = handles.iter().map(|h| *h.get().unwrap()).collect();
    assert_eq!(values, [640, 1280, 2560]);
    assert_eq!(cache.entry_count(), 3);

    // pointing a handle at another family does not disturb the entries
    handles[0].reset(CacheKey::new("other", "thing"));
    assert_eq!(handles[0].state(), CacheState::Uninitialized);
    assert_eq!(cache.entry_count(), 4);
}
