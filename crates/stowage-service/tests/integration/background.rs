use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use stowage_service::config::WorkerConfig;
use stowage_service::jobs::{
    BackgroundExecutor, JobController, JobError, JobState, Priority, QueueClass, job_fn,
};

fn executor(compute: usize) -> BackgroundExecutor {
    BackgroundExecutor::new(&WorkerConfig {
        compute: Some(compute),
        disk_io: 1,
        network: 1,
    })
    .unwrap()
}

/// Occupies the single compute worker until the returned flag is set.
fn block_worker(executor: &BackgroundExecutor) -> (Arc<AtomicBool>, JobController) {
    let release = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    let controller = {
        let release = Arc::clone(&release);
        let started = Arc::clone(&started);
        executor.submit(
            QueueClass::Compute,
            Priority(i32::MAX),
            job_fn(move |_| {
                started.store(true, Ordering::Release);
                stowage_test::wait_until(Duration::from_secs(10), || {
                    release.load(Ordering::Acquire)
                });
                Ok(())
            })
            .named("blocker"),
        )
    };
    assert!(stowage_test::wait_until(Duration::from_secs(10), || {
        started.load(Ordering::Acquire)
    }));
    (release, controller)
}

#[test]
fn test_thousand_jobs() {
    stowage_test::setup();
    let executor = executor(4);
    let results: Arc<Vec<AtomicUsize>> =
        Arc::new((0..1000).map(|_| AtomicUsize::new(usize::MAX)).collect());

    let controllers: Vec<_> = (0..1000)
        .map(|i| {
            let results = Arc::clone(&results);
            executor.submit(
                QueueClass::Compute,
                Priority::NORMAL,
                job_fn(move |ctx| {
                    ctx.check_in()?;
                    results[i].store(i, Ordering::SeqCst);
                    Ok(())
                }),
            )
        })
        .collect();

    assert!(stowage_test::wait_until(Duration::from_secs(30), || {
        controllers
            .iter()
            .all(|c| c.state() == JobState::Finished)
    }));
    for (i, controller) in controllers.iter().enumerate() {
        assert_eq!(results[i].load(Ordering::SeqCst), i);
        assert_eq!(controller.progress(), 1.0);
    }
}

#[test]
fn test_states_are_monotonic() {
    stowage_test::setup();
    let executor = executor(2);

    let controllers: Vec<_> = (0..20)
        .map(|i| {
            executor.submit(
                QueueClass::Compute,
                Priority::NORMAL,
                job_fn(move |ctx| {
                    for step in 0..10 {
                        ctx.check_in()?;
                        ctx.report_progress(step as f32 / 10.0);
                        thread::sleep(Duration::from_micros(200));
                    }
                    if i % 3 == 0 {
                        return Err(JobError::failed("every third job fails"));
                    }
                    Ok(i)
                }),
            )
        })
        .collect();
    controllers[5].cancel();

    let observed: Vec<Vec<(JobState, f32)>> = controllers
        .iter()
        .map(|controller| {
            let mut seen = vec![(controller.state(), controller.progress())];
            stowage_test::wait_until(Duration::from_secs(10), || {
                seen.push((controller.state(), controller.progress()));
                controller.is_done()
            });
            seen
        })
        .collect();

    for seen in observed {
        for pair in seen.windows(2) {
            let ((state_a, progress_a), (state_b, progress_b)) = (pair[0], pair[1]);
            assert!(state_a <= state_b, "{state_a:?} observed before {state_b:?}");
            if state_a == JobState::Computing && state_b == JobState::Computing {
                assert!(progress_a <= progress_b);
            }
        }
        assert!(seen.last().unwrap().0.is_done());
    }
    assert_eq!(controllers[5].error(), Some(JobError::Cancelled));
    assert_eq!(
        controllers[3].error(),
        Some(JobError::Failed("every third job fails".into()))
    );
}

#[test]
fn test_priority_then_fifo() {
    stowage_test::setup();
    let executor = executor(1);
    let (release, blocker) = block_worker(&executor);

    let order = Arc::new(Mutex::new(Vec::new()));
    let priorities = [
        Priority::LOW,
        Priority::HIGH,
        Priority::NORMAL,
        Priority::HIGH,
        Priority::NORMAL,
    ];
    let controllers: Vec<_> = priorities
        .into_iter()
        .enumerate()
        .map(|(i, priority)| {
            let order = Arc::clone(&order);
            executor.submit(
                QueueClass::Compute,
                priority,
                job_fn(move |_| {
                    order.lock().unwrap().push(i);
                    Ok(())
                }),
            )
        })
        .collect();
    assert_eq!(executor.queued(QueueClass::Compute), 5);

    release.store(true, Ordering::Release);
    assert_eq!(blocker.wait(), JobState::Finished);
    for controller in &controllers {
        assert!(controller.wait_timeout(Duration::from_secs(10)));
    }
    assert_eq!(*order.lock().unwrap(), [1, 3, 2, 4, 0]);
}

#[test]
fn test_queue_classes_are_isolated() {
    stowage_test::setup();
    let executor = executor(1);
    let (release, _blocker) = block_worker(&executor);

    let network = executor.submit(QueueClass::Network, Priority::LOW, job_fn(|_| Ok("sent")));
    assert!(network.wait_timeout(Duration::from_secs(10)));
    assert_eq!(network.output::<&'static str>().unwrap().as_deref(), Some(&"sent"));
    assert_eq!(network.queue(), QueueClass::Network);

    release.store(true, Ordering::Release);
}

#[test]
fn test_cancel_queued_job() {
    stowage_test::setup();
    let executor = executor(1);
    let (release, _blocker) = block_worker(&executor);
    let ran = Arc::new(AtomicBool::new(false));

    let queued = {
        let ran = Arc::clone(&ran);
        executor.submit(
            QueueClass::Compute,
            Priority::NORMAL,
            job_fn(move |_| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }),
        )
    };
    queued.cancel();
    assert_eq!(queued.state(), JobState::Failed);
    assert_eq!(queued.error(), Some(JobError::Cancelled));

    let after = executor.submit(QueueClass::Compute, Priority::LOW, job_fn(|_| Ok(())));
    release.store(true, Ordering::Release);
    assert_eq!(after.wait(), JobState::Finished);
    assert!(!ran.load(Ordering::SeqCst));
}
