use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use stowage_service::jobs::{BatchError, ConcurrentJobRunner, Job, JobContext, JobError, job_fn};

/// A batch member that keeps checking in until it is asked to stop.
struct Sibling {
    started: Arc<AtomicUsize>,
    saw_cancellation: Arc<AtomicBool>,
}

impl Job for Sibling {
    type Output = ();

    fn execute(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Err(err) = ctx.check_in() {
                self.saw_cancellation.store(true, Ordering::SeqCst);
                return Err(err);
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}

/// Fails halfway through, once all of its siblings are running.
struct Failing {
    started: Arc<AtomicUsize>,
    siblings: usize,
}

impl Job for Failing {
    type Output = ();

    fn execute(&mut self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        stowage_test::wait_until(Duration::from_secs(10), || {
            self.started.load(Ordering::SeqCst) > self.siblings
        });
        ctx.report_progress(0.5);
        Err(JobError::failed("job 3 broke"))
    }
}

#[test]
fn test_failure_cancels_siblings() {
    stowage_test::setup();
    let started = Arc::new(AtomicUsize::new(0));
    let observed: Vec<Arc<AtomicBool>> = (0..6).map(|_| Arc::default()).collect();

    let jobs: Vec<Box<dyn Job<Output = ()>>> = (0..6)
        .map(|i| -> Box<dyn Job<Output = ()>> {
            if i == 3 {
                Box::new(Failing {
                    started: Arc::clone(&started),
                    siblings: 5,
                })
            } else {
                Box::new(Sibling {
                    started: Arc::clone(&started),
                    saw_cancellation: Arc::clone(&observed[i]),
                })
            }
        })
        .collect();

    let progress = Mutex::new(Vec::new());
    let result = ConcurrentJobRunner::new()
        .max_threads(6)
        .run_with_progress(jobs, |p| progress.lock().unwrap().push(p));

    assert_eq!(
        result,
        Err(BatchError::JobFailed {
            index: 3,
            message: "job failed: job 3 broke".into()
        })
    );
    for (i, saw_cancellation) in observed.iter().enumerate() {
        if i != 3 {
            assert!(saw_cancellation.load(Ordering::SeqCst), "job {i} was not cancelled");
        }
    }
    assert_eq!(started.load(Ordering::SeqCst), 6);
    assert_eq!(*progress.lock().unwrap(), [0.5f32 / 6.0]);
}

#[test]
fn test_batch_converts_into_job_error() {
    let runner = ConcurrentJobRunner::new().max_threads(2);
    let jobs: Vec<Box<dyn Job<Output = u32>>> = vec![
        Box::new(job_fn(|_| Ok(1u32))),
        Box::new(job_fn(|_| Err::<u32, _>(JobError::failed("bad")))),
    ];
    let err: JobError = runner.run(jobs).unwrap_err().into();
    assert_eq!(
        err,
        JobError::Failed("job 1 of the batch failed: job failed: bad".into())
    );
}
