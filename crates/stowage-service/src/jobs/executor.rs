use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::WorkerConfig;

use super::controller::{ErasedValue, JobController};
use super::queue::{JobQueue, QueuedJob};
use super::{Job, JobContext, JobError, Priority, QueueClass};

/// The queue and wakeup signal of one [`QueueClass`].
#[derive(Default)]
struct ClassQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

#[derive(Default)]
struct QueueState {
    jobs: JobQueue,
    shutdown: bool,
}

impl ClassQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Shared {
    queues: [ClassQueue; 3],
}

impl Shared {
    fn queue(&self, class: QueueClass) -> &ClassQueue {
        &self.queues[class.index()]
    }
}

/// A cheap, cloneable handle to submit jobs to a [`BackgroundExecutor`].
#[derive(Clone)]
pub struct JobSubmitter {
    shared: Arc<Shared>,
}

impl JobSubmitter {
    /// Enqueues `job` on the queue of `class` and returns its controller.
    ///
    /// This never blocks on job execution. Submitting to an executor that was shut down returns
    /// a controller that already failed with [`JobError::ShutDown`].
    pub fn submit<J: Job>(&self, class: QueueClass, priority: Priority, job: J) -> JobController {
        let controller = JobController::new(job.name().into_owned(), class);
        let mut job = job;
        let body = Box::new(move |ctx: &JobContext<'_>| {
            job.execute(ctx).map(|output| Arc::new(output) as ErasedValue)
        });

        let queue = self.shared.queue(class);
        let mut state = queue.lock();
        if state.shutdown {
            drop(state);
            tracing::debug!(
                job = controller.name(),
                "Rejecting job submitted after shutdown"
            );
            controller.abort(JobError::ShutDown);
            return controller;
        }
        state.jobs.push(priority, controller.clone(), body);
        drop(state);
        queue.available.notify_one();

        metric!(counter("jobs.submitted") += 1, "queue" => class.as_ref());
        controller
    }

    /// The number of jobs waiting in the queue of `class`.
    pub fn queued(&self, class: QueueClass) -> usize {
        self.shared.queue(class).lock().jobs.len()
    }
}

impl std::fmt::Debug for JobSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("JobSubmitter");
        for class in QueueClass::ALL {
            s.field(class.as_ref(), &self.queued(class));
        }
        s.finish()
    }
}

/// Runs [`Job`]s on dedicated worker threads, one pool per [`QueueClass`].
///
/// Within a queue class jobs are dispatched by [`Priority`], equal priorities in submission
/// order. Dropping the executor shuts it down.
pub struct BackgroundExecutor {
    submitter: JobSubmitter,
    workers: Vec<JoinHandle<()>>,
}

impl BackgroundExecutor {
    /// Spawns the worker threads for every queue class.
    ///
    /// Failing to spawn a thread is fatal at startup, all threads spawned so far are stopped.
    pub fn new(config: &WorkerConfig) -> io::Result<Self> {
        let mut executor = Self {
            submitter: JobSubmitter {
                shared: Arc::default(),
            },
            workers: Vec::new(),
        };

        for class in QueueClass::ALL {
            let count = config.workers_for(class);
            for i in 0..count {
                let shared = Arc::clone(&executor.submitter.shared);
                let handle = thread::Builder::new()
                    .name(format!("stowage-{class}-{i}"))
                    .spawn(move || worker_loop(&shared, class))?;
                executor.workers.push(handle);
            }
            tracing::debug!(queue = %class, workers = count, "Spawned background workers");
        }

        Ok(executor)
    }

    /// A handle to submit jobs from other places, for example from within jobs.
    pub fn submitter(&self) -> JobSubmitter {
        self.submitter.clone()
    }

    /// See [`JobSubmitter::submit`].
    pub fn submit<J: Job>(&self, class: QueueClass, priority: Priority, job: J) -> JobController {
        self.submitter.submit(class, priority, job)
    }

    /// See [`JobSubmitter::queued`].
    pub fn queued(&self, class: QueueClass) -> usize {
        self.submitter.queued(class)
    }

    /// The total number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops all workers and fails every job that did not start yet.
    ///
    /// Running jobs are not cancelled, this blocks until they are done.
    pub fn shutdown(&mut self) {
        let mut aborted = 0;
        for class in QueueClass::ALL {
            let queue = self.submitter.shared.queue(class);
            let pending: Vec<QueuedJob> = {
                let mut state = queue.lock();
                state.shutdown = true;
                state.jobs.drain().collect()
            };
            queue.available.notify_all();

            aborted += pending.len();
            for job in pending {
                job.controller.abort(JobError::ShutDown);
            }
        }

        let workers = std::mem::take(&mut self.workers);
        if !workers.is_empty() {
            tracing::debug!(aborted, "Shutting down background workers");
        }
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("A background worker terminated abnormally");
            }
        }
    }
}

impl Drop for BackgroundExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BackgroundExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundExecutor")
            .field("workers", &self.workers.len())
            .field("queues", &self.submitter)
            .finish()
    }
}

fn worker_loop(shared: &Shared, class: QueueClass) {
    let queue = shared.queue(class);
    loop {
        let job = {
            let mut state = queue.lock();
            loop {
                if let Some(job) = state.jobs.pop() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = queue
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        run_job(class, job);
    }
}

fn run_job(class: QueueClass, job: QueuedJob) {
    let QueuedJob {
        controller, body, ..
    } = job;

    if !controller.start() {
        tracing::trace!(
            job = controller.name(),
            "Skipping job that was cancelled while queued"
        );
        metric!(counter("jobs.cancelled") += 1, "queue" => class.as_ref());
        return;
    }

    let start = Instant::now();
    let report = |progress| controller.set_progress(progress);
    let ctx = JobContext::new(controller.cancel_flag(), &report);
    let result = panic::catch_unwind(AssertUnwindSafe(|| body(&ctx)))
        .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload.as_ref()))));
    metric!(timer("jobs.duration") = start.elapsed(), "queue" => class.as_ref());

    match &result {
        Ok(_) => {
            metric!(counter("jobs.finished") += 1, "queue" => class.as_ref());
        }
        Err(err) if err.is_cancellation() => {
            tracing::debug!(job = controller.name(), "Job was cancelled");
            metric!(counter("jobs.cancelled") += 1, "queue" => class.as_ref());
        }
        Err(err @ JobError::Panicked(_)) => {
            sentry::with_scope(
                |scope| scope.set_extra("job", controller.name().into()),
                || tracing::error!(error = err as &dyn std::error::Error, "Job panicked"),
            );
            metric!(counter("jobs.failed") += 1, "queue" => class.as_ref());
        }
        Err(err) => {
            tracing::warn!(
                job = controller.name(),
                error = err as &dyn std::error::Error,
                "Job failed"
            );
            metric!(counter("jobs.failed") += 1, "queue" => class.as_ref());
        }
    }

    controller.complete(result);
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::jobs::{JobState, job_fn};

    fn executor(workers: usize) -> BackgroundExecutor {
        BackgroundExecutor::new(&WorkerConfig {
            compute: Some(workers),
            disk_io: 1,
            network: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_runs_job() {
        stowage_test::setup();
        let executor = executor(2);
        assert_eq!(executor.worker_count(), 4);

        let controller = executor.submit(
            QueueClass::Compute,
            Priority::NORMAL,
            job_fn(|ctx| {
                ctx.report_progress(0.5);
                Ok("hello".to_owned())
            }),
        );
        assert_eq!(controller.wait(), JobState::Finished);
        assert_eq!(controller.progress(), 1.0);
        assert_eq!(
            controller.output::<String>().unwrap().as_deref(),
            Some(&"hello".to_owned())
        );
    }

    #[test]
    fn test_failure_does_not_kill_worker() {
        stowage_test::setup();
        let executor = executor(1);

        let failing = executor.submit(
            QueueClass::Compute,
            Priority::NORMAL,
            job_fn(|_| Err::<(), _>(JobError::failed("broken input"))),
        );
        let panicking = executor.submit(
            QueueClass::Compute,
            Priority::NORMAL,
            job_fn(|_| -> Result<(), JobError> { panic!("oh no") }),
        );
        let fine = executor.submit(QueueClass::Compute, Priority::NORMAL, job_fn(|_| Ok(1)));

        assert_eq!(failing.wait(), JobState::Failed);
        assert_eq!(failing.error(), Some(JobError::Failed("broken input".into())));
        assert_eq!(panicking.wait(), JobState::Failed);
        assert_eq!(panicking.error(), Some(JobError::Panicked("oh no".into())));
        assert_eq!(fine.wait(), JobState::Finished);
    }

    #[test]
    fn test_cancel_running_job() {
        stowage_test::setup();
        let executor = executor(1);
        let (started_tx, started_rx) = mpsc::channel();

        let controller = executor.submit(
            QueueClass::Compute,
            Priority::NORMAL,
            job_fn(move |ctx| -> Result<(), JobError> {
                started_tx.send(()).ok();
                loop {
                    ctx.check_in()?;
                    thread::sleep(Duration::from_millis(1));
                }
            }),
        );

        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(controller.state(), JobState::Computing);
        controller.cancel();
        assert_eq!(controller.wait(), JobState::Failed);
        assert_eq!(controller.error(), Some(JobError::Cancelled));
    }

    #[test]
    fn test_shutdown_fails_queued_jobs() {
        stowage_test::setup();
        let mut executor = executor(1);
        let release = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = mpsc::channel();

        let blocker = {
            let release = Arc::clone(&release);
            executor.submit(
                QueueClass::Compute,
                Priority::NORMAL,
                job_fn(move |_| {
                    started_tx.send(()).ok();
                    while !release.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                }),
            )
        };
        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        let queued = executor.submit(QueueClass::Compute, Priority::NORMAL, job_fn(|_| Ok(())));
        assert_eq!(executor.queued(QueueClass::Compute), 1);

        let submitter = executor.submitter();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            release.store(true, Ordering::Release);
        });
        executor.shutdown();
        releaser.join().unwrap();

        assert_eq!(blocker.state(), JobState::Finished);
        assert_eq!(queued.error(), Some(JobError::ShutDown));

        let late = submitter.submit(QueueClass::Network, Priority::HIGH, job_fn(|_| Ok(())));
        assert_eq!(late.state(), JobState::Failed);
        assert_eq!(late.error(), Some(JobError::ShutDown));
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload = panic::catch_unwind(|| panic!("formatted {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 1");
    }
}
