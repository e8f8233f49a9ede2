use std::any::{Any, type_name};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{JobError, QueueClass, clamp_progress};

/// A type-erased, shared job output.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// The lifecycle of a submitted job.
///
/// `Queued -> Computing -> Finished | Failed`, or `Queued -> Failed` when cancelled before it
/// started. `Finished` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobState {
    Queued,
    Computing,
    Finished,
    Failed,
}

impl JobState {
    /// Whether no further transitions can happen.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// A handle tracking the state, progress and outcome of a submitted job.
///
/// Controllers are cheap to clone, all clones observe the same job.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    id: u64,
    name: String,
    queue: QueueClass,
    cancel_requested: AtomicBool,
    status: Mutex<Status>,
    changed: Condvar,
}

struct Status {
    state: JobState,
    progress: f32,
    error: Option<JobError>,
    output: Option<ErasedValue>,
}

impl JobController {
    pub(crate) fn new(name: String, queue: QueueClass) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
                name,
                queue,
                cancel_requested: AtomicBool::new(false),
                status: Mutex::new(Status {
                    state: JobState::Queued,
                    progress: 0.0,
                    error: None,
                    output: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// A process-unique id of this job.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The queue class this job was submitted to.
    pub fn queue(&self) -> QueueClass {
        self.inner.queue
    }

    pub fn state(&self) -> JobState {
        self.status().state
    }

    /// Progress in `[0, 1]`, only meaningful while computing and `1.0` once finished.
    pub fn progress(&self) -> f32 {
        self.status().progress
    }

    /// The error the job failed with, if it failed.
    pub fn error(&self) -> Option<JobError> {
        self.status().error.clone()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// The output of a finished job.
    ///
    /// Returns `Ok(None)` while the job has not finished yet, and the job's error once it
    /// failed. Requesting the output as a different type than the job produced fails with
    /// [`JobError::TypeMismatch`].
    pub fn output<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>, JobError> {
        let status = self.status();
        match status.state {
            JobState::Queued | JobState::Computing => Ok(None),
            JobState::Failed => Err(status.error.clone().unwrap_or(JobError::Cancelled)),
            JobState::Finished => match &status.output {
                Some(output) => Arc::clone(output)
                    .downcast::<T>()
                    .map(Some)
                    .map_err(|_| JobError::TypeMismatch {
                        expected: type_name::<T>(),
                    }),
                None => Ok(None),
            },
        }
    }

    pub(crate) fn erased_output(&self) -> Option<ErasedValue> {
        self.status().output.clone()
    }

    /// Requests cancellation of this job.
    ///
    /// A job that has not started yet fails right away. A running job fails the next time it
    /// checks in. Finished jobs are not affected.
    pub fn cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::Release);
        let mut status = self.status();
        if status.state == JobState::Queued {
            status.state = JobState::Failed;
            status.error = Some(JobError::Cancelled);
            self.inner.changed.notify_all();
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_flag(&self) -> &AtomicBool {
        &self.inner.cancel_requested
    }

    /// Blocks until the job is done.
    ///
    /// Must not be used from a thread that cannot afford to wait.
    pub fn wait(&self) -> JobState {
        let mut status = self.status();
        while !status.state.is_done() {
            status = self
                .inner
                .changed
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
        status.state
    }

    /// Blocks until the job is done or `timeout` elapsed, returning whether it is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.status();
        while !status.state.is_done() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            status = self
                .inner
                .changed
                .wait_timeout(status, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Transitions `Queued -> Computing`, returning `false` if the job must not run.
    pub(crate) fn start(&self) -> bool {
        let mut status = self.status();
        if status.state != JobState::Queued {
            return false;
        }
        status.state = JobState::Computing;
        self.inner.changed.notify_all();
        true
    }

    pub(crate) fn set_progress(&self, progress: f32) {
        let progress = clamp_progress(progress);
        let mut status = self.status();
        if status.state == JobState::Computing && progress >= status.progress {
            status.progress = progress;
        }
    }

    /// Records the outcome of a running job.
    pub(crate) fn complete(&self, result: Result<ErasedValue, JobError>) {
        let mut status = self.status();
        if status.state != JobState::Computing {
            return;
        }
        match result {
            Ok(output) => {
                status.state = JobState::Finished;
                status.progress = 1.0;
                status.output = Some(output);
            }
            Err(error) => {
                status.state = JobState::Failed;
                status.error = Some(error);
            }
        }
        self.inner.changed.notify_all();
    }

    /// Fails a job that never started.
    pub(crate) fn abort(&self, error: JobError) {
        let mut status = self.status();
        if status.state == JobState::Queued {
            status.state = JobState::Failed;
            status.error = Some(error);
            self.inner.changed.notify_all();
        }
    }
}

impl PartialEq for JobController {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for JobController {}

impl fmt::Debug for JobController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("JobController")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("queue", &self.inner.queue)
            .field("state", &status.state)
            .field("progress", &status.progress)
            .field("error", &status.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> JobController {
        JobController::new("test".into(), QueueClass::Compute)
    }

    #[test]
    fn test_happy_path() {
        let c = controller();
        assert_eq!(c.state(), JobState::Queued);
        assert_eq!(c.output::<u32>(), Ok(None));

        assert!(c.start());
        assert!(!c.start());
        assert_eq!(c.state(), JobState::Computing);

        c.set_progress(0.4);
        c.set_progress(0.2);
        assert_eq!(c.progress(), 0.4);
        c.set_progress(3.0);
        assert_eq!(c.progress(), 1.0);

        c.complete(Ok(Arc::new(7u32)));
        assert_eq!(c.state(), JobState::Finished);
        assert_eq!(c.output::<u32>(), Ok(Some(Arc::new(7))));
        assert_eq!(
            c.output::<String>(),
            Err(JobError::TypeMismatch {
                expected: "alloc::string::String"
            })
        );
    }

    #[test]
    fn test_finished_forces_full_progress() {
        let c = controller();
        c.start();
        c.set_progress(0.1);
        c.complete(Ok(Arc::new(())));
        assert_eq!(c.progress(), 1.0);
    }

    #[test]
    fn test_cancel_while_queued() {
        let c = controller();
        c.cancel();
        assert!(c.is_cancel_requested());
        assert_eq!(c.state(), JobState::Failed);
        assert_eq!(c.error(), Some(JobError::Cancelled));
        // a worker picking it up later must not run it
        assert!(!c.start());
        assert!(c.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let c = controller();
        c.start();
        c.complete(Err(JobError::failed("nope")));
        c.complete(Ok(Arc::new(1u8)));
        c.cancel();
        c.abort(JobError::ShutDown);
        assert_eq!(c.state(), JobState::Failed);
        assert_eq!(c.error(), Some(JobError::Failed("nope".into())));
        assert_eq!(c.output::<u8>(), Err(JobError::Failed("nope".into())));
    }

    #[test]
    fn test_cancel_while_computing() {
        let c = controller();
        c.start();
        c.cancel();
        // running jobs only stop at their next check-in
        assert_eq!(c.state(), JobState::Computing);
        assert!(c.cancel_flag().load(Ordering::Acquire));
    }

    #[test]
    fn test_wait_across_threads() {
        let c = controller();
        let worker = c.clone();
        let handle = std::thread::spawn(move || {
            worker.start();
            worker.complete(Ok(Arc::new("done")));
        });
        assert_eq!(c.wait(), JobState::Finished);
        handle.join().unwrap();
    }

    #[test]
    fn test_identity() {
        let c = controller();
        assert_ne!(c, controller());
        assert_eq!(c, c.clone());
    }
}
