//! # Background jobs
//!
//! A [`Job`] is a unit of user-supplied work that runs off the calling thread. While running it
//! reports progress and periodically checks in for cancellation through its [`JobContext`].
//!
//! There are two ways to run jobs:
//!
//! - The [`BackgroundExecutor`] owns one prioritized queue and one set of worker threads per
//!   [`QueueClass`]. [`JobSubmitter::submit`] never blocks and hands back a [`JobController`],
//!   which is polled for state, progress and the final output. Queue classes partition work by
//!   resource affinity, so a slow network queue never starves CPU-bound computations.
//! - The [`ConcurrentJobRunner`] is a synchronous fan-out/fan-in primitive. It runs a known,
//!   finite batch of jobs on a bounded pool and blocks until all of them are done or one fails.
//!
//! ## Cancellation
//!
//! Cancellation is cooperative only. Job bodies call [`JobContext::check_in`] at safe points,
//! which returns [`JobError::Cancelled`] once cancellation was requested, to be propagated with
//! `?`. A job that never checks in cannot be cancelled. Timeouts are not built in, but can be
//! layered on top by wrapping `check_in`.

use std::any::type_name;
use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;

mod controller;
mod error;
mod executor;
mod queue;
mod runner;

pub(crate) use controller::ErasedValue;
pub use controller::{JobController, JobState};
pub use error::{BatchError, JobError};
pub use executor::{BackgroundExecutor, JobSubmitter};
pub use runner::ConcurrentJobRunner;

/// A unit of work that can be executed in the background.
pub trait Job: Send + 'static {
    /// The value produced by a successful execution.
    type Output: Send + Sync + 'static;

    /// Runs the job to completion.
    ///
    /// Implementations should call [`JobContext::check_in`] regularly and propagate its error.
    fn execute(&mut self, ctx: &JobContext<'_>) -> Result<Self::Output, JobError>;

    /// A human readable name, used for logging.
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(type_name::<Self>())
    }
}

impl<J: Job + ?Sized> Job for Box<J> {
    type Output = J::Output;

    fn execute(&mut self, ctx: &JobContext<'_>) -> Result<Self::Output, JobError> {
        (**self).execute(ctx)
    }

    fn name(&self) -> Cow<'static, str> {
        (**self).name()
    }
}

/// The view a running [`Job`] has on its surroundings.
///
/// It is the only way for a job body to learn about cancellation and to report progress.
pub struct JobContext<'a> {
    cancelled: &'a AtomicBool,
    progress: &'a (dyn Fn(f32) + Sync),
    parent: Option<&'a JobContext<'a>>,
}

impl<'a> JobContext<'a> {
    /// Creates a context observing the `cancelled` flag and reporting to `progress`.
    ///
    /// This is what the executor and runner use internally. It can also be used to run a job
    /// inline on the current thread.
    pub fn new(cancelled: &'a AtomicBool, progress: &'a (dyn Fn(f32) + Sync)) -> Self {
        Self {
            cancelled,
            progress,
            parent: None,
        }
    }

    /// Creates a context that is additionally cancelled whenever `parent` is.
    pub(crate) fn nested(
        cancelled: &'a AtomicBool,
        progress: &'a (dyn Fn(f32) + Sync),
        parent: Option<&'a JobContext<'a>>,
    ) -> Self {
        Self {
            cancelled,
            progress,
            parent,
        }
    }

    /// The cancellation point of a job.
    ///
    /// Returns [`JobError::Cancelled`] once cancellation of this job, or of any job it is
    /// nested in, has been requested.
    pub fn check_in(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Whether cancellation has been requested, without failing.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.parent.is_some_and(|p| p.is_cancelled())
    }

    /// Reports the progress of this job, in the range `[0, 1]`.
    ///
    /// Values outside that range are clamped, and progress never goes backwards.
    pub fn report_progress(&self, progress: f32) {
        (self.progress)(clamp_progress(progress));
    }
}

impl fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("cancelled", &self.is_cancelled())
            .field("nested", &self.parent.is_some())
            .finish()
    }
}

pub(crate) fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// A [`Job`] backed by a closure, see [`job_fn`].
pub struct FnJob<F, T> {
    name: Cow<'static, str>,
    f: F,
    _output: PhantomData<fn() -> T>,
}

/// Turns a closure into a [`Job`].
pub fn job_fn<F, T>(f: F) -> FnJob<F, T>
where
    F: FnMut(&JobContext<'_>) -> Result<T, JobError> + Send + 'static,
    T: Send + Sync + 'static,
{
    FnJob {
        name: Cow::Borrowed("fn_job"),
        f,
        _output: PhantomData,
    }
}

impl<F, T> FnJob<F, T> {
    /// Gives this job a name for logging.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }
}

impl<F, T> Job for FnJob<F, T>
where
    F: FnMut(&JobContext<'_>) -> Result<T, JobError> + Send + 'static,
    T: Send + Sync + 'static,
{
    type Output = T;

    fn execute(&mut self, ctx: &JobContext<'_>) -> Result<T, JobError> {
        (self.f)(ctx)
    }

    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }
}

/// A partition of the background executor, isolating jobs by resource affinity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    /// CPU-bound computations.
    Compute,
    /// Jobs mostly waiting on the local disk.
    DiskIo,
    /// Jobs mostly waiting on the network.
    Network,
}

impl QueueClass {
    /// All queue classes, in index order.
    pub const ALL: [QueueClass; 3] = [QueueClass::Compute, QueueClass::DiskIo, QueueClass::Network];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl AsRef<str> for QueueClass {
    fn as_ref(&self) -> &str {
        match self {
            Self::Compute => "compute",
            Self::DiskIo => "disk_io",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Dispatch priority within a [`QueueClass`].
///
/// Higher priorities are dispatched first, equal priorities in submission order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Priority = Priority(-10);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(10);
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}
