use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use super::executor::panic_message;
use super::{BatchError, Job, JobContext, JobError};

/// Runs a fixed batch of jobs on a bounded pool and blocks until all of them are done.
///
/// Unlike the [`BackgroundExecutor`](super::BackgroundExecutor) this is a one-shot fan-out/fan-in
/// primitive, and must only be used from threads that can afford to wait. The first failing
/// job cancels all of its siblings, and the batch fails with a single [`BatchError`] once every
/// thread has stopped.
#[derive(Clone, Debug)]
pub struct ConcurrentJobRunner {
    max_threads: usize,
}

impl Default for ConcurrentJobRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentJobRunner {
    /// A runner using up to the available hardware concurrency.
    pub fn new() -> Self {
        Self {
            max_threads: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }

    /// Overrides the maximum number of threads per batch.
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads.max(1);
        self
    }

    /// The number of threads used for a batch of `jobs`, never more than there are jobs.
    pub fn thread_count(&self, jobs: usize) -> usize {
        self.max_threads.min(jobs).max(1)
    }

    /// Runs all `jobs`, returning their outputs in order.
    pub fn run<J: Job>(&self, jobs: Vec<J>) -> Result<Vec<J::Output>, BatchError> {
        self.run_with_progress(jobs, |_| {})
    }

    /// Like [`run`](Self::run), reporting the combined progress of all jobs to `on_progress`.
    ///
    /// Every job contributes equally.
    pub fn run_with_progress<J, P>(
        &self,
        jobs: Vec<J>,
        on_progress: P,
    ) -> Result<Vec<J::Output>, BatchError>
    where
        J: Job,
        P: Fn(f32) + Sync,
    {
        let jobs = jobs.into_iter().map(|job| (1.0, job)).collect();
        self.run_weighted(jobs, on_progress)
    }

    /// Like [`run_with_progress`](Self::run_with_progress), with an explicit weight per job.
    ///
    /// When no job has a positive weight, all jobs contribute equally.
    pub fn run_weighted<J, P>(
        &self,
        jobs: Vec<(f32, J)>,
        on_progress: P,
    ) -> Result<Vec<J::Output>, BatchError>
    where
        J: Job,
        P: Fn(f32) + Sync,
    {
        self.execute(None, jobs, &on_progress)
    }

    /// Runs a batch from within another job.
    ///
    /// Cancelling `parent` cancels the whole batch, and the progress of the batch is reported
    /// as the progress of `parent`.
    pub fn run_nested<J: Job>(
        &self,
        parent: &JobContext<'_>,
        jobs: Vec<J>,
    ) -> Result<Vec<J::Output>, BatchError> {
        let jobs = jobs.into_iter().map(|job| (1.0, job)).collect();
        let report = |progress| parent.report_progress(progress);
        self.execute(Some(parent), jobs, &report)
    }

    fn execute<J: Job>(
        &self,
        parent: Option<&JobContext<'_>>,
        jobs: Vec<(f32, J)>,
        on_progress: &(dyn Fn(f32) + Sync),
    ) -> Result<Vec<J::Output>, BatchError> {
        let count = jobs.len();
        if count == 0 {
            return Ok(Vec::new());
        }
        metric!(counter("runner.batches") += 1);

        let mut weights: Vec<f32> = jobs
            .iter()
            .map(|(weight, _)| if *weight > 0.0 { *weight } else { 0.0 })
            .collect();
        let mut total_weight: f32 = weights.iter().sum();
        if total_weight <= 0.0 || !total_weight.is_finite() {
            weights.fill(1.0);
            total_weight = count as f32;
        }

        let slots: Vec<_> = jobs
            .into_iter()
            .map(|(_, job)| Mutex::new(Some(job)))
            .collect();
        let outputs: Vec<Mutex<Option<J::Output>>> =
            (0..count).map(|_| Mutex::new(None)).collect();
        let progress: Vec<AtomicU32> = (0..count).map(|_| AtomicU32::new(0)).collect();
        let cursor = AtomicUsize::new(0);
        let cancelled = AtomicBool::new(false);
        let first_failure = Mutex::new(None::<(usize, JobError)>);

        let reported = Mutex::new(0.0f32);
        let report_combined = || {
            let mut reported = reported.lock().unwrap_or_else(PoisonError::into_inner);
            let done: f32 = progress
                .iter()
                .zip(&weights)
                .map(|(p, w)| f32::from_bits(p.load(Ordering::Acquire)) * w)
                .sum();
            let done = (done / total_weight).clamp(0.0, 1.0);
            if done > *reported {
                *reported = done;
                on_progress(done);
            }
        };
        let set_progress = |index: usize, value: f32| {
            let bits = value.to_bits();
            // non-negative floats order the same way as their bit patterns
            let previous = progress[index].fetch_max(bits, Ordering::AcqRel);
            if previous < bits {
                report_combined();
            }
        };

        let threads = self.thread_count(count);
        tracing::debug!("Running batch of {} jobs on {} threads", count, threads);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("stowage-batch-{i}"))
            .build()
            .map_err(|e| BatchError::Spawn(e.to_string()))?;

        pool.scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|_| {
                    loop {
                        if cancelled.load(Ordering::Acquire)
                            || parent.is_some_and(|p| p.is_cancelled())
                        {
                            break;
                        }
                        let index = cursor.fetch_add(1, Ordering::AcqRel);
                        if index >= count {
                            break;
                        }
                        let job = slots[index]
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take();
                        let Some(mut job) = job else {
                            continue;
                        };

                        let report = |value| set_progress(index, value);
                        let ctx = JobContext::nested(&cancelled, &report, parent);
                        let result = panic::catch_unwind(AssertUnwindSafe(|| job.execute(&ctx)))
                            .unwrap_or_else(|payload| {
                                Err(JobError::Panicked(panic_message(payload.as_ref())))
                            });

                        match result {
                            Ok(output) => {
                                set_progress(index, 1.0);
                                *outputs[index]
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner) = Some(output);
                            }
                            Err(err) => {
                                let mut failure = first_failure
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner);
                                if failure.is_none() {
                                    *failure = Some((index, err));
                                }
                                drop(failure);
                                cancelled.store(true, Ordering::Release);
                            }
                        }
                    }
                });
            }
        });

        let failure = first_failure
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        match failure {
            Some((_, err)) if err.is_cancellation() => {
                tracing::debug!("Batch was cancelled");
                Err(BatchError::Cancelled)
            }
            Some((index, err)) => {
                tracing::warn!(
                    index,
                    error = &err as &dyn std::error::Error,
                    "Job of batch failed, cancelled its siblings"
                );
                metric!(counter("runner.failures") += 1);
                Err(BatchError::JobFailed {
                    index,
                    message: err.to_string(),
                })
            }
            None => outputs
                .into_iter()
                .map(|output| output.into_inner().unwrap_or_else(PoisonError::into_inner))
                .collect::<Option<Vec<_>>>()
                // some jobs were skipped because the parent was cancelled
                .ok_or(BatchError::Cancelled),
        }
    }
}
