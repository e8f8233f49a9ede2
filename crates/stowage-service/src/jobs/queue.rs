use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::controller::{ErasedValue, JobController};
use super::{JobContext, JobError, Priority};

/// A type-erased job body, ready to run on a worker.
pub(crate) type JobBody =
    Box<dyn FnOnce(&JobContext<'_>) -> Result<ErasedValue, JobError> + Send + 'static>;

pub(crate) struct QueuedJob {
    priority: Priority,
    seq: u64,
    pub controller: JobController,
    pub body: JobBody,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    /// The greatest job is dispatched first: highest priority, then lowest sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The pending jobs of a single queue class.
#[derive(Default)]
pub(crate) struct JobQueue {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
}

impl JobQueue {
    pub fn push(&mut self, priority: Priority, controller: JobController, body: JobBody) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedJob {
            priority,
            seq,
            controller,
            body,
        });
    }

    pub fn pop(&mut self) -> Option<QueuedJob> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = QueuedJob> + '_ {
        self.heap.drain()
    }
}
