use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Issues strictly increasing timestamps, in nanoseconds since the UNIX epoch.
///
/// Follows the wall clock, but never goes backwards, even if the wall clock does.
#[derive(Debug)]
pub(crate) struct UsageClock {
    last: AtomicU64,
}

impl UsageClock {
    /// A clock that issues timestamps greater than `floor`.
    pub fn new(floor: u64) -> Self {
        Self {
            last: AtomicU64::new(floor),
        }
    }

    pub fn now(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

/// Tracks when a cache was last used, to detect idleness.
#[derive(Debug)]
pub(crate) struct ActivityTracker {
    epoch: Instant,
    /// Nanoseconds since `epoch`.
    last: AtomicU64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_nanos(self.last.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// A deferred update of an entry's `last_used` timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct UsageRecord {
    pub id: u64,
    pub timestamp: u64,
}

/// Usage records waiting to be written to the index.
#[derive(Debug, Default)]
pub(crate) struct UsageBuffer {
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageBuffer {
    /// Buffers `record`, returning `true` once at least `max` records are pending.
    pub fn push(&self, record: UsageRecord, max: usize) -> bool {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push(record);
        records.len() >= max
    }

    pub fn take(&self) -> Vec<UsageRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
