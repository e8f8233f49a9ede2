//! The in-process, non-persistent value cache.
//!
//! Values are looked up through typed [`CachedValue`] handles. A handle is pointed at a
//! [`CacheKey`] with [`CachedValue::reset`], asked to compute a missing value with
//! [`CachedValue::ensure_loading`], and then polled once per cycle with [`CachedValue::update`],
//! which never blocks.
//!
//! All handles pointed at the same key share one slot, so a value is computed at most once no
//! matter how many callers ask for it concurrently.

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::InMemoryCacheConfig;
use crate::jobs::{
    ErasedValue, Job, JobController, JobError, JobState, JobSubmitter, Priority, QueueClass,
};

use super::CacheKey;

/// The observable state of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// Nothing is known about the entry, and nothing is computing it.
    Uninitialized,
    /// A job computing the value is queued or running.
    Loading,
    /// The value is available.
    Ready,
    /// Computing the value failed. The failure is not retried automatically.
    Failed,
}

enum SlotState {
    Uninitialized,
    Loading(JobController),
    Ready(ErasedValue),
    Failed(JobError),
}

impl SlotState {
    fn tag(&self) -> CacheState {
        match self {
            Self::Uninitialized => CacheState::Uninitialized,
            Self::Loading(_) => CacheState::Loading,
            Self::Ready(_) => CacheState::Ready,
            Self::Failed(_) => CacheState::Failed,
        }
    }
}

/// The outcome of polling a slot, including the transitions the cache has to follow up on.
enum Poll {
    Pending(CacheState),
    Ready(ErasedValue),
    Promote(ErasedValue),
    Failed(JobError),
    NewlyFailed(JobError),
}

struct Slot {
    key: CacheKey,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(key: CacheKey, state: SlotState) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Follows a `Loading` slot to the outcome of its job.
    fn poll(&self) -> Poll {
        let mut state = self.lock();
        let next = match &*state {
            SlotState::Uninitialized => return Poll::Pending(CacheState::Uninitialized),
            SlotState::Ready(value) => return Poll::Ready(Arc::clone(value)),
            SlotState::Failed(err) => return Poll::Failed(err.clone()),
            SlotState::Loading(controller) => match controller.state() {
                JobState::Queued | JobState::Computing => {
                    return Poll::Pending(CacheState::Loading);
                }
                JobState::Finished => match controller.erased_output() {
                    Some(value) => SlotState::Ready(value),
                    None => SlotState::Failed(JobError::failed("job finished without output")),
                },
                JobState::Failed => {
                    SlotState::Failed(controller.error().unwrap_or(JobError::Cancelled))
                }
            },
        };
        *state = next;
        match &*state {
            SlotState::Ready(value) => Poll::Promote(Arc::clone(value)),
            SlotState::Failed(err) => Poll::NewlyFailed(err.clone()),
            other => Poll::Pending(other.tag()),
        }
    }
}

fn downcast<T: Send + Sync + 'static>(value: ErasedValue) -> Result<Arc<T>, JobError> {
    value.downcast::<T>().map_err(|_| JobError::TypeMismatch {
        expected: type_name::<T>(),
    })
}

struct Inner {
    /// Computed values, bounded and expiring.
    ready: moka::sync::Cache<CacheKey, Arc<Slot>>,
    /// Uninitialized and loading slots, kept while a handle refers to them.
    pending: Mutex<BTreeMap<CacheKey, Arc<Slot>>>,
    submitter: JobSubmitter,
}

/// A non-persistent map from [`CacheKey`] to computed, or in-flight, values.
///
/// Cloning the cache is cheap, all clones share the same entries.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl MemoryCache {
    /// Creates a cache whose jobs are submitted through `submitter`.
    pub fn new(config: &InMemoryCacheConfig, submitter: JobSubmitter) -> Self {
        let mut builder = moka::sync::Cache::builder()
            .name("memory")
            .max_capacity(config.capacity);
        if let Some(time_to_idle) = config.time_to_idle {
            builder = builder.time_to_idle(time_to_idle);
        }

        Self {
            inner: Arc::new(Inner {
                ready: builder.build(),
                pending: Default::default(),
                submitter,
            }),
        }
    }

    /// Creates an unassociated handle for values of type `T`.
    pub fn handle<T: Send + Sync + 'static>(&self) -> CachedValue<T> {
        CachedValue {
            cache: self.clone(),
            slot: None,
            value: None,
            _type: PhantomData,
        }
    }

    fn pending(&self) -> MutexGuard<'_, BTreeMap<CacheKey, Arc<Slot>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The slot of `key`, creating an uninitialized one if there is none.
    fn slot(&self, key: CacheKey) -> Arc<Slot> {
        let mut pending = self.pending();
        if let Some(slot) = self.inner.ready.get(&key) {
            return slot;
        }
        Arc::clone(
            pending
                .entry(key.clone())
                .or_insert_with(|| Slot::new(key, SlotState::Uninitialized)),
        )
    }

    fn existing_slot(&self, key: &CacheKey) -> Option<Arc<Slot>> {
        let pending = self.pending();
        self.inner
            .ready
            .get(key)
            .or_else(|| pending.get(key).cloned())
    }

    /// Applies the transitions observed by [`Slot::poll`] to the cache itself.
    fn settle(&self, slot: &Arc<Slot>, poll: Poll) -> Result<Option<ErasedValue>, JobError> {
        match poll {
            Poll::Pending(_) => Ok(None),
            Poll::Ready(value) => Ok(Some(value)),
            Poll::Promote(value) => {
                let mut pending = self.pending();
                if pending
                    .get(&slot.key)
                    .is_some_and(|current| Arc::ptr_eq(current, slot))
                {
                    pending.remove(&slot.key);
                    self.inner.ready.insert(slot.key.clone(), Arc::clone(slot));
                }
                Ok(Some(value))
            }
            Poll::Failed(err) => Err(err),
            Poll::NewlyFailed(err) => {
                self.unlink(slot);
                if err.is_cancellation() {
                    tracing::debug!("Computation of `{}` was cancelled", slot.key);
                } else {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "Computation of `{}` failed",
                        slot.key
                    );
                }
                Err(err)
            }
        }
    }

    fn unlink(&self, slot: &Arc<Slot>) {
        let mut pending = self.pending();
        if pending
            .get(&slot.key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            pending.remove(&slot.key);
        }
    }

    /// Retires a pending slot once no handle refers to it anymore.
    fn release_slot(&self, slot: Arc<Slot>) {
        let mut pending = self.pending();
        let unused = pending
            .get(&slot.key)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
            && Arc::strong_count(&slot) == 2;
        if unused {
            self.retire(&mut pending, &slot);
        }
    }

    /// Retires every pending slot that lost its last handle without being released.
    fn sweep_pending(&self) {
        let mut pending = self.pending();
        let unused: Vec<_> = pending
            .values()
            .filter(|slot| Arc::strong_count(slot) == 1)
            .cloned()
            .collect();
        for slot in unused {
            self.retire(&mut pending, &slot);
        }
    }

    /// Removes an unreferenced slot from `pending`.
    ///
    /// Computed values move into the bounded map. Jobs still in flight are cancelled, since
    /// nobody is waiting for their output.
    fn retire(&self, pending: &mut BTreeMap<CacheKey, Arc<Slot>>, slot: &Arc<Slot>) {
        pending.remove(&slot.key);
        match slot.poll() {
            Poll::Ready(_) | Poll::Promote(_) => {
                self.inner.ready.insert(slot.key.clone(), Arc::clone(slot));
            }
            Poll::Pending(CacheState::Loading) => {
                if let SlotState::Loading(controller) = &*slot.lock() {
                    tracing::trace!("Cancelling unused computation of `{}`", slot.key);
                    controller.cancel();
                    metric!(counter("caches.memory.abandoned") += 1);
                }
            }
            Poll::Pending(_) | Poll::Failed(_) | Poll::NewlyFailed(_) => {}
        }
    }

    /// Installs an already available value for `key`.
    ///
    /// Handles waiting for a job to compute `key` observe the value on their next update.
    pub fn set<T: Send + Sync + 'static>(&self, key: CacheKey, value: T) {
        let value: ErasedValue = Arc::new(value);
        let mut pending = self.pending();
        let slot = match pending.remove(&key) {
            Some(slot) => {
                *slot.lock() = SlotState::Ready(value);
                slot
            }
            None => Slot::new(key.clone(), SlotState::Ready(value)),
        };
        self.inner.ready.insert(key, slot);
    }

    /// The value of `key`, if it is computed.
    ///
    /// Fails with the job's error if computing it failed, and with
    /// [`JobError::TypeMismatch`] if the value is not a `T`.
    pub fn get<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Result<Option<Arc<T>>, JobError> {
        self.sweep_pending();
        let Some(slot) = self.existing_slot(key) else {
            return Ok(None);
        };
        let poll = slot.poll();
        match self.settle(&slot, poll)? {
            Some(value) => downcast(value).map(Some),
            None => Ok(None),
        }
    }

    /// The current state of `key`, without following any job.
    pub fn state(&self, key: &CacheKey) -> CacheState {
        match self.existing_slot(key) {
            Some(slot) => slot.lock().tag(),
            None => CacheState::Uninitialized,
        }
    }

    /// Removes `key`, returning whether there was an entry.
    ///
    /// Handles still pointing at the entry keep it alive, but it is no longer shared with new
    /// lookups.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut pending = self.pending();
        let removed = pending.remove(key).is_some();
        removed | self.inner.ready.remove(key).is_some()
    }

    /// Removes all entries.
    pub fn clear(&self) {
        let mut pending = self.pending();
        pending.clear();
        self.inner.ready.invalidate_all();
    }

    /// The number of entries, computed or not.
    pub fn entry_count(&self) -> u64 {
        self.sweep_pending();
        let pending = self.pending().len() as u64;
        self.inner.ready.run_pending_tasks();
        pending + self.inner.ready.entry_count()
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("ready", &self.inner.ready.entry_count())
            .field("pending", &self.pending().len())
            .finish()
    }
}

/// A typed handle to one entry of a [`MemoryCache`].
///
/// The handle caches the typed value once it has been observed, so repeated reads of a ready
/// value do not touch any lock.
pub struct CachedValue<T> {
    cache: MemoryCache,
    slot: Option<Arc<Slot>>,
    value: Option<Arc<T>>,
    _type: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> CachedValue<T> {
    /// Points this handle at `key`.
    ///
    /// Resetting to the key the handle already points at does nothing, unless computing it
    /// failed. In that case the handle starts over with a fresh entry.
    pub fn reset(&mut self, key: CacheKey) {
        let unchanged = self.slot.as_ref().is_some_and(|slot| {
            slot.key == key && !matches!(*slot.lock(), SlotState::Failed(_))
        });
        if unchanged {
            return;
        }
        self.release();
        self.slot = Some(self.cache.slot(key));
    }

    /// Points this handle at `key` and makes sure its value is being computed.
    ///
    /// Returns whether a new job was submitted, see [`ensure_loading`](Self::ensure_loading).
    pub fn reset_with<J, F>(
        &mut self,
        key: CacheKey,
        class: QueueClass,
        priority: Priority,
        make_job: F,
    ) -> bool
    where
        J: Job<Output = T>,
        F: FnOnce() -> J,
    {
        self.reset(key);
        self.ensure_loading(class, priority, make_job)
    }

    /// Submits the job created by `make_job` if nothing computes the value yet.
    ///
    /// Returns `true` only for the one caller that submitted the job. Concurrent callers sharing
    /// the entry get `false` and observe the same job.
    pub fn ensure_loading<J, F>(&mut self, class: QueueClass, priority: Priority, make_job: F) -> bool
    where
        J: Job<Output = T>,
        F: FnOnce() -> J,
    {
        let Some(slot) = &self.slot else {
            return false;
        };
        if matches!(*slot.lock(), SlotState::Uninitialized) {
            // `make_job` may look at the cache, so it runs without holding the slot
            let job = make_job();
            let mut state = slot.lock();
            if matches!(*state, SlotState::Uninitialized) {
                let controller = self.cache.inner.submitter.submit(class, priority, job);
                tracing::trace!("Computing `{}` in job {}", slot.key, controller.id());
                *state = SlotState::Loading(controller);
                metric!(counter("caches.memory.computation") += 1, "queue" => class.as_ref());
                return true;
            }
        }

        match &*slot.lock() {
            SlotState::Uninitialized => false,
            SlotState::Loading(_) => {
                metric!(counter("caches.memory.coalesced") += 1);
                false
            }
            SlotState::Ready(_) => {
                metric!(counter("caches.memory.hit") += 1);
                false
            }
            SlotState::Failed(_) => false,
        }
    }

    /// Polls the entry without blocking.
    ///
    /// A loading entry whose job finished becomes ready. A failed job is reported as an error
    /// exactly like its [`JobController::error`], and is not retried.
    pub fn update(&mut self) -> Result<CacheState, JobError> {
        if self.value.is_some() {
            return Ok(CacheState::Ready);
        }
        let Some(slot) = &self.slot else {
            return Ok(CacheState::Uninitialized);
        };
        let poll = slot.poll();
        let state = match &poll {
            Poll::Pending(state) => *state,
            _ => CacheState::Ready,
        };
        match self.cache.settle(slot, poll)? {
            Some(value) => {
                self.value = Some(downcast(value)?);
                Ok(CacheState::Ready)
            }
            None => Ok(state),
        }
    }

    /// The state of the entry as of the last transition, without following its job.
    pub fn state(&self) -> CacheState {
        if self.value.is_some() {
            return CacheState::Ready;
        }
        match &self.slot {
            Some(slot) => slot.lock().tag(),
            None => CacheState::Uninitialized,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == CacheState::Ready
    }

    /// The value, once the entry is ready and holds a `T`.
    pub fn get(&self) -> Option<Arc<T>> {
        if let Some(value) = &self.value {
            return Some(Arc::clone(value));
        }
        match &*self.slot.as_ref()?.lock() {
            SlotState::Ready(value) => downcast(Arc::clone(value)).ok(),
            _ => None,
        }
    }

    /// The progress of the computation, `1.0` once ready.
    pub fn progress(&self) -> f32 {
        if self.value.is_some() {
            return 1.0;
        }
        match self.slot.as_ref().map(|slot| slot.lock()).as_deref() {
            Some(SlotState::Loading(controller)) => controller.progress(),
            Some(SlotState::Ready(_)) => 1.0,
            _ => 0.0,
        }
    }

    /// The job computing the value, while it is loading.
    pub fn controller(&self) -> Option<JobController> {
        match &*self.slot.as_ref()?.lock() {
            SlotState::Loading(controller) => Some(controller.clone()),
            _ => None,
        }
    }

    pub fn key(&self) -> Option<&CacheKey> {
        self.slot.as_ref().map(|slot| &slot.key)
    }

    /// Disassociates this handle from its entry.
    pub fn release(&mut self) {
        self.value = None;
        if let Some(slot) = self.slot.take() {
            self.cache.release_slot(slot);
        }
    }
}

impl<T> Drop for CachedValue<T> {
    fn drop(&mut self) {
        self.value = None;
        if let Some(slot) = self.slot.take() {
            self.cache.release_slot(slot);
        }
    }
}

impl<T> fmt::Debug for CachedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedValue")
            .field("type", &type_name::<T>())
            .field("key", &self.slot.as_ref().map(|slot| &slot.key))
            .field("has_value", &self.value.is_some())
            .finish()
    }
}
