//! Type-keyed collection of dispatchers.

use core::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::debug;

use crate::delivery::ProcessStats;
use crate::error::DispatchResult;
use crate::job::{Job, JobDispatcher};
use crate::{Callback, DispatcherConfig, EntityHandle, Event, TypedDispatcher};

/// Operations the registry runs over every dispatcher regardless of type.
pub(crate) trait ErasedDispatcher: Send + Sync {
    fn name(&self) -> &'static str;
    fn process(&self) -> ProcessStats;
    fn reset(&self);
    fn unsubscribe_entity(&self, entity: EntityHandle) -> usize;
    fn verify_no_subscribers(&self) -> DispatchResult<()>;
    fn verify_no_subscribers_log(&self) -> usize;
    fn dispose(&self);
}

/// Anything that accepts queued events of type `E`.
pub(crate) trait QueueSink<E>: Send + Sync {
    fn queue(&self, entity: EntityHandle, event: E);
}

impl<E: Event> ErasedDispatcher for TypedDispatcher<E> {
    fn name(&self) -> &'static str {
        E::name()
    }

    fn process(&self) -> ProcessStats {
        Self::process(self)
    }

    fn reset(&self) {
        Self::reset(self);
    }

    fn unsubscribe_entity(&self, entity: EntityHandle) -> usize {
        Self::unsubscribe_entity(self, entity)
    }

    fn verify_no_subscribers(&self) -> DispatchResult<()> {
        Self::verify_no_subscribers(self)
    }

    fn verify_no_subscribers_log(&self) -> usize {
        Self::verify_no_subscribers_log(self)
    }

    fn dispose(&self) {
        Self::dispose(self);
    }
}

impl<J: Job<E>, E: Event> ErasedDispatcher for JobDispatcher<J, E> {
    fn name(&self) -> &'static str {
        Self::name()
    }

    fn process(&self) -> ProcessStats {
        Self::process(self)
    }

    fn reset(&self) {
        Self::reset(self);
    }

    fn unsubscribe_entity(&self, entity: EntityHandle) -> usize {
        Self::unsubscribe_entity(self, entity)
    }

    fn verify_no_subscribers(&self) -> DispatchResult<()> {
        Self::verify_no_subscribers(self)
    }

    fn verify_no_subscribers_log(&self) -> usize {
        Self::verify_no_subscribers_log(self)
    }

    fn dispose(&self) {
        Self::dispose(self);
    }
}

impl<J: Job<E>, E: Event> QueueSink<E> for JobDispatcher<J, E> {
    fn queue(&self, entity: EntityHandle, event: E) {
        Self::queue(self, entity, event);
    }
}

/// Job dispatchers listening to one event type.
type JobSinks<E> = SmallVec<[Arc<dyn QueueSink<E>>; 2]>;

#[derive(Default)]
struct RegistryInner {
    config: DispatcherConfig,
    /// `TypeId` of the event -> `TypedDispatcher<E>`
    events: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    /// `(TypeId` of the job, `TypeId` of the event`)` -> `JobDispatcher<J, E>`
    jobs: HashMap<(TypeId, TypeId), Box<dyn Any + Send + Sync>>,
    /// `TypeId` of the event -> `JobSinks<E>`
    job_sinks: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    /// Every dispatcher in creation order.
    all: Vec<Arc<dyn ErasedDispatcher>>,
}

/// One dispatcher per event type and one per job type, created on first use.
///
/// Queuing an event reaches the plain dispatcher for that event type and
/// every job dispatcher driven by it.
#[derive(Clone, Default)]
pub struct DispatcherRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl DispatcherRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry whose dispatchers use `config`.
    #[must_use]
    pub fn with_config(config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                config,
                ..RegistryInner::default()
            })),
        }
    }

    /// Get the dispatcher for `E`, creating it if needed.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidEventType`](crate::DispatchError::InvalidEventType)
    /// if `E` is not fixed-layout.
    pub fn register_event<E: Event>(&self) -> DispatchResult<TypedDispatcher<E>> {
        if let Some(dispatcher) = self.dispatcher::<E>() {
            return Ok(dispatcher);
        }

        let mut inner = self.inner.write();
        if let Some(existing) = inner
            .events
            .get(&TypeId::of::<E>())
            .and_then(|d| d.downcast_ref::<TypedDispatcher<E>>())
        {
            return Ok(existing.clone());
        }

        let dispatcher = TypedDispatcher::<E>::with_config(inner.config)?;
        debug!(event = E::name(), "created dispatcher");

        inner
            .events
            .insert(TypeId::of::<E>(), Box::new(dispatcher.clone()));
        inner.all.push(Arc::new(dispatcher.clone()));

        Ok(dispatcher)
    }

    /// Get the job dispatcher for `J` driven by `E`, creating it if needed.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidEventType`](crate::DispatchError::InvalidEventType)
    /// or [`DispatchError::InvalidJobStateType`](crate::DispatchError::InvalidJobStateType)
    /// if either type is not fixed-layout.
    pub fn register_job<J: Job<E>, E: Event>(&self) -> DispatchResult<JobDispatcher<J, E>> {
        if let Some(dispatcher) = self.job_dispatcher::<J, E>() {
            return Ok(dispatcher);
        }

        let key = (TypeId::of::<J>(), TypeId::of::<E>());
        let mut inner = self.inner.write();
        if let Some(existing) = inner
            .jobs
            .get(&key)
            .and_then(|d| d.downcast_ref::<JobDispatcher<J, E>>())
        {
            return Ok(existing.clone());
        }

        let dispatcher = JobDispatcher::<J, E>::with_config(inner.config)?;
        debug!(job = JobDispatcher::<J, E>::name(), event = E::name(), "created job dispatcher");

        inner.jobs.insert(key, Box::new(dispatcher.clone()));
        inner.all.push(Arc::new(dispatcher.clone()));

        let sink: Arc<dyn QueueSink<E>> = Arc::new(dispatcher.clone());
        let sinks = inner
            .job_sinks
            .entry(TypeId::of::<E>())
            .or_insert_with(|| -> Box<dyn Any + Send + Sync> { Box::new(JobSinks::<E>::new()) });
        if let Some(sinks) = sinks.downcast_mut::<JobSinks<E>>() {
            sinks.push(sink);
        }

        Ok(dispatcher)
    }

    /// Typed handle to an existing dispatcher for `E`.
    #[must_use]
    pub fn dispatcher<E: Event>(&self) -> Option<TypedDispatcher<E>> {
        self.inner
            .read()
            .events
            .get(&TypeId::of::<E>())
            .and_then(|d| d.downcast_ref::<TypedDispatcher<E>>())
            .cloned()
    }

    /// Typed handle to an existing job dispatcher for `J` driven by `E`.
    #[must_use]
    pub fn job_dispatcher<J: Job<E>, E: Event>(&self) -> Option<JobDispatcher<J, E>> {
        self.inner
            .read()
            .jobs
            .get(&(TypeId::of::<J>(), TypeId::of::<E>()))
            .and_then(|d| d.downcast_ref::<JobDispatcher<J, E>>())
            .cloned()
    }

    /// Subscribe `callback` to `E` events addressed to `entity`.
    ///
    /// # Errors
    ///
    /// Layout errors from creating the dispatcher, or
    /// [`DispatchError::DuplicateSubscription`](crate::DispatchError::DuplicateSubscription).
    pub fn subscribe<E: Event>(&self, entity: EntityHandle, callback: &Callback<E>) -> DispatchResult<()> {
        self.register_event::<E>()?.subscribe(entity, callback)
    }

    /// Remove a subscription. Never creates a dispatcher.
    pub fn unsubscribe<E: Event>(&self, entity: EntityHandle, callback: &Callback<E>) {
        if let Some(dispatcher) = self.dispatcher::<E>() {
            dispatcher.unsubscribe(entity, callback);
        }
    }

    /// Subscribe a job for `entity`, driven by `E` events.
    ///
    /// # Errors
    ///
    /// Layout errors from creating the dispatcher, or
    /// [`DispatchError::DuplicateSubscription`](crate::DispatchError::DuplicateSubscription).
    pub fn subscribe_job<J: Job<E>, E: Event>(
        &self,
        entity: EntityHandle,
        job: J,
        on_complete: &Callback<J>,
    ) -> DispatchResult<()> {
        self.register_job::<J, E>()?.subscribe(entity, job, on_complete)
    }

    /// Remove a job subscription. Never creates a dispatcher.
    pub fn unsubscribe_job<J: Job<E>, E: Event>(&self, entity: EntityHandle, on_complete: &Callback<J>) {
        if let Some(dispatcher) = self.job_dispatcher::<J, E>() {
            dispatcher.unsubscribe(entity, on_complete);
        }
    }

    /// Queue `event` for `entity` on the `E` dispatcher and every job
    /// dispatcher driven by `E`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidEventType`](crate::DispatchError::InvalidEventType)
    /// if `E` is not fixed-layout.
    pub fn queue<E: Event>(&self, entity: EntityHandle, event: E) -> DispatchResult<()> {
        let dispatcher = self.register_event::<E>()?;

        let sinks = self
            .inner
            .read()
            .job_sinks
            .get(&TypeId::of::<E>())
            .and_then(|s| s.downcast_ref::<JobSinks<E>>())
            .cloned();

        for sink in sinks.iter().flatten() {
            sink.queue(entity, event.clone());
        }
        dispatcher.queue(entity, event);

        Ok(())
    }

    /// Process every dispatcher in creation order.
    pub fn process_all(&self) -> ProcessStats {
        let mut stats = ProcessStats::default();
        for dispatcher in self.snapshot() {
            stats += dispatcher.process();
        }
        stats
    }

    /// Remove every subscription `entity` holds on any dispatcher, plain or
    /// job. Returns how many there were.
    pub fn unsubscribe_entity(&self, entity: EntityHandle) -> usize {
        let removed: usize = self
            .snapshot()
            .iter()
            .map(|dispatcher| dispatcher.unsubscribe_entity(entity))
            .sum();
        if removed > 0 {
            debug!(entity = %entity, removed, "unsubscribed entity from every dispatcher");
        }
        removed
    }

    /// Reset every dispatcher. Dispatchers stay registered.
    pub fn reset_all(&self) {
        for dispatcher in self.snapshot() {
            dispatcher.reset();
        }
    }

    /// Fail on the first dispatcher that still has subscribers.
    ///
    /// # Errors
    ///
    /// [`DispatchError::LeakedSubscriber`](crate::DispatchError::LeakedSubscriber).
    pub fn verify_no_subscribers(&self) -> DispatchResult<()> {
        self.snapshot()
            .iter()
            .try_for_each(|dispatcher| dispatcher.verify_no_subscribers())
    }

    /// Log every leaked subscription across all dispatchers; return the count.
    pub fn verify_no_subscribers_log(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|dispatcher| dispatcher.verify_no_subscribers_log())
            .sum()
    }

    /// Dispose every dispatcher and forget them.
    pub fn dispose_all(&self) {
        let dispatchers = {
            let mut inner = self.inner.write();
            inner.events.clear();
            inner.jobs.clear();
            inner.job_sinks.clear();
            std::mem::take(&mut inner.all)
        };

        for dispatcher in dispatchers {
            dispatcher.dispose();
        }
    }

    /// Number of dispatchers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().all.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().all.is_empty()
    }

    /// Names of every dispatcher, in creation order.
    #[must_use]
    pub fn dispatcher_names(&self) -> Vec<&'static str> {
        self.inner.read().all.iter().map(|d| d.name()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ErasedDispatcher>> {
        self.inner.read().all.clone()
    }
}

impl fmt::Debug for DispatcherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherRegistry")
            .field("dispatchers", &self.dispatcher_names())
            .finish()
    }
}
