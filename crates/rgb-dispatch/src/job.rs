//! Dispatcher whose subscribers carry state transformed by each event.
//!
//! Every subscription owns a job value. Processing copies the job, runs
//! [`Job::execute`] on the copy in parallel batches, writes the copy back
//! and then calls the completion callback with the new value.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{error, trace, warn};

use crate::callback::{SubscriptionKey, panic_message};
use crate::delivery::{
    DeferredOp, DeliveryGuard, PassEnd, PendingEvent, ProcessStats, collect_matches, deliver,
};
use crate::error::{DispatchError, DispatchResult};
use crate::table::SubscriberTable;
use crate::{Blittable, Callback, DispatcherConfig, EntityHandle, Event};

/// Per-subscriber state updated by events of type `E`.
///
/// `execute` runs on worker threads. It must only touch `self` and the
/// event, and must not call back into any dispatcher.
pub trait Job<E: Event>: Blittable {
    /// Fold `event` into this job.
    fn execute(&mut self, event: &E);
}

struct JobSlot<J> {
    job: J,
    on_complete: Callback<J>,
}

struct State<J, E> {
    table: SubscriberTable<JobSlot<J>>,
    pending: Vec<PendingEvent<E>>,
    pending_by_entity: HashMap<EntityHandle, usize>,
    guard: DeliveryGuard<JobSlot<J>>,
    config: DispatcherConfig,
}

/// Subscribers with job state `J`, driven by events of type `E`.
///
/// At most one event per entity is pending at a time, so no two matches
/// in one pass touch the same job. Queuing a second event for an entity
/// before processing replaces the first.
pub struct JobDispatcher<J: Job<E>, E: Event> {
    state: Arc<Mutex<State<J, E>>>,
}

impl<J: Job<E>, E: Event> Clone for JobDispatcher<J, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<J: Job<E>, E: Event> JobDispatcher<J, E> {
    /// Create a job dispatcher with the default configuration.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidEventType`] or
    /// [`DispatchError::InvalidJobStateType`] if either type is not
    /// fixed-layout.
    pub fn new() -> DispatchResult<Self> {
        Self::with_config(DispatcherConfig::default())
    }

    /// Create a job dispatcher with explicit capacities and batch size.
    ///
    /// # Errors
    ///
    /// See [`JobDispatcher::new`].
    pub fn with_config(config: DispatcherConfig) -> DispatchResult<Self> {
        if let Some(violation) = E::layout_violation() {
            return Err(DispatchError::InvalidEventType(violation));
        }
        if let Some(violation) = J::layout_violation() {
            return Err(DispatchError::InvalidJobStateType(violation));
        }

        let state = State {
            table: SubscriberTable::with_capacity(config.subscriber_capacity),
            pending: Vec::with_capacity(config.queue_capacity),
            pending_by_entity: HashMap::with_capacity(config.queue_capacity),
            guard: DeliveryGuard::default(),
            config,
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Name used in diagnostics.
    #[must_use]
    pub fn name() -> &'static str {
        <J as Event>::name()
    }

    /// Subscribe `job` for `entity`, reporting each update to `on_complete`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::DuplicateSubscription`] if `on_complete` is already
    /// subscribed to `entity`.
    pub fn subscribe(
        &self,
        entity: EntityHandle,
        job: J,
        on_complete: &Callback<J>,
    ) -> DispatchResult<()> {
        let key = SubscriptionKey::new(entity, on_complete.id());
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let duplicate = if state.guard.is_delivering() {
            state.guard.subscribed_after(&state.table, &key)
        } else {
            state.table.contains(&key)
        };

        if duplicate {
            return Err(DispatchError::DuplicateSubscription {
                entity,
                event: Self::name(),
                callback: on_complete.name(),
            });
        }

        trace!(entity = %entity, job = Self::name(), callback = on_complete.name(), "subscribe job");

        let slot = JobSlot {
            job,
            on_complete: on_complete.clone(),
        };

        if state.guard.is_delivering() {
            state.guard.defer(DeferredOp::Subscribe {
                key,
                name: on_complete.name(),
                payload: slot,
            });
        } else {
            state.table.insert(key, on_complete.name(), slot);
        }

        Ok(())
    }

    /// Remove a job subscription. Does nothing if it does not exist.
    pub fn unsubscribe(&self, entity: EntityHandle, on_complete: &Callback<J>) {
        let key = SubscriptionKey::new(entity, on_complete.id());
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.guard.is_delivering() {
            if state.guard.subscribed_after(&state.table, &key) {
                state.guard.defer(DeferredOp::Unsubscribe { key });
            }
            return;
        }

        if state.table.remove(&key).is_some() {
            trace!(entity = %entity, job = Self::name(), "unsubscribe job");
        }
    }

    /// Remove every job subscription owned by `entity`. Returns how many
    /// there were.
    pub fn unsubscribe_entity(&self, entity: EntityHandle) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let removed = state.guard.remove_entity(&mut state.table, entity);
        if removed > 0 {
            trace!(entity = %entity, job = Self::name(), removed, "unsubscribe entity");
        }
        removed
    }

    /// Current job state of a subscription.
    #[must_use]
    pub fn job(&self, entity: EntityHandle, on_complete: &Callback<J>) -> Option<J> {
        let key = SubscriptionKey::new(entity, on_complete.id());
        let state = self.state.lock();
        state.table.get(&key).map(|slot| slot.job.clone())
    }

    /// Overwrite the job state of a subscription, returning the old value.
    ///
    /// Safe to call from a completion callback: the pass has already
    /// written back every job by then.
    pub fn replace_job(&self, entity: EntityHandle, on_complete: &Callback<J>, job: J) -> Option<J> {
        let key = SubscriptionKey::new(entity, on_complete.id());
        let mut state = self.state.lock();
        state
            .table
            .get_mut(&key)
            .map(|slot| std::mem::replace(&mut slot.job, job))
    }

    /// Queue `event` for `entity`, replacing any event already pending for it.
    pub fn queue(&self, entity: EntityHandle, event: E) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(&index) = state.pending_by_entity.get(&entity) {
            warn!(
                entity = %entity,
                job = Self::name(),
                event = E::name(),
                "job event queued twice for the same entity before processing; keeping the latest"
            );
            state.pending[index].event = event;
            return;
        }

        state.pending_by_entity.insert(entity, state.pending.len());
        state.pending.push(PendingEvent { entity, event });
    }

    /// Run every matched job, then call completion callbacks in queue order.
    ///
    /// A job whose `execute` panics keeps its previous state and its
    /// completion callback is skipped.
    pub fn process(&self) -> ProcessStats {
        let (completions, mut stats) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if state.guard.is_delivering() {
                warn!(job = Self::name(), "process called while already delivering; ignored");
                return ProcessStats::default();
            }

            if state.pending.is_empty() {
                return ProcessStats::default();
            }

            let fresh = Vec::with_capacity(state.config.queue_capacity);
            let pending = std::mem::replace(&mut state.pending, fresh);
            state.pending_by_entity.clear();
            state.guard.begin();

            let batch_size = state.config.batch_size;
            let matches = collect_matches(&pending, state.table.entities(), batch_size);

            let mut targets: Vec<Option<usize>> = vec![None; state.table.len()];
            for m in &matches {
                targets[m.slot] = Some(m.event);
            }

            let faults = run_jobs(state.table.payloads_mut(), &targets, &pending, batch_size);

            let mut stats = ProcessStats {
                events: pending.len(),
                ..ProcessStats::default()
            };

            for (slot, message) in faults {
                stats.faults += 1;
                let fault = DispatchError::CallbackFault {
                    dispatcher: Self::name(),
                    entity: state.table.entities()[slot],
                    message,
                };
                error!(job = Self::name(), "{fault}");
                targets[slot] = None;
            }

            let completions: Vec<(EntityHandle, J, Callback<J>)> = matches
                .iter()
                .filter(|m| targets[m.slot].is_some())
                .map(|m| {
                    let slot = state.table.payload(m.slot);
                    (pending[m.event].entity, slot.job.clone(), slot.on_complete.clone())
                })
                .collect();

            (completions, stats)
        };

        for (entity, job, on_complete) in &completions {
            deliver(Self::name(), *entity, on_complete, job, &mut stats);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.guard.finish(&mut state.table) == PassEnd::Reset {
            trace!(job = Self::name(), "applying reset requested during delivery");
            state.pending.clear();
            state.pending_by_entity.clear();
        }

        stats
    }

    /// Drop every subscription and pending event.
    pub fn reset(&self) {
        let mut state = self.state.lock();

        if state.guard.is_delivering() {
            state.guard.request_reset();
            return;
        }

        state.table.clear();
        state.pending.clear();
        state.pending_by_entity.clear();
        state.guard.clear();
    }

    /// Fail if any job subscription remains.
    ///
    /// # Errors
    ///
    /// [`DispatchError::LeakedSubscriber`] listing what is left.
    pub fn verify_no_subscribers(&self) -> DispatchResult<()> {
        let state = self.state.lock();

        if state.table.is_empty() {
            return Ok(());
        }

        Err(DispatchError::LeakedSubscriber {
            dispatcher: Self::name(),
            subscribers: state.table.leaks(),
        })
    }

    /// Log every remaining job subscription and return the count.
    pub fn verify_no_subscribers_log(&self) -> usize {
        let leaks = self.state.lock().table.leaks();

        for leak in &leaks {
            error!(
                dispatcher = Self::name(),
                entity = %leak.entity,
                callback = leak.callback,
                "job subscriber still listening"
            );
        }

        leaks.len()
    }

    /// Reset and release all buffer memory.
    pub fn dispose(&self) {
        let mut state = self.state.lock();

        if state.guard.is_delivering() {
            state.guard.request_reset();
            return;
        }

        state.table.release();
        state.pending = Vec::new();
        state.pending_by_entity = HashMap::new();
        state.guard.clear();
    }

    /// Number of live job subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().table.is_empty()
    }

    /// Number of events waiting for the next pass.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.state.lock().guard.is_delivering()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().guard.generation()
    }
}

/// Copy, execute and write back every targeted slot.
///
/// Returns the slots whose job panicked, with the panic message.
fn run_jobs<J: Job<E>, E: Event>(
    slots: &mut [JobSlot<J>],
    targets: &[Option<usize>],
    pending: &[PendingEvent<E>],
    batch_size: usize,
) -> Vec<(usize, String)> {
    let batch_size = batch_size.max(1);

    let run = &|slot: &mut JobSlot<J>, target: Option<usize>| -> Option<String> {
        let event = &pending[target?].event;
        let mut job = slot.job.clone();
        match catch_unwind(AssertUnwindSafe(|| job.execute(event))) {
            Ok(()) => {
                slot.job = job;
                None
            }
            Err(payload) => Some(panic_message(payload)),
        }
    };

    if slots.len() <= batch_size {
        return slots
            .iter_mut()
            .zip(targets)
            .enumerate()
            .filter_map(|(index, (slot, &target))| run(slot, target).map(|msg| (index, msg)))
            .collect();
    }

    slots
        .par_chunks_mut(batch_size)
        .zip(targets.par_chunks(batch_size))
        .enumerate()
        .flat_map_iter(|(chunk, (slots, targets))| {
            let base = chunk * batch_size;
            slots
                .iter_mut()
                .zip(targets)
                .enumerate()
                .filter_map(move |(offset, (slot, &target))| {
                    run(slot, target).map(|msg| (base + offset, msg))
                })
        })
        .collect()
}

impl<J: Job<E>, E: Event> fmt::Debug for JobDispatcher<J, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JobDispatcher")
            .field("job", &Self::name())
            .field("event", &E::name())
            .field("subscribers", &state.table.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}
