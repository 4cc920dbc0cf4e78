//! Entity-addressed dispatcher for one event type.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::callback::SubscriptionKey;
use crate::delivery::{
    DeferredOp, DeliveryGuard, PassEnd, PendingEvent, ProcessStats, collect_matches, deliver,
};
use crate::error::{DispatchError, DispatchResult};
use crate::table::SubscriberTable;
use crate::{Callback, DispatcherConfig, EntityHandle, Event};

struct State<E> {
    table: SubscriberTable<Callback<E>>,
    pending: Vec<PendingEvent<E>>,
    guard: DeliveryGuard<Callback<E>>,
    config: DispatcherConfig,
}

impl<E> State<E> {
    fn fresh_queue(&self) -> Vec<PendingEvent<E>> {
        Vec::with_capacity(self.config.queue_capacity)
    }
}

/// Subscribers and pending events for the event type `E`.
///
/// Cheap to clone; clones share the same subscribers and queue, so a
/// callback may hold a handle to the dispatcher that is calling it.
///
/// # Example
///
/// ```
/// use rgb_dispatch::{Blittable, Callback, EntityHandle, TypedDispatcher};
///
/// #[derive(Blittable, Clone, Copy)]
/// struct Damage {
///     amount: u32,
/// }
///
/// let dispatcher = TypedDispatcher::<Damage>::new()?;
/// let player = EntityHandle::create();
/// let on_damage = Callback::new(|damage: &Damage| assert_eq!(damage.amount, 10));
///
/// dispatcher.subscribe(player, &on_damage)?;
/// dispatcher.queue(player, Damage { amount: 10 });
/// assert_eq!(dispatcher.process().deliveries, 1);
///
/// dispatcher.unsubscribe(player, &on_damage);
/// dispatcher.verify_no_subscribers()?;
/// # Ok::<(), rgb_dispatch::DispatchError>(())
/// ```
pub struct TypedDispatcher<E: Event> {
    state: Arc<Mutex<State<E>>>,
}

impl<E: Event> Clone for TypedDispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<E: Event> TypedDispatcher<E> {
    /// Create a dispatcher with the default configuration.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidEventType`] if `E` is not fixed-layout.
    pub fn new() -> DispatchResult<Self> {
        Self::with_config(DispatcherConfig::default())
    }

    /// Create a dispatcher with explicit capacities and batch size.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidEventType`] if `E` is not fixed-layout.
    pub fn with_config(config: DispatcherConfig) -> DispatchResult<Self> {
        if let Some(violation) = E::layout_violation() {
            return Err(DispatchError::InvalidEventType(violation));
        }

        let state = State {
            table: SubscriberTable::with_capacity(config.subscriber_capacity),
            pending: Vec::with_capacity(config.queue_capacity),
            guard: DeliveryGuard::default(),
            config,
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Subscribe `callback` to events addressed to `entity`.
    ///
    /// Subscriptions made while this dispatcher is delivering take effect
    /// from the next [`process`](Self::process).
    ///
    /// # Errors
    ///
    /// [`DispatchError::DuplicateSubscription`] if this exact callback is
    /// already subscribed to `entity`.
    pub fn subscribe(&self, entity: EntityHandle, callback: &Callback<E>) -> DispatchResult<()> {
        let key = SubscriptionKey::new(entity, callback.id());
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
                event: E::name(),
                callback: callback.name(),
            });
        }

        trace!(entity = %entity, event = E::name(), callback = callback.name(), "subscribe");

        if state.guard.is_delivering() {
            state.guard.defer(DeferredOp::Subscribe {
                key,
                name: callback.name(),
                payload: callback.clone(),
            });
        } else {
            state.table.insert(key, callback.name(), callback.clone());
        }

        Ok(())
    }

    /// Remove a subscription. Does nothing if it does not exist.
    pub fn unsubscribe(&self, entity: EntityHandle, callback: &Callback<E>) {
        let key = SubscriptionKey::new(entity, callback.id());
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.guard.is_delivering() {
            if state.guard.subscribed_after(&state.table, &key) {
                state.guard.defer(DeferredOp::Unsubscribe { key });
            }
            return;
        }

        if state.table.remove(&key).is_some() {
            trace!(entity = %entity, event = E::name(), callback = callback.name(), "unsubscribe");
        }
    }

    /// Remove every subscription owned by `entity`. Returns how many there
    /// were.
    ///
    /// While this dispatcher is delivering, the removal waits for the end
    /// of the pass like any other unsubscribe.
    pub fn unsubscribe_entity(&self, entity: EntityHandle) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let removed = state.guard.remove_entity(&mut state.table, entity);
        if removed > 0 {
            trace!(entity = %entity, event = E::name(), removed, "unsubscribe entity");
        }
        removed
    }

    /// Queue `event` for `entity` until the next [`process`](Self::process).
    ///
    /// Events are queued even when nobody is subscribed; the next pass
    /// discards them.
    pub fn queue(&self, entity: EntityHandle, event: E) {
        self.state.lock().pending.push(PendingEvent { entity, event });
    }

    /// Deliver every queued event to the subscribers of its entity.
    ///
    /// Only events queued before the call are delivered. A callback that
    /// panics is logged and skipped; the queue is always cleared. Calling
    /// this from inside one of its own callbacks does nothing.
    pub fn process(&self) -> ProcessStats {
        let (pending, deliveries) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if state.guard.is_delivering() {
                warn!(event = E::name(), "process called while already delivering; ignored");
                return ProcessStats::default();
            }

            if state.pending.is_empty() {
                return ProcessStats::default();
            }

            let fresh = state.fresh_queue();
            let pending = std::mem::replace(&mut state.pending, fresh);
            state.guard.begin();

            let matches = collect_matches(&pending, state.table.entities(), state.config.batch_size);
            let deliveries: Vec<(usize, Callback<E>)> = matches
                .into_iter()
                .map(|m| (m.event, state.table.payload(m.slot).clone()))
                .collect();

            (pending, deliveries)
        };

        let mut stats = ProcessStats {
            events: pending.len(),
            ..ProcessStats::default()
        };

        for (index, callback) in &deliveries {
            let PendingEvent { entity, event } = &pending[*index];
            deliver(E::name(), *entity, callback, event, &mut stats);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.guard.finish(&mut state.table) == PassEnd::Reset {
            trace!(event = E::name(), "applying reset requested during delivery");
            state.pending.clear();
        }

        stats
    }

    /// Drop every subscriber and pending event.
    ///
    /// During delivery the reset is held until the pass ends.
    pub fn reset(&self) {
        let mut state = self.state.lock();

        if state.guard.is_delivering() {
            state.guard.request_reset();
            return;
        }

        state.table.clear();
        state.pending.clear();
        state.guard.clear();
    }

    /// Fail if any subscription remains.
    ///
    /// # Errors
    ///
    /// [`DispatchError::LeakedSubscriber`] listing every remaining
    /// (entity, callback) pair.
    pub fn verify_no_subscribers(&self) -> DispatchResult<()> {
        let state = self.state.lock();

        if state.table.is_empty() {
            return Ok(());
        }

        Err(DispatchError::LeakedSubscriber {
            dispatcher: E::name(),
            subscribers: state.table.leaks(),
        })
    }

    /// Log every remaining subscription and return how many there were.
    pub fn verify_no_subscribers_log(&self) -> usize {
        let leaks = self.state.lock().table.leaks();

        for leak in &leaks {
            error!(
                dispatcher = E::name(),
                entity = %leak.entity,
                callback = leak.callback,
                "subscriber still listening"
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
        state.guard.clear();
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    /// Whether there are no live subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().table.is_empty()
    }

    /// Number of events waiting for the next pass.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether a processing pass is delivering right now.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.state.lock().guard.is_delivering()
    }

    /// Number of processing passes that delivered at least one event.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().guard.generation()
    }
}

impl<E: Event> fmt::Debug for TypedDispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TypedDispatcher")
            .field("event", &E::name())
            .field("subscribers", &state.table.len())
            .field("pending", &state.pending.len())
            .field("generation", &state.guard.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use super::*;
    use crate::Blittable;

    #[derive(Blittable, Clone, Copy, Debug, PartialEq)]
    struct Hit {
        value: u32,
    }

    #[derive(Blittable, Clone)]
    struct Named {
        name: String,
    }

    fn counter() -> (Arc<AtomicU32>, Callback<Hit>) {
        let total = Arc::new(AtomicU32::new(0));
        let t = Arc::clone(&total);
        let cb = Callback::new(move |hit: &Hit| {
            t.fetch_add(hit.value, Ordering::SeqCst);
        });
        (total, cb)
    }

    #[test]
    fn test_rejects_non_blittable_event() {
        let err = TypedDispatcher::<Named>::new().unwrap_err();
        assert!(matches!(err, DispatchError::InvalidEventType(v) if v.field == "name"));
    }

    #[test]
    fn test_deliver_to_matching_entity() {
        let dispatcher = TypedDispatcher::<Hit>::new().unwrap();
        let entity = EntityHandle::create();
        let (total, cb) = counter();

        dispatcher.subscribe(entity, &cb).unwrap();
        dispatcher.queue(entity, Hit { value: 10 });
        dispatcher.queue(EntityHandle::create(), Hit { value: 99 });

        let stats = dispatcher.process();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.deliveries, 1);
        assert_eq!(total.load(Ordering::SeqCst), 10);
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[test]
    fn test_duplicate_subscribe_fails() {
        let dispatcher = TypedDispatcher::<Hit>::new().unwrap();
        let entity = EntityHandle::create();
        let (_, cb) = counter();

        dispatcher.subscribe(entity, &cb).unwrap();
        let err = dispatcher.subscribe(entity, &cb.clone()).unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateSubscription { event: "Hit", .. }));
        assert_eq!(dispatcher.len(), 1);

        // Same callback on another entity is a separate subscription
        dispatcher.subscribe(EntityHandle::create(), &cb).unwrap();
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let dispatcher = TypedDispatcher::<Hit>::new().unwrap();
        let (_, cb) = counter();
        dispatcher.unsubscribe(EntityHandle::create(), &cb);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_fifo_per_subscriber() {
        let dispatcher = TypedDispatcher::<Hit>::new().unwrap();
        let entity = EntityHandle::create();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let cb = Callback::new(move |hit: &Hit| s.lock().push(hit.value));

        dispatcher.subscribe(entity, &cb).unwrap();
        for value in 0..100 {
            dispatcher.queue(entity, Hit { value });
        }
        dispatcher.process();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_callback_does_not_block_others() {
        let dispatcher = TypedDispatcher::<Hit>::new().unwrap();
        let entity = EntityHandle::create();
        let (total, cb) = counter();
        let bad = Callback::new(|_: &Hit| panic!("boom"));

        dispatcher.subscribe(entity, &bad).unwrap();
        dispatcher.subscribe(entity, &cb).unwrap();
        dispatcher.queue(entity, Hit { value: 3 });

        let stats = dispatcher.process();
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.deliveries, 1);
        assert_eq!(total.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[test]
    fn test_reentrant_process_is_ignored() {
        let dispatcher = TypedDispatcher::<Hit>::new().unwrap();
        let entity = EntityHandle::create();
        let nested = Arc::new(AtomicUsize::new(usize::MAX));

        let d = dispatcher.clone();
        let n = Arc::clone(&nested);
        let cb = Callback::new(move |_: &Hit| {
            n.store(d.process().events, Ordering::SeqCst);
        });

        dispatcher.subscribe(entity, &cb).unwrap();
        dispatcher.queue(entity, Hit { value: 1 });
        dispatcher.process();

        assert_eq!(nested.load(Ordering::SeqCst), 0);
        assert!(!dispatcher.is_processing());
    }

    #[test]
    fn test_reset_during_delivery_is_deferred() {
        let dispatcher = TypedDispatcher::<Hit>::new().unwrap();
        let entity = EntityHandle::create();
        let calls = Arc::new(AtomicUsize::new(0));

        let d = dispatcher.clone();
        let c = Arc::clone(&calls);
        let cb = Callback::new(move |_: &Hit| {
            c.fetch_add(1, Ordering::SeqCst);
            d.reset();
            d.queue(EntityHandle::create(), Hit { value: 0 });
        });

        dispatcher.subscribe(entity, &cb).unwrap();
        dispatcher.queue(entity, Hit { value: 1 });
        dispatcher.queue(entity, Hit { value: 2 });
        dispatcher.process();

        // Both events of the pass were delivered, then everything was dropped
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(dispatcher.is_empty());
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[test]
    fn test_event_queued_by_callback_waits_for_next_pass() {
        let dispatcher = TypedDispatcher::<Hit>::new().unwrap();
        let entity = EntityHandle::create();
        let values = Arc::new(Mutex::new(Vec::new()));

        let d = dispatcher.clone();
        let v = Arc::clone(&values);
        let cb = Callback::new(move |hit: &Hit| {
            v.lock().push(hit.value);
            if hit.value < 3 {
                d.queue(entity, Hit { value: hit.value + 1 });
            }
        });

        dispatcher.subscribe(entity, &cb).unwrap();
        dispatcher.queue(entity, Hit { value: 1 });

        assert_eq!(dispatcher.process().deliveries, 1);
        assert_eq!(*values.lock(), vec![1]);
        assert_eq!(dispatcher.pending_len(), 1);

        assert_eq!(dispatcher.process().deliveries, 1);
        assert_eq!(*values.lock(), vec![1, 2]);

        dispatcher.process();
        assert_eq!(*values.lock(), vec![1, 2, 3]);
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[test]
    fn test_unsubscribe_entity() {
        let dispatcher = TypedDispatcher::<Hit>::new().unwrap();
        let entity = EntityHandle::create();
        let other = EntityHandle::create();
        let (total, cb) = counter();
        let (_, extra) = counter();

        dispatcher.subscribe(entity, &cb).unwrap();
        dispatcher.subscribe(entity, &extra).unwrap();
        dispatcher.subscribe(other, &cb).unwrap();

        assert_eq!(dispatcher.unsubscribe_entity(entity), 2);
        assert_eq!(dispatcher.len(), 1);

        dispatcher.queue(entity, Hit { value: 5 });
        dispatcher.queue(other, Hit { value: 1 });
        dispatcher.process();
        assert_eq!(total.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_verify_no_subscribers() {
        let dispatcher = TypedDispatcher::<Hit>::new().unwrap();
        let entity = EntityHandle::from_identity(5);
        let (_, cb) = counter();

        dispatcher.verify_no_subscribers().unwrap();
        dispatcher.subscribe(entity, &cb).unwrap();

        match dispatcher.verify_no_subscribers() {
            Err(DispatchError::LeakedSubscriber { dispatcher, subscribers }) => {
                assert_eq!(dispatcher, "Hit");
                assert_eq!(subscribers.len(), 1);
                assert_eq!(subscribers[0].entity, entity);
            }
            other => panic!("expected leak, got {other:?}"),
        }
        assert_eq!(dispatcher.verify_no_subscribers_log(), 1);
    }

    #[test]
    fn test_dispose_releases_everything() {
        let dispatcher = TypedDispatcher::<Hit>::new().unwrap();
        let (_, cb) = counter();
        dispatcher.subscribe(EntityHandle::create(), &cb).unwrap();
        dispatcher.queue(EntityHandle::create(), Hit { value: 1 });

        dispatcher.dispose();
        assert!(dispatcher.is_empty());
        assert_eq!(dispatcher.pending_len(), 0);
    }
}
