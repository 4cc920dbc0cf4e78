//! Pieces shared by every processing pass.
//!
//! - Fan-out: match pending events against subscriber entities in batches
//! - Delivery guard: defer subscription changes while callbacks run
//! - Fault isolation: a panicking callback is logged and skipped

use std::ops::AddAssign;

use rayon::prelude::*;

use crate::callback::SubscriptionKey;
use crate::error::DispatchError;
use crate::table::SubscriberTable;
use crate::{Callback, EntityHandle};

/// An event waiting for the next processing pass.
#[derive(Debug, Clone)]
pub(crate) struct PendingEvent<E> {
    pub entity: EntityHandle,
    pub event: E,
}

/// One (pending event, subscriber slot) delivery pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Match {
    pub event: usize,
    pub slot: usize,
}

/// Counters for one or more processing passes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    /// Pending events consumed.
    pub events: usize,
    /// Callbacks that ran to completion.
    pub deliveries: usize,
    /// Callbacks or job transforms that panicked.
    pub faults: usize,
}

impl AddAssign for ProcessStats {
    fn add_assign(&mut self, rhs: Self) {
        self.events += rhs.events;
        self.deliveries += rhs.deliveries;
        self.faults += rhs.faults;
    }
}

/// Collect every (event, subscriber) pair whose entities are equal.
///
/// Outer order is pending order, inner order is slot order, so one
/// subscriber sees its events FIFO. Large queues are matched in parallel
/// batches of `batch_size` events.
pub(crate) fn collect_matches<E: Sync>(
    pending: &[PendingEvent<E>],
    subscribers: &[EntityHandle],
    batch_size: usize,
) -> Vec<Match> {
    if subscribers.is_empty() || pending.is_empty() {
        return Vec::new();
    }

    let batch_size = batch_size.max(1);

    if pending.len() <= batch_size {
        return pending
            .iter()
            .enumerate()
            .flat_map(|(event, ev)| matches_for(event, ev.entity, subscribers))
            .collect();
    }

    pending
        .par_chunks(batch_size)
        .enumerate()
        .flat_map_iter(|(chunk, events)| {
            let base = chunk * batch_size;
            events
                .iter()
                .enumerate()
                .flat_map(move |(offset, ev)| matches_for(base + offset, ev.entity, subscribers))
        })
        .collect()
}

fn matches_for(
    event: usize,
    target: EntityHandle,
    subscribers: &[EntityHandle],
) -> impl Iterator<Item = Match> + '_ {
    subscribers
        .iter()
        .enumerate()
        .filter(move |&(_, entity)| *entity == target)
        .map(move |(slot, _)| Match { event, slot })
}

/// Invoke one callback, logging and counting a panic instead of unwinding.
pub(crate) fn deliver<E, R>(
    dispatcher: &'static str,
    entity: EntityHandle,
    callback: &Callback<E, R>,
    event: &E,
    stats: &mut ProcessStats,
) -> Option<R> {
    match callback.call_caught(event) {
        Ok(result) => {
            stats.deliveries += 1;
            Some(result)
        }
        Err(message) => {
            stats.faults += 1;
            let fault = DispatchError::CallbackFault {
                dispatcher,
                entity,
                message,
            };
            tracing::error!(callback = callback.name(), "{fault}");
            None
        }
    }
}

/// A subscription change that arrived while callbacks were running.
pub(crate) enum DeferredOp<P> {
    Subscribe {
        key: SubscriptionKey,
        name: &'static str,
        payload: P,
    },
    Unsubscribe {
        key: SubscriptionKey,
    },
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassEnd {
    /// Deferred subscription changes were applied.
    Applied,
    /// A reset arrived during the pass and was applied instead.
    Reset,
}

/// Cooperative lock over a subscriber table during delivery.
///
/// While a pass is delivering, subscription changes are queued instead of
/// applied and a reset is remembered until the pass ends. Each pass bumps
/// the generation.
pub(crate) struct DeliveryGuard<P> {
    delivering: bool,
    generation: u64,
    deferred: Vec<DeferredOp<P>>,
    reset_requested: bool,
}

impl<P> Default for DeliveryGuard<P> {
    fn default() -> Self {
        Self {
            delivering: false,
            generation: 0,
            deferred: Vec::new(),
            reset_requested: false,
        }
    }
}

impl<P> DeliveryGuard<P> {
    pub(crate) fn is_delivering(&self) -> bool {
        self.delivering
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Enter delivery, returning the new pass generation.
    pub(crate) fn begin(&mut self) -> u64 {
        debug_assert!(!self.delivering, "delivery passes must not nest");
        self.delivering = true;
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    pub(crate) fn defer(&mut self, op: DeferredOp<P>) {
        self.deferred.push(op);
    }

    pub(crate) fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    /// Whether `key` will be subscribed once the queued changes apply.
    pub(crate) fn subscribed_after(&self, table: &SubscriberTable<P>, key: &SubscriptionKey) -> bool {
        let mut subscribed = table.contains(key);

        for op in &self.deferred {
            match op {
                DeferredOp::Subscribe { key: k, .. } if k == key => subscribed = true,
                DeferredOp::Unsubscribe { key: k } if k == key => subscribed = false,
                _ => {}
            }
        }

        subscribed
    }

    /// Remove every subscription owned by `entity`, now or at the end of
    /// the current pass. Returns how many subscriptions that covers.
    pub(crate) fn remove_entity(&mut self, table: &mut SubscriberTable<P>, entity: EntityHandle) -> usize {
        if !self.delivering {
            let keys = table.keys_of(entity);
            for key in &keys {
                table.remove(key);
            }
            return keys.len();
        }

        let mut candidates = table.keys_of(entity);
        for op in &self.deferred {
            if let DeferredOp::Subscribe { key, .. } = op
                && key.entity == entity
                && !candidates.contains(key)
            {
                candidates.push(*key);
            }
        }

        let live: Vec<SubscriptionKey> = candidates
            .into_iter()
            .filter(|key| self.subscribed_after(table, key))
            .collect();
        for &key in &live {
            self.defer(DeferredOp::Unsubscribe { key });
        }
        live.len()
    }

    /// Leave delivery and apply whatever arrived in the meantime.
    pub(crate) fn finish(&mut self, table: &mut SubscriberTable<P>) -> PassEnd {
        self.delivering = false;

        if self.reset_requested {
            self.reset_requested = false;
            self.deferred.clear();
            table.clear();
            return PassEnd::Reset;
        }

        for op in self.deferred.drain(..) {
            match op {
                DeferredOp::Subscribe { key, name, payload } => {
                    tracing::trace!(entity = %key.entity, callback = name, "applying queued subscribe");
                    table.insert(key, name, payload);
                }
                DeferredOp::Unsubscribe { key } => {
                    tracing::trace!(entity = %key.entity, "applying queued unsubscribe");
                    table.remove(&key);
                }
            }
        }

        PassEnd::Applied
    }

    pub(crate) fn clear(&mut self) {
        self.deferred.clear();
        self.reset_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(entities: &[u32]) -> Vec<PendingEvent<u32>> {
        entities
            .iter()
            .enumerate()
            .map(|(i, &e)| PendingEvent {
                entity: EntityHandle::from_u32(e),
                event: i as u32,
            })
            .collect()
    }

    fn subscribers(entities: &[u32]) -> Vec<EntityHandle> {
        entities.iter().copied().map(EntityHandle::from_u32).collect()
    }

    #[test]
    fn test_matches_by_entity() {
        let matches = collect_matches(&pending(&[1, 2, 1]), &subscribers(&[2, 1, 1]), 32);

        assert_eq!(
            matches,
            vec![
                Match { event: 0, slot: 1 },
                Match { event: 0, slot: 2 },
                Match { event: 1, slot: 0 },
                Match { event: 2, slot: 1 },
                Match { event: 2, slot: 2 },
            ]
        );
    }

    #[test]
    fn test_parallel_batches_match_sequential() {
        let events: Vec<u32> = (0..500).map(|i| i % 17).collect();
        let subs: Vec<u32> = (0..40).map(|i| i % 13).collect();

        let sequential = collect_matches(&pending(&events), &subscribers(&subs), usize::MAX);
        let parallel = collect_matches(&pending(&events), &subscribers(&subs), 7);

        assert!(!sequential.is_empty());
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_no_subscribers_no_matches() {
        assert!(collect_matches(&pending(&[1, 2]), &[], 1).is_empty());
    }

    #[test]
    fn test_guard_defers_and_applies() {
        let cb = Callback::new(|_: &u32| {});
        let key = SubscriptionKey::new(EntityHandle::from_u32(1), cb.id());
        let mut table = SubscriberTable::with_capacity(1);
        let mut guard = DeliveryGuard::default();

        let generation = guard.begin();
        assert_eq!(generation, 1);
        guard.defer(DeferredOp::Subscribe {
            key,
            name: "cb",
            payload: (),
        });
        assert!(table.is_empty());
        assert!(guard.subscribed_after(&table, &key));

        assert_eq!(guard.finish(&mut table), PassEnd::Applied);
        assert_eq!(table.len(), 1);
        assert!(!guard.is_delivering());
    }

    #[test]
    fn test_remove_entity_during_delivery_covers_queued_subscribes() {
        let a = Callback::new(|_: &u32| {});
        let b = Callback::new(|_: &u32| {});
        let owner = EntityHandle::from_u32(1);
        let other = EntityHandle::from_u32(2);
        let mut table = SubscriberTable::with_capacity(4);
        table.insert(SubscriptionKey::new(owner, a.id()), "a", ());
        table.insert(SubscriptionKey::new(other, a.id()), "a", ());
        let mut guard = DeliveryGuard::default();

        guard.begin();
        guard.defer(DeferredOp::Subscribe {
            key: SubscriptionKey::new(owner, b.id()),
            name: "b",
            payload: (),
        });

        assert_eq!(guard.remove_entity(&mut table, owner), 2);
        assert_eq!(table.len(), 2);

        guard.finish(&mut table);
        assert_eq!(table.len(), 1);
        assert!(table.keys_of(owner).is_empty());
        assert_eq!(table.keys_of(other).len(), 1);
    }

    #[test]
    fn test_guard_reset_wins_over_deferred() {
        let cb = Callback::new(|_: &u32| {});
        let key = SubscriptionKey::new(EntityHandle::from_u32(1), cb.id());
        let mut table = SubscriberTable::with_capacity(1);
        table.insert(key, "cb", ());
        let mut guard = DeliveryGuard::default();

        guard.begin();
        guard.defer(DeferredOp::Unsubscribe { key });
        assert!(!guard.subscribed_after(&table, &key));
        guard.request_reset();

        assert_eq!(guard.finish(&mut table), PassEnd::Reset);
        assert!(table.is_empty());
    }
}
