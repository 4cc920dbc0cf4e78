//! Dense subscriber storage with swap-remove compaction.
//!
//! Subscriber entities live in their own contiguous array so fan-out can
//! scan them without touching callbacks. Per-slot payloads (callbacks, job
//! state) sit in a parallel array. Slot indices are NOT stable: removal
//! moves the last slot into the hole, so subscriptions are always looked
//! up by [`SubscriptionKey`].

use hashbrown::HashMap;

use crate::EntityHandle;
use crate::callback::{CallbackId, SubscriptionKey};
use crate::error::LeakedSubscription;

/// Subscriber arrays for one dispatcher.
pub(crate) struct SubscriberTable<P> {
    entities: Vec<EntityHandle>,
    callbacks: Vec<CallbackId>,
    names: Vec<&'static str>,
    payloads: Vec<P>,
    index: HashMap<SubscriptionKey, usize>,
}

impl<P> SubscriberTable<P> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entities: Vec::with_capacity(capacity),
            callbacks: Vec::with_capacity(capacity),
            names: Vec::with_capacity(capacity),
            payloads: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Append a subscription. Returns `false` if the key already exists.
    pub(crate) fn insert(&mut self, key: SubscriptionKey, name: &'static str, payload: P) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }

        self.index.insert(key, self.entities.len());
        self.entities.push(key.entity);
        self.callbacks.push(key.callback);
        self.names.push(name);
        self.payloads.push(payload);
        true
    }

    /// Swap-remove a subscription, returning its payload.
    pub(crate) fn remove(&mut self, key: &SubscriptionKey) -> Option<P> {
        let index = self.index.remove(key)?;

        self.entities.swap_remove(index);
        self.callbacks.swap_remove(index);
        self.names.swap_remove(index);
        let payload = self.payloads.swap_remove(index);

        // The old last slot now lives at `index`
        if index < self.entities.len() {
            let moved = SubscriptionKey::new(self.entities[index], self.callbacks[index]);
            self.index.insert(moved, index);
        }

        Some(payload)
    }

    pub(crate) fn contains(&self, key: &SubscriptionKey) -> bool {
        self.index.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entities.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub(crate) fn entities(&self) -> &[EntityHandle] {
        &self.entities
    }

    /// Keys of every subscription owned by `entity`, in slot order.
    pub(crate) fn keys_of(&self, entity: EntityHandle) -> Vec<SubscriptionKey> {
        self.entities
            .iter()
            .zip(&self.callbacks)
            .filter(|&(&owner, _)| owner == entity)
            .map(|(&owner, &callback)| SubscriptionKey::new(owner, callback))
            .collect()
    }

    pub(crate) fn get(&self, key: &SubscriptionKey) -> Option<&P> {
        self.index.get(key).map(|&slot| &self.payloads[slot])
    }

    pub(crate) fn get_mut(&mut self, key: &SubscriptionKey) -> Option<&mut P> {
        self.index.get(key).map(|&slot| &mut self.payloads[slot])
    }

    pub(crate) fn payload(&self, slot: usize) -> &P {
        &self.payloads[slot]
    }

    pub(crate) fn payloads(&self) -> &[P] {
        &self.payloads
    }

    pub(crate) fn payloads_mut(&mut self) -> &mut [P] {
        &mut self.payloads
    }

    pub(crate) fn leaks(&self) -> Vec<LeakedSubscription> {
        self.entities
            .iter()
            .zip(&self.names)
            .map(|(&entity, &callback)| LeakedSubscription { entity, callback })
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entities.clear();
        self.callbacks.clear();
        self.names.clear();
        self.payloads.clear();
        self.index.clear();
    }

    /// Clear and give the backing memory back.
    pub(crate) fn release(&mut self) {
        self.entities = Vec::new();
        self.callbacks = Vec::new();
        self.names = Vec::new();
        self.payloads = Vec::new();
        self.index = HashMap::new();
    }
}
