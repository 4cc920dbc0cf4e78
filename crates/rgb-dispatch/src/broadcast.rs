//! Entity-less, in-order delivery for one event type.
//!
//! Listeners live in a doubly linked list threaded through a slot arena,
//! so subscribe and unsubscribe never shift other listeners and a
//! [`ListenerKey`] stays valid until its listener is removed.
//!
//! While subscriptions are locked (during a send, or explicitly through
//! [`Broadcaster::lock_subscriptions`]) changes are queued and applied on
//! the final unlock. A reset requested while locked replaces them.

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::callback::CallbackId;
use crate::delivery::{ProcessStats, deliver};
use crate::error::{DispatchError, DispatchResult, LeakedSubscription};
use crate::{Callback, EntityHandle, Event, TerminableCallback};

const NIL: u32 = u32::MAX;

/// Handle to one broadcaster subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    index: u32,
    generation: u32,
}

enum Listener<E> {
    Plain(Callback<E>),
    Terminable(TerminableCallback<E>),
}

impl<E> Listener<E> {
    fn id(&self) -> CallbackId {
        match self {
            Self::Plain(cb) => cb.id(),
            Self::Terminable(cb) => cb.id(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Plain(cb) => cb.name(),
            Self::Terminable(cb) => cb.name(),
        }
    }
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(cb) => Self::Plain(cb.clone()),
            Self::Terminable(cb) => Self::Terminable(cb.clone()),
        }
    }
}

struct Node<E> {
    listener: Option<Listener<E>>,
    generation: u32,
    prev: u32,
    next: u32,
    linked: bool,
}

struct State<E> {
    nodes: Vec<Node<E>>,
    free: Vec<u32>,
    /// Most recent node allocated for each callback.
    by_callback: HashMap<CallbackId, ListenerKey>,
    head: u32,
    tail: u32,
    linked: usize,
    /// Generation given to freshly pushed nodes, so keys from before a
    /// dispose never match.
    generation_floor: u32,
    lock_depth: usize,
    queued_links: Vec<u32>,
    queued_removes: Vec<ListenerKey>,
    reset_pending: bool,
}

impl<E> State<E> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            by_callback: HashMap::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            linked: 0,
            generation_floor: 0,
            lock_depth: 0,
            queued_links: Vec::new(),
            queued_removes: Vec::new(),
            reset_pending: false,
        }
    }

    fn node(&self, key: ListenerKey) -> Option<&Node<E>> {
        self.nodes
            .get(key.index as usize)
            .filter(|node| node.generation == key.generation && node.listener.is_some())
    }

    fn is_live(&self, key: ListenerKey) -> bool {
        self.node(key).is_some() && !self.queued_removes.contains(&key)
    }

    fn key_of(&self, index: u32) -> ListenerKey {
        ListenerKey {
            index,
            generation: self.nodes[index as usize].generation,
        }
    }

    /// Live listener for `id`. Older nodes with the same callback are
    /// always pending removal, so only the newest can be live.
    fn find(&self, id: CallbackId) -> Option<ListenerKey> {
        self.by_callback
            .get(&id)
            .copied()
            .filter(|&key| self.is_live(key))
    }

    fn alloc(&mut self, listener: Listener<E>) -> u32 {
        let id = listener.id();
        let index = if let Some(index) = self.free.pop() {
            self.nodes[index as usize].listener = Some(listener);
            index
        } else {
            let index = u32::try_from(self.nodes.len()).unwrap_or(NIL);
            assert!(index != NIL, "broadcaster listener arena is full");
            self.nodes.push(Node {
                listener: Some(listener),
                generation: self.generation_floor,
                prev: NIL,
                next: NIL,
                linked: false,
            });
            index
        };

        let key = self.key_of(index);
        self.by_callback.insert(id, key);
        index
    }

    fn link(&mut self, index: u32) {
        let tail = self.tail;
        {
            let node = &mut self.nodes[index as usize];
            node.prev = tail;
            node.next = NIL;
            node.linked = true;
        }

        if tail == NIL {
            self.head = index;
        } else {
            self.nodes[tail as usize].next = index;
        }
        self.tail = index;
        self.linked += 1;
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let node = &mut self.nodes[index as usize];
            node.linked = false;
            (std::mem::replace(&mut node.prev, NIL), std::mem::replace(&mut node.next, NIL))
        };

        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev as usize].next = next;
        }

        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next as usize].prev = prev;
        }
        self.linked -= 1;
    }

    fn release(&mut self, key: ListenerKey) -> bool {
        if self.node(key).is_none() {
            return false;
        }

        if self.nodes[key.index as usize].linked {
            self.unlink(key.index);
        }

        let node = &mut self.nodes[key.index as usize];
        if let Some(listener) = node.listener.take() {
            let id = listener.id();
            if self.by_callback.get(&id) == Some(&key) {
                self.by_callback.remove(&id);
            }
        }
        let node = &mut self.nodes[key.index as usize];
        node.generation = node.generation.wrapping_add(1);
        self.free.push(key.index);
        true
    }

    fn snapshot(&self) -> Vec<Listener<E>> {
        let mut listeners = Vec::with_capacity(self.linked);
        let mut cursor = self.head;
        while cursor != NIL {
            let node = &self.nodes[cursor as usize];
            if let Some(listener) = &node.listener {
                listeners.push(listener.clone());
            }
            cursor = node.next;
        }
        listeners
    }

    fn leaks(&self) -> Vec<LeakedSubscription> {
        self.snapshot()
            .iter()
            .map(|listener| LeakedSubscription {
                entity: EntityHandle::NONE,
                callback: listener.name(),
            })
            .collect()
    }

    fn clear(&mut self) {
        let allocated: Vec<ListenerKey> = (0..self.nodes.len())
            .filter(|&index| self.nodes[index].listener.is_some())
            .map(|index| self.key_of(index as u32))
            .collect();

        for key in allocated {
            self.release(key);
        }

        self.queued_links.clear();
        self.queued_removes.clear();
        self.reset_pending = false;
    }

    fn apply_queued(&mut self) {
        if self.reset_pending {
            trace!("applying reset requested while locked");
            self.clear();
            return;
        }

        for index in std::mem::take(&mut self.queued_links) {
            if self.nodes[index as usize].listener.is_some() {
                self.link(index);
            }
        }

        for key in std::mem::take(&mut self.queued_removes) {
            self.release(key);
        }
    }
}

/// Ordered listeners for the event type `E`, not addressed to any entity.
///
/// Cheap to clone; clones share the same listeners.
pub struct Broadcaster<E: Event> {
    state: Arc<Mutex<State<E>>>,
}

impl<E: Event> Clone for Broadcaster<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<E: Event> Default for Broadcaster<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Broadcaster<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(crate::config::DEFAULT_SUBSCRIBER_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::with_capacity(capacity))),
        }
    }

    /// Append a listener.
    ///
    /// # Errors
    ///
    /// [`DispatchError::DuplicateSubscription`] if `callback` is already
    /// listening.
    pub fn subscribe(&self, callback: &Callback<E>) -> DispatchResult<ListenerKey> {
        self.add(Listener::Plain(callback.clone()))
    }

    /// Append a listener that can stop delivery to the listeners after it.
    ///
    /// # Errors
    ///
    /// [`DispatchError::DuplicateSubscription`] if `callback` is already
    /// listening.
    pub fn subscribe_terminable(&self, callback: &TerminableCallback<E>) -> DispatchResult<ListenerKey> {
        self.add(Listener::Terminable(callback.clone()))
    }

    fn add(&self, listener: Listener<E>) -> DispatchResult<ListenerKey> {
        let mut state = self.state.lock();

        if state.find(listener.id()).is_some() {
            return Err(DispatchError::DuplicateSubscription {
                entity: EntityHandle::NONE,
                event: E::name(),
                callback: listener.name(),
            });
        }

        trace!(event = E::name(), callback = listener.name(), "add listener");

        let index = state.alloc(listener);
        if state.lock_depth > 0 {
            state.queued_links.push(index);
        } else {
            state.link(index);
        }

        Ok(state.key_of(index))
    }

    /// Remove the listener behind `key`. Returns whether it was live.
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        let mut state = self.state.lock();

        if !state.is_live(key) {
            return false;
        }

        if state.lock_depth > 0 {
            state.queued_removes.push(key);
            true
        } else {
            state.release(key)
        }
    }

    /// Remove a plain listener by callback identity.
    pub fn unsubscribe_callback(&self, callback: &Callback<E>) -> bool {
        self.remove_id(callback.id())
    }

    /// Remove a terminable listener by callback identity.
    pub fn unsubscribe_terminable(&self, callback: &TerminableCallback<E>) -> bool {
        self.remove_id(callback.id())
    }

    fn remove_id(&self, id: CallbackId) -> bool {
        let key = self.state.lock().find(id);
        key.is_some_and(|key| self.unsubscribe(key))
    }

    /// Whether any listener is currently linked.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.state.lock().linked > 0
    }

    /// Number of linked listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().linked
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_subscribers()
    }

    /// Queue subscription changes until the matching unlock.
    ///
    /// Locks nest; changes apply when the outermost lock is released.
    pub fn lock_subscriptions(&self) {
        self.state.lock().lock_depth += 1;
    }

    /// Release one lock, applying queued changes if it was the last.
    pub fn unlock_subscriptions(&self) {
        let mut state = self.state.lock();

        if state.lock_depth == 0 {
            warn!(event = E::name(), "unlock without a matching lock");
            return;
        }

        state.lock_depth -= 1;
        if state.lock_depth == 0 {
            state.apply_queued();
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().lock_depth > 0
    }

    /// Deliver `event` to every listener in subscription order.
    ///
    /// Returns `true` if a terminable listener stopped delivery.
    pub fn send(&self, event: &E) -> bool {
        self.deliver(event).0
    }

    pub(crate) fn deliver(&self, event: &E) -> (bool, ProcessStats) {
        let listeners = {
            let mut state = self.state.lock();
            state.lock_depth += 1;
            state.snapshot()
        };

        let mut stats = ProcessStats {
            events: 1,
            ..ProcessStats::default()
        };
        let mut terminated = false;

        for listener in &listeners {
            match listener {
                Listener::Plain(cb) => {
                    deliver(E::name(), EntityHandle::NONE, cb, event, &mut stats);
                }
                Listener::Terminable(cb) => {
                    if deliver(E::name(), EntityHandle::NONE, cb, event, &mut stats) == Some(true) {
                        terminated = true;
                        break;
                    }
                }
            }
        }

        self.unlock_subscriptions();
        (terminated, stats)
    }

    /// Remove every listener, or schedule that for the final unlock.
    pub fn reset(&self) {
        let mut state = self.state.lock();

        if state.lock_depth > 0 {
            state.reset_pending = true;
        } else {
            state.clear();
        }
    }

    /// Whether a reset is waiting for the final unlock.
    #[must_use]
    pub fn is_reset_pending(&self) -> bool {
        self.state.lock().reset_pending
    }

    /// # Errors
    ///
    /// [`DispatchError::LeakedSubscriber`] if any listener remains.
    pub fn verify_no_subscribers(&self) -> DispatchResult<()> {
        let state = self.state.lock();

        if state.linked == 0 {
            return Ok(());
        }

        Err(DispatchError::LeakedSubscriber {
            dispatcher: E::name(),
            subscribers: state.leaks(),
        })
    }

    /// Log every remaining listener and return the count.
    pub fn verify_no_subscribers_log(&self) -> usize {
        let leaks = self.state.lock().leaks();

        for leak in &leaks {
            error!(dispatcher = E::name(), callback = leak.callback, "listener still subscribed");
        }

        leaks.len()
    }

    /// Remove every listener and release the arena.
    ///
    /// Keys issued before the dispose never match a later listener.
    pub fn dispose(&self) {
        let mut state = self.state.lock();

        if state.lock_depth > 0 {
            state.reset_pending = true;
            return;
        }

        let floor = state
            .nodes
            .iter()
            .map(|node| node.generation.wrapping_add(1))
            .max()
            .unwrap_or(state.generation_floor)
            .max(state.generation_floor);

        *state = State::with_capacity(0);
        state.generation_floor = floor;
    }
}

impl<E: Event> fmt::Debug for Broadcaster<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Broadcaster")
            .field("event", &E::name())
            .field("listeners", &state.linked)
            .field("lock_depth", &state.lock_depth)
            .finish()
    }
}

/// Broadcaster operations that do not depend on the event type.
pub(crate) trait ErasedBroadcaster: Send + Sync {
    fn lock_subscriptions(&self);
    fn unlock_subscriptions(&self);
    fn reset(&self);
    fn verify_no_subscribers(&self) -> DispatchResult<()>;
    fn verify_no_subscribers_log(&self) -> usize;
    fn dispose(&self);
}

impl<E: Event> ErasedBroadcaster for Broadcaster<E> {
    fn lock_subscriptions(&self) {
        Self::lock_subscriptions(self);
    }

    fn unlock_subscriptions(&self) {
        Self::unlock_subscriptions(self);
    }

    fn reset(&self) {
        Self::reset(self);
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
