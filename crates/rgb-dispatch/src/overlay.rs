//! Immediate, next-pass and end-of-pass sends over per-type broadcasters.
//!
//! ```text
//!            send(Immediate)         flush_* starts
//!   Idle ─────────────────────▶ Delivering ─────────▶ Idle
//!                                   │  reset()            ▲
//!                                   ▼                     │ full reset
//!                              PendingReset ──────────────┘
//! ```

use core::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::broadcast::{Broadcaster, ErasedBroadcaster, ListenerKey};
use crate::delivery::ProcessStats;
use crate::error::DispatchResult;
use crate::{Callback, Event, OverlayConfig, TerminableCallback};

/// When a send is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SendMode {
    /// Use [`OverlayConfig::default_mode`].
    #[default]
    Default,
    /// Deliver before `send` returns.
    Immediate,
    /// Deliver on the next [`SendOverlay::flush_deferred`].
    Deferred,
    /// Deliver on the next [`SendOverlay::flush_end_of_pass`], which keeps
    /// flushing until nothing new is sent.
    EndOfPass,
}

/// Delivery state of a [`SendOverlay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    Idle,
    Delivering,
    /// A reset arrived during delivery and runs once delivery ends.
    PendingReset,
}

type QueuedSend = Box<dyn FnOnce(&mut ProcessStats) + Send>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Queue {
    Deferred,
    EndOfPass,
}

struct Inner {
    config: OverlayConfig,
    broadcasters: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    all: Vec<Arc<dyn ErasedBroadcaster>>,
    deferred: Vec<QueuedSend>,
    end_of_pass: Vec<QueuedSend>,
    state: OverlayState,
}

impl Inner {
    fn queue_mut(&mut self, queue: Queue) -> &mut Vec<QueuedSend> {
        match queue {
            Queue::Deferred => &mut self.deferred,
            Queue::EndOfPass => &mut self.end_of_pass,
        }
    }
}

/// Entity-less event channel with selectable send timing.
///
/// Sends that arrive while a flush is delivering land in the queue that
/// the flush has already emptied, so they run on the next flush instead
/// of growing the current one.
#[derive(Clone)]
pub struct SendOverlay {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SendOverlay {
    fn default() -> Self {
        Self::new()
    }
}

impl SendOverlay {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(OverlayConfig::default())
    }

    #[must_use]
    pub fn with_config(config: OverlayConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                broadcasters: HashMap::new(),
                all: Vec::new(),
                deferred: Vec::new(),
                end_of_pass: Vec::new(),
                state: OverlayState::Idle,
            })),
        }
    }

    /// The broadcaster for `E`, created on first use.
    #[must_use]
    pub fn broadcaster<E: Event>(&self) -> Broadcaster<E> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner
            .broadcasters
            .get(&TypeId::of::<E>())
            .and_then(|b| b.downcast_ref::<Broadcaster<E>>())
        {
            return existing.clone();
        }

        let broadcaster = Broadcaster::<E>::new();
        debug!(event = E::name(), "created broadcaster");
        inner
            .broadcasters
            .insert(TypeId::of::<E>(), Box::new(broadcaster.clone()));
        inner.all.push(Arc::new(broadcaster.clone()));
        broadcaster
    }

    /// # Errors
    ///
    /// [`DispatchError::DuplicateSubscription`](crate::DispatchError::DuplicateSubscription)
    /// if `callback` already listens to `E`.
    pub fn subscribe<E: Event>(&self, callback: &Callback<E>) -> DispatchResult<ListenerKey> {
        self.broadcaster::<E>().subscribe(callback)
    }

    /// # Errors
    ///
    /// [`DispatchError::DuplicateSubscription`](crate::DispatchError::DuplicateSubscription)
    /// if `callback` already listens to `E`.
    pub fn subscribe_terminable<E: Event>(
        &self,
        callback: &TerminableCallback<E>,
    ) -> DispatchResult<ListenerKey> {
        self.broadcaster::<E>().subscribe_terminable(callback)
    }

    pub fn unsubscribe<E: Event>(&self, key: ListenerKey) -> bool {
        self.broadcaster::<E>().unsubscribe(key)
    }

    pub fn unsubscribe_callback<E: Event>(&self, callback: &Callback<E>) -> bool {
        self.broadcaster::<E>().unsubscribe_callback(callback)
    }

    pub fn unsubscribe_terminable<E: Event>(&self, callback: &TerminableCallback<E>) -> bool {
        self.broadcaster::<E>().unsubscribe_terminable(callback)
    }

    #[must_use]
    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.broadcaster::<E>().has_subscribers()
    }

    /// Send `event` with the given timing.
    ///
    /// Returns `true` only for an immediate send that a terminable listener
    /// stopped. Queued sends always return `false`, since their outcome is
    /// not known yet.
    pub fn send<E: Event>(&self, event: E, mode: SendMode) -> bool {
        let broadcaster = self.broadcaster::<E>();

        let queue = match self.resolve(mode) {
            SendMode::Immediate => {
                let outermost = self.enter();
                let terminated = broadcaster.send(&event);
                self.leave(outermost);
                return terminated;
            }
            SendMode::Deferred => Queue::Deferred,
            SendMode::EndOfPass | SendMode::Default => Queue::EndOfPass,
        };

        let send: QueuedSend = Box::new(move |stats: &mut ProcessStats| {
            let (_, delivered) = broadcaster.deliver(&event);
            *stats += delivered;
        });
        self.inner.lock().queue_mut(queue).push(send);
        false
    }

    /// Deliver everything sent with [`SendMode::Deferred`] before this call.
    pub fn flush_deferred(&self) -> ProcessStats {
        self.flush_round(Queue::Deferred).unwrap_or_default()
    }

    /// Deliver end-of-pass sends, repeating while listeners send more.
    ///
    /// Stops after [`OverlayConfig::max_end_of_pass_rounds`]; anything
    /// still queued waits for the next call.
    pub fn flush_end_of_pass(&self) -> ProcessStats {
        let max_rounds = self.inner.lock().config.max_end_of_pass_rounds;
        let mut stats = ProcessStats::default();

        for _ in 0..max_rounds {
            match self.flush_round(Queue::EndOfPass) {
                Some(round) => stats += round,
                None => return stats,
            }
        }

        let left = self.inner.lock().end_of_pass.len();
        if left > 0 {
            warn!(rounds = max_rounds, left, "end-of-pass flush did not settle");
        }
        stats
    }

    /// One flush of `queue`. `None` if there was nothing to deliver.
    fn flush_round(&self, queue: Queue) -> Option<ProcessStats> {
        let (batch, broadcasters) = {
            let mut inner = self.inner.lock();

            if inner.state != OverlayState::Idle {
                warn!("flush requested during delivery; ignored");
                return None;
            }

            let batch = std::mem::take(inner.queue_mut(queue));
            if batch.is_empty() {
                return None;
            }

            inner.state = OverlayState::Delivering;
            (batch, inner.all.clone())
        };

        for broadcaster in &broadcasters {
            broadcaster.lock_subscriptions();
        }

        let mut stats = ProcessStats::default();
        for send in batch {
            send(&mut stats);
        }

        for broadcaster in &broadcasters {
            broadcaster.unlock_subscriptions();
        }

        self.leave(true);
        Some(stats)
    }

    /// Enter delivery; `true` if this call moved the overlay out of `Idle`.
    fn enter(&self) -> bool {
        let mut inner = self.inner.lock();
        let outermost = inner.state == OverlayState::Idle;
        if outermost {
            inner.state = OverlayState::Delivering;
        }
        outermost
    }

    fn leave(&self, outermost: bool) {
        if !outermost {
            return;
        }

        let reset = {
            let mut inner = self.inner.lock();
            let reset = inner.state == OverlayState::PendingReset;
            inner.state = OverlayState::Idle;
            reset
        };

        if reset {
            self.reset();
        }
    }

    fn resolve(&self, mode: SendMode) -> SendMode {
        match mode {
            SendMode::Default => self.inner.lock().config.default_mode,
            other => other,
        }
    }

    /// Drop queued sends and every listener.
    ///
    /// During delivery this waits until delivery ends.
    pub fn reset(&self) {
        let broadcasters = {
            let mut inner = self.inner.lock();

            if inner.state != OverlayState::Idle {
                inner.state = OverlayState::PendingReset;
                return;
            }

            inner.deferred.clear();
            inner.end_of_pass.clear();
            inner.all.clone()
        };

        for broadcaster in broadcasters {
            broadcaster.reset();
        }
    }

    #[must_use]
    pub fn state(&self) -> OverlayState {
        self.inner.lock().state
    }

    /// Sends waiting for [`flush_deferred`](Self::flush_deferred).
    #[must_use]
    pub fn pending_deferred(&self) -> usize {
        self.inner.lock().deferred.len()
    }

    /// Sends waiting for [`flush_end_of_pass`](Self::flush_end_of_pass).
    #[must_use]
    pub fn pending_end_of_pass(&self) -> usize {
        self.inner.lock().end_of_pass.len()
    }

    /// # Errors
    ///
    /// [`DispatchError::LeakedSubscriber`](crate::DispatchError::LeakedSubscriber)
    /// for the first event type that still has listeners.
    pub fn verify_no_subscribers(&self) -> DispatchResult<()> {
        let broadcasters = self.inner.lock().all.clone();
        broadcasters
            .iter()
            .try_for_each(|broadcaster| broadcaster.verify_no_subscribers())
    }

    /// Log leaked listeners of every event type and return the count.
    pub fn verify_no_subscribers_log(&self) -> usize {
        let broadcasters = self.inner.lock().all.clone();
        let leaks: usize = broadcasters
            .iter()
            .map(|broadcaster| broadcaster.verify_no_subscribers_log())
            .sum();

        if leaks > 0 {
            error!(leaks, "send overlay still has listeners");
        }
        leaks
    }

    /// Drop queued sends and release every broadcaster.
    pub fn dispose(&self) {
        let broadcasters = {
            let mut inner = self.inner.lock();
            inner.deferred = Vec::new();
            inner.end_of_pass = Vec::new();
            inner.broadcasters.clear();
            std::mem::take(&mut inner.all)
        };

        for broadcaster in broadcasters {
            broadcaster.dispose();
        }
    }
}

impl fmt::Debug for SendOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SendOverlay")
            .field("state", &inner.state)
            .field("event_types", &inner.all.len())
            .field("deferred", &inner.deferred.len())
            .field("end_of_pass", &inner.end_of_pass.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::Blittable;

    #[derive(Blittable, Clone, Copy)]
    struct Chime {
        n: u32,
    }

    fn counter() -> (Arc<AtomicU32>, Callback<Chime>) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let cb = Callback::new(move |chime: &Chime| {
            c.fetch_add(chime.n, Ordering::SeqCst);
        });
        (count, cb)
    }

    #[test]
    fn test_immediate_send() {
        let overlay = SendOverlay::new();
        let (count, cb) = counter();
        overlay.subscribe(&cb).unwrap();

        assert!(!overlay.send(Chime { n: 2 }, SendMode::Immediate));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(overlay.state(), OverlayState::Idle);
    }

    #[test]
    fn test_immediate_reports_termination() {
        let overlay = SendOverlay::new();
        overlay
            .subscribe_terminable(&Callback::new(|chime: &Chime| chime.n == 0))
            .unwrap();

        assert!(overlay.send(Chime { n: 0 }, SendMode::Immediate));
        assert!(!overlay.send(Chime { n: 1 }, SendMode::Immediate));
        assert!(!overlay.send(Chime { n: 0 }, SendMode::Deferred));
    }

    #[test]
    fn test_default_mode_resolves_to_end_of_pass() {
        let overlay = SendOverlay::new();
        let (count, cb) = counter();
        overlay.subscribe(&cb).unwrap();

        overlay.send(Chime { n: 1 }, SendMode::Default);
        assert_eq!(overlay.pending_end_of_pass(), 1);
        assert_eq!(overlay.flush_deferred().events, 0);
        assert_eq!(overlay.flush_end_of_pass().deliveries, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_configured_default_mode() {
        let config = OverlayConfig::new().with_default_mode(SendMode::Deferred);
        let overlay = SendOverlay::with_config(config);
        overlay.send(Chime { n: 1 }, SendMode::Default);
        assert_eq!(overlay.pending_deferred(), 1);
    }

    #[test]
    fn test_resend_during_deferred_flush_waits() {
        let overlay = SendOverlay::new();
        let count = Arc::new(AtomicU32::new(0));

        let o = overlay.clone();
        let c = Arc::clone(&count);
        let echo = Callback::new(move |chime: &Chime| {
            c.fetch_add(1, Ordering::SeqCst);
            if chime.n > 0 {
                o.send(Chime { n: chime.n - 1 }, SendMode::Deferred);
            }
        });
        overlay.subscribe(&echo).unwrap();

        overlay.send(Chime { n: 2 }, SendMode::Deferred);
        overlay.flush_deferred();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(overlay.pending_deferred(), 1);

        overlay.flush_deferred();
        overlay.flush_deferred();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(overlay.pending_deferred(), 0);
    }

    #[test]
    fn test_end_of_pass_loops_until_empty() {
        let overlay = SendOverlay::new();
        let count = Arc::new(AtomicU32::new(0));

        let o = overlay.clone();
        let c = Arc::clone(&count);
        let echo = Callback::new(move |chime: &Chime| {
            c.fetch_add(1, Ordering::SeqCst);
            if chime.n > 0 {
                o.send(Chime { n: chime.n - 1 }, SendMode::EndOfPass);
            }
        });
        overlay.subscribe(&echo).unwrap();

        overlay.send(Chime { n: 4 }, SendMode::EndOfPass);
        let stats = overlay.flush_end_of_pass();
        assert_eq!(stats.events, 5);
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(overlay.pending_end_of_pass(), 0);
    }

    #[test]
    fn test_end_of_pass_round_limit() {
        let overlay = SendOverlay::with_config(OverlayConfig::new().with_max_end_of_pass_rounds(3));

        let o = overlay.clone();
        let forever = Callback::new(move |chime: &Chime| {
            o.send(*chime, SendMode::EndOfPass);
        });
        overlay.subscribe(&forever).unwrap();

        overlay.send(Chime { n: 0 }, SendMode::EndOfPass);
        assert_eq!(overlay.flush_end_of_pass().events, 3);
        assert_eq!(overlay.pending_end_of_pass(), 1);
    }

    #[test]
    fn test_subscribe_during_flush_waits_for_unlock() {
        let overlay = SendOverlay::new();
        let (count, late) = counter();

        let o = overlay.clone();
        let l = late.clone();
        let adder = Callback::new(move |_: &Chime| {
            let _ = o.subscribe(&l);
        });
        overlay.subscribe(&adder).unwrap();

        overlay.send(Chime { n: 1 }, SendMode::Deferred);
        overlay.send(Chime { n: 1 }, SendMode::Deferred);
        overlay.flush_deferred();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        overlay.send(Chime { n: 1 }, SendMode::Immediate);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_during_flush_is_applied_after() {
        let overlay = SendOverlay::new();
        let (count, cb) = counter();

        let o = overlay.clone();
        let resetter = Callback::new(move |_: &Chime| {
            o.reset();
            assert_eq!(o.state(), OverlayState::PendingReset);
        });
        overlay.subscribe(&resetter).unwrap();
        overlay.subscribe(&cb).unwrap();

        overlay.send(Chime { n: 1 }, SendMode::Deferred);
        overlay.send(Chime { n: 1 }, SendMode::Deferred);
        overlay.flush_deferred();

        // Delivery finished for the whole batch, then the reset ran
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(overlay.state(), OverlayState::Idle);
        assert!(!overlay.has_subscribers::<Chime>());
        overlay.verify_no_subscribers().unwrap();
    }
}
