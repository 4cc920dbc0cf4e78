//! Per-phase dispatcher sets.
//!
//! Each phase owns a private [`DispatcherRegistry`], so events queued for
//! one phase are only seen when that phase is processed.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::delivery::ProcessStats;
use crate::error::DispatchResult;
use crate::job::Job;
use crate::{Callback, DispatcherConfig, DispatcherRegistry, EntityHandle, Event};

/// A closed set of independently processed phases.
pub trait Phase: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every phase, in processing order.
    const ALL: &'static [Self];

    /// Position of this phase in [`Phase::ALL`].
    fn index(self) -> usize;
}

/// The three logical update ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tick {
    /// Fixed-rate simulation step.
    Fixed = 0,
    /// Per-frame update.
    Update = 1,
    /// End of frame, after every update.
    Late = 2,
}

impl Tick {
    /// All ticks in processing order.
    pub const ALL: [Tick; 3] = [Tick::Fixed, Tick::Update, Tick::Late];

    /// Get the tick that follows this one within a frame.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Fixed => Self::Update,
            Self::Update => Self::Late,
            Self::Late => Self::Fixed,
        }
    }
}

impl Phase for Tick {
    const ALL: &'static [Self] = &Tick::ALL;

    fn index(self) -> usize {
        self as usize
    }
}

/// One [`DispatcherRegistry`] per phase of `P`.
///
/// Every operation names its phase and is forwarded to that phase's
/// registry.
pub struct PhasedEvents<P: Phase = Tick> {
    registries: Arc<[DispatcherRegistry]>,
    _phase: PhantomData<fn() -> P>,
}

impl<P: Phase> Clone for PhasedEvents<P> {
    fn clone(&self) -> Self {
        Self {
            registries: Arc::clone(&self.registries),
            _phase: PhantomData,
        }
    }
}

impl<P: Phase> Default for PhasedEvents<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Phase> PhasedEvents<P> {
    /// Create empty registries for every phase.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    /// Create empty registries whose dispatchers use `config`.
    #[must_use]
    pub fn with_config(config: DispatcherConfig) -> Self {
        let registries = P::ALL
            .iter()
            .map(|_| DispatcherRegistry::with_config(config))
            .collect();

        Self {
            registries,
            _phase: PhantomData,
        }
    }

    /// The registry backing `phase`.
    ///
    /// # Panics
    ///
    /// Panics if `phase.index()` is not a position in [`Phase::ALL`].
    #[must_use]
    pub fn registry(&self, phase: P) -> &DispatcherRegistry {
        &self.registries[phase.index()]
    }

    /// Subscribe in `phase`. See [`DispatcherRegistry::subscribe`].
    ///
    /// # Errors
    ///
    /// As [`DispatcherRegistry::subscribe`].
    pub fn subscribe<E: Event>(
        &self,
        phase: P,
        entity: EntityHandle,
        callback: &Callback<E>,
    ) -> DispatchResult<()> {
        self.registry(phase).subscribe(entity, callback)
    }

    pub fn unsubscribe<E: Event>(&self, phase: P, entity: EntityHandle, callback: &Callback<E>) {
        self.registry(phase).unsubscribe(entity, callback);
    }

    /// Subscribe a job in `phase`.
    ///
    /// # Errors
    ///
    /// As [`DispatcherRegistry::subscribe_job`].
    pub fn subscribe_job<J: Job<E>, E: Event>(
        &self,
        phase: P,
        entity: EntityHandle,
        job: J,
        on_complete: &Callback<J>,
    ) -> DispatchResult<()> {
        self.registry(phase).subscribe_job::<J, E>(entity, job, on_complete)
    }

    pub fn unsubscribe_job<J: Job<E>, E: Event>(
        &self,
        phase: P,
        entity: EntityHandle,
        on_complete: &Callback<J>,
    ) {
        self.registry(phase).unsubscribe_job::<J, E>(entity, on_complete);
    }

    /// Queue an event for the next processing of `phase`.
    ///
    /// # Errors
    ///
    /// As [`DispatcherRegistry::queue`].
    pub fn queue<E: Event>(&self, phase: P, entity: EntityHandle, event: E) -> DispatchResult<()> {
        self.registry(phase).queue(entity, event)
    }

    /// Process `phase` now.
    pub fn process(&self, phase: P) -> ProcessStats {
        self.registry(phase).process_all()
    }

    /// Process every phase once, in [`Phase::ALL`] order.
    ///
    /// Events a phase queues into a later phase are delivered by the same
    /// call; events queued into an earlier phase wait for the next one.
    pub fn process_all(&self) -> ProcessStats {
        let mut stats = ProcessStats::default();
        for &phase in P::ALL {
            stats += self.process(phase);
        }
        stats
    }

    /// Remove every subscription `entity` holds in `phase`. Returns how
    /// many there were.
    pub fn unsubscribe_entity(&self, phase: P, entity: EntityHandle) -> usize {
        self.registry(phase).unsubscribe_entity(entity)
    }

    /// Remove every subscription `entity` holds in any phase.
    pub fn unsubscribe_entity_all(&self, entity: EntityHandle) -> usize {
        self.registries
            .iter()
            .map(|registry| registry.unsubscribe_entity(entity))
            .sum()
    }

    pub fn reset(&self, phase: P) {
        self.registry(phase).reset_all();
    }

    /// Reset every phase.
    pub fn reset_all(&self) {
        for registry in self.registries.iter() {
            registry.reset_all();
        }
    }

    /// Fail if `phase` still has subscribers.
    ///
    /// # Errors
    ///
    /// As [`DispatcherRegistry::verify_no_subscribers`].
    pub fn verify_no_subscribers(&self, phase: P) -> DispatchResult<()> {
        self.registry(phase).verify_no_subscribers()
    }

    /// Fail on the first phase that still has subscribers.
    ///
    /// # Errors
    ///
    /// As [`DispatcherRegistry::verify_no_subscribers`].
    pub fn verify_all(&self) -> DispatchResult<()> {
        self.registries
            .iter()
            .try_for_each(DispatcherRegistry::verify_no_subscribers)
    }

    /// Log leaks in every phase and return the total.
    pub fn verify_no_subscribers_log(&self) -> usize {
        self.registries
            .iter()
            .map(DispatcherRegistry::verify_no_subscribers_log)
            .sum()
    }

    /// Dispose every phase's dispatchers.
    pub fn dispose(&self) {
        for registry in self.registries.iter() {
            registry.dispose_all();
        }
    }
}

impl<P: Phase> fmt::Debug for PhasedEvents<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(P::ALL.iter().zip(self.registries.iter()))
            .finish()
    }
}

/// Entity-less events for one phase.
///
/// Binds a freshly minted entity and a phase, so callers can subscribe and
/// send without naming either.
pub struct TickChannel<P: Phase = Tick> {
    events: PhasedEvents<P>,
    phase: P,
    entity: EntityHandle,
}

impl<P: Phase> Clone for TickChannel<P> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            phase: self.phase,
            entity: self.entity,
        }
    }
}

impl<P: Phase> TickChannel<P> {
    /// Bind a new channel to `phase` of `events`.
    #[must_use]
    pub fn new(events: &PhasedEvents<P>, phase: P) -> Self {
        Self {
            events: events.clone(),
            phase,
            entity: EntityHandle::create(),
        }
    }

    /// The minted entity events are addressed to.
    #[must_use]
    pub const fn entity(&self) -> EntityHandle {
        self.entity
    }

    #[must_use]
    pub const fn phase(&self) -> P {
        self.phase
    }

    /// # Errors
    ///
    /// As [`DispatcherRegistry::subscribe`].
    pub fn subscribe<E: Event>(&self, callback: &Callback<E>) -> DispatchResult<()> {
        self.events.subscribe(self.phase, self.entity, callback)
    }

    pub fn unsubscribe<E: Event>(&self, callback: &Callback<E>) {
        self.events.unsubscribe(self.phase, self.entity, callback);
    }

    /// # Errors
    ///
    /// As [`DispatcherRegistry::subscribe_job`].
    pub fn subscribe_job<J: Job<E>, E: Event>(&self, job: J, on_complete: &Callback<J>) -> DispatchResult<()> {
        self.events
            .subscribe_job::<J, E>(self.phase, self.entity, job, on_complete)
    }

    pub fn unsubscribe_job<J: Job<E>, E: Event>(&self, on_complete: &Callback<J>) {
        self.events
            .unsubscribe_job::<J, E>(self.phase, self.entity, on_complete);
    }

    /// Drop every subscription on this channel.
    pub fn unsubscribe_all(&self) -> usize {
        self.events.unsubscribe_entity(self.phase, self.entity)
    }

    /// Queue `event` for this channel's next phase pass.
    ///
    /// # Errors
    ///
    /// As [`DispatcherRegistry::queue`].
    pub fn send<E: Event>(&self, event: E) -> DispatchResult<()> {
        self.events.queue(self.phase, self.entity, event)
    }

    /// Process this channel's phase.
    pub fn process(&self) -> ProcessStats {
        self.events.process(self.phase)
    }
}

impl<P: Phase> fmt::Debug for TickChannel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickChannel")
            .field("phase", &self.phase)
            .field("entity", &self.entity)
            .finish()
    }
}

/// Simulation and UI channels owned by the host's composition root.
#[derive(Clone, Debug)]
pub struct GlobalEvents<P: Phase = Tick> {
    simulation: TickChannel<P>,
    ui: TickChannel<P>,
}

impl GlobalEvents<Tick> {
    /// Simulation on [`Tick::Fixed`], UI on [`Tick::Late`].
    #[must_use]
    pub fn new(events: &PhasedEvents<Tick>) -> Self {
        Self::with_phases(events, Tick::Fixed, Tick::Late)
    }
}

impl<P: Phase> GlobalEvents<P> {
    /// Bind the two channels to explicit phases.
    #[must_use]
    pub fn with_phases(events: &PhasedEvents<P>, simulation: P, ui: P) -> Self {
        Self {
            simulation: TickChannel::new(events, simulation),
            ui: TickChannel::new(events, ui),
        }
    }

    #[must_use]
    pub const fn simulation(&self) -> &TickChannel<P> {
        &self.simulation
    }

    #[must_use]
    pub const fn ui(&self) -> &TickChannel<P> {
        &self.ui
    }
}
