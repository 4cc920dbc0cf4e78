#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::redundant_pub_crate)]

//! RGB Dispatch
//!
//! Entity-addressed event dispatch for tick-based hosts.
//!
//! # Core Concept: Events Addressed to Entities
//!
//! Subscribers register a callback for an event type on an [`EntityHandle`].
//! Producers queue events addressed to an entity; a processing pass matches
//! every pending event against the subscribers of its entity and invokes
//! their callbacks.
//!
//! - [`TypedDispatcher`]: plain callbacks for one event type
//! - [`JobDispatcher`]: per-subscriber state folded by each event, in
//!   parallel batches, before a completion callback sees it
//! - [`DispatcherRegistry`]: one dispatcher per type, created on first use
//! - [`PhasedEvents`]: one registry per [`Phase`], e.g. the three [`Tick`]s
//! - [`SendOverlay`]: entity-less sends, immediate or deferred
//!
//! # Re-entrancy
//!
//! Callbacks may subscribe, unsubscribe, queue or reset on the object that
//! is calling them. Subscription changes take effect from the next pass and
//! a reset waits until the current pass is done.
//!
//! # Example
//!
//! ```
//! use rgb_dispatch::prelude::*;
//!
//! #[derive(Blittable, Clone, Copy)]
//! struct Damage {
//!     amount: u32,
//! }
//!
//! let events = PhasedEvents::<Tick>::new();
//! let player = EntityHandle::create();
//!
//! let on_damage = Callback::new(|damage: &Damage| {
//!     assert_eq!(damage.amount, 10);
//! });
//! events.subscribe(Tick::Fixed, player, &on_damage)?;
//!
//! events.queue(Tick::Fixed, player, Damage { amount: 10 })?;
//! let stats = events.process(Tick::Fixed);
//! assert_eq!(stats.deliveries, 1);
//!
//! events.unsubscribe(Tick::Fixed, player, &on_damage);
//! events.verify_all()?;
//! # Ok::<(), rgb_dispatch::DispatchError>(())
//! ```

// Lets `#[derive(Blittable)]` name this crate from inside it
#[allow(unused_extern_crates)]
extern crate self as rgb_dispatch;

mod blittable;
mod broadcast;
mod callback;
mod config;
mod delivery;
mod dispatcher;
mod entity;
mod error;
mod event;
mod job;
mod overlay;
mod phase;
mod registry;
mod table;

pub use blittable::{Blittable, LayoutViolation};
pub use broadcast::{Broadcaster, ListenerKey};
pub use callback::{Callback, CallbackId, TerminableCallback};
pub use config::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_END_OF_PASS_ROUNDS, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_SUBSCRIBER_CAPACITY, DispatcherConfig, OverlayConfig,
};
pub use delivery::ProcessStats;
pub use dispatcher::TypedDispatcher;
pub use entity::{EntityHandle, EntityReservation};
pub use error::{DispatchError, DispatchResult, LeakedSubscription};
pub use event::Event;
pub use job::{Job, JobDispatcher};
pub use overlay::{OverlayState, SendMode, SendOverlay};
pub use phase::{GlobalEvents, Phase, PhasedEvents, Tick, TickChannel};
pub use registry::DispatcherRegistry;
pub use rgb_dispatch_derive::Blittable;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Blittable, Callback, DispatchError, DispatchResult, DispatcherRegistry, EntityHandle,
        Event, GlobalEvents, Job, JobDispatcher, PhasedEvents, ProcessStats, SendMode,
        SendOverlay, TerminableCallback, Tick, TickChannel, TypedDispatcher,
    };
}
