//! Dispatch error types.

use std::fmt;

use thiserror::Error;

use crate::EntityHandle;
use crate::blittable::LayoutViolation;

/// A subscription still present when a dispatcher was expected to be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakedSubscription {
    /// Entity the subscription is bound to.
    pub entity: EntityHandle,
    /// Type name of the callback closure.
    pub callback: &'static str,
}

impl fmt::Display for LeakedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.entity, self.callback)
    }
}

/// Wrapper that renders a leak list one subscription per line.
#[derive(Debug)]
struct LeakList<'a>(&'a [LeakedSubscription]);

impl fmt::Display for LeakList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for leak in self.0 {
            write!(f, "\n  {leak}")?;
        }
        Ok(())
    }
}

/// Dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The same (entity, callback) pair was subscribed twice.
    #[error(
        "not allowed to subscribe the same callback to the same entity: entity {entity}, event {event}, callback {callback}"
    )]
    DuplicateSubscription {
        entity: EntityHandle,
        event: &'static str,
        callback: &'static str,
    },

    /// Event type is not fixed-layout.
    #[error("event type must be blittable: {0}")]
    InvalidEventType(LayoutViolation),

    /// Job state type is not fixed-layout.
    #[error("job state type must be blittable: {0}")]
    InvalidJobStateType(LayoutViolation),

    /// Subscribers remain where none were expected.
    #[error(
        "the following subscribers are still listening to the {dispatcher} dispatcher:{}",
        LeakList(.subscribers)
    )]
    LeakedSubscriber {
        dispatcher: &'static str,
        subscribers: Vec<LeakedSubscription>,
    },

    /// A user callback panicked during delivery.
    #[error("callback fault in {dispatcher} dispatcher for entity {entity}: {message}")]
    CallbackFault {
        dispatcher: &'static str,
        entity: EntityHandle,
        message: String,
    },

    /// Index outside a handle reservation.
    #[error("index {index} is outside a reservation of {len} handles")]
    ReservationOutOfRange { index: u64, len: u64 },

    /// Reservation would exhaust the minted id space.
    #[error("cannot reserve {requested} handles: entity id space exhausted")]
    CounterOverflow { requested: u64 },
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
