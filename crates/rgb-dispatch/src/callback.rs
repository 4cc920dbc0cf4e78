//! Shared callback handles with stable identity.
//!
//! Closures have no identity of their own, so a callback is wrapped in an
//! `Arc` once and the allocation address becomes its [`CallbackId`]. Clone
//! the handle to subscribe and later unsubscribe the same callback.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::EntityHandle;

/// Identity of a [`Callback`], stable across clones.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(usize);

impl fmt::Debug for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallbackId({:#x})", self.0)
    }
}

/// Key of one subscription: the entity plus the callback identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SubscriptionKey {
    pub entity: EntityHandle,
    pub callback: CallbackId,
}

impl SubscriptionKey {
    pub(crate) const fn new(entity: EntityHandle, callback: CallbackId) -> Self {
        Self { entity, callback }
    }
}

/// A shareable callback over `&E` returning `R`.
///
/// Two callbacks are the same subscriber only if one is a clone of the
/// other; wrapping the same function twice gives two distinct callbacks.
pub struct Callback<E, R = ()> {
    func: Arc<dyn Fn(&E) -> R + Send + Sync>,
    name: &'static str,
}

/// Callback that can stop delivery to later subscribers by returning `true`.
pub type TerminableCallback<E> = Callback<E, bool>;

impl<E, R> Callback<E, R> {
    /// Wrap a closure.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&E) -> R + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            name: core::any::type_name::<F>(),
        }
    }

    /// Identity of this callback.
    #[must_use]
    pub fn id(&self) -> CallbackId {
        CallbackId(Arc::as_ptr(&self.func).cast::<()>() as usize)
    }

    /// Type name of the wrapped closure, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Invoke the callback directly.
    pub fn call(&self, event: &E) -> R {
        (self.func)(event)
    }

    /// Invoke the callback, catching a panic and returning its message.
    pub(crate) fn call_caught(&self, event: &E) -> Result<R, String> {
        catch_unwind(AssertUnwindSafe(|| (self.func)(event))).map_err(panic_message)
    }
}

impl<E, R> Clone for Callback<E, R> {
    fn clone(&self) -> Self {
        Self {
            func: Arc::clone(&self.func),
            name: self.name,
        }
    }
}

impl<E, R> PartialEq for Callback<E, R> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<E, R> Eq for Callback<E, R> {}

impl<E, R> fmt::Debug for Callback<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("id", &self.id())
            .field("name", &self.name)
            .finish()
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
