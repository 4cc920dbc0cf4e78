//! Event marker trait.
//!
//! Events are plain values addressed to an entity. Any fixed-layout type
//! can be an event; the dispatcher checks the layout when it is built.

use core::any::TypeId;

use crate::Blittable;

/// Marker trait for event types.
///
/// Blanket-implemented for every [`Blittable`] type.
pub trait Event: Blittable {
    /// Get the TypeId of this event type.
    fn type_id() -> TypeId {
        TypeId::of::<Self>()
    }

    /// Short name used in diagnostics.
    fn name() -> &'static str {
        short_type_name(core::any::type_name::<Self>())
    }
}

impl<T: Blittable> Event for T {}

/// Strip the module path from a type name, keeping generic arguments intact.
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Damage;

    impl Blittable for Damage {}

    struct Explosion;

    #[test]
    fn test_event_type_id() {
        assert_eq!(<Damage as Event>::type_id(), TypeId::of::<Damage>());
        assert_ne!(<Damage as Event>::type_id(), TypeId::of::<Explosion>());
    }

    #[test]
    fn test_short_names() {
        assert_eq!(<Damage as Event>::name(), "Damage");
        assert_eq!(<u32 as Event>::name(), "u32");
        assert_eq!(short_type_name("a::b::Wrapper<c::D>"), "Wrapper<c::D>");
    }
}
