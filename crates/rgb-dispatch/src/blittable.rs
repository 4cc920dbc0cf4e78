//! Fixed-layout validation for event and job types.
//!
//! Dispatchers copy events and job state into worker batches, so both must
//! be flat values: no references, no heap handles, no shared state. The
//! check runs once, when a dispatcher is constructed.

use std::fmt;

use crate::EntityHandle;

/// The first field that keeps a type from being fixed-layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutViolation {
    /// Full type name of the offending type.
    pub type_name: &'static str,
    /// Field path inside that type (`variant::field` for enums).
    pub field: &'static str,
    /// What kind of type the field is (`String`, `reference`, ...).
    pub kind: &'static str,
}

impl fmt::Display for LayoutViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field `{}` of {} is {}",
            self.field, self.type_name, self.kind
        )
    }
}

/// A value type that can be copied across worker batches.
///
/// Implement with `#[derive(Blittable)]`. Primitives, arrays, tuples,
/// `Option<T>` and [`EntityHandle`] are covered here.
pub trait Blittable: Clone + Send + Sync + 'static {
    /// Report the first non-fixed-layout field, or `None` if the type is flat.
    fn layout_violation() -> Option<LayoutViolation> {
        None
    }
}

macro_rules! impl_blittable {
    ($($ty:ty),* $(,)?) => {
        $(impl Blittable for $ty {})*
    };
}

impl_blittable!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    EntityHandle,
);

impl<T: Blittable, const N: usize> Blittable for [T; N] {
    fn layout_violation() -> Option<LayoutViolation> {
        T::layout_violation()
    }
}

impl<T: Blittable> Blittable for Option<T> {
    fn layout_violation() -> Option<LayoutViolation> {
        T::layout_violation()
    }
}

macro_rules! impl_blittable_tuple {
    ($($name:ident),+) => {
        impl<$($name: Blittable),+> Blittable for ($($name,)+) {
            fn layout_violation() -> Option<LayoutViolation> {
                None$(.or_else($name::layout_violation))+
            }
        }
    };
}

impl_blittable_tuple!(A);
impl_blittable_tuple!(A, B);
impl_blittable_tuple!(A, B, C);
impl_blittable_tuple!(A, B, C, D);
impl_blittable_tuple!(A, B, C, D, E);
impl_blittable_tuple!(A, B, C, D, E, F);
