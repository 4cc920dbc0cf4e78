//! Generic types check their parameters through where clauses.

use rgb_dispatch::Blittable;

#[derive(Blittable, Clone, Copy)]
struct Pair<T> {
    left: T,
    right: T,
}

#[derive(Blittable, Clone)]
struct Holder<T> {
    inner: Option<T>,
}

fn main() {
    assert!(<Pair<u32>>::layout_violation().is_none());

    assert!(<Holder<Pair<i8>>>::layout_violation().is_none());
}
