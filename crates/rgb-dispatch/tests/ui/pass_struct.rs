//! Flat structs, tuple structs and unit structs derive Blittable.

use rgb_dispatch::{Blittable, EntityHandle};

#[derive(Blittable, Clone, Copy)]
struct Position {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Blittable, Clone, Copy)]
struct Moved(EntityHandle, Position, [Position; 2]);

#[derive(Blittable, Clone, Copy)]
struct Tick;

fn main() {
    assert!(Position::layout_violation().is_none());
    assert!(Moved::layout_violation().is_none());
    assert!(Tick::layout_violation().is_none());
}
