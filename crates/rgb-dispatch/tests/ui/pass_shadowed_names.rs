//! Flat user types may share a name with a std container.

use rgb_dispatch::Blittable;

mod grid {
    use rgb_dispatch::Blittable;

    #[derive(Blittable, Clone, Copy)]
    pub struct Cell {
        pub x: i32,
        pub y: i32,
    }
}

use grid::Cell;

#[derive(Blittable, Clone, Copy)]
struct Path {
    from: grid::Cell,
    #[blittable(nested)]
    to: Cell,
}

fn main() {
    assert!(Cell::layout_violation().is_none());
    assert!(Path::layout_violation().is_none());
}
