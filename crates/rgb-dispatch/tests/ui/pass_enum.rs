//! Enums report violations with the variant in the field path.

use rgb_dispatch::Blittable;

#[derive(Blittable, Clone, Copy)]
enum Command {
    Stop,
    Move { dx: i32, dy: i32 },
}

#[derive(Blittable, Clone)]
enum Message {
    Empty,
    Text { body: String },
}

fn main() {
    assert!(Command::layout_violation().is_none());

    let violation = Message::layout_violation().unwrap();
    assert_eq!(violation.field, "Text::body");
    assert_eq!(violation.kind, "String");
}
