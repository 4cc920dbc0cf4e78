//! Compile-time tests for the Blittable derive macro.
//!
//! Non-fixed-layout fields still compile; they are reported when a
//! dispatcher is built over the type.

#[test]
fn test_derive_compiles() {
    let t = trybuild::TestCases::new();
    t.pass("tests/ui/pass_*.rs");
}
