//! Property-based tests.
//!
//! Run with: `cargo test --test property`

mod depth_bound;
mod view_containment;
