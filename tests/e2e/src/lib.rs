//! End-to-end test support for Toolsight
//!
//! Scenario tests run the real pipeline, stores, and retrieval engine over a
//! deterministic stub encoder, so no model weights are needed. The stub maps
//! the red channel of a photo's first pixel onto an angle on the unit circle;
//! catalog fixtures place items at known angles, which makes similarity
//! outcomes exact and repeatable.

pub mod fixtures;
pub mod harness;

pub use fixtures::{photo_with_red, seed_catalog, unit_at};
pub use harness::{RedChannelEncoder, TestService};
