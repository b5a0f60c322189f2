//! Shared test fixtures and utilities for dynplan crates.
//!
//! Provides sample robot models, deterministic random states and mock
//! evaluators that count or fail state updates.

pub mod mocks;
pub mod models;
pub mod rng;

// ---------------------------------------------------------------------------
// Re-exports for convenience
// ---------------------------------------------------------------------------

pub use mocks::CountingEvaluator;
pub use models::{arm_model, two_leg_model};
pub use rng::{random_robot_state, seeded_rng};
