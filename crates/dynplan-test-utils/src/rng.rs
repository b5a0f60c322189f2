//! Deterministic RNG utilities for reproducible tests.

use nalgebra::{DVector, Vector3, Vector4};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use dynplan_core::{RobotState, quaternion};

/// Create a deterministic `ChaCha8Rng` from a seed.
///
/// All test randomization should go through this to ensure reproducibility.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

fn uniform<R: Rng>(rng: &mut R, bound: f64) -> f64 {
    rng.gen_range(-bound..bound)
}

/// Random state with a unit base quaternion and a quaternion rate that
/// corresponds to a bounded body angular velocity.
pub fn random_robot_state<R: Rng>(rng: &mut R, dofs: usize) -> RobotState {
    let base_quaternion = quaternion::normalized(&Vector4::new(
        1.0 + rng.r#gen::<f64>(),
        uniform(rng, 0.5),
        uniform(rng, 0.5),
        uniform(rng, 0.5),
    ));
    let omega = Vector3::new(uniform(rng, 1.0), uniform(rng, 1.0), uniform(rng, 1.0));
    RobotState {
        base_position: Vector3::new(uniform(rng, 1.0), uniform(rng, 1.0), 0.5 + rng.r#gen::<f64>()),
        base_quaternion,
        joint_positions: DVector::from_fn(dofs, |_, _| uniform(rng, 1.0)),
        base_linear_velocity: Vector3::new(uniform(rng, 1.0), uniform(rng, 1.0), uniform(rng, 1.0)),
        base_quaternion_velocity: quaternion::left_trivialized_derivative(&base_quaternion) * omega,
        joint_velocities: DVector::from_fn(dofs, |_, _| uniform(rng, 2.0)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
