//! Generalized position and velocity of a floating-base mechanism.

use nalgebra::{DVector, Isometry3, Matrix3, Translation3, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::quaternion;

/// Number of scalar entries in a state besides the joint vectors:
/// base position (3), base quaternion (4), base linear velocity (3),
/// base quaternion velocity (4).
pub const BASE_STATE_DIM: usize = 14;

/// Floating-base robot state.
///
/// The base quaternion is stored raw (scalar-first, possibly slightly off the
/// unit sphere). Kinematics uses the normalized value; derivatives are taken
/// with respect to the raw one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    /// Base origin in the world frame (m).
    pub base_position: Vector3<f64>,
    /// Base orientation `[w, x, y, z]`, not necessarily normalized.
    pub base_quaternion: Vector4<f64>,
    /// Joint positions (rad or m).
    pub joint_positions: DVector<f64>,
    /// Base linear velocity in the world frame (m/s).
    pub base_linear_velocity: Vector3<f64>,
    /// Time derivative of `base_quaternion`.
    pub base_quaternion_velocity: Vector4<f64>,
    /// Joint velocities (rad/s or m/s).
    pub joint_velocities: DVector<f64>,
}

impl RobotState {
    /// State at the origin with identity orientation and zero velocities.
    pub fn zeros(dofs: usize) -> Self {
        Self {
            base_position: Vector3::zeros(),
            base_quaternion: quaternion::identity(),
            joint_positions: DVector::zeros(dofs),
            base_linear_velocity: Vector3::zeros(),
            base_quaternion_velocity: Vector4::zeros(),
            joint_velocities: DVector::zeros(dofs),
        }
    }

    /// Number of joint degrees of freedom.
    pub fn dofs(&self) -> usize {
        self.joint_positions.len()
    }

    /// Whether both joint vectors have the same length.
    pub fn is_consistent(&self) -> bool {
        self.joint_positions.len() == self.joint_velocities.len()
    }

    /// Total number of scalar entries.
    pub fn len(&self) -> usize {
        BASE_STATE_DIM + self.joint_positions.len() + self.joint_velocities.len()
    }

    /// Always false: the base part is never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn normalized_base_quaternion(&self) -> Vector4<f64> {
        quaternion::normalized(&self.base_quaternion)
    }

    /// Distance of the raw base quaternion from the unit sphere.
    pub fn quaternion_norm_error(&self) -> f64 {
        quaternion::norm_error(&self.base_quaternion)
    }

    /// Base rotation computed from the normalized quaternion.
    pub fn base_rotation(&self) -> Matrix3<f64> {
        quaternion::rotation_from_quaternion(&self.normalized_base_quaternion())
    }

    /// Base pose in the world frame.
    pub fn base_pose(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.base_position),
            quaternion::to_unit_quaternion(&self.base_quaternion),
        )
    }

    /// Base angular velocity expressed in the base frame, from the quaternion rate.
    pub fn base_body_angular_velocity(&self) -> Vector3<f64> {
        quaternion::left_trivialized_derivative_inverse(&self.normalized_base_quaternion())
            * self.base_quaternion_velocity
    }

    /// Iterate over every scalar in a fixed order: base position, base
    /// quaternion, joint positions, base linear velocity, quaternion rate,
    /// joint velocities.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.base_position
            .iter()
            .chain(self.base_quaternion.iter())
            .chain(self.joint_positions.iter())
            .chain(self.base_linear_velocity.iter())
            .chain(self.base_quaternion_velocity.iter())
            .chain(self.joint_velocities.iter())
            .copied()
    }

    /// Largest absolute component-wise difference (infinity norm of `self - other`).
    ///
    /// Returns `None` when the joint dimensions differ.
    pub fn max_abs_difference(&self, other: &Self) -> Option<f64> {
        if self.joint_positions.len() != other.joint_positions.len()
            || self.joint_velocities.len() != other.joint_velocities.len()
        {
            return None;
        }
        Some(
            self.iter()
                .zip(other.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max),
        )
    }

    /// Whether every component of `other` differs from `self` by strictly less than `tolerance`.
    ///
    /// NaN components never compare equal.
    pub fn same_as(&self, other: &Self, tolerance: f64) -> bool {
        if self.joint_positions.len() != other.joint_positions.len()
            || self.joint_velocities.len() != other.joint_velocities.len()
        {
            return false;
        }
        self.iter()
            .zip(other.iter())
            .all(|(a, b)| (a - b).abs() < tolerance)
    }
}
