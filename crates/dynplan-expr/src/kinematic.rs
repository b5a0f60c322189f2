//! Graph leaves whose values come from the kinematics cache.

use nalgebra::DMatrix;

use dynplan_cache::StateCache;
use dynplan_core::CacheError;
use dynplan_core::quaternion::quaternion_from_rotation;
use dynplan_kinematics::FrameIndex;

/// A quantity of `target` relative to `base`, read from the cache of the
/// selected knot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kinematic {
    /// Position of `target` in `base` coordinates, `3x1`.
    RelativePosition { base: FrameIndex, target: FrameIndex },
    /// Orientation of `target` in `base`, scalar-first with `w >= 0`, `4x1`.
    RelativeQuaternion { base: FrameIndex, target: FrameIndex },
    /// Body-fixed relative Jacobian over the joints, `6 x dofs`.
    RelativeJacobian { base: FrameIndex, target: FrameIndex },
}

impl Kinematic {
    pub const fn frames(&self) -> (FrameIndex, FrameIndex) {
        match *self {
            Self::RelativePosition { base, target }
            | Self::RelativeQuaternion { base, target }
            | Self::RelativeJacobian { base, target } => (base, target),
        }
    }

    pub const fn shape(&self, dofs: usize) -> (usize, usize) {
        match self {
            Self::RelativePosition { .. } => (3, 1),
            Self::RelativeQuaternion { .. } => (4, 1),
            Self::RelativeJacobian { .. } => (6, dofs),
        }
    }

    pub fn compute(&self, cache: &StateCache) -> Result<DMatrix<f64>, CacheError> {
        match *self {
            Self::RelativePosition { base, target } => {
                let transform = cache.relative_transform(base, target)?;
                Ok(DMatrix::from_column_slice(
                    3,
                    1,
                    transform.translation.vector.as_slice(),
                ))
            }
            Self::RelativeQuaternion { base, target } => {
                let transform = cache.relative_transform(base, target)?;
                let rotation = transform.rotation.to_rotation_matrix().into_inner();
                let q = quaternion_from_rotation(&rotation);
                Ok(DMatrix::from_column_slice(4, 1, q.as_slice()))
            }
            Self::RelativeJacobian { base, target } => cache.relative_jacobian(base, target),
        }
    }
}
