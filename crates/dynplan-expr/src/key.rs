//! Structured keys for registry-built expressions.

use std::fmt;

use crate::graph::{StateField, VariableId};

/// Robot-wide quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedQuantity {
    State(StateField),
    /// `q * (q^T q)^(-1/2)` of the raw base quaternion.
    NormalizedBaseQuaternion,
    BaseRotation,
    /// Body-fixed base twist `[R^T p_dot; G^-1(q) q_dot]`.
    BaseTwist,
    /// Center of mass in base-link coordinates.
    ComInBase,
    /// Center of mass in world coordinates.
    ComPosition,
    /// Homogeneous pose of the base link in the world, `[[R, p], [0, 1]]`.
    WorldToBase,
}

impl NamedQuantity {
    pub const fn name(self) -> &'static str {
        match self {
            Self::State(field) => field.name(),
            Self::NormalizedBaseQuaternion => "normalized_base_quaternion",
            Self::BaseRotation => "base_rotation",
            Self::BaseTwist => "base_twist",
            Self::ComInBase => "com_in_base",
            Self::ComPosition => "com_position",
            Self::WorldToBase => "world_to_base",
        }
    }
}

/// Quantities of a target frame relative to a base frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramePairQuantity {
    RelativePosition,
    RelativeQuaternion,
    RelativeRotation,
    /// `4x4` homogeneous transform.
    RelativeTransform,
    RelativeJacobian,
    /// Body-fixed velocity of the target relative to the base.
    RelativeVelocity,
    AdjointTransform,
    AdjointTransformWrench,
}

impl FramePairQuantity {
    pub const fn name(self) -> &'static str {
        match self {
            Self::RelativePosition => "relative_position",
            Self::RelativeQuaternion => "relative_quaternion",
            Self::RelativeRotation => "relative_rotation",
            Self::RelativeTransform => "relative_transform",
            Self::RelativeJacobian => "relative_jacobian",
            Self::RelativeVelocity => "relative_velocity",
            Self::AdjointTransform => "adjoint_transform",
            Self::AdjointTransformWrench => "adjoint_transform_wrench",
        }
    }
}

/// Quantities of a single frame in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameQuantity {
    WorldPosition,
    WorldRotation,
}

impl FrameQuantity {
    pub const fn name(self) -> &'static str {
        match self {
            Self::WorldPosition => "world_position",
            Self::WorldRotation => "world_rotation",
        }
    }
}

/// Quantities of a frame measured against a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameVariableQuantity {
    /// `R(desired)^T R_world(frame)` for a desired-orientation quaternion.
    RotationError,
}

impl FrameVariableQuantity {
    pub const fn name(self) -> &'static str {
        match self {
            Self::RotationError => "rotation_error",
        }
    }
}

/// Identity of a registry expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExpressionKey {
    Named(NamedQuantity),
    FramePair {
        kind: FramePairQuantity,
        base: String,
        target: String,
    },
    Frame {
        kind: FrameQuantity,
        frame: String,
    },
    FrameVariable {
        kind: FrameVariableQuantity,
        frame: String,
        variable: VariableId,
    },
    /// Built by a user-defined builder registered under this name.
    Custom(String),
}

impl ExpressionKey {
    pub const fn state(field: StateField) -> Self {
        Self::Named(NamedQuantity::State(field))
    }

    pub fn pair(kind: FramePairQuantity, base: &str, target: &str) -> Self {
        Self::FramePair {
            kind,
            base: base.to_owned(),
            target: target.to_owned(),
        }
    }

    pub fn relative_position(base: &str, target: &str) -> Self {
        Self::pair(FramePairQuantity::RelativePosition, base, target)
    }

    pub fn relative_quaternion(base: &str, target: &str) -> Self {
        Self::pair(FramePairQuantity::RelativeQuaternion, base, target)
    }

    pub fn relative_rotation(base: &str, target: &str) -> Self {
        Self::pair(FramePairQuantity::RelativeRotation, base, target)
    }

    pub fn relative_jacobian(base: &str, target: &str) -> Self {
        Self::pair(FramePairQuantity::RelativeJacobian, base, target)
    }

    pub fn world_position(frame: &str) -> Self {
        Self::Frame {
            kind: FrameQuantity::WorldPosition,
            frame: frame.to_owned(),
        }
    }

    pub fn world_rotation(frame: &str) -> Self {
        Self::Frame {
            kind: FrameQuantity::WorldRotation,
            frame: frame.to_owned(),
        }
    }

    pub fn rotation_error(frame: &str, desired: VariableId) -> Self {
        Self::FrameVariable {
            kind: FrameVariableQuantity::RotationError,
            frame: frame.to_owned(),
            variable: desired,
        }
    }

    pub fn custom(name: &str) -> Self {
        Self::Custom(name.to_owned())
    }
}

impl fmt::Display for ExpressionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(quantity) => f.write_str(quantity.name()),
            Self::FramePair { kind, base, target } => {
                write!(f, "{}({base}, {target})", kind.name())
            }
            Self::Frame { kind, frame } => write!(f, "{}({frame})", kind.name()),
            Self::FrameVariable {
                kind,
                frame,
                variable,
            } => write!(f, "{}({frame}, #{})", kind.name(), variable.index()),
            Self::Custom(name) => write!(f, "custom({name})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn display_names_the_quantity_and_frames() {
        assert_eq!(
            ExpressionKey::relative_position("l_sole", "r_sole").to_string(),
            "relative_position(l_sole, r_sole)"
        );
        assert_eq!(
            ExpressionKey::state(StateField::JointPositions).to_string(),
            "joint_positions"
        );
        assert_eq!(
            ExpressionKey::world_rotation("tool").to_string(),
            "world_rotation(tool)"
        );
        assert_eq!(
            ExpressionKey::rotation_error("tool", VariableId(7)).to_string(),
            "rotation_error(tool, #7)"
        );
    }

    #[test]
    fn frame_order_matters() {
        let mut keys = HashSet::new();
        keys.insert(ExpressionKey::relative_position("a", "b"));
        keys.insert(ExpressionKey::relative_position("b", "a"));
        keys.insert(ExpressionKey::relative_quaternion("a", "b"));
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&ExpressionKey::relative_position("a", "b")));
    }
}
