//! Backend-agnostic kinematics/dynamics evaluator trait.
//!
//! Every state cache owns one [`KinDynEvaluator`] instance. A backend wraps
//! some rigid-body library (or the in-crate [`FloatingBaseKinematics`]) and
//! answers queries for whatever state it was last updated with.
//!
//! [`FloatingBaseKinematics`]: crate::FloatingBaseKinematics

use nalgebra::{DMatrix, DVector, Isometry3, Vector3, Vector6};

use dynplan_core::{EvaluatorError, RobotState};

use crate::model::{FrameIndex, JointKind, RobotModel};

/// Frame in which base velocities and frame Jacobians are expressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum VelocityRepresentation {
    /// Linear velocity of the frame origin and angular velocity, both in world axes.
    #[default]
    Mixed,
    /// Linear and angular velocity in the frame's own axes.
    Body,
    /// Spatial velocity of the body seen at the world origin.
    Inertial,
}

impl VelocityRepresentation {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mixed => "mixed",
            Self::Body => "body",
            Self::Inertial => "inertial",
        }
    }
}

/// A wrench applied at a frame origin, world axes: `[force; torque]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalWrench {
    pub frame: FrameIndex,
    pub wrench: Vector6<f64>,
}

/// Geometry of a joint, as needed to differentiate relative Jacobians.
#[derive(Debug, Clone, PartialEq)]
pub struct JointMotion {
    pub kind: JointKind,
    /// Joint axis in the child link frame.
    pub axis: Vector3<f64>,
    /// Frame of the link the joint moves.
    pub child_frame: FrameIndex,
    /// Position in the joint vector.
    pub dof: usize,
}

/// Trait that concrete kinematics/dynamics backends must implement.
///
/// Generalized velocities have `6 + dofs` entries: base linear velocity,
/// base angular velocity (in the axes selected by the representation) and
/// joint velocities. Frame Jacobians are `6 x (6 + dofs)`.
pub trait KinDynEvaluator: Send + Sync {
    /// Independent copy of this evaluator, including its loaded model.
    fn boxed_clone(&self) -> Box<dyn KinDynEvaluator>;

    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Load a robot description, discarding any previous state.
    fn load_model(&mut self, model: &RobotModel) -> Result<(), EvaluatorError>;

    /// Whether a model has been loaded.
    fn is_valid(&self) -> bool;

    /// Loaded model description.
    fn model(&self) -> Result<&RobotModel, EvaluatorError>;

    /// Number of joint degrees of freedom. Zero before a model is loaded.
    fn dofs(&self) -> usize;

    fn frame_index(&self, name: &str) -> Result<FrameIndex, EvaluatorError> {
        self.model()?
            .frame_index(name)
            .ok_or_else(|| EvaluatorError::UnknownFrame(name.to_owned()))
    }

    fn frame_name(&self, frame: FrameIndex) -> Result<&str, EvaluatorError> {
        self.model()?
            .frame(frame)
            .map(|f| f.name.as_str())
            .ok_or(EvaluatorError::FrameIndexOutOfRange(frame))
    }

    fn set_gravity(&mut self, gravity: Vector3<f64>);

    fn gravity(&self) -> Vector3<f64>;

    /// Evaluate everything that depends on `state`.
    fn update_state(&mut self, state: &RobotState) -> Result<(), EvaluatorError>;

    /// Last state passed to a successful [`update_state`](Self::update_state).
    fn current_state(&self) -> Option<&RobotState>;

    /// Whether `state` matches the current state within `tolerance`.
    fn same_state(&self, state: &RobotState, tolerance: f64) -> bool {
        self.current_state()
            .is_some_and(|current| current.same_as(state, tolerance))
    }

    /// Pose of `frame` in the world.
    fn world_transform(&self, frame: FrameIndex) -> Result<Isometry3<f64>, EvaluatorError>;

    /// Pose of `target` expressed in `base`.
    fn relative_transform(
        &self,
        base: FrameIndex,
        target: FrameIndex,
    ) -> Result<Isometry3<f64>, EvaluatorError> {
        Ok(self.world_transform(base)?.inverse() * self.world_transform(target)?)
    }

    /// `6 x (6 + dofs)` Jacobian of `frame`.
    fn frame_jacobian(
        &self,
        frame: FrameIndex,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError>;

    /// `6 x dofs` Jacobian of the motion of `target` relative to `base`,
    /// expressed in `target` axes. Only joint velocities contribute.
    fn relative_jacobian(
        &self,
        base: FrameIndex,
        target: FrameIndex,
    ) -> Result<DMatrix<f64>, EvaluatorError>;

    /// Twist of `frame` under the current state.
    fn frame_velocity(
        &self,
        frame: FrameIndex,
        representation: VelocityRepresentation,
    ) -> Result<Vector6<f64>, EvaluatorError>;

    /// Whole-body centre of mass in the world.
    fn com_position(&self) -> Result<Vector3<f64>, EvaluatorError>;

    /// `3 x (6 + dofs)` Jacobian of the centre of mass.
    fn com_jacobian(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError>;

    /// Total momentum `[linear; angular]` about the base origin.
    fn momentum(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<Vector6<f64>, EvaluatorError>;

    /// `6 x (6 + dofs)` map from generalized velocity to momentum.
    fn momentum_jacobian(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError>;

    /// `(6 + dofs) x (6 + dofs)` joint-space inertia.
    fn mass_matrix(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError>;

    /// Generalized forces that hold the current configuration static under
    /// gravity and the given external wrenches (mixed representation).
    fn static_torques(&self, external: &[ExternalWrench]) -> Result<DVector<f64>, EvaluatorError>;

    /// Link carrying `frame`, and the frame's pose in that link.
    fn frame_link(&self, frame: FrameIndex) -> Result<(FrameIndex, Isometry3<f64>), EvaluatorError> {
        let model = self.model()?;
        let f = model
            .frame(frame)
            .ok_or(EvaluatorError::FrameIndexOutOfRange(frame))?;
        Ok((model.links()[f.link].frame, f.offset))
    }

    /// Actuated joints between two frames. Returns `(up, down)` as in
    /// [`RobotModel::path_between`], with fixed joints removed.
    fn joint_path(
        &self,
        base: FrameIndex,
        target: FrameIndex,
    ) -> Result<(Vec<JointMotion>, Vec<JointMotion>), EvaluatorError> {
        let model = self.model()?;
        let link_of = |frame: FrameIndex| {
            model
                .frame(frame)
                .map(|f| f.link)
                .ok_or(EvaluatorError::FrameIndexOutOfRange(frame))
        };
        let (up, down) = model.path_between(link_of(base)?, link_of(target)?);
        let motions = |joints: Vec<usize>| -> Vec<JointMotion> {
            joints
                .into_iter()
                .filter_map(|j| {
                    let joint = &model.joints()[j];
                    joint.dof.map(|dof| JointMotion {
                        kind: joint.kind,
                        axis: joint.axis.into_inner(),
                        child_frame: model.links()[joint.child].frame,
                        dof,
                    })
                })
                .collect()
        };
        Ok((motions(up), motions(down)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trait_is_object_safe() {
        fn _accepts_boxed(_: Box<dyn KinDynEvaluator>) {}
    }

    #[test]
    fn trait_is_send_sync() {
        fn _assert_send_sync<T: Send + Sync>() {}
        _assert_send_sync::<Box<dyn KinDynEvaluator>>();
    }

    #[test]
    fn representation_names() {
        assert_eq!(VelocityRepresentation::default(), VelocityRepresentation::Mixed);
        assert_eq!(VelocityRepresentation::Body.name(), "body");
        assert_eq!(VelocityRepresentation::Inertial.name(), "inertial");
    }
}
