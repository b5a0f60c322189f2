//! Reference [`KinDynEvaluator`] backend for floating-base trees.
//!
//! Forward kinematics composes `parent * origin * motion(q)` down the tree,
//! the same way a serial chain is walked, and stores the world pose and a
//! mixed-representation Jacobian of every link origin. All other quantities
//! are derived from those two tables on demand.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Vector3, Vector6};
use tracing::{debug, trace};

use dynplan_core::quaternion::skew;
use dynplan_core::{EvaluatorError, PlannerConfig, RobotState};

use crate::evaluator::{ExternalWrench, KinDynEvaluator, VelocityRepresentation};
use crate::model::{FrameIndex, JointKind, RobotModel};

const DEFAULT_QUATERNION_NORM_TOLERANCE: f64 = 1e-2;

/// Floating-base kinematics and rigid-body dynamics on a [`RobotModel`].
#[derive(Debug, Clone)]
pub struct FloatingBaseKinematics {
    model: Option<Arc<RobotModel>>,
    gravity: Vector3<f64>,
    quaternion_norm_tolerance: f64,
    state: Option<RobotState>,
    /// World pose of every link.
    link_poses: Vec<Isometry3<f64>>,
    /// Mixed Jacobian of every link origin, `6 x (6 + dofs)`.
    link_jacobians: Vec<DMatrix<f64>>,
    /// Mixed generalized velocity `[p_dot; omega_world; s_dot]`.
    velocity: DVector<f64>,
}

impl Default for FloatingBaseKinematics {
    fn default() -> Self {
        Self::new()
    }
}

impl FloatingBaseKinematics {
    pub fn new() -> Self {
        Self {
            model: None,
            gravity: Vector3::new(0.0, 0.0, -9.81),
            quaternion_norm_tolerance: DEFAULT_QUATERNION_NORM_TOLERANCE,
            state: None,
            link_poses: Vec::new(),
            link_jacobians: Vec::new(),
            velocity: DVector::zeros(0),
        }
    }

    /// Evaluator with `model` already loaded.
    pub fn with_model(model: &RobotModel) -> Result<Self, EvaluatorError> {
        let mut evaluator = Self::new();
        evaluator.load_model(model)?;
        Ok(evaluator)
    }

    /// Evaluator for `model` with the gravity and quaternion tolerance of a
    /// planner config.
    pub fn from_config(model: &RobotModel, config: &PlannerConfig) -> Result<Self, EvaluatorError> {
        let mut evaluator = Self::with_model(model)?
            .with_quaternion_norm_tolerance(config.cache.quaternion_norm_tolerance);
        evaluator.set_gravity(Vector3::from(config.gravity));
        Ok(evaluator)
    }

    /// Maximum accepted `| |q| - 1 |` of the raw base quaternion.
    #[must_use]
    pub fn with_quaternion_norm_tolerance(mut self, tolerance: f64) -> Self {
        self.quaternion_norm_tolerance = tolerance;
        self
    }

    fn loaded(&self) -> Result<&RobotModel, EvaluatorError> {
        self.model.as_deref().ok_or(EvaluatorError::ModelNotLoaded)
    }

    fn state(&self) -> Result<&RobotState, EvaluatorError> {
        self.loaded()?;
        self.state.as_ref().ok_or(EvaluatorError::StateNotSet)
    }

    fn base_rotation(&self) -> Result<Matrix3<f64>, EvaluatorError> {
        self.state()?;
        Ok(rotation_of(&self.link_poses[0]))
    }

    fn base_position(&self) -> Vector3<f64> {
        self.link_poses[0].translation.vector
    }

    /// World pose and mixed Jacobian of `frame`.
    fn frame_kinematics(
        &self,
        frame: FrameIndex,
    ) -> Result<(Isometry3<f64>, DMatrix<f64>), EvaluatorError> {
        self.state()?;
        let model = self.loaded()?;
        let f = model
            .frame(frame)
            .ok_or(EvaluatorError::FrameIndexOutOfRange(frame))?;
        let link_pose = self.link_poses[f.link];
        let pose = link_pose * f.offset;
        let lever = pose.translation.vector - link_pose.translation.vector;
        Ok((pose, shift_point(&self.link_jacobians[f.link], &lever)))
    }

    /// Mass properties of every link in world axes.
    fn com_jacobians(&self) -> Result<Vec<LinkMass>, EvaluatorError> {
        self.state()?;
        let model = self.loaded()?;
        Ok(model
            .links()
            .iter()
            .enumerate()
            .map(|(i, link)| {
                let pose = &self.link_poses[i];
                let rotation = rotation_of(pose);
                let lever = rotation * link.inertial.com;
                let inertia = rotation * link.inertial.inertia * rotation.transpose();
                let position = pose.translation.vector + lever;
                LinkMass {
                    mass: link.inertial.mass,
                    inertia,
                    position,
                    jacobian: shift_point(&self.link_jacobians[i], &lever),
                }
            })
            .collect())
    }

    /// Right-multiply base columns to accept a generalized velocity in `representation`.
    fn convert_columns(
        &self,
        jacobian: &DMatrix<f64>,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError> {
        let mut out = jacobian.clone();
        match representation {
            VelocityRepresentation::Mixed => {}
            VelocityRepresentation::Body => {
                let r = self.base_rotation()?;
                out.columns_mut(0, 3).copy_from(&(jacobian.columns(0, 3) * r));
                out.columns_mut(3, 3).copy_from(&(jacobian.columns(3, 3) * r));
            }
            VelocityRepresentation::Inertial => {
                // p_dot = v_origin - skew(p_b) omega
                let p = self.base_position();
                let correction = jacobian.columns(0, 3) * skew(&p);
                let mut angular = out.columns_mut(3, 3);
                angular -= correction;
            }
        }
        Ok(out)
    }

    /// Generalized velocity of the current state in `representation`:
    /// base linear, base angular, then joint velocities.
    pub fn generalized_velocity(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DVector<f64>, EvaluatorError> {
        self.state()?;
        let mut out = self.velocity.clone();
        let linear: Vector3<f64> = self.velocity.fixed_rows::<3>(0).into();
        let angular: Vector3<f64> = self.velocity.fixed_rows::<3>(3).into();
        match representation {
            VelocityRepresentation::Mixed => {}
            VelocityRepresentation::Body => {
                let r = self.base_rotation()?;
                out.fixed_rows_mut::<3>(0).copy_from(&(r.transpose() * linear));
                out.fixed_rows_mut::<3>(3).copy_from(&(r.transpose() * angular));
            }
            VelocityRepresentation::Inertial => {
                let p = self.base_position();
                out.fixed_rows_mut::<3>(0).copy_from(&(linear + skew(&p) * angular));
            }
        }
        Ok(out)
    }

    /// Mixed centroidal-style momentum matrix about the base origin.
    fn mixed_momentum_jacobian(&self) -> Result<DMatrix<f64>, EvaluatorError> {
        let width = 6 + self.dofs();
        let base = self.base_position();
        let mut out = DMatrix::zeros(6, width);
        for link in self.com_jacobians()? {
            let linear = link.jacobian.rows(0, 3) * link.mass;
            let angular =
                link.inertia * link.jacobian.rows(3, 3) + skew(&(link.position - base)) * &linear;
            let mut top = out.rows_mut(0, 3);
            top += &linear;
            let mut bottom = out.rows_mut(3, 3);
            bottom += angular;
        }
        Ok(out)
    }
}

/// A link's mass, world-axes inertia, centre of mass and mixed Jacobian of
/// that centre of mass.
struct LinkMass {
    mass: f64,
    inertia: Matrix3<f64>,
    position: Vector3<f64>,
    jacobian: DMatrix<f64>,
}

/// Linear rows moved from the reference point to a point `lever` away.
fn shift_point(jacobian: &DMatrix<f64>, lever: &Vector3<f64>) -> DMatrix<f64> {
    let mut out = jacobian.clone();
    let correction = skew(lever) * jacobian.rows(3, 3);
    let mut linear = out.rows_mut(0, 3);
    linear -= correction;
    out
}

/// Rotate both row blocks by `rotation`.
fn rotate_rows(jacobian: &DMatrix<f64>, rotation: &Matrix3<f64>) -> DMatrix<f64> {
    let mut out = jacobian.clone();
    out.rows_mut(0, 3).copy_from(&(rotation * jacobian.rows(0, 3)));
    out.rows_mut(3, 3).copy_from(&(rotation * jacobian.rows(3, 3)));
    out
}

fn rotation_of(pose: &Isometry3<f64>) -> Matrix3<f64> {
    pose.rotation.to_rotation_matrix().into_inner()
}

fn unsupported(quantity: &'static str, representation: VelocityRepresentation) -> EvaluatorError {
    EvaluatorError::UnsupportedRepresentation {
        quantity,
        representation: representation.name(),
    }
}

impl KinDynEvaluator for FloatingBaseKinematics {
    fn boxed_clone(&self) -> Box<dyn KinDynEvaluator> {
        Box::new(self.clone())
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "floating-base"
    }

    fn load_model(&mut self, model: &RobotModel) -> Result<(), EvaluatorError> {
        if model.links().is_empty() {
            return Err(EvaluatorError::InvalidModel("model has no links".into()));
        }
        debug!(
            links = model.links().len(),
            dofs = model.dofs(),
            frames = model.frames().len(),
            "Loaded robot model"
        );
        self.model = Some(Arc::new(model.clone()));
        self.state = None;
        self.link_poses = vec![Isometry3::identity(); model.links().len()];
        self.link_jacobians = vec![DMatrix::zeros(6, 6 + model.dofs()); model.links().len()];
        self.velocity = DVector::zeros(6 + model.dofs());
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.model.is_some()
    }

    fn model(&self) -> Result<&RobotModel, EvaluatorError> {
        self.loaded()
    }

    fn dofs(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.dofs())
    }

    fn set_gravity(&mut self, gravity: Vector3<f64>) {
        self.gravity = gravity;
    }

    fn gravity(&self) -> Vector3<f64> {
        self.gravity
    }

    fn update_state(&mut self, state: &RobotState) -> Result<(), EvaluatorError> {
        let model = Arc::clone(self.model.as_ref().ok_or(EvaluatorError::ModelNotLoaded)?);
        let n = model.dofs();
        for got in [state.joint_positions.len(), state.joint_velocities.len()] {
            if got != n {
                return Err(EvaluatorError::DimensionMismatch { expected: n, got });
            }
        }
        let norm_error = state.quaternion_norm_error();
        if norm_error.is_nan() || norm_error > self.quaternion_norm_tolerance {
            return Err(EvaluatorError::NonUnitQuaternion(norm_error));
        }

        self.link_poses[model.base_link()] = state.base_pose();
        for &j in model.traversal() {
            let joint = &model.joints()[j];
            let position = joint.dof.map_or(0.0, |d| state.joint_positions[d]);
            self.link_poses[joint.child] =
                self.link_poses[joint.parent] * joint.origin * joint.motion(position);
        }

        let base_position = self.link_poses[model.base_link()].translation.vector;
        for (link, jacobian) in self.link_jacobians.iter_mut().enumerate() {
            let position = self.link_poses[link].translation.vector;
            jacobian.fill(0.0);
            jacobian.fixed_view_mut::<3, 3>(0, 0).fill_with_identity();
            jacobian
                .fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&(-skew(&(position - base_position))));
            jacobian.fixed_view_mut::<3, 3>(3, 3).fill_with_identity();
            for j in model.path_from_base(link) {
                let joint = &model.joints()[j];
                let Some(dof) = joint.dof else { continue };
                let child = &self.link_poses[joint.child];
                let axis = child.rotation * joint.axis.into_inner();
                let (linear, angular) = match joint.kind {
                    JointKind::Revolute => {
                        (axis.cross(&(position - child.translation.vector)), axis)
                    }
                    JointKind::Prismatic => (axis, Vector3::zeros()),
                    JointKind::Fixed => continue,
                };
                jacobian.fixed_view_mut::<3, 1>(0, 6 + dof).copy_from(&linear);
                jacobian.fixed_view_mut::<3, 1>(3, 6 + dof).copy_from(&angular);
            }
        }

        let base_rotation = state.base_rotation();
        self.velocity
            .fixed_rows_mut::<3>(0)
            .copy_from(&state.base_linear_velocity);
        self.velocity
            .fixed_rows_mut::<3>(3)
            .copy_from(&(base_rotation * state.base_body_angular_velocity()));
        self.velocity.rows_mut(6, n).copy_from(&state.joint_velocities);

        self.state = Some(state.clone());
        trace!(dofs = n, "Evaluated robot state");
        Ok(())
    }

    fn current_state(&self) -> Option<&RobotState> {
        self.state.as_ref()
    }

    fn world_transform(&self, frame: FrameIndex) -> Result<Isometry3<f64>, EvaluatorError> {
        self.state()?;
        let model = self.loaded()?;
        let f = model
            .frame(frame)
            .ok_or(EvaluatorError::FrameIndexOutOfRange(frame))?;
        Ok(self.link_poses[f.link] * f.offset)
    }

    fn frame_jacobian(
        &self,
        frame: FrameIndex,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError> {
        let (pose, mixed) = self.frame_kinematics(frame)?;
        let columns = self.convert_columns(&mixed, representation)?;
        Ok(match representation {
            VelocityRepresentation::Mixed => columns,
            VelocityRepresentation::Body => rotate_rows(&columns, &rotation_of(&pose).transpose()),
            VelocityRepresentation::Inertial => {
                // v_origin = p_dot + skew(p) omega
                let mut out = columns.clone();
                let correction = skew(&pose.translation.vector) * columns.rows(3, 3);
                let mut linear = out.rows_mut(0, 3);
                linear += correction;
                out
            }
        })
    }

    fn relative_jacobian(
        &self,
        base: FrameIndex,
        target: FrameIndex,
    ) -> Result<DMatrix<f64>, EvaluatorError> {
        let n = self.dofs();
        let (pose_a, jac_a) = self.frame_kinematics(base)?;
        let (pose_b, jac_b) = self.frame_kinematics(target)?;
        let r_b_t = rotation_of(&pose_b).transpose();
        let offset = pose_b.translation.vector - pose_a.translation.vector;

        let linear = r_b_t
            * (jac_b.view((0, 6), (3, n)) - jac_a.view((0, 6), (3, n))
                + skew(&offset) * jac_a.view((3, 6), (3, n)));
        let angular = r_b_t * (jac_b.view((3, 6), (3, n)) - jac_a.view((3, 6), (3, n)));

        let mut out = DMatrix::zeros(6, n);
        out.rows_mut(0, 3).copy_from(&linear);
        out.rows_mut(3, 3).copy_from(&angular);
        Ok(out)
    }

    fn frame_velocity(
        &self,
        frame: FrameIndex,
        representation: VelocityRepresentation,
    ) -> Result<Vector6<f64>, EvaluatorError> {
        let (pose, mixed) = self.frame_kinematics(frame)?;
        let twist = mixed * &self.velocity;
        let linear = Vector3::new(twist[0], twist[1], twist[2]);
        let angular = Vector3::new(twist[3], twist[4], twist[5]);
        let (linear, angular) = match representation {
            VelocityRepresentation::Mixed => (linear, angular),
            VelocityRepresentation::Body => {
                let r_t = rotation_of(&pose).transpose();
                (r_t * linear, r_t * angular)
            }
            VelocityRepresentation::Inertial => {
                (linear + skew(&pose.translation.vector) * angular, angular)
            }
        };
        Ok(Vector6::new(
            linear.x, linear.y, linear.z, angular.x, angular.y, angular.z,
        ))
    }

    fn com_position(&self) -> Result<Vector3<f64>, EvaluatorError> {
        let total = self.loaded()?.total_mass();
        if total <= 0.0 {
            return Err(EvaluatorError::InvalidModel("total mass is zero".into()));
        }
        let weighted = self
            .com_jacobians()?
            .iter()
            .fold(Vector3::zeros(), |acc, link| acc + link.position * link.mass);
        Ok(weighted / total)
    }

    fn com_jacobian(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError> {
        let total = self.loaded()?.total_mass();
        if total <= 0.0 {
            return Err(EvaluatorError::InvalidModel("total mass is zero".into()));
        }
        let mut mixed = DMatrix::zeros(3, 6 + self.dofs());
        for link in self.com_jacobians()? {
            mixed += link.jacobian.rows(0, 3) * (link.mass / total);
        }
        self.convert_columns(&mixed, representation)
    }

    fn momentum(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<Vector6<f64>, EvaluatorError> {
        if representation == VelocityRepresentation::Inertial {
            return Err(unsupported("momentum", representation));
        }
        let h = self.mixed_momentum_jacobian()? * &self.velocity;
        let mut linear = Vector3::new(h[0], h[1], h[2]);
        let mut angular = Vector3::new(h[3], h[4], h[5]);
        if representation == VelocityRepresentation::Body {
            let r_t = self.base_rotation()?.transpose();
            linear = r_t * linear;
            angular = r_t * angular;
        }
        Ok(Vector6::new(
            linear.x, linear.y, linear.z, angular.x, angular.y, angular.z,
        ))
    }

    fn momentum_jacobian(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError> {
        match representation {
            VelocityRepresentation::Mixed => self.mixed_momentum_jacobian(),
            VelocityRepresentation::Body => {
                let mixed = self.mixed_momentum_jacobian()?;
                let columns = self.convert_columns(&mixed, representation)?;
                Ok(rotate_rows(&columns, &self.base_rotation()?.transpose()))
            }
            VelocityRepresentation::Inertial => Err(unsupported("momentum jacobian", representation)),
        }
    }

    fn mass_matrix(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError> {
        if representation == VelocityRepresentation::Inertial {
            return Err(unsupported("mass matrix", representation));
        }
        let width = 6 + self.dofs();
        let mut mixed = DMatrix::zeros(width, width);
        for link in self.com_jacobians()? {
            let linear = link.jacobian.rows(0, 3);
            let angular = link.jacobian.rows(3, 3);
            mixed += linear.transpose() * linear * link.mass;
            mixed += angular.transpose() * (link.inertia * angular);
        }
        if representation == VelocityRepresentation::Mixed {
            return Ok(mixed);
        }
        let mut transform = DMatrix::identity(width, width);
        let r = self.base_rotation()?;
        transform.view_mut((0, 0), (3, 3)).copy_from(&r);
        transform.view_mut((3, 3), (3, 3)).copy_from(&r);
        Ok(transform.transpose() * mixed * transform)
    }

    fn static_torques(&self, external: &[ExternalWrench]) -> Result<DVector<f64>, EvaluatorError> {
        let mut torques = DVector::zeros(6 + self.dofs());
        for link in self.com_jacobians()? {
            torques -= link.jacobian.rows(0, 3).transpose() * (self.gravity * link.mass);
        }
        for applied in external {
            let (_, jacobian) = self.frame_kinematics(applied.frame)?;
            torques -= jacobian.transpose() * applied.wrench;
        }
        Ok(torques)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Inertial;
    use approx::assert_relative_eq;
    use dynplan_core::quaternion;
    use nalgebra::Vector4;

    /// Floating torso with a two-link planar arm (rotations about y) and a
    /// prismatic tip, plus a tool frame.
    fn arm() -> RobotModel {
        RobotModel::builder(
            "torso",
            Inertial::cuboid(4.0, Vector3::new(0.0, 0.0, 0.05), Vector3::new(0.3, 0.2, 0.4)),
        )
        .revolute(
            "upper",
            Inertial::cuboid(1.0, Vector3::new(0.0, 0.0, -0.2), Vector3::new(0.05, 0.05, 0.4)),
            "shoulder",
            "torso",
            Isometry3::translation(0.0, 0.15, 0.2),
            Vector3::y(),
        )
        .revolute(
            "lower",
            Inertial::cuboid(0.5, Vector3::new(0.0, 0.0, -0.15), Vector3::new(0.04, 0.04, 0.3)),
            "elbow",
            "upper",
            Isometry3::translation(0.0, 0.0, -0.4),
            Vector3::new(0.0, 1.0, 0.3),
        )
        .link(
            "tip",
            Inertial::cuboid(0.1, Vector3::zeros(), Vector3::new(0.02, 0.02, 0.02)),
            "slide",
            JointKind::Prismatic,
            "lower",
            Isometry3::translation(0.0, 0.0, -0.3),
            Vector3::new(0.2, 0.0, -1.0),
        )
        .frame("tool", "tip", Isometry3::translation(0.02, 0.01, -0.05))
        .build()
        .unwrap()
    }

    fn state() -> RobotState {
        let mut state = RobotState::zeros(3);
        state.base_position = Vector3::new(0.3, -0.1, 0.9);
        state.base_quaternion = quaternion::normalized(&Vector4::new(0.9, 0.1, -0.3, 0.2));
        state.joint_positions = DVector::from_vec(vec![0.4, -0.7, 0.05]);
        state.base_linear_velocity = Vector3::new(0.2, 0.1, -0.3);
        let omega = Vector3::new(0.3, -0.2, 0.5);
        state.base_quaternion_velocity =
            quaternion::left_trivialized_derivative(&state.base_quaternion) * omega;
        state.joint_velocities = DVector::from_vec(vec![0.5, -1.0, 0.2]);
        state
    }

    fn evaluator() -> FloatingBaseKinematics {
        let mut kin = FloatingBaseKinematics::with_model(&arm()).unwrap();
        kin.update_state(&state()).unwrap();
        kin
    }

    #[test]
    fn generalized_velocity_layout() {
        let kin = evaluator();
        let s = state();
        let body = kin.generalized_velocity(VelocityRepresentation::Body).unwrap();
        assert_eq!(body.len(), 9);
        let linear = s.base_rotation().transpose() * s.base_linear_velocity;
        let angular = Vector3::new(0.3, -0.2, 0.5);
        for i in 0..3 {
            assert_relative_eq!(body[i], linear[i], epsilon = 1e-12);
            assert_relative_eq!(body[3 + i], angular[i], epsilon = 1e-12);
            assert_relative_eq!(body[6 + i], s.joint_velocities[i], epsilon = 1e-12);
        }
        let mixed = kin.generalized_velocity(VelocityRepresentation::Mixed).unwrap();
        assert_relative_eq!(mixed[0], s.base_linear_velocity.x, epsilon = 1e-12);

        let unset = FloatingBaseKinematics::with_model(&arm()).unwrap();
        assert_eq!(
            unset.generalized_velocity(VelocityRepresentation::Mixed),
            Err(EvaluatorError::StateNotSet)
        );
    }

    /// State advanced by `dt` along its own rates.
    fn advanced(state: &RobotState, dt: f64) -> RobotState {
        let mut next = state.clone();
        next.base_position += state.base_linear_velocity * dt;
        next.base_quaternion += state.base_quaternion_velocity * dt;
        next.joint_positions += &state.joint_velocities * dt;
        next
    }

    #[test]
    fn base_frame_follows_state() {
        let kin = evaluator();
        let base = kin.frame_index("torso").unwrap();
        let pose = kin.world_transform(base).unwrap();
        assert_relative_eq!(pose.translation.vector, state().base_position, epsilon = 1e-12);
        assert_relative_eq!(
            rotation_of(&pose),
            state().base_rotation(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn queries_before_update_fail() {
        let kin = FloatingBaseKinematics::with_model(&arm()).unwrap();
        assert_eq!(kin.world_transform(0).unwrap_err(), EvaluatorError::StateNotSet);
        let empty = FloatingBaseKinematics::new();
        assert!(!empty.is_valid());
        assert_eq!(empty.dofs(), 0);
        assert_eq!(empty.frame_index("torso").unwrap_err(), EvaluatorError::ModelNotLoaded);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut kin = FloatingBaseKinematics::with_model(&arm()).unwrap();
        let err = kin.update_state(&RobotState::zeros(2)).unwrap_err();
        assert_eq!(err, EvaluatorError::DimensionMismatch { expected: 3, got: 2 });
        assert!(kin.current_state().is_none());
    }

    #[test]
    fn far_from_unit_quaternion_rejected() {
        let mut kin = FloatingBaseKinematics::with_model(&arm()).unwrap();
        let mut bad = state();
        bad.base_quaternion *= 1.5;
        assert!(matches!(
            kin.update_state(&bad),
            Err(EvaluatorError::NonUnitQuaternion(_))
        ));
        bad.base_quaternion = state().base_quaternion * 1.001;
        assert!(kin.update_state(&bad).is_ok());
    }

    #[test]
    fn unknown_frame_index_rejected() {
        let kin = evaluator();
        assert_eq!(
            kin.world_transform(99).unwrap_err(),
            EvaluatorError::FrameIndexOutOfRange(99)
        );
        assert!(matches!(
            kin.frame_index("nope"),
            Err(EvaluatorError::UnknownFrame(_))
        ));
    }

    #[test]
    fn mixed_velocity_matches_position_finite_differences() {
        let kin = evaluator();
        let tool = kin.frame_index("tool").unwrap();
        let dt = 1e-6;
        let mut ahead = kin.clone();
        ahead.update_state(&advanced(&state(), dt)).unwrap();
        let mut behind = kin.clone();
        behind.update_state(&advanced(&state(), -dt)).unwrap();
        let fd = (ahead.world_transform(tool).unwrap().translation.vector
            - behind.world_transform(tool).unwrap().translation.vector)
            / (2.0 * dt);
        let twist = kin.frame_velocity(tool, VelocityRepresentation::Mixed).unwrap();
        assert_relative_eq!(twist.fixed_rows::<3>(0).into_owned(), fd, epsilon = 1e-6);
    }

    #[test]
    fn body_velocity_is_rotated_mixed_velocity() {
        let kin = evaluator();
        let tool = kin.frame_index("tool").unwrap();
        let r_t = rotation_of(&kin.world_transform(tool).unwrap()).transpose();
        let mixed = kin.frame_velocity(tool, VelocityRepresentation::Mixed).unwrap();
        let body = kin.frame_velocity(tool, VelocityRepresentation::Body).unwrap();
        assert_relative_eq!(
            body.fixed_rows::<3>(0).into_owned(),
            r_t * mixed.fixed_rows::<3>(0),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            body.fixed_rows::<3>(3).into_owned(),
            r_t * mixed.fixed_rows::<3>(3),
            epsilon = 1e-12
        );
    }

    #[test]
    fn jacobian_times_velocity_matches_frame_velocity_in_every_representation() {
        let kin = evaluator();
        let tool = kin.frame_index("tool").unwrap();
        for repr in [
            VelocityRepresentation::Mixed,
            VelocityRepresentation::Body,
            VelocityRepresentation::Inertial,
        ] {
            let jacobian = kin.frame_jacobian(tool, repr).unwrap();
            let nu = kin.generalized_velocity(repr).unwrap();
            let twist = kin.frame_velocity(tool, repr).unwrap();
            let product = jacobian * nu;
            for i in 0..6 {
                assert_relative_eq!(product[i], twist[i], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn relative_jacobian_matches_relative_position_derivative() {
        let kin = evaluator();
        let a = kin.frame_index("upper").unwrap();
        let b = kin.frame_index("tool").unwrap();
        let jacobian = kin.relative_jacobian(a, b).unwrap();
        let rel = kin.relative_transform(a, b).unwrap();
        let r_rel = rotation_of(&rel);
        let eps = 1e-6;
        for dof in 0..3 {
            let mut plus = state();
            let mut minus = state();
            plus.joint_positions[dof] += eps;
            minus.joint_positions[dof] -= eps;
            let mut kp = kin.clone();
            kp.update_state(&plus).unwrap();
            let mut km = kin.clone();
            km.update_state(&minus).unwrap();
            let fd = (kp.relative_transform(a, b).unwrap().translation.vector
                - km.relative_transform(a, b).unwrap().translation.vector)
                / (2.0 * eps);
            let column = Vector3::new(jacobian[(0, dof)], jacobian[(1, dof)], jacobian[(2, dof)]);
            assert_relative_eq!(r_rel * column, fd, epsilon = 1e-6);
        }
        // The shoulder is not between `upper` and `tool`
        assert_relative_eq!(jacobian.column(0).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn relative_jacobian_is_antisymmetric_in_angular_part() {
        let kin = evaluator();
        let a = kin.frame_index("torso").unwrap();
        let b = kin.frame_index("lower").unwrap();
        let ab = kin.relative_jacobian(a, b).unwrap();
        let ba = kin.relative_jacobian(b, a).unwrap();
        let r_ab = rotation_of(&kin.relative_transform(a, b).unwrap());
        // omega_ab (in b) = -R_ab^T omega_ba (in a)
        let lhs = ab.fixed_rows::<3>(3).into_owned();
        let rhs = -(r_ab.transpose() * ba.rows(3, 3));
        assert_relative_eq!(lhs, rhs, epsilon = 1e-12);
    }

    #[test]
    fn com_jacobian_matches_finite_differences() {
        let kin = evaluator();
        let jacobian = kin.com_jacobian(VelocityRepresentation::Mixed).unwrap();
        let eps = 1e-6;
        for dof in 0..3 {
            let mut plus = state();
            let mut minus = state();
            plus.joint_positions[dof] += eps;
            minus.joint_positions[dof] -= eps;
            let mut kp = kin.clone();
            kp.update_state(&plus).unwrap();
            let mut km = kin.clone();
            km.update_state(&minus).unwrap();
            let fd = (kp.com_position().unwrap() - km.com_position().unwrap()) / (2.0 * eps);
            for r in 0..3 {
                assert_relative_eq!(jacobian[(r, 6 + dof)], fd[r], epsilon = 1e-6);
            }
        }
        let base_linear = jacobian.columns(0, 3).into_owned();
        assert_relative_eq!(base_linear, DMatrix::identity(3, 3), epsilon = 1e-12);
    }

    #[test]
    fn linear_momentum_is_mass_times_com_velocity() {
        let kin = evaluator();
        let h = kin.momentum(VelocityRepresentation::Mixed).unwrap();
        let com_velocity = kin.com_jacobian(VelocityRepresentation::Mixed).unwrap() * &kin.velocity;
        let mass = arm().total_mass();
        for i in 0..3 {
            assert_relative_eq!(h[i], mass * com_velocity[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn body_momentum_is_rotated_mixed_momentum() {
        let kin = evaluator();
        let mixed = kin.momentum(VelocityRepresentation::Mixed).unwrap();
        let body = kin.momentum(VelocityRepresentation::Body).unwrap();
        let r_t = state().base_rotation().transpose();
        assert_relative_eq!(
            body.fixed_rows::<3>(3).into_owned(),
            r_t * mixed.fixed_rows::<3>(3),
            epsilon = 1e-10
        );
        let jacobian = kin.momentum_jacobian(VelocityRepresentation::Body).unwrap();
        let nu = kin.generalized_velocity(VelocityRepresentation::Body).unwrap();
        let product = jacobian * nu;
        for i in 0..6 {
            assert_relative_eq!(product[i], body[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn inertial_momentum_is_unsupported() {
        let kin = evaluator();
        let err = kin.momentum_jacobian(VelocityRepresentation::Inertial).unwrap_err();
        assert_eq!(
            err,
            EvaluatorError::UnsupportedRepresentation {
                quantity: "momentum jacobian",
                representation: "inertial"
            }
        );
        assert!(kin.mass_matrix(VelocityRepresentation::Inertial).is_err());
        assert!(kin.momentum(VelocityRepresentation::Inertial).is_err());
    }

    #[test]
    fn mass_matrix_is_symmetric_with_total_mass_block() {
        let kin = evaluator();
        for repr in [VelocityRepresentation::Mixed, VelocityRepresentation::Body] {
            let m = kin.mass_matrix(repr).unwrap();
            assert_relative_eq!(m.clone(), m.transpose(), epsilon = 1e-10);
            let linear = m.view((0, 0), (3, 3)).into_owned();
            assert_relative_eq!(linear, DMatrix::identity(3, 3) * arm().total_mass(), epsilon = 1e-10);
        }
    }

    #[test]
    fn kinetic_energy_agrees_across_representations() {
        let kin = evaluator();
        let energy = |repr| {
            let m = kin.mass_matrix(repr).unwrap();
            let nu = kin.generalized_velocity(repr).unwrap();
            (nu.transpose() * m * nu)[(0, 0)]
        };
        assert_relative_eq!(
            energy(VelocityRepresentation::Mixed),
            energy(VelocityRepresentation::Body),
            epsilon = 1e-10
        );
    }

    #[test]
    fn supported_body_balances_gravity() {
        let model = RobotModel::builder(
            "block",
            Inertial::cuboid(2.0, Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.2, 0.2, 0.2)),
        )
        .frame("support", "block", Isometry3::translation(0.1, 0.0, 0.0))
        .build()
        .unwrap();
        let mut kin = FloatingBaseKinematics::with_model(&model).unwrap();
        kin.update_state(&RobotState::zeros(0)).unwrap();
        let support = kin.frame_index("support").unwrap();

        let free = kin.static_torques(&[]).unwrap();
        assert_relative_eq!(free[2], 2.0 * 9.81, epsilon = 1e-12);

        let push = ExternalWrench {
            frame: support,
            wrench: Vector6::new(0.0, 0.0, 2.0 * 9.81, 0.0, 0.0, 0.0),
        };
        let balanced = kin.static_torques(&[push]).unwrap();
        assert_relative_eq!(balanced.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn from_config_applies_gravity_and_tolerance() {
        let config = PlannerConfig {
            gravity: [0.0, 0.0, -1.62],
            ..PlannerConfig::default()
        };
        let mut kin = FloatingBaseKinematics::from_config(&arm(), &config).unwrap();
        assert_relative_eq!(kin.gravity().z, -1.62);
        let mut skewed = state();
        skewed.base_quaternion *= 1.05;
        assert!(matches!(
            kin.update_state(&skewed),
            Err(EvaluatorError::NonUnitQuaternion(_))
        ));
    }

    #[test]
    fn boxed_clone_is_independent() {
        let kin = evaluator();
        let mut copy = kin.boxed_clone();
        let mut moved = state();
        moved.base_position.x += 1.0;
        copy.update_state(&moved).unwrap();
        assert!(kin.same_state(&state(), 1e-12));
        assert!(!copy.same_state(&state(), 1e-12));
    }
}
