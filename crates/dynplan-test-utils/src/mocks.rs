//! Mock evaluators for testing.
//!
//! [`CountingEvaluator`] wraps the reference backend, counts how many state
//! updates reach it and can be switched into a failing mode. Clones share
//! the counter and the switch, so a test can observe every copy a cache set
//! makes of the prototype.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nalgebra::{DMatrix, DVector, Isometry3, Vector3, Vector6};

use dynplan_core::{EvaluatorError, RobotState};
use dynplan_kinematics::{
    ExternalWrench, FloatingBaseKinematics, FrameIndex, KinDynEvaluator, RobotModel,
    VelocityRepresentation,
};

// ---------------------------------------------------------------------------
// CountingEvaluator
// ---------------------------------------------------------------------------

/// Reference evaluator that counts `update_state` calls.
#[derive(Debug, Clone)]
pub struct CountingEvaluator {
    inner: FloatingBaseKinematics,
    updates: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl CountingEvaluator {
    /// Wrap a freshly loaded reference evaluator.
    pub fn new(model: &RobotModel) -> Result<Self, EvaluatorError> {
        Ok(Self {
            inner: FloatingBaseKinematics::with_model(model)?,
            updates: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Number of `update_state` calls across this evaluator and its clones.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Shared handle to the update counter.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.updates)
    }

    /// Shared switch: while set, every `update_state` fails.
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.failing)
    }
}

impl KinDynEvaluator for CountingEvaluator {
    fn boxed_clone(&self) -> Box<dyn KinDynEvaluator> {
        Box::new(self.clone())
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "counting"
    }

    fn load_model(&mut self, model: &RobotModel) -> Result<(), EvaluatorError> {
        self.inner.load_model(model)
    }

    fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    fn model(&self) -> Result<&RobotModel, EvaluatorError> {
        self.inner.model()
    }

    fn dofs(&self) -> usize {
        self.inner.dofs()
    }

    fn set_gravity(&mut self, gravity: Vector3<f64>) {
        self.inner.set_gravity(gravity);
    }

    fn gravity(&self) -> Vector3<f64> {
        self.inner.gravity()
    }

    fn update_state(&mut self, state: &RobotState) -> Result<(), EvaluatorError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EvaluatorError::InvalidModel("injected update failure".into()));
        }
        self.inner.update_state(state)
    }

    fn current_state(&self) -> Option<&RobotState> {
        self.inner.current_state()
    }

    fn world_transform(&self, frame: FrameIndex) -> Result<Isometry3<f64>, EvaluatorError> {
        self.inner.world_transform(frame)
    }

    fn frame_jacobian(
        &self,
        frame: FrameIndex,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError> {
        self.inner.frame_jacobian(frame, representation)
    }

    fn relative_jacobian(
        &self,
        base: FrameIndex,
        target: FrameIndex,
    ) -> Result<DMatrix<f64>, EvaluatorError> {
        self.inner.relative_jacobian(base, target)
    }

    fn frame_velocity(
        &self,
        frame: FrameIndex,
        representation: VelocityRepresentation,
    ) -> Result<Vector6<f64>, EvaluatorError> {
        self.inner.frame_velocity(frame, representation)
    }

    fn com_position(&self) -> Result<Vector3<f64>, EvaluatorError> {
        self.inner.com_position()
    }

    fn com_jacobian(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError> {
        self.inner.com_jacobian(representation)
    }

    fn momentum(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<Vector6<f64>, EvaluatorError> {
        self.inner.momentum(representation)
    }

    fn momentum_jacobian(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError> {
        self.inner.momentum_jacobian(representation)
    }

    fn mass_matrix(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, EvaluatorError> {
        self.inner.mass_matrix(representation)
    }

    fn static_torques(&self, external: &[ExternalWrench]) -> Result<DVector<f64>, EvaluatorError> {
        self.inner.static_torques(external)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::arm_model;

    #[test]
    fn clones_share_the_counter() {
        let evaluator = CountingEvaluator::new(&arm_model()).unwrap();
        let mut copy = evaluator.boxed_clone();
        copy.update_state(&RobotState::zeros(3)).unwrap();
        copy.update_state(&RobotState::zeros(3)).unwrap();
        assert_eq!(evaluator.updates(), 2);
        assert!(evaluator.current_state().is_none());
    }

    #[test]
    fn failure_switch_makes_updates_fail() {
        let mut evaluator = CountingEvaluator::new(&arm_model()).unwrap();
        evaluator.failure_switch().store(true, Ordering::SeqCst);
        assert!(evaluator.update_state(&RobotState::zeros(3)).is_err());
        evaluator.failure_switch().store(false, Ordering::SeqCst);
        assert!(evaluator.update_state(&RobotState::zeros(3)).is_ok());
        assert_eq!(evaluator.updates(), 2);
    }
}
