//! Evaluate-if-changed wrapper around one evaluator instance.
//!
//! A [`StateCache`] owns a private deep copy of a [`KinDynEvaluator`] and the
//! last state pushed into it. [`StateCache::update`] only reaches the
//! evaluator when the incoming state differs from the stored one by at least
//! the tolerance in some component. Every evaluator invocation, successful or
//! not, advances [`StateCache::generation`], which is what downstream
//! memoization compares against.

use std::fmt;

use nalgebra::{DMatrix, DVector, Isometry3, Vector3, Vector6};
use tracing::{debug, trace, warn};

use dynplan_core::{CacheError, EvaluatorError, RobotState};
use dynplan_kinematics::{
    ExternalWrench, FrameIndex, KinDynEvaluator, RobotModel, VelocityRepresentation,
};

fn check_tolerance(tolerance: f64) -> Result<f64, CacheError> {
    if tolerance.is_finite() && tolerance >= 0.0 {
        Ok(tolerance)
    } else {
        Err(CacheError::InvalidTolerance(tolerance))
    }
}

/// Kinematics cache for a single state.
pub struct StateCache {
    evaluator: Box<dyn KinDynEvaluator>,
    tolerance: f64,
    state: Option<RobotState>,
    generation: u64,
}

impl fmt::Debug for StateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCache")
            .field("evaluator", &self.evaluator.name())
            .field("tolerance", &self.tolerance)
            .field("initialized", &self.state.is_some())
            .field("generation", &self.generation)
            .finish()
    }
}

impl Clone for StateCache {
    fn clone(&self) -> Self {
        Self {
            evaluator: self.evaluator.boxed_clone(),
            tolerance: self.tolerance,
            state: self.state.clone(),
            generation: self.generation,
        }
    }
}

impl StateCache {
    /// Cache over a private copy of `prototype`, which must have a model loaded.
    pub fn new(prototype: &dyn KinDynEvaluator, tolerance: f64) -> Result<Self, CacheError> {
        let tolerance = check_tolerance(tolerance)?;
        if !prototype.is_valid() {
            return Err(EvaluatorError::ModelNotLoaded.into());
        }
        Ok(Self {
            evaluator: prototype.boxed_clone(),
            tolerance,
            state: None,
            generation: 0,
        })
    }

    /// Push `state` into the cache.
    ///
    /// Returns `Ok(false)` when a state has already been evaluated and every
    /// component of `state` is strictly within the tolerance of it. Otherwise
    /// the evaluator is refreshed and `Ok(true)` is returned. If the
    /// evaluator fails, the cache becomes uninitialized.
    pub fn update(&mut self, state: &RobotState) -> Result<bool, CacheError> {
        if let Some(last) = &self.state {
            if last.same_as(state, self.tolerance) {
                trace!(generation = self.generation, "State unchanged, skipping evaluation");
                return Ok(false);
            }
        }

        self.generation += 1;
        if let Err(err) = self.evaluator.update_state(state) {
            self.state = None;
            warn!(generation = self.generation, error = %err, "Evaluator rejected state");
            return Err(err.into());
        }
        self.state = Some(state.clone());
        debug!(generation = self.generation, "Evaluated new state");
        Ok(true)
    }

    /// Number of evaluator invocations so far.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub const fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub const fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn set_tolerance(&mut self, tolerance: f64) -> Result<(), CacheError> {
        self.tolerance = check_tolerance(tolerance)?;
        Ok(())
    }

    /// The wrapped evaluator. Model queries are valid before the first update.
    pub fn evaluator(&self) -> &dyn KinDynEvaluator {
        self.evaluator.as_ref()
    }

    pub fn model(&self) -> Result<&RobotModel, CacheError> {
        Ok(self.evaluator.model()?)
    }

    pub fn dofs(&self) -> usize {
        self.evaluator.dofs()
    }

    pub fn frame_index(&self, name: &str) -> Result<FrameIndex, CacheError> {
        Ok(self.evaluator.frame_index(name)?)
    }

    fn ready(&self) -> Result<&dyn KinDynEvaluator, CacheError> {
        if self.state.is_some() {
            Ok(self.evaluator.as_ref())
        } else {
            Err(CacheError::Uninitialized)
        }
    }

    /// Last evaluated state.
    pub fn state(&self) -> Result<&RobotState, CacheError> {
        self.state.as_ref().ok_or(CacheError::Uninitialized)
    }

    pub fn world_transform(&self, frame: FrameIndex) -> Result<Isometry3<f64>, CacheError> {
        Ok(self.ready()?.world_transform(frame)?)
    }

    pub fn relative_transform(
        &self,
        base: FrameIndex,
        target: FrameIndex,
    ) -> Result<Isometry3<f64>, CacheError> {
        Ok(self.ready()?.relative_transform(base, target)?)
    }

    pub fn frame_jacobian(
        &self,
        frame: FrameIndex,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, CacheError> {
        Ok(self.ready()?.frame_jacobian(frame, representation)?)
    }

    pub fn relative_jacobian(
        &self,
        base: FrameIndex,
        target: FrameIndex,
    ) -> Result<DMatrix<f64>, CacheError> {
        Ok(self.ready()?.relative_jacobian(base, target)?)
    }

    pub fn frame_velocity(
        &self,
        frame: FrameIndex,
        representation: VelocityRepresentation,
    ) -> Result<Vector6<f64>, CacheError> {
        Ok(self.ready()?.frame_velocity(frame, representation)?)
    }

    pub fn com_position(&self) -> Result<Vector3<f64>, CacheError> {
        Ok(self.ready()?.com_position()?)
    }

    pub fn com_jacobian(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, CacheError> {
        Ok(self.ready()?.com_jacobian(representation)?)
    }

    pub fn momentum(&self, representation: VelocityRepresentation) -> Result<Vector6<f64>, CacheError> {
        Ok(self.ready()?.momentum(representation)?)
    }

    pub fn momentum_jacobian(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, CacheError> {
        Ok(self.ready()?.momentum_jacobian(representation)?)
    }

    pub fn mass_matrix(
        &self,
        representation: VelocityRepresentation,
    ) -> Result<DMatrix<f64>, CacheError> {
        Ok(self.ready()?.mass_matrix(representation)?)
    }

    pub fn static_torques(&self, external: &[ExternalWrench]) -> Result<DVector<f64>, CacheError> {
        Ok(self.ready()?.static_torques(external)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
