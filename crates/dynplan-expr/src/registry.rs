//! Keyed, build-once access to the expressions of a floating-base robot.
//!
//! The registry owns the graph and the per-knot caches. Every expression is
//! built the first time its [`ExpressionKey`] is requested and shared by all
//! later requests, so composite expressions reuse the same nodes. Values are
//! read from the cache of the selected knot.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Vector3};
use tracing::{debug, trace};

use dynplan_cache::TimeIndexedCacheSet;
use dynplan_core::{CacheError, EvaluatorError, ExpressionError, PlannerConfig, RobotState};
use dynplan_kinematics::{FrameIndex, KinDynEvaluator};

use crate::graph::{
    Binding, EvalContext, ExpressionGraph, NodeId, StateField, Stamp, VariableId,
};
use crate::key::{
    ExpressionKey, FramePairQuantity, FrameQuantity, FrameVariableQuantity, NamedQuantity,
};
use crate::kinematic::Kinematic;

/// User-defined expression builder. May request other keys.
pub type Builder =
    Arc<dyn Fn(&mut ExpressionRegistry) -> Result<NodeId, ExpressionError> + Send + Sync>;

/// Owner of the expression graph, the knot caches and the key table.
pub struct ExpressionRegistry {
    pub(crate) graph: ExpressionGraph,
    caches: TimeIndexedCacheSet,
    nodes: HashMap<ExpressionKey, NodeId>,
    building: HashSet<ExpressionKey>,
    pub(crate) deriving: HashSet<(NodeId, VariableId)>,
    pub(crate) columns: HashMap<(NodeId, usize), NodeId>,
    builders: HashMap<String, Builder>,
    state_variables: [VariableId; 6],
    current: Option<usize>,
    epoch: u64,
}

impl fmt::Debug for ExpressionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionRegistry")
            .field("nodes", &self.graph.len())
            .field("keys", &self.nodes.len())
            .field("knots", &self.caches.len())
            .field("current", &self.current)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl ExpressionRegistry {
    /// Registry over `caches`, with one variable per robot state component.
    pub fn new(caches: TimeIndexedCacheSet) -> Result<Self, ExpressionError> {
        let dofs = caches.first().dofs();
        let mut graph = ExpressionGraph::new();
        let mut state_variables = [VariableId(0); 6];
        for (slot, field) in state_variables.iter_mut().zip(StateField::ALL) {
            let dim = match field {
                StateField::BasePosition | StateField::BaseLinearVelocity => 3,
                StateField::BaseQuaternion | StateField::BaseQuaternionVelocity => 4,
                StateField::JointPositions | StateField::JointVelocities => dofs,
            };
            *slot = graph.add_variable(field.name(), dim, Binding::State(field))?;
        }
        debug!(dofs, knots = caches.len(), "Created expression registry");
        Ok(Self {
            graph,
            caches,
            nodes: HashMap::new(),
            building: HashSet::new(),
            deriving: HashSet::new(),
            columns: HashMap::new(),
            builders: HashMap::new(),
            state_variables,
            current: None,
            epoch: 0,
        })
    }

    /// Registry with one cache per sample time of `config`.
    pub fn from_config(
        prototype: &dyn KinDynEvaluator,
        config: &PlannerConfig,
    ) -> Result<Self, ExpressionError> {
        Self::new(TimeIndexedCacheSet::from_config(prototype, config)?)
    }

    pub fn dofs(&self) -> usize {
        self.caches.first().dofs()
    }

    pub const fn graph(&self) -> &ExpressionGraph {
        &self.graph
    }

    /// Mutable graph access for composing custom expressions.
    pub fn graph_mut(&mut self) -> &mut ExpressionGraph {
        &mut self.graph
    }

    pub const fn caches(&self) -> &TimeIndexedCacheSet {
        &self.caches
    }

    /// Direct cache access. Updates made here are seen by the next evaluation.
    pub fn caches_mut(&mut self) -> &mut TimeIndexedCacheSet {
        &mut self.caches
    }

    // -----------------------------------------------------------------------
    // Keys
    // -----------------------------------------------------------------------

    /// Node for `key`, built on first request.
    pub fn get(&mut self, key: &ExpressionKey) -> Result<NodeId, ExpressionError> {
        if let Some(&id) = self.nodes.get(key) {
            return Ok(id);
        }
        if !self.building.insert(key.clone()) {
            return Err(ExpressionError::Cycle(key.to_string()));
        }
        let first_node = self.graph.len();
        let built = self.build(key);
        self.building.remove(key);
        let id = built?;
        self.nodes.insert(key.clone(), id);
        debug!(
            key = %key,
            node = id.index(),
            added = self.graph.len() - first_node,
            "Built expression"
        );
        Ok(id)
    }

    pub fn contains(&self, key: &ExpressionKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Register a builder for `ExpressionKey::Custom(name)`. Replacing a
    /// builder does not affect a node that was already built.
    pub fn define<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&mut Self) -> Result<NodeId, ExpressionError> + Send + Sync + 'static,
    {
        self.builders.insert(name.to_owned(), Arc::new(builder));
    }

    fn build(&mut self, key: &ExpressionKey) -> Result<NodeId, ExpressionError> {
        match key {
            ExpressionKey::Named(quantity) => self.build_named(*quantity),
            ExpressionKey::FramePair { kind, base, target } => {
                self.build_pair(*kind, base, target)
            }
            ExpressionKey::Frame { kind, frame } => self.build_frame(*kind, frame),
            ExpressionKey::FrameVariable {
                kind,
                frame,
                variable,
            } => self.build_frame_variable(*kind, frame, *variable),
            ExpressionKey::Custom(name) => {
                let builder = self
                    .builders
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ExpressionError::UnknownExpression(key.to_string()))?;
                builder(self)
            }
        }
    }

    fn build_named(&mut self, quantity: NamedQuantity) -> Result<NodeId, ExpressionError> {
        match quantity {
            NamedQuantity::State(field) => self.state_node(field),
            NamedQuantity::NormalizedBaseQuaternion => {
                let raw = self.state_node(StateField::BaseQuaternion)?;
                self.graph.normalize(raw)
            }
            NamedQuantity::BaseRotation => {
                let q = self.get(&ExpressionKey::Named(NamedQuantity::NormalizedBaseQuaternion))?;
                self.graph.rotation_from_quaternion(q)
            }
            NamedQuantity::BaseTwist => {
                let rotation = self.get(&ExpressionKey::Named(NamedQuantity::BaseRotation))?;
                let q = self.get(&ExpressionKey::Named(NamedQuantity::NormalizedBaseQuaternion))?;
                let linear_velocity = self.state_node(StateField::BaseLinearVelocity)?;
                let quaternion_velocity = self.state_node(StateField::BaseQuaternionVelocity)?;
                let g = &mut self.graph;
                let rt = g.transpose(rotation)?;
                let linear = g.product(rt, linear_velocity)?;
                let inverse_map = g.quaternion_rate_map_inverse(q)?;
                let angular = g.product(inverse_map, quaternion_velocity)?;
                g.vcat(&[linear, angular])
            }
            NamedQuantity::ComInBase => self.build_com_in_base(),
            NamedQuantity::ComPosition => {
                let com = self.get(&ExpressionKey::Named(NamedQuantity::ComInBase))?;
                let rotation = self.get(&ExpressionKey::Named(NamedQuantity::BaseRotation))?;
                let position = self.state_node(StateField::BasePosition)?;
                let g = &mut self.graph;
                let rotated = g.product(rotation, com)?;
                g.add(position, rotated)
            }
            NamedQuantity::WorldToBase => {
                let rotation = self.get(&ExpressionKey::Named(NamedQuantity::BaseRotation))?;
                let position = self.state_node(StateField::BasePosition)?;
                self.graph.homogeneous(rotation, position)
            }
        }
    }

    /// `sum_i m_i / M (p_i + R_i c_i)` over the links, in base-link coordinates.
    fn build_com_in_base(&mut self) -> Result<NodeId, ExpressionError> {
        let base = self.base_frame_name()?;
        let model = self.caches.first().model()?;
        let total = model.total_mass();
        if total <= 0.0 {
            return Err(EvaluatorError::InvalidModel("total mass is zero".into()).into());
        }
        let links: Vec<(String, f64, Vector3<f64>)> = model
            .links()
            .iter()
            .filter(|link| link.inertial.mass > 0.0)
            .map(|link| (link.name.clone(), link.inertial.mass, link.inertial.com))
            .collect();

        let mut sum = self.graph.zero(3, 1);
        for (frame, mass, com) in links {
            let position = self.get(&ExpressionKey::relative_position(&base, &frame))?;
            let rotation = self.get(&ExpressionKey::relative_rotation(&base, &frame))?;
            let g = &mut self.graph;
            let offset = g.constant_vector(com.as_slice());
            let rotated = g.product(rotation, offset)?;
            let link_com = g.add(position, rotated)?;
            let weight = g.scalar(mass / total);
            let weighted = g.scale(weight, link_com)?;
            sum = g.add(sum, weighted)?;
        }
        Ok(sum)
    }

    fn build_pair(
        &mut self,
        kind: FramePairQuantity,
        base: &str,
        target: &str,
    ) -> Result<NodeId, ExpressionError> {
        let indices = (self.frame_index(base)?, self.frame_index(target)?);
        match kind {
            FramePairQuantity::RelativePosition => self.kinematic_node(Kinematic::RelativePosition {
                base: indices.0,
                target: indices.1,
            }),
            FramePairQuantity::RelativeQuaternion => {
                self.kinematic_node(Kinematic::RelativeQuaternion {
                    base: indices.0,
                    target: indices.1,
                })
            }
            FramePairQuantity::RelativeJacobian => self.kinematic_node(Kinematic::RelativeJacobian {
                base: indices.0,
                target: indices.1,
            }),
            FramePairQuantity::RelativeRotation => {
                let q = self.get(&ExpressionKey::relative_quaternion(base, target))?;
                self.graph.rotation_from_quaternion(q)
            }
            FramePairQuantity::RelativeTransform => {
                let (rotation, position) = self.rotation_and_position(base, target)?;
                self.graph.homogeneous(rotation, position)
            }
            FramePairQuantity::RelativeVelocity => {
                let jacobian = self.get(&ExpressionKey::relative_jacobian(base, target))?;
                let velocities = self.state_node(StateField::JointVelocities)?;
                self.graph.product(jacobian, velocities)
            }
            FramePairQuantity::AdjointTransform => {
                let (rotation, position) = self.rotation_and_position(base, target)?;
                self.graph.adjoint(rotation, position)
            }
            FramePairQuantity::AdjointTransformWrench => {
                let (rotation, position) = self.rotation_and_position(base, target)?;
                self.graph.adjoint_wrench(rotation, position)
            }
        }
    }

    fn rotation_and_position(
        &mut self,
        base: &str,
        target: &str,
    ) -> Result<(NodeId, NodeId), ExpressionError> {
        let rotation = self.get(&ExpressionKey::relative_rotation(base, target))?;
        let position = self.get(&ExpressionKey::relative_position(base, target))?;
        Ok((rotation, position))
    }

    fn build_frame(&mut self, kind: FrameQuantity, frame: &str) -> Result<NodeId, ExpressionError> {
        let base = self.base_frame_name()?;
        let base_rotation = self.get(&ExpressionKey::Named(NamedQuantity::BaseRotation))?;
        match kind {
            FrameQuantity::WorldPosition => {
                let relative = self.get(&ExpressionKey::relative_position(&base, frame))?;
                let base_position = self.state_node(StateField::BasePosition)?;
                let rotated = self.graph.product(base_rotation, relative)?;
                self.graph.add(base_position, rotated)
            }
            FrameQuantity::WorldRotation => {
                let relative = self.get(&ExpressionKey::relative_rotation(&base, frame))?;
                self.graph.product(base_rotation, relative)
            }
        }
    }

    fn build_frame_variable(
        &mut self,
        kind: FrameVariableQuantity,
        frame: &str,
        variable: VariableId,
    ) -> Result<NodeId, ExpressionError> {
        match kind {
            FrameVariableQuantity::RotationError => {
                let desired = self.graph.variable(variable)?;
                if desired.dim != 4 {
                    return Err(ExpressionError::VariableLength {
                        name: desired.name.clone(),
                        expected: 4,
                        got: desired.dim,
                    });
                }
                let desired = desired.node;
                let actual = self.get(&ExpressionKey::world_rotation(frame))?;
                let g = &mut self.graph;
                let unit = g.normalize(desired)?;
                let desired_rotation = g.rotation_from_quaternion(unit)?;
                let transposed = g.transpose(desired_rotation)?;
                g.product(transposed, actual)
            }
        }
    }

    fn kinematic_node(&mut self, quantity: Kinematic) -> Result<NodeId, ExpressionError> {
        let (base, target) = quantity.frames();
        let (up, down) = self.caches.first().evaluator().joint_path(base, target)?;
        let depends = if up.is_empty() && down.is_empty() {
            BTreeSet::new()
        } else {
            BTreeSet::from([self.state_variable(StateField::JointPositions)])
        };
        let shape = quantity.shape(self.dofs());
        Ok(self.graph.kinematic(quantity, shape, depends))
    }

    fn state_node(&self, field: StateField) -> Result<NodeId, ExpressionError> {
        Ok(self.graph.variable(self.state_variable(field))?.node)
    }

    fn frame_index(&self, name: &str) -> Result<FrameIndex, ExpressionError> {
        Ok(self.caches.first().frame_index(name)?)
    }

    pub(crate) fn frame_name(&self, frame: FrameIndex) -> Result<String, ExpressionError> {
        Ok(self.caches.first().evaluator().frame_name(frame)?.to_owned())
    }

    /// Name of the frame attached to the floating base link.
    pub fn base_frame_name(&self) -> Result<String, ExpressionError> {
        let model = self.caches.first().model()?;
        let base = &model.links()[model.base_link()];
        Ok(base.name.clone())
    }

    // -----------------------------------------------------------------------
    // Variables
    // -----------------------------------------------------------------------

    /// Free variable of dimension `dim`, initialized to zero.
    pub fn add_variable(&mut self, name: &str, dim: usize) -> Result<VariableId, ExpressionError> {
        self.add_variable_with_value(name, &DVector::zeros(dim))
    }

    pub fn add_variable_with_value(
        &mut self,
        name: &str,
        value: &DVector<f64>,
    ) -> Result<VariableId, ExpressionError> {
        let id = self
            .graph
            .add_variable(name, value.len(), Binding::Free(value.clone()))?;
        debug!(name, dim = value.len(), "Added free variable");
        Ok(id)
    }

    /// Set a free variable. Every node depending on it is recomputed on the
    /// next evaluation.
    pub fn set_variable(
        &mut self,
        variable: VariableId,
        value: &DVector<f64>,
    ) -> Result<(), ExpressionError> {
        self.graph.set_free_value(variable, value)?;
        self.epoch += 1;
        trace!(variable = variable.index(), epoch = self.epoch, "Set free variable");
        Ok(())
    }

    pub fn variable(&self, name: &str) -> Result<VariableId, ExpressionError> {
        self.graph
            .find_variable(name)
            .ok_or_else(|| ExpressionError::UnknownVariable(name.to_owned()))
    }

    /// Node holding the value of `variable`.
    pub fn variable_node(&self, variable: VariableId) -> Result<NodeId, ExpressionError> {
        Ok(self.graph.variable(variable)?.node)
    }

    pub fn state_variable(&self, field: StateField) -> VariableId {
        match field {
            StateField::BasePosition => self.state_variables[0],
            StateField::BaseQuaternion => self.state_variables[1],
            StateField::JointPositions => self.state_variables[2],
            StateField::BaseLinearVelocity => self.state_variables[3],
            StateField::BaseQuaternionVelocity => self.state_variables[4],
            StateField::JointVelocities => self.state_variables[5],
        }
    }

    /// Number of free-variable assignments so far.
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    // -----------------------------------------------------------------------
    // State and evaluation
    // -----------------------------------------------------------------------

    /// Select the knot of `time` and push `state` into its cache. Returns
    /// whether the evaluator was invoked.
    pub fn update_robot_state(
        &mut self,
        time: f64,
        state: &RobotState,
    ) -> Result<bool, ExpressionError> {
        let knot = self.caches.index_of(time)?;
        self.current = Some(knot);
        let cache = self
            .caches
            .by_index_mut(knot)
            .ok_or(CacheError::UnknownTimeSample(time))?;
        Ok(cache.update(state)?)
    }

    /// Select the knot of `time` without touching its cache.
    pub fn set_time(&mut self, time: f64) -> Result<(), ExpressionError> {
        self.current = Some(self.caches.index_of(time)?);
        Ok(())
    }

    pub const fn current_knot(&self) -> Option<usize> {
        self.current
    }

    /// Stamp the next evaluation runs under.
    pub fn stamp(&self) -> Result<Stamp, ExpressionError> {
        let knot = self.current.ok_or(ExpressionError::NoTimeSelected)?;
        let cache = self
            .caches
            .by_index(knot)
            .ok_or(ExpressionError::NoTimeSelected)?;
        Ok(Stamp {
            knot,
            generation: cache.generation(),
            epoch: self.epoch,
        })
    }

    /// Value of `id` at the selected knot.
    pub fn evaluate(&mut self, id: NodeId) -> Result<&DMatrix<f64>, ExpressionError> {
        let stamp = self.stamp()?;
        let cache = self
            .caches
            .by_index(stamp.knot)
            .ok_or(ExpressionError::NoTimeSelected)?;
        self.graph.evaluate(id, &EvalContext { cache, stamp })
    }

    /// Build `key` if needed and evaluate it.
    pub fn evaluate_key(&mut self, key: &ExpressionKey) -> Result<&DMatrix<f64>, ExpressionError> {
        let id = self.get(key)?;
        self.evaluate(id)
    }

    // -----------------------------------------------------------------------
    // Derivative caches
    // -----------------------------------------------------------------------

    /// Forget the derivatives cached on `id`.
    ///
    /// The graph only grows: nodes of the dropped derivatives stay in the
    /// arena, and the next `derivative` call builds a fresh sub-graph. Clear
    /// during setup, not inside an optimization loop.
    pub fn clear_derivative_cache(&mut self, id: NodeId) -> Result<(), ExpressionError> {
        let node = self.graph.node_mut(id)?;
        let dropped = node.derivatives.len();
        node.derivatives.clear();
        trace!(node = id.index(), dropped, "Cleared derivative cache");
        Ok(())
    }

    /// Forget every cached derivative. Dropped nodes are not reclaimed.
    pub fn clear_all_derivative_caches(&mut self) {
        let dropped = self.graph.clear_all_derivatives();
        self.deriving.clear();
        trace!(dropped, "Cleared all derivative caches");
    }
}

impl Drop for ExpressionRegistry {
    fn drop(&mut self) {
        self.clear_all_derivative_caches();
    }
}
