//! Symbolic differentiation of graph nodes.
//!
//! The derivative of an `r x c` node with respect to a variable of
//! dimension `d` is an `(r c) x d` node whose rows follow the column-major
//! vectorization of the node. Derivatives are ordinary graph nodes, so they
//! can be evaluated, shared and differentiated again.
//!
//! Kinematic leaves are differentiated through the relative Jacobian:
//!
//! - `d p_AB / ds = R_AB J_AB[0..3]`
//! - `d q_AB / ds = G(q_AB) J_AB[3..6]`
//! - `d J_AB / ds` is the derivative of the column-wise composition of
//!   `J_AB` from relative positions and rotations of the joint frames.

use nalgebra::DMatrix;
use tracing::{debug, trace};

use dynplan_core::ExpressionError;
use dynplan_core::quaternion::skew;
use dynplan_kinematics::{FrameIndex, JointKind};

use crate::graph::{NodeId, Op, StateField, Tap, VariableId};
use crate::key::ExpressionKey;
use crate::kinematic::Kinematic;
use crate::registry::ExpressionRegistry;

impl ExpressionRegistry {
    /// Derivative of `id` with respect to `variable`, built once and cached
    /// on the node.
    pub fn derivative(
        &mut self,
        id: NodeId,
        variable: VariableId,
    ) -> Result<NodeId, ExpressionError> {
        let (name, dim) = {
            let v = self.graph.variable(variable)?;
            (v.name.clone(), v.dim)
        };
        let node = self.graph.node(id)?;
        if let Some(&cached) = node.derivatives.get(&variable) {
            trace!(node = id.index(), variable = %name, "Derivative cache hit");
            return Ok(cached);
        }
        let (r, c) = node.shape();
        if !node.depends_on(variable) {
            let zero = self.graph.zero(r * c, dim);
            self.graph.node_mut(id)?.derivatives.insert(variable, zero);
            return Ok(zero);
        }
        if !self.deriving.insert((id, variable)) {
            return Err(ExpressionError::Cycle(format!(
                "derivative of node {} with respect to {name}",
                id.index()
            )));
        }
        let first_node = self.graph.len();
        let built = self.derive(id, variable, dim);
        self.deriving.remove(&(id, variable));
        let derived = built?;
        self.graph.node_mut(id)?.derivatives.insert(variable, derived);
        debug!(
            node = id.index(),
            variable = %name,
            derivative = derived.index(),
            added = self.graph.len() - first_node,
            "Built derivative"
        );
        Ok(derived)
    }

    /// Derivative of column `col` of `id`, an `r x d` node.
    pub fn column_derivative(
        &mut self,
        id: NodeId,
        col: usize,
        variable: VariableId,
    ) -> Result<NodeId, ExpressionError> {
        let column = if let Some(&column) = self.columns.get(&(id, col)) {
            column
        } else {
            let column = self.graph.column(id, col)?;
            self.columns.insert((id, col), column);
            column
        };
        self.derivative(column, variable)
    }

    fn depends(&self, id: NodeId, variable: VariableId) -> Result<bool, ExpressionError> {
        Ok(self.graph.node(id)?.depends_on(variable))
    }

    fn derive(
        &mut self,
        id: NodeId,
        variable: VariableId,
        dim: usize,
    ) -> Result<NodeId, ExpressionError> {
        let node = self.graph.node(id)?;
        let (r, c) = node.shape();
        let op = node.op().clone();
        match op {
            Op::Variable(v) if v == variable => Ok(self.graph.identity(dim)),
            Op::Variable(_) | Op::Constant | Op::Zero => Ok(self.graph.zero(r * c, dim)),
            Op::Add(a, b) => {
                let da = self.derivative(a, variable)?;
                let db = self.derivative(b, variable)?;
                self.graph.add(da, db)
            }
            Op::Sub(a, b) => {
                let da = self.derivative(a, variable)?;
                let db = self.derivative(b, variable)?;
                self.graph.sub(da, db)
            }
            Op::Neg(a) => {
                let da = self.derivative(a, variable)?;
                self.graph.neg(da)
            }
            Op::Product(a, b) => {
                // d vec(AB) = (B^T kron I) d vec(A) + (I kron A) d vec(B)
                let mut total = self.graph.zero(r * c, dim);
                if self.depends(a, variable)? {
                    let da = self.derivative(a, variable)?;
                    let lift = self.graph.kron_transpose_identity(b, r)?;
                    let term = self.graph.product(lift, da)?;
                    total = self.graph.add(total, term)?;
                }
                if self.depends(b, variable)? {
                    let db = self.derivative(b, variable)?;
                    let lift = self.graph.kron_identity(c, a)?;
                    let term = self.graph.product(lift, db)?;
                    total = self.graph.add(total, term)?;
                }
                Ok(total)
            }
            Op::Scale(s, a) => {
                let mut total = self.graph.zero(r * c, dim);
                if self.depends(s, variable)? {
                    let ds = self.derivative(s, variable)?;
                    let flat = self.graph.vectorize(a)?;
                    let term = self.graph.product(flat, ds)?;
                    total = self.graph.add(total, term)?;
                }
                if self.depends(a, variable)? {
                    let da = self.derivative(a, variable)?;
                    let term = self.graph.scale(s, da)?;
                    total = self.graph.add(total, term)?;
                }
                Ok(total)
            }
            Op::Pow(s, exponent) => {
                let ds = self.derivative(s, variable)?;
                let coefficient = self.graph.scalar(exponent);
                let lowered = self.graph.pow(s, exponent - 1.0)?;
                let factor = self.graph.scale(coefficient, lowered)?;
                self.graph.scale(factor, ds)
            }
            Op::Gather { operands, entries } => {
                self.derive_gather(&operands, &entries, r * c, variable, dim)
            }
            Op::Kinematic(quantity) => self.derive_kinematic(quantity, variable),
        }
    }

    /// Row `k` of the result, column `j`, reads entry `(index, j)` of the
    /// tapped operand's derivative.
    fn derive_gather(
        &mut self,
        operands: &[NodeId],
        entries: &[Option<Tap>],
        rows: usize,
        variable: VariableId,
        dim: usize,
    ) -> Result<NodeId, ExpressionError> {
        let mut derived = Vec::new();
        let mut slots = Vec::with_capacity(operands.len());
        for &operand in operands {
            if !self.depends(operand, variable)? {
                slots.push(None);
                continue;
            }
            let d = self.derivative(operand, variable)?;
            if self.graph.is_zero(d) {
                slots.push(None);
            } else {
                let (len, _) = self.graph.shape(d)?;
                slots.push(Some((derived.len(), len)));
                derived.push(d);
            }
        }

        let mut out = vec![None; rows * dim];
        for (k, entry) in entries.iter().enumerate() {
            let Some(tap) = entry else { continue };
            let Some((slot, len)) = slots[tap.operand] else {
                continue;
            };
            for j in 0..dim {
                out[k + rows * j] = Some(Tap {
                    operand: slot,
                    index: tap.index + len * j,
                    coeff: tap.coeff,
                });
            }
        }
        self.graph.gather(derived, rows, dim, out)
    }

    /// Kinematic leaves only depend on the joint positions.
    fn derive_kinematic(
        &mut self,
        quantity: Kinematic,
        variable: VariableId,
    ) -> Result<NodeId, ExpressionError> {
        let joints = self.state_variable(StateField::JointPositions);
        let n = self.dofs();
        let (base, target) = quantity.frames();
        if variable != joints {
            let (rows, cols) = quantity.shape(n);
            let dim = self.graph.variable(variable)?.dim;
            return Ok(self.graph.zero(rows * cols, dim));
        }
        let base_name = self.frame_name(base)?;
        let target_name = self.frame_name(target)?;
        match quantity {
            Kinematic::RelativePosition { .. } => {
                let rotation =
                    self.get(&ExpressionKey::relative_rotation(&base_name, &target_name))?;
                let jacobian =
                    self.get(&ExpressionKey::relative_jacobian(&base_name, &target_name))?;
                let linear = self.graph.block(jacobian, 0, 0, 3, n)?;
                self.graph.product(rotation, linear)
            }
            Kinematic::RelativeQuaternion { .. } => {
                let q = self.get(&ExpressionKey::relative_quaternion(&base_name, &target_name))?;
                let jacobian =
                    self.get(&ExpressionKey::relative_jacobian(&base_name, &target_name))?;
                let rate_map = self.graph.quaternion_rate_map(q)?;
                let angular = self.graph.block(jacobian, 3, 0, 3, n)?;
                self.graph.product(rate_map, angular)
            }
            Kinematic::RelativeJacobian { .. } => {
                let composed = self.relative_jacobian_expression(base, target)?;
                self.derivative(composed, variable)
            }
        }
    }

    /// The relative Jacobian of `target` with respect to `base`, with each
    /// joint column written in terms of the pose of `target` in the joint's
    /// child frame `c`:
    ///
    /// - revolute: `sign [R_cB^T (a x p_cB); R_cB^T a]`
    /// - prismatic: `sign [R_cB^T a; 0]`
    ///
    /// where `sign` is `-1` for joints on the base side of the path.
    pub fn relative_jacobian_expression(
        &mut self,
        base: FrameIndex,
        target: FrameIndex,
    ) -> Result<NodeId, ExpressionError> {
        let n = self.dofs();
        let target_name = self.frame_name(target)?;
        let (up, down) = self.caches().first().evaluator().joint_path(base, target)?;
        let motions = up
            .into_iter()
            .map(|m| (m, -1.0))
            .chain(down.into_iter().map(|m| (m, 1.0)));

        let mut columns: Vec<Option<NodeId>> = vec![None; n];
        for (motion, sign) in motions {
            let child = self.frame_name(motion.child_frame)?;
            let rotation = self.get(&ExpressionKey::relative_rotation(&child, &target_name))?;
            let axis = motion.axis * sign;
            let column = match motion.kind {
                JointKind::Prismatic => {
                    let g = &mut self.graph;
                    let rt = g.transpose(rotation)?;
                    let a = g.constant_vector(axis.as_slice());
                    let linear = g.product(rt, a)?;
                    let angular = g.zero(3, 1);
                    g.vcat(&[linear, angular])?
                }
                JointKind::Revolute | JointKind::Fixed => {
                    let position =
                        self.get(&ExpressionKey::relative_position(&child, &target_name))?;
                    let g = &mut self.graph;
                    let rt = g.transpose(rotation)?;
                    let a = g.constant_vector(axis.as_slice());
                    let cross = g.constant(DMatrix::from_column_slice(
                        3,
                        3,
                        skew(&axis).as_slice(),
                    ));
                    let lever = g.product(cross, position)?;
                    let linear = g.product(rt, lever)?;
                    let angular = g.product(rt, a)?;
                    g.vcat(&[linear, angular])?
                }
            };
            if let Some(slot) = columns.get_mut(motion.dof) {
                *slot = Some(column);
            }
        }

        let zero = self.graph.zero(6, 1);
        let parts: Vec<NodeId> = columns.into_iter().map(|c| c.unwrap_or(zero)).collect();
        self.graph.hcat(&parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use dynplan_cache::TimeIndexedCacheSet;
    use dynplan_core::{CacheConfig, RobotState};
    use dynplan_kinematics::FloatingBaseKinematics;
    use dynplan_test_utils::{arm_model, random_robot_state, seeded_rng};
    use nalgebra::{DVector, dmatrix};

    fn registry() -> (ExpressionRegistry, RobotState) {
        let prototype = FloatingBaseKinematics::with_model(&arm_model()).unwrap();
        let caches = TimeIndexedCacheSet::new(&prototype, &[0.0], &CacheConfig::default()).unwrap();
        let mut registry = ExpressionRegistry::new(caches).unwrap();
        let state = random_robot_state(&mut seeded_rng(21), 3);
        registry.update_robot_state(0.0, &state).unwrap();
        (registry, state)
    }

    #[test]
    fn product_rule_on_free_variables() {
        let (mut registry, _) = registry();
        let x = registry
            .add_variable_with_value("x", &DVector::from_vec(vec![1.0, 2.0]))
            .unwrap();
        let xn = registry.variable_node(x).unwrap();
        let g = registry.graph_mut();
        let a = g.constant(dmatrix![1.0, 0.0; 2.0, 3.0]);
        let ax = g.product(a, xn).unwrap();
        let xt = g.transpose(xn).unwrap();
        let quadratic = g.product(xt, ax).unwrap();

        let d = registry.derivative(quadratic, x).unwrap();
        assert_eq!(registry.graph().shape(d).unwrap(), (1, 2));
        let value = registry.evaluate(d).unwrap().clone();
        // d(x^T A x) = x^T (A + A^T)
        let expected = dmatrix![1.0, 2.0] * dmatrix![2.0, 2.0; 2.0, 6.0];
        assert_relative_eq!(value, expected, epsilon = 1e-12);
    }

    #[test]
    fn power_and_scale_rules() {
        let (mut registry, _) = registry();
        let x = registry
            .add_variable_with_value("x", &DVector::from_vec(vec![3.0]))
            .unwrap();
        let xn = registry.variable_node(x).unwrap();
        let g = registry.graph_mut();
        let cube = g.pow(xn, 3.0).unwrap();
        let v = g.constant(dmatrix![1.0; -2.0]);
        let scaled = g.scale(cube, v).unwrap();
        let d = registry.derivative(scaled, x).unwrap();
        let value = registry.evaluate(d).unwrap().clone();
        assert_relative_eq!(value, dmatrix![27.0; -54.0], epsilon = 1e-12);
    }

    #[test]
    fn derivatives_are_cached_per_variable() {
        let (mut registry, _) = registry();
        let position = registry
            .get(&ExpressionKey::relative_position("torso", "tool"))
            .unwrap();
        let joints = registry.state_variable(StateField::JointPositions);
        let first = registry.derivative(position, joints).unwrap();
        let size = registry.graph().len();
        assert_eq!(registry.derivative(position, joints).unwrap(), first);
        assert_eq!(registry.graph().len(), size);
        assert_eq!(registry.graph().node(position).unwrap().cached_derivatives(), 1);

        registry.clear_derivative_cache(position).unwrap();
        assert_eq!(registry.graph().node(position).unwrap().cached_derivatives(), 0);
        // Rebuilding appends new nodes; the old derivative stays in the arena
        let rebuilt = registry.derivative(position, joints).unwrap();
        assert_ne!(rebuilt, first);
        assert!(registry.graph().len() > size);
        assert!(registry.graph().node(first).is_ok());
    }

    #[test]
    fn independent_variable_gives_zero_of_vectorized_shape() {
        let (mut registry, _) = registry();
        let rotation = registry
            .get(&ExpressionKey::relative_rotation("upper", "tool"))
            .unwrap();
        let velocity = registry.state_variable(StateField::BaseLinearVelocity);
        let d = registry.derivative(rotation, velocity).unwrap();
        assert!(registry.graph().is_zero(d));
        assert_eq!(registry.graph().shape(d).unwrap(), (9, 3));
    }

    #[test]
    fn composed_relative_jacobian_matches_the_evaluator() {
        let (mut registry, _) = registry();
        for (a, b) in [("torso", "tool"), ("tool", "upper"), ("lower", "wrist")] {
            let base = registry.caches().first().frame_index(a).unwrap();
            let target = registry.caches().first().frame_index(b).unwrap();
            let composed = registry.relative_jacobian_expression(base, target).unwrap();
            let composed = registry.evaluate(composed).unwrap().clone();
            let direct = registry
                .evaluate_key(&ExpressionKey::relative_jacobian(a, b))
                .unwrap()
                .clone();
            assert_relative_eq!(composed, direct, epsilon = 1e-12);
        }
    }

    #[test]
    fn column_derivative_is_the_matching_block() {
        let (mut registry, _) = registry();
        let jacobian = registry
            .get(&ExpressionKey::relative_jacobian("torso", "tool"))
            .unwrap();
        let joints = registry.state_variable(StateField::JointPositions);
        let full = registry.derivative(jacobian, joints).unwrap();
        let column = registry.column_derivative(jacobian, 1, joints).unwrap();
        assert_eq!(registry.column_derivative(jacobian, 1, joints).unwrap(), column);
        let full = registry.evaluate(full).unwrap().clone();
        let column = registry.evaluate(column).unwrap().clone();
        assert_eq!(column.shape(), (6, 3));
        assert_relative_eq!(column, full.rows(6, 6).into_owned(), epsilon = 1e-12);
    }
}
