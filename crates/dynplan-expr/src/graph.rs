//! Arena of differentiable matrix expressions.
//!
//! Nodes live in a `Vec` and refer to each other through [`NodeId`]
//! handles, so derivative expressions can point back at the node they were
//! derived from without owning it. Every node carries its shape, the set of
//! leaf variables it depends on, its last value with the [`Stamp`] it was
//! computed under, and a cache of derivative nodes keyed by variable.
//!
//! Construction simplifies structural zeros: adding a zero returns the other
//! operand, and products, scalings and gathers of zeros are zero nodes.

use std::collections::{BTreeSet, HashMap};

use nalgebra::{DMatrix, DVector};

use dynplan_cache::StateCache;
use dynplan_core::ExpressionError;

use crate::kinematic::Kinematic;

/// Handle to a node of an [`ExpressionGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Handle to a leaf variable of an [`ExpressionGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub(crate) usize);

impl VariableId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Component of the robot state a variable is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateField {
    BasePosition,
    BaseQuaternion,
    JointPositions,
    BaseLinearVelocity,
    BaseQuaternionVelocity,
    JointVelocities,
}

impl StateField {
    pub const ALL: [Self; 6] = [
        Self::BasePosition,
        Self::BaseQuaternion,
        Self::JointPositions,
        Self::BaseLinearVelocity,
        Self::BaseQuaternionVelocity,
        Self::JointVelocities,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::BasePosition => "base_position",
            Self::BaseQuaternion => "base_quaternion",
            Self::JointPositions => "joint_positions",
            Self::BaseLinearVelocity => "base_linear_velocity",
            Self::BaseQuaternionVelocity => "base_quaternion_velocity",
            Self::JointVelocities => "joint_velocities",
        }
    }
}

/// Where a variable's value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Read from the current state cache.
    State(StateField),
    /// Set explicitly.
    Free(DVector<f64>),
}

/// A leaf variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub dim: usize,
    pub binding: Binding,
    /// Node whose value is this variable.
    pub node: NodeId,
}

/// `coeff * vec(operands[operand])[index]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tap {
    pub operand: usize,
    pub index: usize,
    pub coeff: f64,
}

/// Node operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Variable(VariableId),
    Constant,
    Zero,
    Add(NodeId, NodeId),
    Sub(NodeId, NodeId),
    Neg(NodeId),
    Product(NodeId, NodeId),
    /// `1x1` times a matrix.
    Scale(NodeId, NodeId),
    /// `1x1` raised to a constant power.
    Pow(NodeId, f64),
    /// Each output entry (column-major) is either zero or one signed entry of
    /// an operand.
    Gather {
        operands: Vec<NodeId>,
        entries: Vec<Option<Tap>>,
    },
    /// Value read from the state cache.
    Kinematic(Kinematic),
}

impl Op {
    /// Nodes this operation reads.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            Self::Variable(_) | Self::Constant | Self::Zero | Self::Kinematic(_) => Vec::new(),
            Self::Add(a, b) | Self::Sub(a, b) | Self::Product(a, b) | Self::Scale(a, b) => {
                vec![*a, *b]
            }
            Self::Neg(a) | Self::Pow(a, _) => vec![*a],
            Self::Gather { operands, .. } => operands.clone(),
        }
    }
}

/// Evaluation snapshot: knot, cache generation and free-variable epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub knot: usize,
    pub generation: u64,
    pub epoch: u64,
}

/// What an evaluation reads from.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub cache: &'a StateCache,
    pub stamp: Stamp,
}

/// Arena entry.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) op: Op,
    pub(crate) shape: (usize, usize),
    pub(crate) depends: BTreeSet<VariableId>,
    pub(crate) value: DMatrix<f64>,
    pub(crate) stamp: Option<Stamp>,
    pub(crate) derivatives: HashMap<VariableId, NodeId>,
}

impl Node {
    pub fn op(&self) -> &Op {
        &self.op
    }

    pub const fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn depends_on(&self, variable: VariableId) -> bool {
        self.depends.contains(&variable)
    }

    /// Number of cached derivatives.
    pub fn cached_derivatives(&self) -> usize {
        self.derivatives.len()
    }
}

/// Arena of expression nodes.
#[derive(Debug, Clone, Default)]
pub struct ExpressionGraph {
    nodes: Vec<Node>,
    variables: Vec<Variable>,
    evaluations: u64,
}

impl ExpressionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, ExpressionError> {
        self.nodes.get(id.0).ok_or(ExpressionError::UnknownNode(id.0))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, ExpressionError> {
        self.nodes
            .get_mut(id.0)
            .ok_or(ExpressionError::UnknownNode(id.0))
    }

    pub fn shape(&self, id: NodeId) -> Result<(usize, usize), ExpressionError> {
        Ok(self.node(id)?.shape)
    }

    /// Whether `id` is a structural zero.
    pub fn is_zero(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).is_some_and(|n| n.op == Op::Zero)
    }

    pub fn variable(&self, id: VariableId) -> Result<&Variable, ExpressionError> {
        self.variables
            .get(id.0)
            .ok_or_else(|| ExpressionError::UnknownVariable(format!("#{}", id.0)))
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn find_variable(&self, name: &str) -> Option<VariableId> {
        self.variables
            .iter()
            .position(|v| v.name == name)
            .map(VariableId)
    }

    /// Total number of node recomputations performed.
    pub const fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Forget every cached derivative. Returns how many entries were dropped.
    pub(crate) fn clear_all_derivatives(&mut self) -> usize {
        self.nodes
            .iter_mut()
            .map(|node| {
                let count = node.derivatives.len();
                node.derivatives.clear();
                count
            })
            .sum()
    }

    fn push(
        &mut self,
        op: Op,
        shape: (usize, usize),
        depends: BTreeSet<VariableId>,
        value: DMatrix<f64>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            op,
            shape,
            depends,
            value,
            stamp: None,
            derivatives: HashMap::new(),
        });
        id
    }

    fn union(&self, ids: &[NodeId]) -> BTreeSet<VariableId> {
        ids.iter()
            .filter_map(|id| self.nodes.get(id.0))
            .flat_map(|n| n.depends.iter().copied())
            .collect()
    }

    pub(crate) fn add_variable(
        &mut self,
        name: &str,
        dim: usize,
        binding: Binding,
    ) -> Result<VariableId, ExpressionError> {
        if self.find_variable(name).is_some() {
            return Err(ExpressionError::DuplicateVariable(name.to_owned()));
        }
        let initial = match &binding {
            Binding::Free(value) if value.len() != dim => {
                return Err(ExpressionError::VariableLength {
                    name: name.to_owned(),
                    expected: dim,
                    got: value.len(),
                });
            }
            Binding::Free(value) => DMatrix::from_column_slice(dim, 1, value.as_slice()),
            Binding::State(_) => DMatrix::zeros(dim, 1),
        };
        let var = VariableId(self.variables.len());
        let node = self.push(Op::Variable(var), (dim, 1), BTreeSet::from([var]), initial);
        self.variables.push(Variable {
            name: name.to_owned(),
            dim,
            binding,
            node,
        });
        Ok(var)
    }

    pub(crate) fn set_free_value(
        &mut self,
        var: VariableId,
        value: &DVector<f64>,
    ) -> Result<(), ExpressionError> {
        let variable = self
            .variables
            .get_mut(var.0)
            .ok_or_else(|| ExpressionError::UnknownVariable(format!("#{}", var.0)))?;
        if value.len() != variable.dim {
            return Err(ExpressionError::VariableLength {
                name: variable.name.clone(),
                expected: variable.dim,
                got: value.len(),
            });
        }
        match &mut variable.binding {
            Binding::Free(stored) => stored.copy_from(value),
            Binding::State(_) => {
                return Err(ExpressionError::StateBoundVariable(variable.name.clone()));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    pub fn constant(&mut self, value: DMatrix<f64>) -> NodeId {
        let shape = value.shape();
        self.push(Op::Constant, shape, BTreeSet::new(), value)
    }

    pub fn scalar(&mut self, value: f64) -> NodeId {
        self.constant(DMatrix::from_element(1, 1, value))
    }

    pub fn identity(&mut self, n: usize) -> NodeId {
        self.constant(DMatrix::identity(n, n))
    }

    pub fn zero(&mut self, rows: usize, cols: usize) -> NodeId {
        self.push(Op::Zero, (rows, cols), BTreeSet::new(), DMatrix::zeros(rows, cols))
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, ExpressionError> {
        let (sa, sb) = (self.shape(a)?, self.shape(b)?);
        if sa != sb {
            return Err(ExpressionError::ShapeMismatch {
                op: "add",
                left: sa,
                right: sb,
            });
        }
        if self.is_zero(a) {
            return Ok(b);
        }
        if self.is_zero(b) {
            return Ok(a);
        }
        let depends = self.union(&[a, b]);
        Ok(self.push(Op::Add(a, b), sa, depends, DMatrix::zeros(sa.0, sa.1)))
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, ExpressionError> {
        let (sa, sb) = (self.shape(a)?, self.shape(b)?);
        if sa != sb {
            return Err(ExpressionError::ShapeMismatch {
                op: "sub",
                left: sa,
                right: sb,
            });
        }
        if self.is_zero(b) {
            return Ok(a);
        }
        if self.is_zero(a) {
            return self.neg(b);
        }
        let depends = self.union(&[a, b]);
        Ok(self.push(Op::Sub(a, b), sa, depends, DMatrix::zeros(sa.0, sa.1)))
    }

    pub fn neg(&mut self, a: NodeId) -> Result<NodeId, ExpressionError> {
        let shape = self.shape(a)?;
        if self.is_zero(a) {
            return Ok(a);
        }
        let depends = self.union(&[a]);
        Ok(self.push(Op::Neg(a), shape, depends, DMatrix::zeros(shape.0, shape.1)))
    }

    /// Matrix product `a * b`.
    pub fn product(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, ExpressionError> {
        let (sa, sb) = (self.shape(a)?, self.shape(b)?);
        if sa.1 != sb.0 {
            return Err(ExpressionError::ShapeMismatch {
                op: "product",
                left: sa,
                right: sb,
            });
        }
        let shape = (sa.0, sb.1);
        if self.is_zero(a) || self.is_zero(b) {
            return Ok(self.zero(shape.0, shape.1));
        }
        let depends = self.union(&[a, b]);
        Ok(self.push(Op::Product(a, b), shape, depends, DMatrix::zeros(shape.0, shape.1)))
    }

    /// `s * a` for a `1x1` node `s`.
    pub fn scale(&mut self, s: NodeId, a: NodeId) -> Result<NodeId, ExpressionError> {
        let (ss, sa) = (self.shape(s)?, self.shape(a)?);
        if ss != (1, 1) {
            return Err(ExpressionError::ShapeMismatch {
                op: "scale",
                left: ss,
                right: (1, 1),
            });
        }
        if self.is_zero(s) || self.is_zero(a) {
            return Ok(self.zero(sa.0, sa.1));
        }
        let depends = self.union(&[s, a]);
        Ok(self.push(Op::Scale(s, a), sa, depends, DMatrix::zeros(sa.0, sa.1)))
    }

    /// `s^exponent` for a `1x1` node `s`.
    pub fn pow(&mut self, s: NodeId, exponent: f64) -> Result<NodeId, ExpressionError> {
        let shape = self.shape(s)?;
        if shape != (1, 1) {
            return Err(ExpressionError::ShapeMismatch {
                op: "pow",
                left: shape,
                right: (1, 1),
            });
        }
        let depends = self.union(&[s]);
        Ok(self.push(Op::Pow(s, exponent), shape, depends, DMatrix::zeros(1, 1)))
    }

    /// Signed selection of operand entries into a `rows x cols` node.
    pub fn gather(
        &mut self,
        operands: Vec<NodeId>,
        rows: usize,
        cols: usize,
        entries: Vec<Option<Tap>>,
    ) -> Result<NodeId, ExpressionError> {
        if entries.len() != rows * cols {
            return Err(ExpressionError::IndexOutOfRange {
                op: "gather",
                index: entries.len(),
                bound: rows * cols,
            });
        }
        let mut sizes = Vec::with_capacity(operands.len());
        for &id in &operands {
            let (r, c) = self.shape(id)?;
            sizes.push(r * c);
        }
        for tap in entries.iter().flatten() {
            let bound = *sizes.get(tap.operand).ok_or(ExpressionError::IndexOutOfRange {
                op: "gather operand",
                index: tap.operand,
                bound: sizes.len(),
            })?;
            if tap.index >= bound {
                return Err(ExpressionError::IndexOutOfRange {
                    op: "gather",
                    index: tap.index,
                    bound,
                });
            }
        }
        let live = entries
            .iter()
            .flatten()
            .any(|tap| tap.coeff != 0.0 && !self.is_zero(operands[tap.operand]));
        if !live {
            return Ok(self.zero(rows, cols));
        }
        let depends = self.union(&operands);
        Ok(self.push(
            Op::Gather { operands, entries },
            (rows, cols),
            depends,
            DMatrix::zeros(rows, cols),
        ))
    }

    pub(crate) fn kinematic(
        &mut self,
        quantity: Kinematic,
        shape: (usize, usize),
        depends: BTreeSet<VariableId>,
    ) -> NodeId {
        self.push(
            Op::Kinematic(quantity),
            shape,
            depends,
            DMatrix::zeros(shape.0, shape.1),
        )
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Value of `id` under `ctx`, recomputing only nodes whose stamp differs.
    pub fn evaluate(
        &mut self,
        id: NodeId,
        ctx: &EvalContext<'_>,
    ) -> Result<&DMatrix<f64>, ExpressionError> {
        self.refresh(id, ctx)?;
        Ok(&self.nodes[id.0].value)
    }

    /// Last computed value, without refreshing.
    pub fn cached_value(&self, id: NodeId) -> Option<&DMatrix<f64>> {
        self.nodes
            .get(id.0)
            .filter(|n| n.stamp.is_some() || matches!(n.op, Op::Constant | Op::Zero))
            .map(|n| &n.value)
    }

    fn refresh(&mut self, id: NodeId, ctx: &EvalContext<'_>) -> Result<(), ExpressionError> {
        let node = self.node(id)?;
        if node.stamp == Some(ctx.stamp) {
            return Ok(());
        }
        for operand in node.op.operands() {
            self.refresh(operand, ctx)?;
        }
        let value = self.compute(id, ctx)?;
        let node = &mut self.nodes[id.0];
        node.value = value;
        node.stamp = Some(ctx.stamp);
        self.evaluations += 1;
        Ok(())
    }

    fn compute(&self, id: NodeId, ctx: &EvalContext<'_>) -> Result<DMatrix<f64>, ExpressionError> {
        let node = &self.nodes[id.0];
        let value = |other: NodeId| &self.nodes[other.0].value;
        Ok(match &node.op {
            Op::Variable(var) => match &self.variables[var.0].binding {
                Binding::Free(stored) => DMatrix::from_column_slice(stored.len(), 1, stored.as_slice()),
                Binding::State(field) => state_value(ctx.cache, *field)?,
            },
            Op::Constant | Op::Zero => node.value.clone(),
            Op::Add(a, b) => value(*a) + value(*b),
            Op::Sub(a, b) => value(*a) - value(*b),
            Op::Neg(a) => -value(*a),
            Op::Product(a, b) => value(*a) * value(*b),
            Op::Scale(s, a) => value(*a) * value(*s)[(0, 0)],
            Op::Pow(s, exponent) => DMatrix::from_element(1, 1, value(*s)[(0, 0)].powf(*exponent)),
            Op::Gather { operands, entries } => {
                let mut out = DMatrix::zeros(node.shape.0, node.shape.1);
                for (k, entry) in entries.iter().enumerate() {
                    if let Some(tap) = entry {
                        out.as_mut_slice()[k] =
                            tap.coeff * value(operands[tap.operand]).as_slice()[tap.index];
                    }
                }
                out
            }
            Op::Kinematic(quantity) => quantity.compute(ctx.cache)?,
        })
    }
}

fn state_value(cache: &StateCache, field: StateField) -> Result<DMatrix<f64>, ExpressionError> {
    let state = cache.state()?;
    let column = |slice: &[f64]| DMatrix::from_column_slice(slice.len(), 1, slice);
    Ok(match field {
        StateField::BasePosition => column(state.base_position.as_slice()),
        StateField::BaseQuaternion => column(state.base_quaternion.as_slice()),
        StateField::JointPositions => column(state.joint_positions.as_slice()),
        StateField::BaseLinearVelocity => column(state.base_linear_velocity.as_slice()),
        StateField::BaseQuaternionVelocity => column(state.base_quaternion_velocity.as_slice()),
        StateField::JointVelocities => column(state.joint_velocities.as_slice()),
    })
}
