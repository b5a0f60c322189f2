//! Structural operations expressed as gathers, and the quaternion and
//! rigid-transform expressions built from them.

use nalgebra::DMatrix;

use dynplan_core::ExpressionError;

use crate::graph::{ExpressionGraph, NodeId, Tap};

/// Incremental description of a gather node.
#[derive(Debug, Clone)]
pub struct GatherBuilder {
    operands: Vec<NodeId>,
    rows: usize,
    cols: usize,
    entries: Vec<Option<Tap>>,
}

impl GatherBuilder {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            operands: Vec::new(),
            rows,
            cols,
            entries: vec![None; rows * cols],
        }
    }

    /// Slot of `id` among the operands, adding it if needed.
    pub fn operand(&mut self, id: NodeId) -> usize {
        if let Some(slot) = self.operands.iter().position(|o| *o == id) {
            slot
        } else {
            self.operands.push(id);
            self.operands.len() - 1
        }
    }

    /// Output entry `(row, col)` becomes `coeff * vec(operand)[index]`.
    pub fn set(&mut self, row: usize, col: usize, operand: usize, index: usize, coeff: f64) {
        if row < self.rows && col < self.cols {
            self.entries[row + self.rows * col] = Some(Tap {
                operand,
                index,
                coeff,
            });
        }
    }

    pub fn build(self, graph: &mut ExpressionGraph) -> Result<NodeId, ExpressionError> {
        graph.gather(self.operands, self.rows, self.cols, self.entries)
    }
}

/// Component and sign of `skew(v)[(row, col)]`.
const fn skew_tap(row: usize, col: usize) -> Option<(usize, f64)> {
    match (row, col) {
        (0, 1) => Some((2, -1.0)),
        (0, 2) => Some((1, 1.0)),
        (1, 0) => Some((2, 1.0)),
        (1, 2) => Some((0, -1.0)),
        (2, 0) => Some((1, -1.0)),
        (2, 1) => Some((0, 1.0)),
        _ => None,
    }
}

impl ExpressionGraph {
    fn expect_shape(
        &self,
        op: &'static str,
        id: NodeId,
        shape: (usize, usize),
    ) -> Result<(), ExpressionError> {
        let actual = self.shape(id)?;
        if actual == shape {
            Ok(())
        } else {
            Err(ExpressionError::ShapeMismatch {
                op,
                left: actual,
                right: shape,
            })
        }
    }

    pub fn transpose(&mut self, a: NodeId) -> Result<NodeId, ExpressionError> {
        let (r, c) = self.shape(a)?;
        let mut g = GatherBuilder::new(c, r);
        let slot = g.operand(a);
        for j in 0..c {
            for i in 0..r {
                g.set(j, i, slot, i + r * j, 1.0);
            }
        }
        g.build(self)
    }

    /// `rows x cols` sub-block starting at `(row, col)`.
    pub fn block(
        &mut self,
        a: NodeId,
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    ) -> Result<NodeId, ExpressionError> {
        let (r, c) = self.shape(a)?;
        if row + rows > r {
            return Err(ExpressionError::IndexOutOfRange {
                op: "block rows",
                index: row + rows,
                bound: r,
            });
        }
        if col + cols > c {
            return Err(ExpressionError::IndexOutOfRange {
                op: "block cols",
                index: col + cols,
                bound: c,
            });
        }
        let mut g = GatherBuilder::new(rows, cols);
        let slot = g.operand(a);
        for j in 0..cols {
            for i in 0..rows {
                g.set(i, j, slot, (row + i) + r * (col + j), 1.0);
            }
        }
        g.build(self)
    }

    pub fn column(&mut self, a: NodeId, col: usize) -> Result<NodeId, ExpressionError> {
        let (r, _) = self.shape(a)?;
        self.block(a, 0, col, r, 1)
    }

    /// Column-major vectorization `vec(a)`.
    pub fn vectorize(&mut self, a: NodeId) -> Result<NodeId, ExpressionError> {
        let (r, c) = self.shape(a)?;
        let mut g = GatherBuilder::new(r * c, 1);
        let slot = g.operand(a);
        for k in 0..r * c {
            g.set(k, 0, slot, k, 1.0);
        }
        g.build(self)
    }

    /// Cross-product matrix of a `3x1` node.
    pub fn skew(&mut self, v: NodeId) -> Result<NodeId, ExpressionError> {
        self.expect_shape("skew", v, (3, 1))?;
        let mut g = GatherBuilder::new(3, 3);
        let slot = g.operand(v);
        for col in 0..3 {
            for row in 0..3 {
                if let Some((component, sign)) = skew_tap(row, col) {
                    g.set(row, col, slot, component, sign);
                }
            }
        }
        g.build(self)
    }

    /// Assemble a block matrix. Every block row and block column must hold
    /// at least one node to fix its size; `None` blocks are zero.
    pub fn blocks(&mut self, grid: &[Vec<Option<NodeId>>]) -> Result<NodeId, ExpressionError> {
        let block_cols = grid.first().map_or(0, Vec::len);
        let mut heights = vec![None; grid.len()];
        let mut widths = vec![None; block_cols];
        for (bi, row) in grid.iter().enumerate() {
            if row.len() != block_cols {
                return Err(ExpressionError::ShapeMismatch {
                    op: "blocks",
                    left: (bi, row.len()),
                    right: (bi, block_cols),
                });
            }
            for (bj, cell) in row.iter().enumerate() {
                let Some(id) = cell else { continue };
                let (h, w) = self.shape(*id)?;
                for (slot, size) in [(&mut heights[bi], h), (&mut widths[bj], w)] {
                    match slot {
                        Some(existing) if *existing != size => {
                            return Err(ExpressionError::ShapeMismatch {
                                op: "blocks",
                                left: (bi, bj),
                                right: (*existing, size),
                            });
                        }
                        _ => *slot = Some(size),
                    }
                }
            }
        }
        let heights = heights
            .into_iter()
            .enumerate()
            .map(|(i, h)| {
                h.ok_or(ExpressionError::IndexOutOfRange {
                    op: "blocks: empty block row",
                    index: i,
                    bound: grid.len(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let widths = widths
            .into_iter()
            .enumerate()
            .map(|(j, w)| {
                w.ok_or(ExpressionError::IndexOutOfRange {
                    op: "blocks: empty block column",
                    index: j,
                    bound: block_cols,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut g = GatherBuilder::new(heights.iter().sum(), widths.iter().sum());
        let mut row_offset = 0;
        for (bi, row) in grid.iter().enumerate() {
            let mut col_offset = 0;
            for (bj, cell) in row.iter().enumerate() {
                if let Some(id) = cell {
                    let (h, w) = (heights[bi], widths[bj]);
                    let slot = g.operand(*id);
                    for c in 0..w {
                        for r in 0..h {
                            g.set(row_offset + r, col_offset + c, slot, r + h * c, 1.0);
                        }
                    }
                }
                col_offset += widths[bj];
            }
            row_offset += heights[bi];
        }
        g.build(self)
    }

    /// Stack nodes vertically.
    pub fn vcat(&mut self, parts: &[NodeId]) -> Result<NodeId, ExpressionError> {
        let grid: Vec<Vec<Option<NodeId>>> = parts.iter().map(|p| vec![Some(*p)]).collect();
        self.blocks(&grid)
    }

    /// Place nodes side by side.
    pub fn hcat(&mut self, parts: &[NodeId]) -> Result<NodeId, ExpressionError> {
        self.blocks(&[parts.iter().map(|p| Some(*p)).collect()])
    }

    /// `kron(b^T, I_r)` for a `k x c` node `b`: maps `vec(A)` to `vec(A b)`
    /// for any `r x k` matrix `A`.
    pub fn kron_transpose_identity(&mut self, b: NodeId, r: usize) -> Result<NodeId, ExpressionError> {
        let (k, c) = self.shape(b)?;
        let mut g = GatherBuilder::new(r * c, r * k);
        let slot = g.operand(b);
        for j in 0..c {
            for l in 0..k {
                for i in 0..r {
                    g.set(i + r * j, i + r * l, slot, l + k * j, 1.0);
                }
            }
        }
        g.build(self)
    }

    /// `kron(I_c, a)` for an `r x k` node `a`: maps `vec(B)` to `vec(a B)`
    /// for any `k x c` matrix `B`.
    pub fn kron_identity(&mut self, c: usize, a: NodeId) -> Result<NodeId, ExpressionError> {
        let (r, k) = self.shape(a)?;
        let mut g = GatherBuilder::new(r * c, k * c);
        let slot = g.operand(a);
        for j in 0..c {
            for l in 0..k {
                for i in 0..r {
                    g.set(i + r * j, l + k * j, slot, i + r * l, 1.0);
                }
            }
        }
        g.build(self)
    }

    /// `G(q) = 0.5 [-v^T; w I + skew(v)]`, the `4x3` map from body angular
    /// velocity to quaternion rate.
    pub fn quaternion_rate_map(&mut self, q: NodeId) -> Result<NodeId, ExpressionError> {
        self.expect_shape("quaternion rate map", q, (4, 1))?;
        let mut g = GatherBuilder::new(4, 3);
        let slot = g.operand(q);
        for col in 0..3 {
            g.set(0, col, slot, 1 + col, -0.5);
            for i in 0..3 {
                if i == col {
                    g.set(1 + i, col, slot, 0, 0.5);
                } else if let Some((component, sign)) = skew_tap(i, col) {
                    g.set(1 + i, col, slot, 1 + component, 0.5 * sign);
                }
            }
        }
        g.build(self)
    }

    /// `2 [-v, w I - skew(v)]`, the `3x4` left inverse of
    /// [`quaternion_rate_map`](Self::quaternion_rate_map) for unit `q`.
    pub fn quaternion_rate_map_inverse(&mut self, q: NodeId) -> Result<NodeId, ExpressionError> {
        self.expect_shape("quaternion rate map inverse", q, (4, 1))?;
        let mut g = GatherBuilder::new(3, 4);
        let slot = g.operand(q);
        for i in 0..3 {
            g.set(i, 0, slot, 1 + i, -2.0);
            for col in 0..3 {
                if i == col {
                    g.set(i, 1 + col, slot, 0, 2.0);
                } else if let Some((component, sign)) = skew_tap(i, col) {
                    g.set(i, 1 + col, slot, 1 + component, -2.0 * sign);
                }
            }
        }
        g.build(self)
    }

    /// `q / |q|`, written as `q * (q^T q)^(-1/2)` so that derivatives carry
    /// the normalization Jacobian.
    pub fn normalize(&mut self, q: NodeId) -> Result<NodeId, ExpressionError> {
        let (r, c) = self.shape(q)?;
        if c != 1 {
            return Err(ExpressionError::ShapeMismatch {
                op: "normalize",
                left: (r, c),
                right: (r, 1),
            });
        }
        let qt = self.transpose(q)?;
        let squared = self.product(qt, q)?;
        let inverse_norm = self.pow(squared, -0.5)?;
        self.scale(inverse_norm, q)
    }

    /// Rotation matrix `I + 2 w skew(v) + 2 skew(v)^2` of a unit quaternion node.
    pub fn rotation_from_quaternion(&mut self, q: NodeId) -> Result<NodeId, ExpressionError> {
        self.expect_shape("rotation from quaternion", q, (4, 1))?;
        let w = self.block(q, 0, 0, 1, 1)?;
        let v = self.block(q, 1, 0, 3, 1)?;
        let s = self.skew(v)?;
        let two = self.scalar(2.0);
        let identity = self.identity(3);
        let ws = self.scale(w, s)?;
        let first = self.scale(two, ws)?;
        let ss = self.product(s, s)?;
        let second = self.scale(two, ss)?;
        let partial = self.add(identity, first)?;
        self.add(partial, second)
    }

    /// `4x4` homogeneous transform `[R p; 0 1]`.
    pub fn homogeneous(&mut self, rotation: NodeId, position: NodeId) -> Result<NodeId, ExpressionError> {
        self.expect_shape("homogeneous rotation", rotation, (3, 3))?;
        self.expect_shape("homogeneous position", position, (3, 1))?;
        let one = self.scalar(1.0);
        self.blocks(&[
            vec![Some(rotation), Some(position)],
            vec![None, Some(one)],
        ])
    }

    /// Twist adjoint `[R skew(p) R; 0 R]`.
    pub fn adjoint(&mut self, rotation: NodeId, position: NodeId) -> Result<NodeId, ExpressionError> {
        let cross = self.skew(position)?;
        let coupling = self.product(cross, rotation)?;
        self.blocks(&[
            vec![Some(rotation), Some(coupling)],
            vec![None, Some(rotation)],
        ])
    }

    /// Wrench adjoint `[R 0; skew(p) R R]`.
    pub fn adjoint_wrench(
        &mut self,
        rotation: NodeId,
        position: NodeId,
    ) -> Result<NodeId, ExpressionError> {
        let cross = self.skew(position)?;
        let coupling = self.product(cross, rotation)?;
        self.blocks(&[
            vec![Some(rotation), None],
            vec![Some(coupling), Some(rotation)],
        ])
    }

    /// Constant node holding a column vector.
    pub fn constant_vector(&mut self, values: &[f64]) -> NodeId {
        self.constant(DMatrix::from_column_slice(values.len(), 1, values))
    }
}
