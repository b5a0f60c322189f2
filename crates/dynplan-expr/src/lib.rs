// dynplan-expr: Memoized, differentiable kinematic expressions keyed by frame and knot.

mod derivative;
pub mod graph;
pub mod key;
pub mod kinematic;
pub mod ops;
pub mod registry;

pub use graph::{
    Binding, EvalContext, ExpressionGraph, Node, NodeId, Op, Stamp, StateField, Tap, Variable,
    VariableId,
};
pub use key::{
    ExpressionKey, FramePairQuantity, FrameQuantity, FrameVariableQuantity, NamedQuantity,
};
pub use kinematic::Kinematic;
pub use ops::GatherBuilder;
pub use registry::{Builder, ExpressionRegistry};
