// dynplan-kinematics: Floating-base robot models and kinematics/dynamics evaluators.

pub mod evaluator;
pub mod floating_base;
pub mod model;

pub use evaluator::{ExternalWrench, JointMotion, KinDynEvaluator, VelocityRepresentation};
pub use floating_base::FloatingBaseKinematics;
pub use model::{FrameIndex, Inertial, Joint, JointKind, Link, RobotModel, RobotModelBuilder};
