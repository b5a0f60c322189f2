// dynplan-core: Errors, config, robot state, vector schemas and quaternion helpers.

pub mod config;
pub mod error;
pub mod labeller;
pub mod quaternion;
pub mod state;

pub use config::{CacheConfig, PlannerConfig, TimeLookup};
pub use error::{
    CacheError, ConfigError, DynplanError, EvaluatorError, ExpressionError, SchemaError,
};
pub use labeller::{NamedRange, NamedVectorView};
pub use state::RobotState;
