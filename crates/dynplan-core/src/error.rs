use thiserror::Error;

/// Top-level error type for dynplan.
#[derive(Debug, Error)]
pub enum DynplanError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Evaluator error: {0}")]
    Evaluator(#[from] EvaluatorError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid tolerance for {field}: {value} (must be finite and >= 0)")]
    InvalidTolerance { field: &'static str, value: f64 },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Errors raised while building or using a [`NamedVectorView`](crate::NamedVectorView).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Label already registered: {0}")]
    DuplicateLabel(String),

    #[error("Unknown label: {0}")]
    UnknownLabel(String),

    #[error("Invalid range: offset={offset}, len={len}, total={total}")]
    InvalidRange {
        offset: usize,
        len: usize,
        total: usize,
    },

    #[error("Vector length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
}

/// Failures reported by a kinematics/dynamics evaluator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluatorError {
    #[error("No robot model loaded")]
    ModelNotLoaded,

    #[error("Invalid robot model: {0}")]
    InvalidModel(String),

    #[error("Unknown frame: {0}")]
    UnknownFrame(String),

    #[error("Frame index out of range: {0}")]
    FrameIndexOutOfRange(usize),

    #[error("Joint index out of range: {0}")]
    JointIndexOutOfRange(usize),

    #[error("State dimension mismatch: expected {expected} dofs, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Base quaternion is not close to unit norm (norm error {0:e})")]
    NonUnitQuaternion(f64),

    #[error("{quantity} is not available in {representation} representation")]
    UnsupportedRepresentation {
        quantity: &'static str,
        representation: &'static str,
    },

    #[error("Robot state has not been set")]
    StateNotSet,
}

/// Errors raised by [`StateCache`] and the time-indexed cache set.
///
/// [`StateCache`]: ../../dynplan_cache/struct.StateCache.html
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error("Cache read before the first state update")]
    Uninitialized,

    #[error("No cache configured for time {0}")]
    UnknownTimeSample(f64),

    #[error("Cache set needs at least one sample time")]
    EmptyTimings,

    #[error("Sample time {index} is not finite: {value}")]
    NonFiniteTime { index: usize, value: f64 },

    #[error("Sample times must be strictly increasing: t[{index}]={current} <= {previous}")]
    NonMonotonicTimes {
        index: usize,
        previous: f64,
        current: f64,
    },

    #[error("Invalid update tolerance: {0} (must be finite and >= 0)")]
    InvalidTolerance(f64),

    #[error("Evaluator failure: {0}")]
    Evaluator(#[from] EvaluatorError),
}

/// Errors raised by the expression graph and registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Variable already registered: {0}")]
    DuplicateVariable(String),

    #[error("Variable {0} is bound to the robot state and cannot be set directly")]
    StateBoundVariable(String),

    #[error("Unknown expression node: {0}")]
    UnknownNode(usize),

    #[error("No builder defined for expression {0}")]
    UnknownExpression(String),

    #[error("Cyclic expression construction detected at {0}")]
    Cycle(String),

    #[error("Shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("Value for variable {name} has length {got}, expected {expected}")]
    VariableLength {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Index out of range in {op}: {index} >= {bound}")]
    IndexOutOfRange {
        op: &'static str,
        index: usize,
        bound: usize,
    },

    #[error("No time sample selected; call update_robot_state or set_time first")]
    NoTimeSelected,

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Evaluator error: {0}")]
    Evaluator(#[from] EvaluatorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynplan_error_from_schema_error() {
        let err = SchemaError::DuplicateLabel("joints".into());
        let top: DynplanError = err.into();
        assert!(matches!(top, DynplanError::Schema(_)));
        assert!(top.to_string().contains("joints"));
    }

    #[test]
    fn dynplan_error_from_cache_error() {
        let err = CacheError::UnknownTimeSample(0.25);
        let top: DynplanError = err.into();
        assert!(matches!(top, DynplanError::Cache(_)));
        assert!(top.to_string().contains("0.25"));
    }

    #[test]
    fn cache_error_wraps_evaluator_error() {
        let err: CacheError = EvaluatorError::ModelNotLoaded.into();
        assert_eq!(err, CacheError::Evaluator(EvaluatorError::ModelNotLoaded));
    }

    #[test]
    fn evaluator_errors_carry_float_payloads() {
        let err = EvaluatorError::NonUnitQuaternion(0.2);
        assert_eq!(err.clone(), EvaluatorError::NonUnitQuaternion(0.2));
        assert_ne!(err, EvaluatorError::NonUnitQuaternion(0.3));
        let wrapped: ExpressionError = CacheError::from(err).into();
        assert_eq!(
            wrapped,
            ExpressionError::Cache(CacheError::Evaluator(EvaluatorError::NonUnitQuaternion(0.2)))
        );
    }

    #[test]
    fn expression_error_wraps_cache_error() {
        let err: ExpressionError = CacheError::Uninitialized.into();
        assert!(matches!(err, ExpressionError::Cache(CacheError::Uninitialized)));
    }

    #[test]
    fn config_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let config_err: ConfigError = io_err.into();
        assert!(matches!(config_err, ConfigError::Io(_)));
    }

    #[test]
    fn schema_error_display_messages() {
        assert_eq!(
            SchemaError::DuplicateLabel("q".into()).to_string(),
            "Label already registered: q"
        );
        assert_eq!(
            SchemaError::UnknownLabel("v".into()).to_string(),
            "Unknown label: v"
        );
        assert_eq!(
            SchemaError::LengthMismatch {
                expected: 12,
                got: 10
            }
            .to_string(),
            "Vector length mismatch: expected 12, got 10"
        );
    }

    #[test]
    fn evaluator_error_display_messages() {
        assert_eq!(
            EvaluatorError::UnsupportedRepresentation {
                quantity: "mass matrix",
                representation: "inertial"
            }
            .to_string(),
            "mass matrix is not available in inertial representation"
        );
        assert_eq!(
            EvaluatorError::DimensionMismatch {
                expected: 6,
                got: 4
            }
            .to_string(),
            "State dimension mismatch: expected 6 dofs, got 4"
        );
    }

    #[test]
    fn cache_error_display_messages() {
        assert_eq!(
            CacheError::Uninitialized.to_string(),
            "Cache read before the first state update"
        );
        assert_eq!(
            CacheError::NonMonotonicTimes {
                index: 2,
                previous: 1.0,
                current: 0.5
            }
            .to_string(),
            "Sample times must be strictly increasing: t[2]=0.5 <= 1"
        );
    }

    #[test]
    fn expression_error_display_messages() {
        assert_eq!(
            ExpressionError::Cycle("relative_position(a, b)".into()).to_string(),
            "Cyclic expression construction detected at relative_position(a, b)"
        );
        assert_eq!(
            ExpressionError::ShapeMismatch {
                op: "add",
                left: (3, 1),
                right: (4, 1)
            }
            .to_string(),
            "Shape mismatch in add: (3, 1) vs (4, 1)"
        );
    }
}
