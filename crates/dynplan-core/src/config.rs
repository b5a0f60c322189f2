use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

const fn default_update_tolerance() -> f64 {
    1e-15
}
const fn default_time_match_tolerance() -> f64 {
    1e-9
}
const fn default_quaternion_norm_tolerance() -> f64 {
    1e-2
}
const fn default_gravity() -> [f64; 3] {
    [0.0, 0.0, -9.81]
}
fn default_sample_times() -> Vec<f64> {
    vec![0.0]
}

// ---------------------------------------------------------------------------
// TimeLookup
// ---------------------------------------------------------------------------

/// How a query time is resolved to one of the configured sample times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeLookup {
    /// The query must match a sample time (within `time_match_tolerance`).
    #[default]
    Exact,
    /// The query resolves to the latest sample time not after it.
    NearestBelow,
}

// ---------------------------------------------------------------------------
// CacheConfig
// ---------------------------------------------------------------------------

/// Settings shared by every state cache of a problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Absolute per-component tolerance under which two states are the same.
    #[serde(default = "default_update_tolerance")]
    pub update_tolerance: f64,

    /// Time-to-sample resolution policy.
    #[serde(default)]
    pub time_lookup: TimeLookup,

    /// Slack used when comparing query times against sample times.
    #[serde(default = "default_time_match_tolerance")]
    pub time_match_tolerance: f64,

    /// Maximum accepted `| |q| - 1 |` for the raw base quaternion.
    #[serde(default = "default_quaternion_norm_tolerance")]
    pub quaternion_norm_tolerance: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            update_tolerance: default_update_tolerance(),
            time_lookup: TimeLookup::default(),
            time_match_tolerance: default_time_match_tolerance(),
            quaternion_norm_tolerance: default_quaternion_norm_tolerance(),
        }
    }
}

impl CacheConfig {
    /// Validate configuration. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_tolerance("update_tolerance", self.update_tolerance)?;
        check_tolerance("time_match_tolerance", self.time_match_tolerance)?;
        check_tolerance("quaternion_norm_tolerance", self.quaternion_norm_tolerance)?;
        Ok(())
    }
}

fn check_tolerance(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidTolerance { field, value })
    }
}

// ---------------------------------------------------------------------------
// PlannerConfig
// ---------------------------------------------------------------------------

/// Problem-level configuration: cache settings, knot times and gravity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Trajectory knot times, strictly increasing.
    #[serde(default = "default_sample_times")]
    pub sample_times: Vec<f64>,

    /// Gravity vector [x, y, z] in m/s^2.
    #[serde(default = "default_gravity")]
    pub gravity: [f64; 3],

    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            sample_times: default_sample_times(),
            gravity: default_gravity(),
            cache: CacheConfig::default(),
        }
    }
}

impl PlannerConfig {
    /// Validate configuration. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        if self.sample_times.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sample_times".into(),
                message: "at least one sample time is required".into(),
            });
        }
        for (i, pair) in self.sample_times.windows(2).enumerate() {
            if pair[1].partial_cmp(&pair[0]) != Some(std::cmp::Ordering::Greater) {
                return Err(ConfigError::InvalidValue {
                    field: "sample_times".into(),
                    message: format!("entry {} is not greater than entry {i}", i + 1),
                });
            }
        }
        if self.gravity.iter().any(|g| !g.is_finite()) {
            return Err(ConfigError::InvalidValue {
                field: "gravity".into(),
                message: "components must be finite".into(),
            });
        }
        Ok(())
    }

    /// Parse and validate from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cache_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.time_lookup, TimeLookup::Exact);
    }

    #[test]
    fn negative_tolerance_rejected() {
        let config = CacheConfig {
            update_tolerance: -1.0,
            ..CacheConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidTolerance {
                field: "update_tolerance",
                ..
            }
        ));
    }

    #[test]
    fn nan_tolerance_rejected() {
        let config = CacheConfig {
            time_match_tolerance: f64::NAN,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn planner_config_from_toml() {
        let text = r#"
            sample_times = [0.0, 0.1, 0.2]
            gravity = [0.0, 0.0, -9.8]

            [cache]
            update_tolerance = 1e-12
            time_lookup = "nearest_below"
        "#;
        let config = PlannerConfig::from_toml_str(text).unwrap();
        assert_eq!(config.sample_times.len(), 3);
        assert_eq!(config.cache.time_lookup, TimeLookup::NearestBelow);
        assert!((config.cache.update_tolerance - 1e-12).abs() < f64::EPSILON);
        // Unspecified fields fall back to defaults
        assert!((config.cache.quaternion_norm_tolerance - 1e-2).abs() < f64::EPSILON);
    }

    #[test]
    fn planner_config_rejects_unsorted_times() {
        let text = "sample_times = [0.0, 0.2, 0.1]";
        let err = PlannerConfig::from_toml_str(text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn planner_config_rejects_empty_times() {
        let text = "sample_times = []";
        assert!(PlannerConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn planner_config_bad_toml() {
        let err = PlannerConfig::from_toml_str("sample_times = [0.0,").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn planner_config_roundtrip_through_toml() {
        let config = PlannerConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = PlannerConfig::from_toml_str(&text).unwrap();
        assert_eq!(config, parsed);
    }
}
