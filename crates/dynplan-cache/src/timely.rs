//! One [`StateCache`] per trajectory knot.

use tracing::debug;

use dynplan_core::{CacheConfig, CacheError, PlannerConfig, RobotState, TimeLookup};
use dynplan_kinematics::KinDynEvaluator;

use crate::state_cache::StateCache;

/// Ordered set of independent caches, addressed by sample time.
#[derive(Debug, Clone)]
pub struct TimeIndexedCacheSet {
    times: Vec<f64>,
    caches: Vec<StateCache>,
    policy: TimeLookup,
    time_tolerance: f64,
}

impl TimeIndexedCacheSet {
    /// One cache per entry of `times`, each with its own copy of `prototype`.
    ///
    /// `times` must be non-empty, finite and strictly increasing.
    pub fn new(
        prototype: &dyn KinDynEvaluator,
        times: &[f64],
        config: &CacheConfig,
    ) -> Result<Self, CacheError> {
        if times.is_empty() {
            return Err(CacheError::EmptyTimings);
        }
        for (index, &value) in times.iter().enumerate() {
            if !value.is_finite() {
                return Err(CacheError::NonFiniteTime { index, value });
            }
        }
        for (i, pair) in times.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(CacheError::NonMonotonicTimes {
                    index: i + 1,
                    previous: pair[0],
                    current: pair[1],
                });
            }
        }
        let time_tolerance = config.time_match_tolerance;
        if !(time_tolerance.is_finite() && time_tolerance >= 0.0) {
            return Err(CacheError::InvalidTolerance(time_tolerance));
        }

        let caches = times
            .iter()
            .map(|_| StateCache::new(prototype, config.update_tolerance))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            knots = times.len(),
            policy = ?config.time_lookup,
            evaluator = prototype.name(),
            "Created time-indexed cache set"
        );
        Ok(Self {
            times: times.to_vec(),
            caches,
            policy: config.time_lookup,
            time_tolerance,
        })
    }

    /// Cache set over the sample times and cache settings of a planner config.
    pub fn from_config(
        prototype: &dyn KinDynEvaluator,
        config: &PlannerConfig,
    ) -> Result<Self, CacheError> {
        Self::new(prototype, &config.sample_times, &config.cache)
    }

    /// Index of the knot that `time` resolves to under the lookup policy.
    pub fn index_of(&self, time: f64) -> Result<usize, CacheError> {
        if !time.is_finite() {
            return Err(CacheError::UnknownTimeSample(time));
        }
        let slack = self.time_tolerance;
        match self.policy {
            TimeLookup::Exact => {
                let i = self.times.partition_point(|t| *t < time - slack);
                match self.times.get(i) {
                    Some(t) if (t - time).abs() <= slack => Ok(i),
                    _ => Err(CacheError::UnknownTimeSample(time)),
                }
            }
            TimeLookup::NearestBelow => {
                let above = self.times.partition_point(|t| *t <= time + slack);
                above
                    .checked_sub(1)
                    .ok_or(CacheError::UnknownTimeSample(time))
            }
        }
    }

    pub fn get(&self, time: f64) -> Result<&StateCache, CacheError> {
        let i = self.index_of(time)?;
        Ok(&self.caches[i])
    }

    pub fn get_mut(&mut self, time: f64) -> Result<&mut StateCache, CacheError> {
        let i = self.index_of(time)?;
        Ok(&mut self.caches[i])
    }

    /// Push `state` into the cache for `time`.
    pub fn update(&mut self, time: f64, state: &RobotState) -> Result<bool, CacheError> {
        self.get_mut(time)?.update(state)
    }

    pub fn by_index(&self, index: usize) -> Option<&StateCache> {
        self.caches.get(index)
    }

    pub fn by_index_mut(&mut self, index: usize) -> Option<&mut StateCache> {
        self.caches.get_mut(index)
    }

    /// Cache of the earliest knot. Model queries give the same answer on
    /// every knot.
    pub fn first(&self) -> &StateCache {
        &self.caches[0]
    }

    /// Configured sample times.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    /// Always false: construction requires at least one sample.
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    pub const fn policy(&self) -> TimeLookup {
        self.policy
    }

    /// `(time, cache)` pairs in time order.
    pub fn iter(&self) -> impl Iterator<Item = (f64, &StateCache)> {
        self.times.iter().copied().zip(self.caches.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (f64, &mut StateCache)> {
        self.times.iter().copied().zip(self.caches.iter_mut())
    }

    /// Change the update tolerance of every cache.
    pub fn set_tolerance(&mut self, tolerance: f64) -> Result<(), CacheError> {
        for cache in &mut self.caches {
            cache.set_tolerance(tolerance)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
