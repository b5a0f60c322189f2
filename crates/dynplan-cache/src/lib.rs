// dynplan-cache: Evaluate-if-changed kinematics caches, per state and per knot.

pub mod state_cache;
pub mod timely;

pub use dynplan_core::TimeLookup;
pub use state_cache::StateCache;
pub use timely::TimeIndexedCacheSet;
