//! Configuration for the cache system.
//!
//! Plain structs with defaults, injected at construction. Loading these
//! from files or the environment is the embedding application's concern.

use crate::manager::DefaultPreferences;

/// Cache-wide tunables.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Minimum age (ms since last check) before an object is due for
    /// re-checking. Default 24 h.
    pub check_grace_ms: i64,
    /// How long (ms) a nonzero refcount protects an object from
    /// eviction. Default 1 h.
    pub refcount_ttl_ms: i64,
    /// Objects at or below this many bytes count as small for volume
    /// preferences. Default 100 MB.
    pub small_object_cutoff: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            check_grace_ms: 24 * 60 * 60 * 1000,
            refcount_ttl_ms: 60 * 60 * 1000,
            small_object_cutoff: 100_000_000,
        }
    }
}

impl CacheConfig {
    /// The size-driven preference policy matching this configuration.
    #[must_use]
    pub fn preferences(&self) -> DefaultPreferences {
        DefaultPreferences {
            small_object_cutoff: self.small_object_cutoff,
        }
    }
}

/// Monitor worker scheduling parameters.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between sweep starts, anchored to UTC midnight. Must be
    /// positive; it should divide an hour if on-the-hour scheduling is
    /// wanted. Default 30 min.
    pub duty_cycle_ms: i64,
    /// Grace period applied to both the data and head-bag inventories.
    /// Default 24 h.
    pub grace_period_ms: i64,
    /// Offset of the cycle grid from UTC midnight. Default 0.
    pub start_offset_ms: i64,
    /// Objects examined per inventory batch. Default 100.
    pub max_objects_per_batch: usize,
    /// Exit after one cycle instead of rescheduling. Default false.
    pub once: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            duty_cycle_ms: 30 * 60 * 1000,
            grace_period_ms: 24 * 60 * 60 * 1000,
            start_offset_ms: 0,
            max_objects_per_batch: 100,
            once: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cache = CacheConfig::default();
        assert_eq!(cache.check_grace_ms, 86_400_000);
        assert_eq!(cache.refcount_ttl_ms, 3_600_000);

        let monitor = MonitorConfig::default();
        assert_eq!(monitor.duty_cycle_ms, 1_800_000);
        assert!(!monitor.once);
        // The default duty cycle divides an hour, keeping cycles on the
        // hour boundary.
        assert_eq!(3_600_000 % monitor.duty_cycle_ms, 0);
    }

    #[test]
    fn preferences_inherit_cutoff() {
        let config = CacheConfig {
            small_object_cutoff: 42,
            ..CacheConfig::default()
        };
        assert_eq!(config.preferences().small_object_cutoff, 42);
    }
}
