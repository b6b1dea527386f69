//! Adaptive optimization system configuration.
//!
//! Values come from three places, later ones overriding earlier ones:
//!
//! 1. [`AosConfig::default`]
//! 2. `VIREO_*` environment variables ([`AosConfig::from_env`])
//! 3. Field assignment by the embedder
//!
//! | Variable                          | Field                          |
//! |-----------------------------------|--------------------------------|
//! | `VIREO_INVOCATION_COUNT_THRESHOLD`| `invocation_count_threshold`   |
//! | `VIREO_INVOCATION_COUNT_OPT_LEVEL`| `invocation_count_opt_level`   |
//! | `VIREO_MAX_OPT_LEVEL`             | `max_opt_level`                |
//! | `VIREO_FILTER_OPT_LEVEL`          | `filter_opt_level`             |
//! | `VIREO_METHOD_SAMPLE_SIZE`        | `method_sample_size`           |
//! | `VIREO_NUM_PROCESSORS`            | `num_processors`               |
//! | `VIREO_COMPILER_THREADS`          | `compiler_threads`             |
//! | `VIREO_OSR_PRIORITY`              | `osr_priority`                 |
//! | `VIREO_ORGANIZER_PARK_MS`         | `organizer_park_timeout`       |
//! | `VIREO_ENABLE_OSR`                | `enable_osr`                   |
//! | `VIREO_ENABLE_INVOCATION_COUNTERS`| `enable_invocation_counters`   |

use std::str::FromStr;
use std::time::Duration;

use log::warn;
use vireo_core::OptLevel;
use vireo_core::tier::MAX_OPT_LEVEL;

// =============================================================================
// AosConfig
// =============================================================================

/// Tunables of the controller, organizers and compilation workers.
#[derive(Debug, Clone, PartialEq)]
pub struct AosConfig {
    /// Invocations of baseline code before its counter trips.
    pub invocation_count_threshold: i32,
    /// Opt level requested by the invocation-counter fast path.
    pub invocation_count_opt_level: OptLevel,
    /// Highest opt level the strategy may choose.
    pub max_opt_level: OptLevel,
    /// Opt code at or above this level is no longer reported as hot.
    pub filter_opt_level: OptLevel,
    /// Samples buffered before the method-sample organizer runs.
    pub method_sample_size: usize,
    /// Virtual processors; widens the recursive-exit limit.
    pub num_processors: u32,
    /// Background compilation workers. Zero compiles on the controller thread.
    pub compiler_threads: usize,
    /// Queue priority of on-stack-replacement events.
    pub osr_priority: f64,
    /// Queue priority of invocation-counter plans.
    pub invocation_plan_priority: f64,
    /// Upper bound on a passive organizer's sleep.
    pub organizer_park_timeout: Duration,
    /// Wall time represented by one method sample.
    pub sample_interval: Duration,
    /// Whether threads may request on-stack replacement.
    pub enable_osr: bool,
    /// Whether baseline code is armed with invocation counters.
    pub enable_invocation_counters: bool,
}

impl Default for AosConfig {
    fn default() -> Self {
        Self {
            invocation_count_threshold: 1000,
            invocation_count_opt_level: 1,
            max_opt_level: 2,
            filter_opt_level: 2,
            method_sample_size: 3,
            num_processors: 1,
            compiler_threads: 1,
            osr_priority: 5.0,
            invocation_plan_priority: 2.0,
            organizer_park_timeout: Duration::from_millis(50),
            sample_interval: Duration::from_millis(10),
            enable_osr: true,
            enable_invocation_counters: true,
        }
    }
}

impl AosConfig {
    /// Small, synchronous configuration for tests.
    pub fn for_testing() -> Self {
        Self {
            invocation_count_threshold: 4,
            method_sample_size: 2,
            compiler_threads: 0,
            organizer_park_timeout: Duration::from_millis(5),
            ..Self::default()
        }
    }

    /// Defaults overridden by `VIREO_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = Env { lookup };

        env.apply("VIREO_INVOCATION_COUNT_THRESHOLD", &mut config.invocation_count_threshold);
        env.apply("VIREO_INVOCATION_COUNT_OPT_LEVEL", &mut config.invocation_count_opt_level);
        env.apply("VIREO_MAX_OPT_LEVEL", &mut config.max_opt_level);
        env.apply("VIREO_FILTER_OPT_LEVEL", &mut config.filter_opt_level);
        env.apply("VIREO_METHOD_SAMPLE_SIZE", &mut config.method_sample_size);
        env.apply("VIREO_NUM_PROCESSORS", &mut config.num_processors);
        env.apply("VIREO_COMPILER_THREADS", &mut config.compiler_threads);
        env.apply("VIREO_OSR_PRIORITY", &mut config.osr_priority);

        let mut park_ms = config.organizer_park_timeout.as_millis() as u64;
        env.apply("VIREO_ORGANIZER_PARK_MS", &mut park_ms);
        config.organizer_park_timeout = Duration::from_millis(park_ms);

        if let Some(v) = env.flag("VIREO_ENABLE_OSR") {
            config.enable_osr = v;
        }
        if let Some(v) = env.flag("VIREO_ENABLE_INVOCATION_COUNTERS") {
            config.enable_invocation_counters = v;
        }

        config.clamp();
        config
    }

    /// Set the compilation worker count.
    #[inline]
    pub fn with_compiler_threads(mut self, threads: usize) -> Self {
        self.compiler_threads = threads;
        self
    }

    /// Set the invocation counter threshold.
    #[inline]
    pub fn with_invocation_count_threshold(mut self, threshold: i32) -> Self {
        self.invocation_count_threshold = threshold;
        self
    }

    /// Set the highest opt level the strategy may choose.
    #[inline]
    pub fn with_max_opt_level(mut self, level: OptLevel) -> Self {
        self.max_opt_level = level;
        self
    }

    fn clamp(&mut self) {
        if self.max_opt_level > MAX_OPT_LEVEL {
            warn!(target: "vireo::aos", "max_opt_level={} clamped to {MAX_OPT_LEVEL}", self.max_opt_level);
            self.max_opt_level = MAX_OPT_LEVEL;
        }
        self.invocation_count_opt_level = self.invocation_count_opt_level.min(self.max_opt_level);
        self.invocation_count_threshold = self.invocation_count_threshold.max(1);
        self.method_sample_size = self.method_sample_size.max(1);
        self.num_processors = self.num_processors.max(1);
    }
}

// =============================================================================
// Environment Lookup
// =============================================================================

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn apply<T: FromStr>(&self, name: &str, slot: &mut T) {
        let Some(raw) = (self.lookup)(name) else {
            return;
        };
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(target: "vireo::aos", "ignoring {name}={raw:?}: not a valid value"),
        }
    }

    /// Truthy unless empty, `0`, `false` or `off`.
    fn flag(&self, name: &str) -> Option<bool> {
        (self.lookup)(name).map(|v| {
            let v = v.trim().to_ascii_lowercase();
            !(v.is_empty() || v == "0" || v == "false" || v == "off")
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AosConfig::default();
        assert_eq!(config.osr_priority, 5.0);
        assert_eq!(config.invocation_count_opt_level, 1);
        assert!(config.enable_osr);
        assert_eq!(AosConfig::from_lookup(|_| None), config);
    }

    #[test]
    fn test_overrides() {
        let config = AosConfig::from_lookup(lookup(&[
            ("VIREO_INVOCATION_COUNT_THRESHOLD", "250"),
            ("VIREO_COMPILER_THREADS", " 4 "),
            ("VIREO_OSR_PRIORITY", "7.5"),
            ("VIREO_ORGANIZER_PARK_MS", "20"),
            ("VIREO_ENABLE_OSR", "off"),
        ]));
        assert_eq!(config.invocation_count_threshold, 250);
        assert_eq!(config.compiler_threads, 4);
        assert_eq!(config.osr_priority, 7.5);
        assert_eq!(config.organizer_park_timeout, Duration::from_millis(20));
        assert!(!config.enable_osr);
        assert!(config.enable_invocation_counters);
    }

    #[test]
    fn test_invalid_values_ignored() {
        let config = AosConfig::from_lookup(lookup(&[
            ("VIREO_METHOD_SAMPLE_SIZE", "lots"),
            ("VIREO_MAX_OPT_LEVEL", "-1"),
        ]));
        assert_eq!(config.method_sample_size, AosConfig::default().method_sample_size);
        assert_eq!(config.max_opt_level, 2);
    }

    #[test]
    fn test_levels_clamped() {
        let config = AosConfig::from_lookup(lookup(&[
            ("VIREO_MAX_OPT_LEVEL", "9"),
            ("VIREO_INVOCATION_COUNT_OPT_LEVEL", "3"),
        ]));
        assert_eq!(config.max_opt_level, MAX_OPT_LEVEL);
        assert_eq!(config.invocation_count_opt_level, 3);

        let config = AosConfig::from_lookup(lookup(&[("VIREO_INVOCATION_COUNT_OPT_LEVEL", "3")]));
        assert_eq!(config.invocation_count_opt_level, 2);
    }
}
