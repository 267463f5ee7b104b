use crate::error::ConfigError;
use crate::governor::GovernorPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Operator-facing knobs for the streaming engine (`[streaming]` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Push once this many new chars have accumulated since the last push.
    #[serde(default = "default_size_threshold_chars")]
    pub size_threshold_chars: usize,
    /// Push once this long has passed since the last push, if anything is new.
    #[serde(default = "default_time_threshold_ms")]
    pub time_threshold_ms: u64,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_baseline_interval_ms")]
    pub baseline_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Multiplier applied to the interval after each recovery run (< 1.0).
    #[serde(default = "default_recovery_factor")]
    pub recovery_factor: f64,
    /// Consecutive successes required before the interval tightens.
    #[serde(default = "default_recovery_successes")]
    pub recovery_successes: u32,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Session-local consecutive failures after which incremental pushes stop.
    /// Must exceed `breaker_threshold`.
    #[serde(default = "default_abandon_streaming_threshold")]
    pub abandon_streaming_threshold: u32,
    #[serde(default = "default_lock_staleness_secs")]
    pub lock_staleness_secs: u64,
    #[serde(default = "default_final_flush_attempts")]
    pub final_flush_attempts: u32,
    /// Destinations untouched for this long are dropped from the governor
    /// once their breaker has expired.
    #[serde(default = "default_governor_idle_ttl_secs")]
    pub governor_idle_ttl_secs: u64,
}

fn default_size_threshold_chars() -> usize {
    500
}

fn default_time_threshold_ms() -> u64 {
    3_000
}

fn default_min_interval_ms() -> u64 {
    1_000
}

fn default_baseline_interval_ms() -> u64 {
    2_000
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_recovery_factor() -> f64 {
    0.5
}

fn default_recovery_successes() -> u32 {
    3
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_abandon_streaming_threshold() -> u32 {
    8
}

fn default_lock_staleness_secs() -> u64 {
    // Generous multiple of the longest generation we expect to relay.
    30 * 60
}

fn default_final_flush_attempts() -> u32 {
    3
}

fn default_governor_idle_ttl_secs() -> u64 {
    60 * 60
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            size_threshold_chars: default_size_threshold_chars(),
            time_threshold_ms: default_time_threshold_ms(),
            min_interval_ms: default_min_interval_ms(),
            baseline_interval_ms: default_baseline_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            backoff_factor: default_backoff_factor(),
            recovery_factor: default_recovery_factor(),
            recovery_successes: default_recovery_successes(),
            breaker_threshold: default_breaker_threshold(),
            cooldown_secs: default_cooldown_secs(),
            abandon_streaming_threshold: default_abandon_streaming_threshold(),
            lock_staleness_secs: default_lock_staleness_secs(),
            final_flush_attempts: default_final_flush_attempts(),
            governor_idle_ttl_secs: default_governor_idle_ttl_secs(),
        }
    }
}

impl StreamingConfig {
    pub fn time_threshold(&self) -> Duration {
        Duration::from_millis(self.time_threshold_ms)
    }

    pub fn lock_staleness(&self) -> Duration {
        Duration::from_secs(self.lock_staleness_secs)
    }

    pub fn governor_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.governor_idle_ttl_secs)
    }

    pub fn governor_policy(&self) -> GovernorPolicy {
        GovernorPolicy {
            min_interval: Duration::from_millis(self.min_interval_ms),
            baseline_interval: Duration::from_millis(self.baseline_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            backoff_factor: self.backoff_factor,
            recovery_factor: self.recovery_factor,
            recovery_successes: self.recovery_successes,
            breaker_threshold: self.breaker_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_threshold_chars == 0 {
            return Err(invalid("size_threshold_chars must be > 0"));
        }
        if self.time_threshold_ms == 0 {
            return Err(invalid("time_threshold_ms must be > 0"));
        }
        if self.min_interval_ms > self.baseline_interval_ms {
            return Err(invalid("min_interval_ms must be <= baseline_interval_ms"));
        }
        if self.baseline_interval_ms > self.max_interval_ms {
            return Err(invalid("baseline_interval_ms must be <= max_interval_ms"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(invalid("backoff_factor must be a finite number >= 1.0"));
        }
        if !self.recovery_factor.is_finite()
            || self.recovery_factor <= 0.0
            || self.recovery_factor > 1.0
        {
            return Err(invalid("recovery_factor must be in (0.0, 1.0]"));
        }
        if self.recovery_successes == 0 {
            return Err(invalid("recovery_successes must be > 0"));
        }
        if self.breaker_threshold == 0 {
            return Err(invalid("breaker_threshold must be > 0"));
        }
        if self.abandon_streaming_threshold <= self.breaker_threshold {
            return Err(invalid(
                "abandon_streaming_threshold must be > breaker_threshold",
            ));
        }
        if self.lock_staleness_secs == 0 {
            return Err(invalid("lock_staleness_secs must be > 0"));
        }
        if self.final_flush_attempts == 0 {
            return Err(invalid("final_flush_attempts must be > 0"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StreamingConfig::default()
            .validate()
            .expect("defaults are valid");
    }

    #[test]
    fn defaults_map_to_governor_policy() {
        let policy = StreamingConfig::default().governor_policy();
        assert_eq!(policy.min_interval, Duration::from_secs(1));
        assert_eq!(policy.baseline_interval, Duration::from_secs(2));
        assert_eq!(policy.max_interval, Duration::from_secs(30));
        assert_eq!(policy.breaker_threshold, 5);
        assert_eq!(policy.cooldown, Duration::from_secs(300));
    }

    #[test]
    fn abandon_threshold_must_exceed_breaker_threshold() {
        let cfg = StreamingConfig {
            abandon_streaming_threshold: 5,
            ..StreamingConfig::default()
        };
        let err = cfg.validate().expect_err("equal thresholds rejected");
        assert!(err.to_string().contains("abandon_streaming_threshold"));
    }

    #[test]
    fn interval_bounds_must_be_ordered() {
        let cfg = StreamingConfig {
            min_interval_ms: 5_000,
            ..StreamingConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_table_fills_defaults() {
        let cfg: StreamingConfig =
            serde_json::from_str(r#"{"size_threshold_chars": 120}"#).expect("parse");
        assert_eq!(cfg.size_threshold_chars, 120);
        assert_eq!(cfg.breaker_threshold, 5);
        assert_eq!(cfg.time_threshold(), Duration::from_secs(3));
    }
}
