// src/rate_limiter/config.rs
//! Rate limiter configuration: a fixed set of named knobs, validated before
//! the service starts.

use super::backoff::BackoffPolicy;
use crate::error::RateLimitError;
use log::info;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Ceilings used when `test_mode` is on
pub const TEST_MODE_MAX_DELAY: Duration = Duration::from_secs(10);
pub const TEST_MODE_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// When false every call is passed straight through, once
    pub enabled: bool,
    pub db_path: PathBuf,
    /// Ceiling for backoff delays, server hints and quota sleeps
    pub max_delay: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
    pub test_mode: bool,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_ratio: f64,
    /// Pause before dispatch while quota is low; zero disables it
    pub preemptive_delay: Duration,
    pub low_quota_watermark: u64,
    pub max_in_flight: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: PathBuf::from("data/rate_limiter.db"),
            max_delay: Duration::from_secs(300),
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(300),
            test_mode: false,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter_ratio: 0.2,
            preemptive_delay: Duration::ZERO,
            low_quota_watermark: 10,
            max_in_flight: 4,
        }
    }
}

impl RateLimiterConfig {
    /// Defaults with the test-mode ceilings applied
    pub fn for_tests() -> Self {
        Self::default().with_test_mode(true)
    }

    /// Shrinks the delay ceiling and cool-down for fast test iteration
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        if test_mode {
            self.max_delay = self.max_delay.min(TEST_MODE_MAX_DELAY);
            self.circuit_breaker_cooldown = self.circuit_breaker_cooldown.min(TEST_MODE_COOLDOWN);
            self.preemptive_delay = self.preemptive_delay.min(TEST_MODE_MAX_DELAY);
        }
        self
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str| {
            env::var(name)
                .ok()
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|v| Duration::try_from_secs_f64(v).ok())
        };
        let flag = |name: &str| {
            env::var(name)
                .ok()
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        };

        let config = Self {
            enabled: flag("RATE_LIMITER_ENABLED").unwrap_or(defaults.enabled),
            db_path: env::var("RATE_LIMITER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            max_delay: secs("RATE_LIMITER_MAX_DELAY").unwrap_or(defaults.max_delay),
            circuit_breaker_threshold: env::var("RATE_LIMITER_CIRCUIT_BREAKER_THRESHOLD")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.circuit_breaker_threshold),
            circuit_breaker_cooldown: secs("RATE_LIMITER_CIRCUIT_BREAKER_TIMEOUT")
                .unwrap_or(defaults.circuit_breaker_cooldown),
            test_mode: false,
            base_delay: secs("RATE_LIMITER_BASE_DELAY").unwrap_or(defaults.base_delay),
            backoff_multiplier: env::var("RATE_LIMITER_AGGRESSIVE_BACKOFF_MULTIPLIER")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.backoff_multiplier),
            jitter_ratio: defaults.jitter_ratio,
            preemptive_delay: secs("RATE_LIMITER_PREEMPTIVE_DELAY")
                .unwrap_or(defaults.preemptive_delay),
            low_quota_watermark: env::var("RATE_LIMITER_LOW_QUOTA_WATERMARK")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.low_quota_watermark),
            max_in_flight: env::var("RATE_LIMITER_MAX_IN_FLIGHT")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.max_in_flight),
        };
        config.with_test_mode(flag("TEST_MODE").unwrap_or(false))
    }

    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.circuit_breaker_threshold == 0 {
            return Err(RateLimitError::InvalidConfig(
                "circuit_breaker_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker_cooldown.is_zero() {
            return Err(RateLimitError::InvalidConfig(
                "circuit_breaker_cooldown must be positive".to_string(),
            ));
        }
        if self.max_delay.is_zero() {
            return Err(RateLimitError::InvalidConfig(
                "max_delay must be positive".to_string(),
            ));
        }
        if self.base_delay.is_zero() || self.base_delay > self.max_delay {
            return Err(RateLimitError::InvalidConfig(format!(
                "base_delay {:?} must be positive and not exceed max_delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(RateLimitError::InvalidConfig(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(RateLimitError::InvalidConfig(format!(
                "jitter_ratio must be in [0, 1), got {}",
                self.jitter_ratio
            )));
        }
        if self.max_in_flight == 0 {
            return Err(RateLimitError::InvalidConfig(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: self.base_delay,
            multiplier: self.backoff_multiplier,
            jitter_ratio: self.jitter_ratio,
            max_delay: self.max_delay,
        }
    }

    pub fn log_summary(&self) {
        info!(
            "🚦 Rate limiter: enabled={}, max_delay={:?}, breaker={} throttles / {:?} cool-down, backoff x{}, in-flight={}{}",
            self.enabled,
            self.max_delay,
            self.circuit_breaker_threshold,
            self.circuit_breaker_cooldown,
            self.backoff_multiplier,
            self.max_in_flight,
            if self.test_mode { " [TEST MODE]" } else { "" }
        );
    }
}
