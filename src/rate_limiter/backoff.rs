// src/rate_limiter/backoff.rs
//! Retry delay computation.
//!
//! `compute_delay` is pure: the jitter sample is an input, so identical
//! arguments always give the same delay. `BackoffCalculator` pairs it with a
//! [`JitterSource`] that can be seeded for deterministic tests.

use log::warn;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Symmetric jitter, 0.2 means +/-20%
    pub jitter_ratio: f64,
    /// Ceiling for both computed delays and server hints
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_ratio: 0.2,
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Delay before retry number `attempt` (1-based).
///
/// A server hint wins over the exponential schedule but is still capped at
/// `max_delay`. `jitter_sample` is clamped to [-1, 1].
pub fn compute_delay(
    policy: &BackoffPolicy,
    attempt: u32,
    server_hint: Option<Duration>,
    jitter_sample: f64,
) -> Duration {
    if let Some(hint) = server_hint {
        return hint.min(policy.max_delay);
    }

    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = policy.base_delay.as_secs_f64() * policy.multiplier.powi(exponent);
    let sample = if jitter_sample.is_finite() {
        jitter_sample.clamp(-1.0, 1.0)
    } else {
        0.0
    };
    let jittered = raw * (1.0 + policy.jitter_ratio * sample);
    let capped = jittered.min(policy.max_delay.as_secs_f64()).max(0.0);

    Duration::try_from_secs_f64(capped).unwrap_or(policy.max_delay)
}

/// Where jitter samples come from
#[derive(Debug)]
pub enum JitterSource {
    /// Always 0, the bare exponential schedule
    None,
    /// Thread-local fastrand generator
    Random,
    Seeded(Mutex<fastrand::Rng>),
}

impl JitterSource {
    pub fn seeded(seed: u64) -> Self {
        JitterSource::Seeded(Mutex::new(fastrand::Rng::with_seed(seed)))
    }

    /// A sample in [-1, 1]
    pub fn sample(&self) -> f64 {
        match self {
            JitterSource::None => 0.0,
            JitterSource::Random => fastrand::f64() * 2.0 - 1.0,
            JitterSource::Seeded(rng) => {
                let mut rng = rng.lock().unwrap_or_else(|e| e.into_inner());
                rng.f64() * 2.0 - 1.0
            }
        }
    }
}

#[derive(Debug)]
pub struct BackoffCalculator {
    policy: BackoffPolicy,
    jitter: JitterSource,
}

impl BackoffCalculator {
    pub fn new(policy: BackoffPolicy, jitter: JitterSource) -> Self {
        Self { policy, jitter }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn delay(&self, attempt: u32, server_hint: Option<Duration>) -> Duration {
        if let Some(hint) = server_hint {
            if hint > self.policy.max_delay {
                warn!(
                    "⚠️ Server asked for retry-after {:?}, capping at {:?}",
                    hint, self.policy.max_delay
                );
            }
        }
        compute_delay(&self.policy, attempt, server_hint, self.jitter.sample())
    }
}
