// src/config/profiles.rs
//! Named rate limiter presets, from cautious to reckless.

use crate::error::HunterError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileName {
    Safe,
    Balanced,
    Fast,
    Aggressive,
    Extreme,
}

impl ProfileName {
    pub const ALL: [ProfileName; 5] = [
        ProfileName::Safe,
        ProfileName::Balanced,
        ProfileName::Fast,
        ProfileName::Aggressive,
        ProfileName::Extreme,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProfileName::Safe => "safe",
            ProfileName::Balanced => "balanced",
            ProfileName::Fast => "fast",
            ProfileName::Aggressive => "aggressive",
            ProfileName::Extreme => "extreme",
        }
    }

    pub fn profile(self) -> RateLimiterProfile {
        RateLimiterProfile::get(self)
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileName {
    type Err = HunterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ProfileName::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| {
                HunterError::Config(format!(
                    "Unknown rate limiter profile '{}'. Available: safe, balanced, fast, aggressive, extreme",
                    s
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterProfile {
    pub name: ProfileName,
    pub title: &'static str,
    pub description: &'static str,
    pub max_delay: Duration,
    pub preemptive_delay: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
    pub backoff_multiplier: f64,
    pub max_retries_per_request: u32,
    pub price_cache_ttl: Duration,
    pub request_timeout: Duration,
}

impl RateLimiterProfile {
    pub fn get(name: ProfileName) -> Self {
        let secs = Duration::from_secs;
        match name {
            ProfileName::Safe => Self {
                name,
                title: "Safe Mode",
                description: "Maximum protection, minimal risk of account blocking",
                max_delay: secs(600),
                preemptive_delay: secs(120),
                circuit_breaker_threshold: 2,
                circuit_breaker_cooldown: secs(600),
                backoff_multiplier: 3.0,
                max_retries_per_request: 3,
                price_cache_ttl: secs(60),
                request_timeout: secs(45),
            },
            ProfileName::Balanced => Self {
                name,
                title: "Balanced Mode",
                description: "Good balance between speed and safety (default)",
                max_delay: secs(300),
                preemptive_delay: secs(60),
                circuit_breaker_threshold: 3,
                circuit_breaker_cooldown: secs(300),
                backoff_multiplier: 2.0,
                max_retries_per_request: 5,
                price_cache_ttl: secs(30),
                request_timeout: secs(30),
            },
            ProfileName::Fast => Self {
                name,
                title: "Fast Mode",
                description: "Optimized for quick sellouts (2-6 minute window)",
                max_delay: secs(60),
                preemptive_delay: secs(10),
                circuit_breaker_threshold: 5,
                circuit_breaker_cooldown: secs(120),
                backoff_multiplier: 1.5,
                max_retries_per_request: 4,
                price_cache_ttl: secs(10),
                request_timeout: secs(20),
            },
            ProfileName::Aggressive => Self {
                name,
                title: "Aggressive Mode",
                description: "High-speed purchases, higher risk",
                max_delay: secs(30),
                preemptive_delay: secs(5),
                circuit_breaker_threshold: 7,
                circuit_breaker_cooldown: secs(60),
                backoff_multiplier: 1.2,
                max_retries_per_request: 3,
                price_cache_ttl: secs(5),
                request_timeout: secs(15),
            },
            ProfileName::Extreme => Self {
                name,
                title: "Extreme Mode",
                description: "Maximum speed, maximum risk. Emergencies only",
                max_delay: secs(15),
                preemptive_delay: secs(2),
                circuit_breaker_threshold: 10,
                circuit_breaker_cooldown: secs(30),
                backoff_multiplier: 1.1,
                max_retries_per_request: 2,
                price_cache_ttl: secs(3),
                request_timeout: secs(10),
            },
        }
    }

    pub fn all() -> Vec<RateLimiterProfile> {
        ProfileName::ALL.into_iter().map(Self::get).collect()
    }
}

impl fmt::Display for RateLimiterProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<11} {} | max delay {}s, breaker {} / {}s, backoff x{}, {} retries",
            self.name.as_str(),
            self.description,
            self.max_delay.as_secs(),
            self.circuit_breaker_threshold,
            self.circuit_breaker_cooldown.as_secs(),
            self.backoff_multiplier,
            self.max_retries_per_request
        )
    }
}
