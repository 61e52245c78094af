// src/rate_limiter/circuit_breaker.rs
//! Circuit breaker driven by consecutive throttled responses.
//!
//! CLOSED -> OPEN once `threshold` failures are seen in a row, OPEN ->
//! HALF_OPEN when the cool-down has elapsed (evaluated lazily in
//! [`CircuitBreaker::is_open`], there is no timer task), HALF_OPEN -> CLOSED
//! on the next success and back to OPEN on the next failure.
//!
//! While OPEN, the only success that closes the breaker is a trial call's
//! ([`CircuitBreaker::record_trial_success`]).

use super::clock::Clock;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitPhase::Closed => write!(f, "CLOSED"),
            CircuitPhase::Open => write!(f, "OPEN"),
            CircuitPhase::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// The persisted part of the breaker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    phase: CircuitPhase,
    times_opened: u64,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: 0,
            opened_at: None,
            phase: CircuitPhase::Closed,
            times_opened: 0,
            clock,
        }
    }

    /// Restores a persisted breaker. A recorded `opened_at` means the breaker
    /// was open at the time; the cool-down keeps counting from that instant.
    pub fn restore(&mut self, snapshot: CircuitSnapshot) {
        self.consecutive_failures = snapshot.consecutive_failures;
        self.opened_at = snapshot.opened_at;
        self.phase = if snapshot.opened_at.is_some() {
            CircuitPhase::Open
        } else {
            CircuitPhase::Closed
        };
        if self.phase == CircuitPhase::Open {
            warn!(
                "🔴 Circuit breaker restored OPEN ({} consecutive throttles)",
                self.consecutive_failures
            );
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at,
        }
    }

    /// `true` while OPEN and the cool-down has not elapsed yet
    pub fn is_open(&mut self) -> bool {
        if self.phase == CircuitPhase::Open && self.time_until_half_open().is_zero() {
            self.phase = CircuitPhase::HalfOpen;
            info!("🟡 Circuit breaker HALF_OPEN, next call decides");
        }
        self.phase == CircuitPhase::Open
    }

    /// Remaining cool-down, zero unless OPEN
    pub fn time_until_half_open(&self) -> Duration {
        match (self.phase, self.opened_at) {
            (CircuitPhase::Open, Some(opened_at)) => {
                let elapsed = (self.clock.now() - opened_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                self.cooldown.saturating_sub(elapsed)
            }
            _ => Duration::ZERO,
        }
    }

    /// Counts a success of a call admitted normally. Returns `false` and
    /// leaves the breaker untouched while it is still cooling down.
    pub fn record_success(&mut self) -> bool {
        if self.is_open() {
            debug!("Ignoring success of a call admitted before the breaker opened");
            return false;
        }
        self.close();
        true
    }

    /// A CRITICAL trial call admitted through the open breaker succeeded
    pub fn record_trial_success(&mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.phase != CircuitPhase::Closed {
            info!("🟢 Circuit breaker CLOSED after a successful call");
        }
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.phase = CircuitPhase::Closed;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.phase {
            CircuitPhase::Closed if self.consecutive_failures >= self.threshold => self.trip(),
            CircuitPhase::Closed => {}
            CircuitPhase::HalfOpen => self.trip(),
            // A failed trial call while open restarts the cool-down
            CircuitPhase::Open => self.opened_at = Some(self.clock.now()),
        }
    }

    fn trip(&mut self) {
        self.phase = CircuitPhase::Open;
        self.opened_at = Some(self.clock.now());
        self.times_opened += 1;
        warn!(
            "🔴 Circuit breaker OPEN after {} consecutive throttles, cooling down {:?}",
            self.consecutive_failures, self.cooldown
        );
    }

    pub fn phase(&self) -> CircuitPhase {
        self.phase
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// How many times the breaker tripped since this process started
    pub fn times_opened(&self) -> u64 {
        self.times_opened
    }
}
