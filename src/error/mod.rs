// src/error/mod.rs
//! Error types for the sticker hunter.
//!
//! Three layers, each with its own enum:
//! - [`StoreError`]: the persistent state store failed to read or write.
//! - [`RateLimitError`]: outcomes surfaced by the rate limiter service.
//! - [`HunterError`]: application-level failures seen by the orchestrator.

use std::time::Duration;
use thiserror::Error;

/// Persistent state store failures
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(String),

    #[error("Store database error: {0}")]
    Database(String),

    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors surfaced by the rate limiter service to its callers
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    /// Breaker is open and the caller is not CRITICAL priority
    #[error("Circuit breaker open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// Retries exhausted while the upstream kept throttling
    #[error("Rate limited by upstream (last retry-after: {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The priority's timeout budget elapsed before dispatch
    #[error("Request waited {waited:?} without being dispatched")]
    QueueTimeout { waited: Duration },

    #[error("Rate limiter service is shutting down")]
    ServiceShuttingDown,

    /// Transport errors or 5xx responses that outlived every retry
    #[error("Upstream failure after {attempts} attempt(s) (status {status:?}): {message}")]
    UpstreamFailure {
        status: Option<u16>,
        message: String,
        attempts: u32,
    },

    /// State could not be made durable. Crash-safety is degraded until this is fixed.
    #[error("Failed to persist rate limiter state: {0}")]
    StatePersistence(#[from] StoreError),

    #[error("Invalid rate limiter configuration: {0}")]
    InvalidConfig(String),
}

impl RateLimitError {
    /// Whether the caller may reasonably try again later
    pub fn is_recoverable(&self) -> bool {
        match self {
            RateLimitError::CircuitOpen { .. } => true, // after the cool-down
            RateLimitError::RateLimited { .. } => true,
            RateLimitError::QueueTimeout { .. } => true,
            RateLimitError::ServiceShuttingDown => false,
            RateLimitError::UpstreamFailure { .. } => true,
            RateLimitError::StatePersistence(_) => false,
            RateLimitError::InvalidConfig(_) => false,
        }
    }

    /// `true` when the request was blocked by policy rather than by a broken upstream
    pub fn is_policy_block(&self) -> bool {
        matches!(
            self,
            RateLimitError::CircuitOpen { .. }
                | RateLimitError::RateLimited { .. }
                | RateLimitError::QueueTimeout { .. }
        )
    }

    /// Categorizes error for metrics and monitoring
    pub fn categorize(&self) -> ErrorCategory {
        match self {
            RateLimitError::CircuitOpen { .. } => ErrorCategory::Safety,
            RateLimitError::RateLimited { .. } => ErrorCategory::Throttling,
            RateLimitError::QueueTimeout { .. } => ErrorCategory::Throttling,
            RateLimitError::ServiceShuttingDown => ErrorCategory::Infrastructure,
            RateLimitError::UpstreamFailure { .. } => ErrorCategory::Network,
            RateLimitError::StatePersistence(_) => ErrorCategory::Critical,
            RateLimitError::InvalidConfig(_) => ErrorCategory::Configuration,
        }
    }
}

/// Application-level errors
#[derive(Debug, Clone, Error)]
pub enum HunterError {
    #[error("API Error: {0}")]
    Api(String),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("Wallet Error: {0}")]
    Wallet(String),

    #[error("Payment Error: {0}")]
    Payment(String),

    #[error("Collection Not Available: {0}")]
    CollectionNotAvailable(String),

    #[error("Insufficient Balance: {0}")]
    InsufficientBalance(String),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Validation Error: {0}")]
    Validation(String),
}

impl From<serde_json::Error> for HunterError {
    fn from(err: serde_json::Error) -> Self {
        HunterError::Api(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<StoreError> for HunterError {
    fn from(err: StoreError) -> Self {
        HunterError::RateLimit(RateLimitError::StatePersistence(err))
    }
}

impl HunterError {
    /// Determines if an error is recoverable through retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            HunterError::Api(_) => true,
            HunterError::RateLimit(e) => e.is_recoverable(),
            HunterError::Wallet(_) => true, // node hiccups are common
            HunterError::Payment(_) => false,
            HunterError::CollectionNotAvailable(_) => true, // may go live later
            HunterError::InsufficientBalance(_) => false,
            HunterError::Config(_) => false,
            HunterError::Validation(_) => false,
        }
    }

    /// Whether a purchase session should stop instead of attempting the next purchase
    pub fn stops_session(&self) -> bool {
        matches!(
            self,
            HunterError::InsufficientBalance(_)
                | HunterError::Config(_)
                | HunterError::RateLimit(RateLimitError::ServiceShuttingDown)
                | HunterError::RateLimit(RateLimitError::StatePersistence(_))
        )
    }

    /// Categorizes error for metrics and monitoring
    pub fn categorize(&self) -> ErrorCategory {
        match self {
            HunterError::Api(_) => ErrorCategory::Network,
            HunterError::RateLimit(e) => e.categorize(),
            HunterError::Wallet(_) => ErrorCategory::Balance,
            HunterError::Payment(_) => ErrorCategory::Trading,
            HunterError::CollectionNotAvailable(_) => ErrorCategory::Data,
            HunterError::InsufficientBalance(_) => ErrorCategory::Balance,
            HunterError::Config(_) => ErrorCategory::Configuration,
            HunterError::Validation(_) => ErrorCategory::Data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Throttling,
    Trading,
    Data,
    Balance,
    Safety,
    Configuration,
    Infrastructure,
    Critical,
}

// Convenience type aliases
pub type Result<T> = std::result::Result<T, HunterError>;
