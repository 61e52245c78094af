// src/rate_limiter/mod.rs
//! Request admission control for the marketplace API.
//!
//! Leaves first: [`backoff`], [`circuit_breaker`], [`priority_queue`] and the
//! [`state_store`] implementations are composed by [`service`], which every
//! outbound call goes through.

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod priority_queue;
pub mod service;
pub mod sqlite_store;
pub mod state_store;
pub mod types;

pub use backoff::{compute_delay, BackoffCalculator, BackoffPolicy, JitterSource};
pub use circuit_breaker::{CircuitBreaker, CircuitPhase, CircuitSnapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RateLimiterConfig;
pub use priority_queue::{PriorityQueue, QueuedRequest};
pub use service::{LimiterStats, RateLimiterService};
pub use sqlite_store::SqliteStateStore;
pub use state_store::{MemoryStateStore, StateStore};
pub use types::{
    Exchange, RateLimitState, RequestMetric, RequestPriority, ResponseClass, ResponseMeta,
    TransportError,
};
