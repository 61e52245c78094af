pub mod api;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod purchase;
pub mod rate_limiter;
pub mod utils;
pub mod wallet;

pub use api::StickerdomApi;
pub use error::{HunterError, RateLimitError, Result};
pub use purchase::PurchaseOrchestrator;
pub use rate_limiter::{RateLimiterConfig, RateLimiterService, RequestPriority};
