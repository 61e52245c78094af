// src/api/mod.rs
//! Marketplace API access
//!
//! - [`transport`]: one HTTP attempt behind the `HttpTransport` trait
//! - [`client`]: endpoint methods routed through the rate limiter
//! - [`models`]: response payloads

pub mod client;
pub mod models;
pub mod transport;

pub use client::{ApiClientConfig, ApiResponse, StickerdomApi, MAX_PURCHASE_COUNT};
pub use models::{CharacterInfo, CollectionInfo, PriceQuote, PurchaseData};
pub use transport::{HttpMethod, HttpRequest, HttpTransport, ReqwestTransport};
