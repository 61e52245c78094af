// src/api/client.rs
//! Marketplace API client.
//!
//! Every call goes through [`RateLimiterService::execute`] with a priority
//! matching how much the purchase flow depends on it. GET bodies are cached
//! per URL so that a `304 Not Modified` can be answered locally.

use super::models::{
    CollectionInfo, CollectionPayload, Envelope, InvoicePayload, PriceQuote, PurchaseData,
};
use super::transport::{HttpMethod, HttpRequest, HttpTransport};
use crate::error::{HunterError, Result};
use crate::rate_limiter::{RateLimiterService, RequestPriority};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Largest pack the buy endpoints accept
pub const MAX_PURCHASE_COUNT: u32 = 10;

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub price_cache_ttl: Duration,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.stickerdom.store".to_string(),
            request_timeout: Duration::from_secs(30),
            max_retries: 5,
            price_cache_ttl: Duration::from_secs(30),
        }
    }
}

/// Response as seen by the endpoint methods
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
    /// Body replayed from cache after a 304; `status` is then reported as 200
    pub from_cache: bool,
}

pub struct StickerdomApi {
    config: ApiClientConfig,
    transport: Arc<dyn HttpTransport>,
    limiter: RateLimiterService,
    price_cache: DashMap<String, (f64, Instant)>,
    body_cache: DashMap<String, String>,
}

impl StickerdomApi {
    pub fn new(
        config: ApiClientConfig,
        transport: Arc<dyn HttpTransport>,
        limiter: RateLimiterService,
    ) -> Self {
        info!("🔌 API client initialized for {}", config.base_url);
        Self {
            config,
            transport,
            limiter,
            price_cache: DashMap::new(),
            body_cache: DashMap::new(),
        }
    }

    pub fn limiter(&self) -> &RateLimiterService {
        &self.limiter
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send(&self, priority: RequestPriority, request: HttpRequest) -> Result<ApiResponse> {
        self.send_with_retries(priority, self.config.max_retries, request)
            .await
    }

    async fn send_with_retries(
        &self,
        priority: RequestPriority,
        max_retries: u32,
        request: HttpRequest,
    ) -> Result<ApiResponse> {
        let cache_key = request.full_url();
        let cacheable = request.method == HttpMethod::Get;

        let request = if cacheable && self.body_cache.contains_key(&cache_key) {
            let conditional = self.limiter.conditional_headers(&cache_key).await;
            request.headers(conditional)
        } else {
            request
        };

        let transport = &self.transport;
        let request = &request;
        let exchange = self
            .limiter
            .execute(priority, max_retries, move || transport.send(request))
            .await?;

        let status = exchange.status();
        if status == 304 {
            if let Some(body) = self.body_cache.get(&cache_key) {
                debug!("♻️ {} not modified, serving cached body", request.endpoint);
                return Ok(ApiResponse {
                    status: 200,
                    body: body.clone(),
                    from_cache: true,
                });
            }
            warn!("{} returned 304 without a cached body", request.endpoint);
        } else if cacheable && status == 200 {
            self.body_cache.insert(cache_key, exchange.value.clone());
        }

        Ok(ApiResponse {
            status,
            body: exchange.value,
            from_cache: false,
        })
    }

    fn decode<T: DeserializeOwned>(what: &str, body: &str) -> Result<T> {
        let envelope: Envelope<T> = serde_json::from_str(body)?;
        if !envelope.ok {
            let message = envelope
                .message
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(HunterError::Api(format!("{} failed: {}", what, message)));
        }
        envelope
            .data
            .ok_or_else(|| HunterError::Api(format!("{} returned no data", what)))
    }

    fn check_count(count: u32) -> Result<()> {
        if count == 0 {
            return Err(HunterError::Validation(
                "Purchase count must be positive".to_string(),
            ));
        }
        if count > MAX_PURCHASE_COUNT {
            return Err(HunterError::Validation(format!(
                "Purchase count {} too high, maximum is {}",
                count, MAX_PURCHASE_COUNT
            )));
        }
        Ok(())
    }

    /// Lightweight connectivity check against the shop settings endpoint
    pub async fn test_connection(&self) -> bool {
        let request = HttpRequest::get(
            "settings",
            self.url("/api/v1/shop/settings"),
            Duration::from_secs(10),
        );
        match self.send_with_retries(RequestPriority::Low, 1, request).await {
            Ok(response) => response.status == 200,
            Err(e) => {
                error!("❌ API connection test failed: {}", e);
                false
            }
        }
    }

    /// `None` when the collection does not exist (yet)
    pub async fn get_collection(&self, collection_id: u64) -> Result<Option<CollectionInfo>> {
        self.get_collection_with_priority(collection_id, RequestPriority::High)
            .await
    }

    /// Same as [`get_collection`](Self::get_collection) at a caller-chosen
    /// priority, for background polling
    pub async fn get_collection_with_priority(
        &self,
        collection_id: u64,
        priority: RequestPriority,
    ) -> Result<Option<CollectionInfo>> {
        let request = HttpRequest::get(
            "collection",
            self.url(&format!("/api/v1/collection/{}", collection_id)),
            self.config.request_timeout,
        );
        let response = self.send(priority, request).await?;

        match response.status {
            404 => Ok(None),
            200 => {
                let payload: CollectionPayload = Self::decode("Collection API", &response.body)?;
                Ok(Some(CollectionInfo::from(payload)))
            }
            status => Err(HunterError::Api(format!(
                "Collection API returned HTTP {}: {}",
                status, response.body
            ))),
        }
    }

    /// Price per sticker in `currency`, cached for the configured TTL
    pub async fn get_character_price(
        &self,
        collection_id: u64,
        character_id: u64,
        currency: &str,
    ) -> Result<Option<f64>> {
        let cache_key = format!("{}:{}:{}", collection_id, character_id, currency);
        if let Some(entry) = self.price_cache.get(&cache_key) {
            let (price, fetched_at) = *entry;
            if fetched_at.elapsed() < self.config.price_cache_ttl {
                return Ok(Some(price));
            }
        }

        let request = HttpRequest::get(
            "price",
            self.url("/api/v1/shop/price/crypto"),
            self.config.request_timeout,
        )
        .query("collection", collection_id)
        .query("character", character_id);
        let response = self.send(RequestPriority::Critical, request).await?;
        if response.status != 200 {
            return Err(HunterError::Api(format!(
                "Price API returned HTTP {}: {}",
                response.status, response.body
            )));
        }

        let quotes: Vec<PriceQuote> = Self::decode("Price API", &response.body)?;
        match quotes.into_iter().find(|q| q.token_symbol == currency) {
            Some(quote) => {
                self.price_cache
                    .insert(cache_key, (quote.price, Instant::now()));
                Ok(Some(quote.price))
            }
            None => {
                warn!(
                    "Price for {} not found for {}/{}",
                    currency, collection_id, character_id
                );
                Ok(None)
            }
        }
    }

    pub fn clear_price_cache(&self) {
        self.price_cache.clear();
    }

    /// Creates a TON order; the returned data says where and how much to pay
    pub async fn initiate_purchase(
        &self,
        collection_id: u64,
        character_id: u64,
        count: u32,
    ) -> Result<PurchaseData> {
        Self::check_count(count)?;

        let request = HttpRequest::post(
            "buy_crypto",
            self.url("/api/v1/shop/buy/crypto"),
            self.config.request_timeout * 2,
        )
        .query("collection", collection_id)
        .query("character", character_id)
        .query("currency", "TON")
        .query("count", count);
        let response = self.send(RequestPriority::Critical, request).await?;
        if response.status != 200 {
            error!(
                "Purchase initiation failed: {} - {}",
                response.status, response.body
            );
            return Err(HunterError::Api(format!(
                "Purchase initiation failed: HTTP {}",
                response.status
            )));
        }

        let data: PurchaseData = Self::decode("Purchase initiation", &response.body)?;
        info!(
            "🧾 Purchase initiated: order_id={}, amount={:.9} TON",
            data.order_id,
            data.total_amount_ton()
        );
        Ok(data)
    }

    /// Creates a Telegram Stars invoice and returns its URL
    pub async fn get_stars_invoice_url(
        &self,
        collection_id: u64,
        character_id: u64,
        count: u32,
    ) -> Result<String> {
        Self::check_count(count)?;

        let request = HttpRequest::post(
            "buy_stars",
            self.url("/api/v1/shop/buy"),
            self.config.request_timeout * 2,
        )
        .query("collection", collection_id)
        .query("character", character_id)
        .query("count", count);
        let response = self.send(RequestPriority::Critical, request).await?;
        if response.status != 200 {
            return Err(HunterError::Api(format!(
                "Stars invoice creation failed: HTTP {}",
                response.status
            )));
        }

        let payload: InvoicePayload = Self::decode("Stars invoice creation", &response.body)?;
        let url = payload
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| HunterError::Api("Invalid response: missing url".to_string()))?;
        info!(
            "⭐ Stars invoice created for collection {}, character {}",
            collection_id, character_id
        );
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateLimitError;
    use crate::rate_limiter::{
        Exchange, JitterSource, MemoryStateStore, RateLimiterConfig, ResponseMeta, SystemClock,
        TransportError,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted responses and records what was sent
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<(u16, Vec<(&'static str, &'static str)>, String)>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn push(&self, status: u16, headers: Vec<(&'static str, &'static str)>, body: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back((status, headers, body.to_string()));
        }

        fn seen(&self) -> Vec<HttpRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: &HttpRequest) -> std::result::Result<Exchange<String>, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            let next = self.responses.lock().unwrap().pop_front();
            let Some((status, headers, body)) = next else {
                return Err(TransportError::new(request.endpoint, "no scripted response"));
            };
            let mut meta = ResponseMeta::new(request.endpoint, status).with_url(request.full_url());
            for (name, value) in headers {
                meta = meta.with_header(name, value);
            }
            Ok(Exchange::new(meta, body))
        }
    }

    async fn client(transport: Arc<ScriptedTransport>) -> StickerdomApi {
        let _ = env_logger::try_init();
        let limiter = RateLimiterService::init_with(
            RateLimiterConfig::for_tests(),
            Arc::new(MemoryStateStore::new()),
            Arc::new(SystemClock::new()),
            JitterSource::None,
        )
        .await
        .unwrap();
        StickerdomApi::new(
            ApiClientConfig {
                base_url: "https://api.test".to_string(),
                max_retries: 2,
                ..ApiClientConfig::default()
            },
            transport,
            limiter,
        )
    }

    const COLLECTION_BODY: &str = r#"{"ok":true,"data":{"collection":{"id":19,"title":"Cats","status":"active","total_count":500,"sold_count":20},"characters":[{"id":2,"name":"Tom","left":40,"price":125}]}}"#;

    #[tokio::test(start_paused = true)]
    async fn test_get_collection_maps_404_to_none() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(404, vec![], "{}");
        let api = client(transport).await;

        assert_eq!(api.get_collection(19).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_modified_serves_cached_body() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(200, vec![("etag", "\"v1\"")], COLLECTION_BODY);
        transport.push(304, vec![], "");
        let api = client(transport.clone()).await;

        let first = api.get_collection(19).await.unwrap().unwrap();
        let second = api.get_collection(19).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert!(second.is_active());

        let seen = transport.seen();
        assert!(seen[0].headers.is_empty());
        assert_eq!(
            seen[1].headers,
            vec![("If-None-Match".to_string(), "\"v1\"".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_is_cached_for_ttl() {
        let transport = Arc::new(ScriptedTransport::default());
        let prices = r#"{"ok":true,"data":[{"token_symbol":"USDT","price":3.5},{"token_symbol":"TON","price":1.25}]}"#;
        transport.push(200, vec![], prices);
        transport.push(200, vec![], prices);
        let api = client(transport.clone()).await;

        assert_eq!(api.get_character_price(19, 2, "TON").await.unwrap(), Some(1.25));
        assert_eq!(api.get_character_price(19, 2, "TON").await.unwrap(), Some(1.25));
        assert_eq!(transport.seen().len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(api.get_character_price(19, 2, "TON").await.unwrap(), Some(1.25));
        assert_eq!(transport.seen().len(), 2);
        assert_eq!(api.get_character_price(19, 2, "BTC").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purchase_count_is_validated_before_any_request() {
        let transport = Arc::new(ScriptedTransport::default());
        let api = client(transport.clone()).await;

        assert!(matches!(
            api.initiate_purchase(19, 2, 0).await,
            Err(HunterError::Validation(_))
        ));
        assert!(matches!(
            api.get_stars_invoice_url(19, 2, 11).await,
            Err(HunterError::Validation(_))
        ));
        assert!(transport.seen().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_purchase_decodes_order() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(
            200,
            vec![],
            r#"{"ok":true,"data":{"order_id":"ord-1","total_amount":6250000000,"wallet":"EQxyz"}}"#,
        );
        let api = client(transport.clone()).await;

        let order = api.initiate_purchase(19, 2, 5).await.unwrap();
        assert_eq!(order.order_id, "ord-1");
        assert_eq!(order.total_amount_ton(), 6.25);
        let query = &transport.seen()[0].query;
        assert!(query.contains(&("currency".to_string(), "TON".to_string())));
        assert!(query.contains(&("count".to_string(), "5".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_envelope_error_message_is_surfaced() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(200, vec![], r#"{"ok":false,"message":"sold out"}"#);
        let api = client(transport).await;

        match api.get_stars_invoice_url(19, 2, 5).await {
            Err(HunterError::Api(msg)) => assert!(msg.contains("sold out")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_surfaces_rate_limit_error() {
        let transport = Arc::new(ScriptedTransport::default());
        for _ in 0..3 {
            transport.push(429, vec![("retry-after", "1")], "");
        }
        let api = client(transport.clone()).await;

        let err = api.get_collection(19).await.unwrap_err();
        assert!(matches!(
            err,
            HunterError::RateLimit(RateLimitError::RateLimited { .. })
        ));
        assert_eq!(transport.seen().len(), 3);
        assert!(!api.test_connection().await);
    }
}
