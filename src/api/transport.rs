// src/api/transport.rs
//! One HTTP attempt, abstracted so the client can be tested without a network.

use crate::error::HunterError;
use crate::rate_limiter::{Exchange, ResponseMeta, TransportError};
use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, ORIGIN, REFERER, USER_AGENT};
use std::time::Duration;

const SITE_ORIGIN: &str = "https://stickerdom.store";
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Short name used in logs and metrics
    pub endpoint: &'static str,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(endpoint: &'static str, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Get,
            endpoint,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            timeout,
        }
    }

    pub fn post(endpoint: &'static str, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::get(endpoint, url, timeout)
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// URL including the query string, the key for cached bodies and validators
    pub fn full_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        match url::Url::parse_with_params(&self.url, &self.query) {
            Ok(url) => url.to_string(),
            Err(_) => self.url.clone(),
        }
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Performs exactly one attempt. Any HTTP status is a successful exchange.
    async fn send(&self, request: &HttpRequest) -> Result<Exchange<String>, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(jwt_token: &str) -> Result<Self, HunterError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", jwt_token))
                .map_err(|e| HunterError::Config(format!("Invalid JWT token: {}", e)))?,
        );
        headers.insert(ORIGIN, HeaderValue::from_static(SITE_ORIGIN));
        headers.insert(REFERER, HeaderValue::from_static("https://stickerdom.store/"));
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| HunterError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<Exchange<String>, TransportError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let mut builder = self
            .client
            .request(method, &request.url)
            .query(&request.query)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::new(request.endpoint, e.to_string()))?;

        let mut meta = ResponseMeta::new(request.endpoint, response.status().as_u16())
            .with_url(request.full_url());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                meta = meta.with_header(name.as_str(), value);
            }
        }
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::new(request.endpoint, e.to_string()))?;

        debug!("🌐 {} {} -> {}", request.endpoint, request.url, meta.status);
        Ok(Exchange::new(meta, body))
    }
}
