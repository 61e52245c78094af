// src/config/settings.rs
use super::profiles::{ProfileName, RateLimiterProfile};
use crate::api::ApiClientConfig;
use crate::error::HunterError;
use crate::monitoring::WatchSettings;
use crate::purchase::{PaymentMethod, PurchaseSettings};
use crate::rate_limiter::RateLimiterConfig;
use log::{info, warn};
use std::env;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub api_base_url: String,
    pub jwt_token: String,
    pub payment_methods: Vec<PaymentMethod>,
    pub request_timeout: Duration,
    pub max_retries_per_request: u32,
    pub price_cache_ttl: Duration,
    pub stickers_per_purchase: u32,
    pub gas_amount: f64,
    pub purchase_delay: Duration,
    pub stars_max_purchases: usize,
    pub collection_check_interval: Duration,
    pub collection_not_found_retry: Duration,
    pub dry_run_mode: bool,
    /// Starting balance of the simulated wallet, in TON
    pub dry_run_balance_ton: f64,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file_path: String,
    pub rate_limiter_profile: Option<ProfileName>,
    pub rate_limiter: RateLimiterConfig,
    /// Problems found while reading the environment, logged by
    /// [`Config::log_settings`] once logging is up
    pub load_warnings: Vec<String>,
}

// The JWT must never end up in logs
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("jwt_token", &if self.jwt_token.is_empty() { "<missing>" } else { "<redacted>" })
            .field("payment_methods", &self.payment_methods)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries_per_request", &self.max_retries_per_request)
            .field("price_cache_ttl", &self.price_cache_ttl)
            .field("stickers_per_purchase", &self.stickers_per_purchase)
            .field("gas_amount", &self.gas_amount)
            .field("purchase_delay", &self.purchase_delay)
            .field("stars_max_purchases", &self.stars_max_purchases)
            .field("collection_check_interval", &self.collection_check_interval)
            .field("collection_not_found_retry", &self.collection_not_found_retry)
            .field("dry_run_mode", &self.dry_run_mode)
            .field("rate_limiter_profile", &self.rate_limiter_profile)
            .finish()
    }
}

fn flag(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn secs(name: &str, default: u64) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|v| Duration::try_from_secs_f64(v).ok())
        .unwrap_or(Duration::from_secs(default))
}

impl Config {
    pub fn from_env() -> Self {
        let mut load_warnings = Vec::new();
        let mut payment_methods = Vec::new();
        for raw in env::var("PAYMENT_METHODS")
            .unwrap_or_else(|_| "TON,STARS".to_string())
            .split(',')
            .filter(|s| !s.trim().is_empty())
        {
            match raw.parse::<PaymentMethod>() {
                Ok(method) if !payment_methods.contains(&method) => payment_methods.push(method),
                Ok(_) => {}
                Err(e) => load_warnings.push(format!("Ignoring payment method: {}", e)),
            }
        }

        let rate_limiter_profile = env::var("RATE_LIMITER_PROFILE").ok().and_then(|name| {
            name.parse::<ProfileName>()
                .map_err(|e| load_warnings.push(format!("Ignoring RATE_LIMITER_PROFILE: {}", e)))
                .ok()
        });

        let mut config = Config {
            api_base_url: env::var("API_BASE_URL")
                .unwrap_or_else(|_| "https://api.stickerdom.store".to_string()),
            jwt_token: env::var("STICKERDOM_JWT_TOKEN").unwrap_or_default(),
            payment_methods,
            request_timeout: secs("REQUEST_TIMEOUT", 30),
            max_retries_per_request: env::var("MAX_RETRIES_PER_REQUEST")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5),
            price_cache_ttl: secs("PRICE_CACHE_TTL", 30),
            stickers_per_purchase: env::var("STICKERS_PER_PURCHASE")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5),
            gas_amount: env::var("GAS_AMOUNT")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0.1),
            purchase_delay: secs("PURCHASE_DELAY", 1),
            stars_max_purchases: env::var("STARS_MAX_PURCHASES_PER_SESSION")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(3),
            collection_check_interval: secs("COLLECTION_CHECK_INTERVAL", 5),
            collection_not_found_retry: secs("COLLECTION_NOT_FOUND_RETRY", 30),
            dry_run_mode: flag("DRY_RUN_MODE", false),
            dry_run_balance_ton: env::var("DRY_RUN_BALANCE_TON")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(10.0),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_to_file: flag("LOG_TO_FILE", false),
            log_file_path: env::var("LOG_FILE_PATH")
                .unwrap_or_else(|_| "logs/sticker_bot.log".to_string()),
            rate_limiter_profile,
            rate_limiter: RateLimiterConfig::from_env(),
            load_warnings,
        };
        if let Some(profile) = rate_limiter_profile {
            config.apply_profile(&profile.profile());
        }
        config
    }

    /// Overrides the limiter and request knobs with a preset. Test-mode
    /// ceilings still apply on top.
    pub fn apply_profile(&mut self, profile: &RateLimiterProfile) {
        self.rate_limiter_profile = Some(profile.name);
        self.rate_limiter.max_delay = profile.max_delay;
        self.rate_limiter.preemptive_delay = profile.preemptive_delay;
        self.rate_limiter.circuit_breaker_threshold = profile.circuit_breaker_threshold;
        self.rate_limiter.circuit_breaker_cooldown = profile.circuit_breaker_cooldown;
        self.rate_limiter.backoff_multiplier = profile.backoff_multiplier;
        self.max_retries_per_request = profile.max_retries_per_request;
        self.price_cache_ttl = profile.price_cache_ttl;
        self.request_timeout = profile.request_timeout;

        let test_mode = self.rate_limiter.test_mode;
        self.rate_limiter = self.rate_limiter.clone().with_test_mode(test_mode);
    }

    pub fn validate(&self) -> Result<(), HunterError> {
        if self.jwt_token.trim().is_empty() {
            return Err(HunterError::Config(
                "STICKERDOM_JWT_TOKEN environment variable is required".to_string(),
            ));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(HunterError::Config("API_BASE_URL cannot be empty".to_string()));
        }
        if self.payment_methods.is_empty() {
            return Err(HunterError::Config(
                "At least one payment method must be specified in PAYMENT_METHODS".to_string(),
            ));
        }
        if self.stickers_per_purchase == 0 {
            return Err(HunterError::Config(
                "STICKERS_PER_PURCHASE must be positive".to_string(),
            ));
        }
        if !(self.gas_amount > 0.0) {
            return Err(HunterError::Config("GAS_AMOUNT must be positive".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(HunterError::Config("REQUEST_TIMEOUT must be positive".to_string()));
        }
        if self.collection_check_interval.is_zero() || self.collection_not_found_retry.is_zero() {
            return Err(HunterError::Config(
                "COLLECTION_CHECK_INTERVAL and COLLECTION_NOT_FOUND_RETRY must be positive"
                    .to_string(),
            ));
        }
        self.rate_limiter
            .validate()
            .map_err(|e| HunterError::Config(e.to_string()))
    }

    pub fn log_settings(&self) {
        for warning in &self.load_warnings {
            warn!("⚠️ {}", warning);
        }
        info!("Application Configuration Loaded: {:?}", self);
        if let Some(name) = self.rate_limiter_profile {
            let profile = name.profile();
            info!("🎛️ Rate limiter profile: {} ({})", profile.title, profile.description);
        }
        self.rate_limiter.log_summary();
        if self.dry_run_mode {
            info!("🎭 DRY RUN mode: no payments will be sent");
        }
    }

    pub fn api_client_config(&self) -> ApiClientConfig {
        ApiClientConfig {
            base_url: self.api_base_url.clone(),
            request_timeout: self.request_timeout,
            max_retries: self.max_retries_per_request,
            price_cache_ttl: self.price_cache_ttl,
        }
    }

    pub fn watch_settings(&self, continuous: bool) -> WatchSettings {
        WatchSettings {
            check_interval: self.collection_check_interval,
            not_found_retry: self.collection_not_found_retry,
            continuous,
        }
    }

    pub fn purchase_settings(&self) -> PurchaseSettings {
        PurchaseSettings {
            stickers_per_purchase: self.stickers_per_purchase,
            gas_amount: self.gas_amount,
            stars_max_purchases: self.stars_max_purchases,
            purchase_delay: self.purchase_delay,
        }
    }
}
