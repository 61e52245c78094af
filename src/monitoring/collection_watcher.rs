// src/monitoring/collection_watcher.rs
//! Waits for a drop: polls a collection through the rate limiter until the
//! target character is on sale, then hands the target to the purchase
//! orchestrator. Polling runs at NORMAL priority so purchase calls always
//! overtake it in the queue.

use crate::api::{CollectionInfo, StickerdomApi};
use crate::error::{HunterError, RateLimitError, Result};
use crate::purchase::{PurchaseOrchestrator, PurchaseResult};
use crate::rate_limiter::RequestPriority;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_NOT_FOUND_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchSettings {
    /// Pause between polls of a published collection
    pub check_interval: Duration,
    /// Pause between polls while the collection does not exist yet
    pub not_found_retry: Duration,
    /// Keep watching and buying after a session that bought something
    pub continuous: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            not_found_retry: DEFAULT_NOT_FOUND_RETRY,
            continuous: false,
        }
    }
}

/// What one poll found out about the target
#[derive(Debug, Clone, PartialEq)]
pub enum TargetStatus {
    /// 404, typical for an upcoming drop
    NotPublished,
    Inactive { status: String },
    CharacterMissing,
    SoldOut,
    OnSale { collection: CollectionInfo, left: u64 },
}

#[derive(Debug, Default)]
pub struct WatchSummary {
    pub polls: u64,
    pub sessions: usize,
    pub results: Vec<PurchaseResult>,
}

impl WatchSummary {
    pub fn confirmed(&self) -> usize {
        self.results.iter().filter(|r| r.is_successful()).count()
    }
}

pub struct CollectionWatcher {
    api: Arc<StickerdomApi>,
    settings: WatchSettings,
}

impl CollectionWatcher {
    pub fn new(api: Arc<StickerdomApi>, settings: WatchSettings) -> Self {
        Self { api, settings }
    }

    pub async fn check(&self, collection_id: u64, character_id: u64) -> Result<TargetStatus> {
        let Some(collection) = self
            .api
            .get_collection_with_priority(collection_id, RequestPriority::Normal)
            .await?
        else {
            return Ok(TargetStatus::NotPublished);
        };
        if !collection.is_active() {
            return Ok(TargetStatus::Inactive {
                status: collection.status,
            });
        }
        let status = match collection.character(character_id) {
            None => TargetStatus::CharacterMissing,
            Some(character) if !character.is_available() => TargetStatus::SoldOut,
            Some(character) => TargetStatus::OnSale {
                left: character.left,
                collection: collection.clone(),
            },
        };
        Ok(status)
    }

    /// Polls until the character is on sale and runs a purchase session.
    /// Returns after the first session that bought something, unless
    /// `continuous` is set, in which case it returns once the funds are
    /// exhausted or on a fatal error.
    pub async fn watch(
        &self,
        orchestrator: &PurchaseOrchestrator,
        collection_id: u64,
        character_id: u64,
    ) -> Result<WatchSummary> {
        if orchestrator.methods().is_empty() {
            return Err(HunterError::Config(
                "No payment methods configured".to_string(),
            ));
        }
        info!(
            "👀 Watching collection {}, character {}{}",
            collection_id,
            character_id,
            if self.settings.continuous { " (continuous)" } else { "" }
        );

        let mut summary = WatchSummary::default();
        let mut not_found = 0u64;
        let mut last_stock = 0u64;

        loop {
            summary.polls += 1;
            let pause = match self.check(collection_id, character_id).await {
                Ok(TargetStatus::NotPublished) => {
                    not_found += 1;
                    if not_found % 5 == 1 {
                        info!(
                            "⏳ Collection {} not found yet, waiting for it to appear (attempt #{})",
                            collection_id, not_found
                        );
                    }
                    self.settings.not_found_retry
                }
                Ok(TargetStatus::Inactive { status }) => {
                    debug!("Collection {} not active yet (status: {})", collection_id, status);
                    self.settings.check_interval
                }
                Ok(TargetStatus::CharacterMissing) => {
                    warn!("Character {} not found in collection {}", character_id, collection_id);
                    self.settings.check_interval
                }
                Ok(TargetStatus::SoldOut) => {
                    if last_stock > 0 {
                        info!("Character {} sold out", character_id);
                    }
                    last_stock = 0;
                    self.settings.check_interval
                }
                Ok(TargetStatus::OnSale { collection, left }) => {
                    if left > last_stock {
                        info!("🚀 {} is on sale, {} left", collection.name, left);
                    }
                    last_stock = left;

                    summary.sessions += 1;
                    let bought = match orchestrator
                        .execute_multiple_purchases(collection_id, character_id)
                        .await
                    {
                        Ok(results) => {
                            let bought = results.iter().filter(|r| r.is_successful()).count();
                            summary.results.extend(results);
                            bought
                        }
                        Err(HunterError::InsufficientBalance(reason)) if summary.confirmed() > 0 => {
                            info!("💸 Funds exhausted after {} purchase(s): {}", summary.confirmed(), reason);
                            return Ok(summary);
                        }
                        Err(e) if e.stops_session() => return Err(e),
                        Err(e) => {
                            error!("❌ Purchase session failed: {}", e);
                            0
                        }
                    };
                    if bought > 0 && !self.settings.continuous {
                        info!("✅ Bought {} pack(s), stopping watch", bought);
                        return Ok(summary);
                    }
                    if bought == 0 {
                        warn!("Nothing was bought this round, watching again");
                    }
                    self.settings.check_interval
                }
                Err(e) if e.stops_session() => return Err(e),
                Err(HunterError::RateLimit(RateLimitError::CircuitOpen { retry_after })) => {
                    warn!("🔴 Polling paused {:?} by open circuit breaker", retry_after);
                    retry_after.max(self.settings.check_interval)
                }
                Err(e) => {
                    error!("Error polling collection {}: {}", collection_id, e);
                    self.settings.check_interval
                }
            };
            sleep(pause).await;
        }
    }
}
