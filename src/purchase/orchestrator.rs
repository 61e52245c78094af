// src/purchase/orchestrator.rs
//! Runs purchase sessions across the configured payment strategies.

use super::models::{PaymentMethod, PurchaseResult, PurchaseStatus};
use super::strategies::{PaymentStrategy, PurchasePlan};
use crate::api::{CharacterInfo, StickerdomApi};
use crate::error::{HunterError, Result};
use futures::future::join_all;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Safety cap for a single session
const MAX_PURCHASES_PER_SESSION: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PurchaseSettings {
    pub stickers_per_purchase: u32,
    /// TON reserved per purchase for fees
    pub gas_amount: f64,
    pub stars_max_purchases: usize,
    pub purchase_delay: Duration,
}

impl Default for PurchaseSettings {
    fn default() -> Self {
        Self {
            stickers_per_purchase: 5,
            gas_amount: 0.1,
            stars_max_purchases: 3,
            purchase_delay: Duration::from_secs(1),
        }
    }
}

/// How many purchases of `stickers_per_purchase` the balance can fund, and what
/// they cost in total. `price_per_sticker` and `gas` are in TON.
pub fn calculate_max_purchases(
    balance: f64,
    price_per_sticker: f64,
    stickers_per_purchase: u32,
    gas: f64,
) -> (usize, f64) {
    if !(balance > 0.0) || !(price_per_sticker > 0.0) || stickers_per_purchase == 0 {
        return (0, 0.0);
    }
    let cost_per_purchase = price_per_sticker * f64::from(stickers_per_purchase) + gas.max(0.0);
    let affordable = (balance / cost_per_purchase).floor();
    if !affordable.is_finite() || affordable < 1.0 {
        return (0, 0.0);
    }
    let purchases = (affordable as usize).min(MAX_PURCHASES_PER_SESSION);
    (purchases, purchases as f64 * cost_per_purchase)
}

/// What a session would do, without paying for anything
#[derive(Debug, Clone, Default)]
pub struct DryRunReport {
    pub collection_name: Option<String>,
    pub character: Option<CharacterInfo>,
    pub plans: Vec<(PaymentMethod, PurchasePlan)>,
    /// Methods that cannot afford a single purchase, with the reason
    pub shortfalls: Vec<(PaymentMethod, String)>,
}

impl DryRunReport {
    pub fn total_purchases(&self) -> usize {
        self.plans.iter().map(|(_, p)| p.purchases).sum()
    }

    pub fn total_cost_ton(&self) -> f64 {
        self.plans.iter().map(|(_, p)| p.total_cost_ton).sum()
    }
}

pub struct PurchaseOrchestrator {
    api: Arc<StickerdomApi>,
    strategies: Vec<Arc<dyn PaymentStrategy>>,
    settings: PurchaseSettings,
}

impl PurchaseOrchestrator {
    pub fn new(api: Arc<StickerdomApi>, settings: PurchaseSettings) -> Self {
        Self {
            api,
            strategies: Vec::new(),
            settings,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn PaymentStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn methods(&self) -> Vec<PaymentMethod> {
        self.strategies.iter().map(|s| s.method()).collect()
    }

    async fn on_sale_character(&self, collection_id: u64, character_id: u64) -> Result<CharacterInfo> {
        let collection = self
            .api
            .get_collection(collection_id)
            .await?
            .filter(|c| c.is_active())
            .ok_or_else(|| {
                HunterError::CollectionNotAvailable(format!(
                    "Collection {} is not active",
                    collection_id
                ))
            })?;
        let character = collection
            .character(character_id)
            .filter(|c| c.is_available())
            .cloned()
            .ok_or_else(|| {
                HunterError::CollectionNotAvailable(format!(
                    "Character {} is sold out or missing in {}",
                    character_id, collection.name
                ))
            })?;
        info!(
            "🎯 {} / {}: {} left at {} per sticker",
            collection.name, character.name, character.left, character.price
        );
        Ok(character)
    }

    /// Runs every configured method, concurrently when there are several
    pub async fn execute_multiple_purchases(
        &self,
        collection_id: u64,
        character_id: u64,
    ) -> Result<Vec<PurchaseResult>> {
        match self.strategies.as_slice() {
            [] => Err(HunterError::Config(
                "No payment methods configured".to_string(),
            )),
            [only] => {
                self.execute_single_method_purchases(only.as_ref(), collection_id, character_id)
                    .await
            }
            strategies => {
                info!(
                    "🚀 Running {} payment methods concurrently",
                    strategies.len()
                );
                let sessions = strategies.iter().map(|s| {
                    self.execute_single_method_purchases(s.as_ref(), collection_id, character_id)
                });
                let outcomes = join_all(sessions).await;

                let mut combined = Vec::new();
                for (strategy, outcome) in strategies.iter().zip(outcomes) {
                    match outcome {
                        Ok(results) => combined.extend(results),
                        Err(e) => error!("❌ {} session failed: {}", strategy.method(), e),
                    }
                }
                log_summary(&combined);
                Ok(combined)
            }
        }
    }

    /// One sequential session for `strategy`. Stops at the first funding problem.
    pub async fn execute_single_method_purchases(
        &self,
        strategy: &dyn PaymentStrategy,
        collection_id: u64,
        character_id: u64,
    ) -> Result<Vec<PurchaseResult>> {
        let method = strategy.method();
        let character = self.on_sale_character(collection_id, character_id).await?;
        let plan = strategy.max_purchases(collection_id, &character).await?;
        if plan.purchases == 0 {
            warn!("{}: nothing to buy", method);
            return Ok(Vec::new());
        }
        info!(
            "🛒 {}: starting {} purchase(s) of {} sticker(s)",
            method, plan.purchases, self.settings.stickers_per_purchase
        );

        let mut results = Vec::with_capacity(plan.purchases);
        for i in 0..plan.purchases {
            match strategy
                .execute_purchase(collection_id, character_id, self.settings.stickers_per_purchase)
                .await
            {
                Ok(result) => {
                    let stop = !result.is_successful() && result.is_insufficient_funds();
                    if !result.is_successful() {
                        warn!(
                            "{} purchase {}/{} {}: {}",
                            method,
                            i + 1,
                            plan.purchases,
                            result.status,
                            result.error_message.as_deref().unwrap_or("unknown error")
                        );
                    }
                    results.push(result);
                    if stop {
                        warn!("💸 {}: out of funds, ending session", method);
                        break;
                    }
                }
                Err(e) => {
                    error!("❌ {} purchase {}/{} failed: {}", method, i + 1, plan.purchases, e);
                    results.push(PurchaseResult::failed(
                        method,
                        None,
                        PurchaseStatus::Failed,
                        e.to_string(),
                    ));
                    break;
                }
            }

            if i + 1 < plan.purchases && !self.settings.purchase_delay.is_zero() {
                tokio::time::sleep(self.settings.purchase_delay).await;
            }
        }

        let confirmed = results.iter().filter(|r| r.is_successful()).count();
        info!("📦 {}: {}/{} purchases confirmed", method, confirmed, results.len());
        Ok(results)
    }

    /// Plans a session for every method without paying
    pub async fn dry_run(&self, collection_id: u64, character_id: u64) -> Result<DryRunReport> {
        let Some(collection) = self.api.get_collection(collection_id).await? else {
            info!("🎭 Collection {} not found yet", collection_id);
            return Ok(DryRunReport::default());
        };
        let mut report = DryRunReport {
            collection_name: Some(collection.name.clone()),
            ..DryRunReport::default()
        };
        let character = collection.character(character_id).cloned().ok_or_else(|| {
            HunterError::CollectionNotAvailable(format!(
                "Character {} not found in {}",
                character_id, collection.name
            ))
        })?;
        report.character = Some(character.clone());
        if !collection.is_active() || !character.is_available() {
            info!("🎭 {} / {} is not on sale", collection.name, character.name);
            return Ok(report);
        }

        for strategy in &self.strategies {
            match strategy.max_purchases(collection_id, &character).await {
                Ok(plan) => report.plans.push((strategy.method(), plan)),
                Err(HunterError::InsufficientBalance(msg)) => {
                    report.shortfalls.push((strategy.method(), msg))
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

fn log_summary(results: &[PurchaseResult]) {
    let confirmed = results.iter().filter(|r| r.is_successful()).count();
    let spent: f64 = results
        .iter()
        .filter(|r| r.is_successful())
        .filter_map(|r| r.request.as_ref())
        .map(|r| r.total_amount_ton())
        .sum();
    info!(
        "📊 Session total: {}/{} purchases confirmed, {:.4} TON spent",
        confirmed,
        results.len(),
        spent
    );
}
