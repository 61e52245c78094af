// src/purchase/strategies.rs
//! Payment strategies: one per way of paying for a sticker pack.

use super::models::{PaymentMethod, PurchaseRequest, PurchaseResult, PurchaseStatus};
use super::orchestrator::{calculate_max_purchases, PurchaseSettings};
use crate::api::{CharacterInfo, StickerdomApi};
use crate::error::{HunterError, Result};
use crate::wallet::{StarsPayment, WalletManager};
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Upper bound for a single pack price, anything above is treated as bogus data
const MAX_REASONABLE_PRICE_TON: f64 = 1000.0;
const TON_PAYMENT_TIMEOUT: Duration = Duration::from_secs(60);
const STARS_INVOICE_TIMEOUT: Duration = Duration::from_secs(30);
const STARS_PAYMENT_TIMEOUT: Duration = Duration::from_secs(120);

/// How many purchases a method can fund right now
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PurchasePlan {
    pub purchases: usize,
    /// Expected TON spend including gas, zero for Stars
    pub total_cost_ton: f64,
}

#[async_trait]
pub trait PaymentStrategy: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Purchases of `stickers_per_purchase` this method can make for `character`
    async fn max_purchases(&self, collection_id: u64, character: &CharacterInfo)
        -> Result<PurchasePlan>;

    /// One purchase of `count` stickers. Failures after an order was created
    /// come back as a non-successful [`PurchaseResult`], earlier ones as `Err`.
    async fn execute_purchase(
        &self,
        collection_id: u64,
        character_id: u64,
        count: u32,
    ) -> Result<PurchaseResult>;
}

/// Re-checks that the target is on sale and caps `count` at the stock left
async fn validate_target(
    api: &StickerdomApi,
    collection_id: u64,
    character_id: u64,
    count: u32,
) -> Result<u32> {
    if count == 0 {
        return Err(HunterError::Validation("Purchase count must be positive".to_string()));
    }
    let collection = api
        .get_collection(collection_id)
        .await?
        .filter(|c| c.is_active())
        .ok_or_else(|| {
            HunterError::CollectionNotAvailable(format!("Collection {} not available", collection_id))
        })?;
    let character = collection
        .character(character_id)
        .filter(|c| c.is_available())
        .ok_or_else(|| {
            HunterError::CollectionNotAvailable(format!("Character {} not available", character_id))
        })?;

    let left = u32::try_from(character.left).unwrap_or(u32::MAX);
    if left < count {
        warn!("Not enough stock. Requested: {}, available: {}", count, left);
    }
    Ok(count.min(left))
}

/// Purchases that the remaining stock allows, counting a final partial pack
fn purchases_by_stock(character: &CharacterInfo, stickers_per_purchase: u32) -> usize {
    let per = u64::from(stickers_per_purchase.max(1));
    ((character.left + per - 1) / per) as usize
}

pub struct TonPaymentStrategy {
    api: Arc<StickerdomApi>,
    wallet: Arc<dyn WalletManager>,
    settings: PurchaseSettings,
}

impl TonPaymentStrategy {
    pub fn new(
        api: Arc<StickerdomApi>,
        wallet: Arc<dyn WalletManager>,
        settings: PurchaseSettings,
    ) -> Self {
        Self {
            api,
            wallet,
            settings,
        }
    }

    async fn current_price(&self, collection_id: u64, character_id: u64) -> Result<f64> {
        let price = self
            .api
            .get_character_price(collection_id, character_id, PaymentMethod::Ton.as_str())
            .await?
            .ok_or_else(|| {
                HunterError::CollectionNotAvailable(format!(
                    "Could not get TON price for character {} in collection {}",
                    character_id, collection_id
                ))
            })?;
        if !(price > 0.0) {
            return Err(HunterError::Validation(format!(
                "Invalid price: {}. Must be positive",
                price
            )));
        }
        if price > MAX_REASONABLE_PRICE_TON {
            return Err(HunterError::Validation(format!(
                "Price too high: {} TON",
                price
            )));
        }
        Ok(price)
    }

    fn shortfall(&self, required: f64, balance: f64) -> String {
        format!(
            "Insufficient balance. Need {:.6} TON (incl. {:.6} gas), have {:.6} TON",
            required, self.settings.gas_amount, balance
        )
    }
}

#[async_trait]
impl PaymentStrategy for TonPaymentStrategy {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Ton
    }

    async fn max_purchases(
        &self,
        collection_id: u64,
        character: &CharacterInfo,
    ) -> Result<PurchasePlan> {
        let price = self.current_price(collection_id, character.id).await?;
        let wallet_info = self.wallet.wallet_info().await?;
        let (affordable, total_cost_ton) = calculate_max_purchases(
            wallet_info.balance_ton(),
            price,
            self.settings.stickers_per_purchase,
            self.settings.gas_amount,
        );

        if affordable == 0 {
            let required =
                price * f64::from(self.settings.stickers_per_purchase) + self.settings.gas_amount;
            return Err(HunterError::InsufficientBalance(
                self.shortfall(required, wallet_info.balance_ton()),
            ));
        }

        let by_stock = purchases_by_stock(character, self.settings.stickers_per_purchase);
        if by_stock < affordable {
            info!("Limiting purchases to {} due to stock availability", by_stock);
        }
        let purchases = affordable.min(by_stock);
        Ok(PurchasePlan {
            purchases,
            total_cost_ton: total_cost_ton / affordable as f64 * purchases as f64,
        })
    }

    async fn execute_purchase(
        &self,
        collection_id: u64,
        character_id: u64,
        count: u32,
    ) -> Result<PurchaseResult> {
        let count = validate_target(&self.api, collection_id, character_id, count).await?;
        let price = self.current_price(collection_id, character_id).await?;

        let wallet_info = self.wallet.wallet_info().await?;
        let required = price * f64::from(count) + self.settings.gas_amount;
        if !wallet_info.has_sufficient_balance(required) {
            return Err(HunterError::InsufficientBalance(
                self.shortfall(required, wallet_info.balance_ton()),
            ));
        }

        let order = self
            .api
            .initiate_purchase(collection_id, character_id, count)
            .await?;
        let request = PurchaseRequest {
            method: PaymentMethod::Ton,
            collection_id,
            character_id,
            count,
            price_per_item: price,
            total_amount: order.total_amount,
            order_id: order.order_id.clone(),
            destination_wallet: order.wallet.clone(),
            created_at: Utc::now(),
        };

        // The order amount is authoritative, check it before paying
        let final_info = self.wallet.wallet_info().await?;
        let required = order.total_amount_ton() + self.settings.gas_amount;
        if !final_info.has_sufficient_balance(required) {
            let message = self.shortfall(required, final_info.balance_ton());
            error!("❌ TON purchase failed: {}", message);
            return Ok(PurchaseResult::failed(
                PaymentMethod::Ton,
                Some(request),
                PurchaseStatus::Failed,
                message,
            ));
        }

        match timeout(
            TON_PAYMENT_TIMEOUT,
            self.wallet
                .send_payment(&order.wallet, order.total_amount, &order.order_id),
        )
        .await
        {
            Ok(Ok((tx_hash, completed_at))) => {
                info!("✅ TON purchase completed: {}", tx_hash);
                Ok(PurchaseResult::confirmed(request, tx_hash, completed_at))
            }
            Ok(Err(e)) => {
                error!("❌ TON payment failed: {}", e);
                Ok(PurchaseResult::failed(
                    PaymentMethod::Ton,
                    Some(request),
                    PurchaseStatus::Failed,
                    e.to_string(),
                ))
            }
            Err(_) => {
                error!("⌛ TON payment timed out for order {}", order.order_id);
                Ok(PurchaseResult::failed(
                    PaymentMethod::Ton,
                    Some(request),
                    PurchaseStatus::Timeout,
                    "Purchase timed out",
                ))
            }
        }
    }
}

pub struct StarsPaymentStrategy {
    api: Arc<StickerdomApi>,
    stars: Arc<dyn StarsPayment>,
    settings: PurchaseSettings,
}

impl StarsPaymentStrategy {
    pub fn new(
        api: Arc<StickerdomApi>,
        stars: Arc<dyn StarsPayment>,
        settings: PurchaseSettings,
    ) -> Self {
        Self {
            api,
            stars,
            settings,
        }
    }
}

#[async_trait]
impl PaymentStrategy for StarsPaymentStrategy {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Stars
    }

    async fn max_purchases(
        &self,
        _collection_id: u64,
        character: &CharacterInfo,
    ) -> Result<PurchasePlan> {
        // No balance to check, the session cap keeps the account safe
        let by_stock = purchases_by_stock(character, self.settings.stickers_per_purchase);
        Ok(PurchasePlan {
            purchases: self.settings.stars_max_purchases.min(by_stock),
            total_cost_ton: 0.0,
        })
    }

    async fn execute_purchase(
        &self,
        collection_id: u64,
        character_id: u64,
        count: u32,
    ) -> Result<PurchaseResult> {
        let count = validate_target(&self.api, collection_id, character_id, count).await?;

        let invoice_url = timeout(
            STARS_INVOICE_TIMEOUT,
            self.api
                .get_stars_invoice_url(collection_id, character_id, count),
        )
        .await
        .map_err(|_| HunterError::Payment("Stars invoice request timed out".to_string()))??;

        let payment_id = timeout(STARS_PAYMENT_TIMEOUT, self.stars.pay_invoice(&invoice_url))
            .await
            .map_err(|_| HunterError::Payment("Stars purchase timed out".to_string()))??;

        let request = PurchaseRequest {
            method: PaymentMethod::Stars,
            collection_id,
            character_id,
            count,
            price_per_item: 0.0,
            total_amount: 0,
            order_id: payment_id.clone(),
            destination_wallet: String::new(),
            created_at: Utc::now(),
        };
        info!("✅ Stars purchase completed: {}", payment_id);
        Ok(PurchaseResult::confirmed(request, payment_id, Utc::now()))
    }
}

/// The payment back ends a session can use. Either may be missing when
/// nothing implementing it is linked in.
#[derive(Clone, Default)]
pub struct PaymentCollaborators {
    pub wallet: Option<Arc<dyn WalletManager>>,
    pub stars: Option<Arc<dyn StarsPayment>>,
}

impl PaymentCollaborators {
    pub fn new(wallet: Arc<dyn WalletManager>, stars: Arc<dyn StarsPayment>) -> Self {
        Self {
            wallet: Some(wallet),
            stars: Some(stars),
        }
    }

    /// One strategy per method, in order. A method whose back end is missing
    /// is a configuration error.
    pub fn strategies(
        &self,
        methods: &[PaymentMethod],
        api: &Arc<StickerdomApi>,
        settings: PurchaseSettings,
    ) -> Result<Vec<Arc<dyn PaymentStrategy>>> {
        let mut strategies: Vec<Arc<dyn PaymentStrategy>> = Vec::with_capacity(methods.len());
        for method in methods {
            let strategy: Arc<dyn PaymentStrategy> = match method {
                PaymentMethod::Ton => {
                    let wallet = self.wallet.clone().ok_or_else(|| {
                        HunterError::Config("TON payments need a wallet, none is linked".to_string())
                    })?;
                    Arc::new(TonPaymentStrategy::new(api.clone(), wallet, settings))
                }
                PaymentMethod::Stars => {
                    let stars = self.stars.clone().ok_or_else(|| {
                        HunterError::Config(
                            "Stars payments need a Telegram client, none is linked".to_string(),
                        )
                    })?;
                    Arc::new(StarsPaymentStrategy::new(api.clone(), stars, settings))
                }
            };
            strategies.push(strategy);
        }
        Ok(strategies)
    }

    /// Startup check of every linked back end: wallet balance, Telegram reachability
    pub async fn verify(&self) -> Result<()> {
        if let Some(wallet) = &self.wallet {
            let info = wallet.wallet_info().await?;
            info!("💰 TON wallet {}: {:.9} TON", info.address, info.balance_ton());
            if info.balance_ton() < 0.1 {
                warn!("⚠️ Low wallet balance: {:.9} TON", info.balance_ton());
            }
        }
        if let Some(stars) = &self.stars {
            if !stars.check_connection().await {
                return Err(HunterError::Payment(
                    "Telegram is not reachable for Stars payments".to_string(),
                ));
            }
            info!("💫 Telegram Stars connection verified");
        }
        Ok(())
    }
}
