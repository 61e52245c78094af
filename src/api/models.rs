// src/api/models.rs
//! Wire formats of the marketplace API and the domain types built from them.

use serde::{Deserialize, Serialize};

/// Every endpoint wraps its payload as `{ok, data, message}`
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub ok: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CollectionPayload {
    pub collection: RawCollection,
    #[serde(default)]
    pub characters: Vec<CharacterInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawCollection {
    pub id: u64,
    pub title: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub sold_count: u64,
}

fn default_status() -> String {
    "inactive".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterInfo {
    pub id: u64,
    pub name: String,
    /// Stickers left in stock
    #[serde(default)]
    pub left: u64,
    /// Price in stars per sticker
    #[serde(default)]
    pub price: f64,
}

impl CharacterInfo {
    pub fn is_available(&self) -> bool {
        self.left > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub total_count: u64,
    pub sold_count: u64,
    pub characters: Vec<CharacterInfo>,
}

impl CollectionInfo {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn character(&self, character_id: u64) -> Option<&CharacterInfo> {
        self.characters.iter().find(|c| c.id == character_id)
    }

    pub fn available_characters(&self) -> impl Iterator<Item = &CharacterInfo> {
        self.characters.iter().filter(|c| c.is_available())
    }
}

impl From<CollectionPayload> for CollectionInfo {
    fn from(payload: CollectionPayload) -> Self {
        Self {
            id: payload.collection.id,
            name: payload.collection.title,
            status: payload.collection.status,
            total_count: payload.collection.total_count,
            sold_count: payload.collection.sold_count,
            characters: payload.characters,
        }
    }
}

/// One entry of the crypto price list
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceQuote {
    pub token_symbol: String,
    pub price: f64,
}

/// Order created by the crypto buy endpoint, to be paid on-chain
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PurchaseData {
    pub order_id: String,
    /// Amount to pay, in nano-TON
    pub total_amount: u64,
    /// Destination wallet address
    pub wallet: String,
}

impl PurchaseData {
    pub fn total_amount_ton(&self) -> f64 {
        self.total_amount as f64 / 1e9
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct InvoicePayload {
    pub url: Option<String>,
}
