// src/purchase/models.rs

use crate::error::HunterError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    Ton,
    Stars,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Ton => "TON",
            PaymentMethod::Stars => "STARS",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = HunterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TON" => Ok(PaymentMethod::Ton),
            "STARS" => Ok(PaymentMethod::Stars),
            other => Err(HunterError::Config(format!(
                "Invalid payment method: {}. Must be one of: TON, STARS",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseStatus {
    Pending,
    Confirmed,
    Failed,
    Timeout,
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurchaseStatus::Pending => write!(f, "pending"),
            PurchaseStatus::Confirmed => write!(f, "confirmed"),
            PurchaseStatus::Failed => write!(f, "failed"),
            PurchaseStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// An order that has been created upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub method: PaymentMethod,
    pub collection_id: u64,
    pub character_id: u64,
    pub count: u32,
    /// TON per sticker, zero for Stars purchases
    pub price_per_item: f64,
    /// Nano-TON, zero for Stars purchases
    pub total_amount: u64,
    pub order_id: String,
    pub destination_wallet: String,
    pub created_at: DateTime<Utc>,
}

impl PurchaseRequest {
    pub fn total_amount_ton(&self) -> f64 {
        self.total_amount as f64 / 1e9
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseResult {
    pub method: PaymentMethod,
    /// `None` when the attempt failed before an order existed
    pub request: Option<PurchaseRequest>,
    pub transaction_hash: Option<String>,
    pub status: PurchaseStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl PurchaseResult {
    pub fn confirmed(request: PurchaseRequest, transaction_hash: String, at: DateTime<Utc>) -> Self {
        Self {
            method: request.method,
            request: Some(request),
            transaction_hash: Some(transaction_hash),
            status: PurchaseStatus::Confirmed,
            completed_at: Some(at),
            error_message: None,
        }
    }

    pub fn failed(
        method: PaymentMethod,
        request: Option<PurchaseRequest>,
        status: PurchaseStatus,
        error: impl Into<String>,
    ) -> Self {
        Self {
            method,
            request,
            transaction_hash: None,
            status,
            completed_at: Some(Utc::now()),
            error_message: Some(error.into()),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == PurchaseStatus::Confirmed
    }

    /// The failure was a lack of funds, further attempts are pointless
    pub fn is_insufficient_funds(&self) -> bool {
        self.error_message
            .as_deref()
            .map(|m| m.to_ascii_lowercase().contains("insufficient"))
            .unwrap_or(false)
    }
}
