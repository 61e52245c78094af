// src/wallet/mod.rs
//! Payment collaborators
//!
//! The purchase flow pays through two narrow interfaces:
//! - [`WalletManager`]: a TON wallet that can report its balance and send a payment
//! - [`StarsPayment`]: something that can settle a Telegram Stars invoice
//!
//! Transaction signing and Telegram sessions live outside this crate. The
//! [`dry_run`] implementations simulate both for planning and tests.

pub mod dry_run;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use dry_run::{DryRunStars, DryRunWallet};

pub const NANO_PER_TON: u64 = 1_000_000_000;

pub fn ton_to_nano(ton: f64) -> u64 {
    if !ton.is_finite() || ton <= 0.0 {
        return 0;
    }
    (ton * NANO_PER_TON as f64).round() as u64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub address: String,
    /// Balance in nano-TON
    pub balance: u64,
    pub seqno: u32,
    pub is_active: bool,
}

impl WalletInfo {
    pub fn balance_ton(&self) -> f64 {
        self.balance as f64 / NANO_PER_TON as f64
    }

    pub fn has_sufficient_balance(&self, required_ton: f64) -> bool {
        self.balance_ton() >= required_ton
    }
}

#[async_trait]
pub trait WalletManager: Send + Sync {
    async fn wallet_info(&self) -> Result<WalletInfo>;

    /// Sends `amount_nano` to `destination` with `comment` attached.
    /// Returns the transaction hash and when it was confirmed.
    async fn send_payment(
        &self,
        destination: &str,
        amount_nano: u64,
        comment: &str,
    ) -> Result<(String, DateTime<Utc>)>;
}

#[async_trait]
pub trait StarsPayment: Send + Sync {
    /// Pays the invoice and returns the payment identifier
    async fn pay_invoice(&self, invoice_url: &str) -> Result<String>;

    /// Whether the Telegram side is reachable
    async fn check_connection(&self) -> bool {
        true
    }
}
