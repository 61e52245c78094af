// src/wallet/dry_run.rs
//! Simulated payment collaborators. Nothing leaves the process.

use super::{StarsPayment, WalletInfo, WalletManager};
use crate::error::{HunterError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Wallet with an in-memory balance that payments are deducted from
#[derive(Debug)]
pub struct DryRunWallet {
    address: String,
    balance: Mutex<u64>,
    sent: AtomicU64,
}

impl DryRunWallet {
    pub fn new(address: impl Into<String>, balance_nano: u64) -> Self {
        Self {
            address: address.into(),
            balance: Mutex::new(balance_nano),
            sent: AtomicU64::new(0),
        }
    }

    /// Number of payments sent so far
    pub fn payments_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletManager for DryRunWallet {
    async fn wallet_info(&self) -> Result<WalletInfo> {
        let balance = *self.balance.lock().unwrap_or_else(|e| e.into_inner());
        Ok(WalletInfo {
            address: self.address.clone(),
            balance,
            seqno: self.sent.load(Ordering::SeqCst) as u32,
            is_active: true,
        })
    }

    async fn send_payment(
        &self,
        destination: &str,
        amount_nano: u64,
        comment: &str,
    ) -> Result<(String, DateTime<Utc>)> {
        let mut balance = self.balance.lock().unwrap_or_else(|e| e.into_inner());
        if *balance < amount_nano {
            return Err(HunterError::InsufficientBalance(format!(
                "Insufficient balance for {} nano-TON payment, have {}",
                amount_nano, *balance
            )));
        }
        *balance -= amount_nano;
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "🎭 DRY RUN: would send {} nano-TON to {} (comment: {})",
            amount_nano, destination, comment
        );
        Ok((format!("dry-run-tx-{}", n), Utc::now()))
    }
}

/// Stars payer that accepts every invoice
#[derive(Debug, Default)]
pub struct DryRunStars {
    paid: AtomicU64,
}

impl DryRunStars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invoices_paid(&self) -> u64 {
        self.paid.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StarsPayment for DryRunStars {
    async fn pay_invoice(&self, invoice_url: &str) -> Result<String> {
        if invoice_url.is_empty() {
            return Err(HunterError::Payment("Empty invoice URL".to_string()));
        }
        let n = self.paid.fetch_add(1, Ordering::SeqCst) + 1;
        info!("🎭 DRY RUN: would pay Stars invoice {}", invoice_url);
        Ok(format!("dry-run-stars-{}", n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_wallet_deducts_and_refuses_overdraft() {
        let wallet = DryRunWallet::new("EQdry", 3_000_000_000);
        let (tx, _) = wallet
            .send_payment("EQshop", 2_000_000_000, "ord-1")
            .await
            .unwrap();
        assert_eq!(tx, "dry-run-tx-1");
        assert_eq!(wallet.wallet_info().await.unwrap().balance, 1_000_000_000);

        let err = wallet
            .send_payment("EQshop", 2_000_000_000, "ord-2")
            .await
            .unwrap_err();
        assert!(matches!(err, HunterError::InsufficientBalance(_)));
        assert_eq!(wallet.payments_sent(), 1);
    }
}
