// src/purchase/mod.rs
//! Purchase sessions: strategies per payment method and the orchestrator
//! that runs them against one collection/character target.

pub mod models;
pub mod orchestrator;
pub mod strategies;

pub use models::{PaymentMethod, PurchaseRequest, PurchaseResult, PurchaseStatus};
pub use orchestrator::{
    calculate_max_purchases, DryRunReport, PurchaseOrchestrator, PurchaseSettings,
};
pub use strategies::{
    PaymentCollaborators, PaymentStrategy, PurchasePlan, StarsPaymentStrategy, TonPaymentStrategy,
};
