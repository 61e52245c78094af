// src/rate_limiter/state_store.rs
//! Durable storage for the limiter state.
//!
//! Implementations must make a write durable before returning from it; the
//! service relies on that to stay crash-consistent.

use super::circuit_breaker::CircuitSnapshot;
use super::types::{RateLimitState, RequestMetric};
use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Stored state, or the unconstrained default on first run
    async fn load(&self) -> Result<RateLimitState, StoreError>;

    async fn save(&self, state: &RateLimitState) -> Result<(), StoreError>;

    async fn load_circuit(&self) -> Result<CircuitSnapshot, StoreError>;

    async fn save_circuit(&self, snapshot: &CircuitSnapshot) -> Result<(), StoreError>;

    /// Writes state and breaker together: either both are durable or neither
    async fn save_snapshot(
        &self,
        state: &RateLimitState,
        circuit: &CircuitSnapshot,
    ) -> Result<(), StoreError>;

    /// Append-only, never read back by the limiter
    async fn append_metric(&self, metric: &RequestMetric) -> Result<(), StoreError>;
}

/// In-process store for tests and for running with persistence disabled
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<RateLimitState>>,
    circuit: Mutex<Option<CircuitSnapshot>>,
    metrics: Mutex<Vec<RequestMetric>>,
    fail_writes: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded as if a previous run had saved `state`
    pub fn with_state(state: RateLimitState) -> Self {
        let store = Self::default();
        *store.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
        store
    }

    pub fn with_circuit(self, snapshot: CircuitSnapshot) -> Self {
        *self.circuit.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
        self
    }

    /// Makes every subsequent write fail, to exercise persistence errors
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn saved_state(&self) -> Option<RateLimitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn saved_circuit(&self) -> Option<CircuitSnapshot> {
        self.circuit.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn metrics(&self) -> Vec<RequestMetric> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("simulated write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<RateLimitState, StoreError> {
        Ok(self.saved_state().unwrap_or_default())
    }

    async fn save(&self, state: &RateLimitState) -> Result<(), StoreError> {
        self.check_writable()?;
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        Ok(())
    }

    async fn load_circuit(&self) -> Result<CircuitSnapshot, StoreError> {
        Ok(self.saved_circuit().unwrap_or_default())
    }

    async fn save_circuit(&self, snapshot: &CircuitSnapshot) -> Result<(), StoreError> {
        self.check_writable()?;
        *self.circuit.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(())
    }

    async fn save_snapshot(
        &self,
        state: &RateLimitState,
        circuit: &CircuitSnapshot,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        *self.circuit.lock().unwrap_or_else(|e| e.into_inner()) = Some(circuit.clone());
        Ok(())
    }

    async fn append_metric(&self, metric: &RequestMetric) -> Result<(), StoreError> {
        self.check_writable()?;
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(metric.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_run_is_unconstrained() {
        let store = MemoryStateStore::new();
        let state = store.load().await.unwrap();
        assert_eq!(state, RateLimitState::default());
        assert_eq!(state.remaining_quota, None);
        assert_eq!(store.load_circuit().await.unwrap(), CircuitSnapshot::default());
    }

    #[tokio::test]
    async fn test_failed_writes_surface_as_errors() {
        let store = MemoryStateStore::new();
        store.set_fail_writes(true);
        let err = store.save(&RateLimitState::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(store.saved_state().is_none());
    }

    #[tokio::test]
    async fn test_failed_snapshot_writes_neither_part() {
        let store = MemoryStateStore::new();
        store.set_fail_writes(true);
        let circuit = CircuitSnapshot {
            consecutive_failures: 1,
            opened_at: None,
        };
        assert!(store
            .save_snapshot(&RateLimitState::default(), &circuit)
            .await
            .is_err());
        assert!(store.saved_state().is_none());
        assert!(store.saved_circuit().is_none());

        store.set_fail_writes(false);
        store
            .save_snapshot(&RateLimitState::default(), &circuit)
            .await
            .unwrap();
        assert_eq!(store.load_circuit().await.unwrap(), circuit);
    }
}
