// src/rate_limiter/service.rs
//! The single choke point every outbound API call passes through.
//!
//! Callers hand [`RateLimiterService::execute`] a closure that performs one
//! network attempt. The service:
//! 1. fails fast with `CircuitOpen` while the breaker is open (CRITICAL
//!    callers get one trial call instead),
//! 2. queues the call and lets a single dispatcher task admit calls in
//!    priority order, pausing first when the known quota is exhausted,
//! 3. runs the attempt, folds its headers into [`RateLimitState`] and
//!    persists state, breaker and a metric before the caller sees a result,
//! 4. retries throttled (429) and upstream (5xx/transport) failures with
//!    backoff, within the priority's timeout budget. A retry that could not
//!    start before the budget ends is not attempted; the caller gets the
//!    last failure instead.
//!
//! Only 429 responses feed the circuit breaker. Upstream failures are tracked
//! in a separate counter that is reported in [`LimiterStats`].

use super::backoff::{BackoffCalculator, JitterSource};
use super::circuit_breaker::{CircuitBreaker, CircuitPhase};
use super::clock::{Clock, SystemClock};
use super::config::RateLimiterConfig;
use super::priority_queue::{PriorityQueue, QueuedRequest};
use super::state_store::StateStore;
use super::types::{
    Exchange, RateLimitState, RequestMetric, RequestPriority, ResponseClass, TransportError,
};
use crate::error::RateLimitError;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};

/// One unit of optimistic quota held by an admitted call. Given back when the
/// attempt is recorded, or on drop when the caller abandons the call.
#[derive(Debug)]
struct Reservation {
    reserved: Arc<AtomicU64>,
    held: bool,
}

impl Reservation {
    fn take(reserved: &Arc<AtomicU64>) -> Self {
        reserved.fetch_add(1, Ordering::SeqCst);
        Self {
            reserved: reserved.clone(),
            held: true,
        }
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.held) {
            // already zero when an authoritative quota reset it meanwhile
            let _ = self
                .reserved
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}

/// What the dispatcher grants a queued caller
#[derive(Debug)]
struct Admission {
    /// In-flight slot, released when the attempt has been recorded
    _permit: OwnedSemaphorePermit,
    /// Admitted as the CRITICAL trial call through an open breaker
    trial: bool,
    reservation: Reservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Throttled,
    Upstream,
}

/// A failed attempt that may be retried
#[derive(Debug, Clone)]
struct RetryableFailure {
    kind: FailureKind,
    status: Option<u16>,
    retry_after: Option<Duration>,
    message: String,
}

impl RetryableFailure {
    /// The error reported once no retries are left
    fn into_terminal(self, attempts: u32, last_retry_after: Option<Duration>) -> RateLimitError {
        match self.kind {
            FailureKind::Throttled => RateLimitError::RateLimited {
                retry_after: self.retry_after.or(last_retry_after),
            },
            FailureKind::Upstream => RateLimitError::UpstreamFailure {
                status: self.status,
                message: self.message,
                attempts,
            },
        }
    }
}

enum AttemptOutcome<T> {
    Delivered(Exchange<T>),
    Retryable(RetryableFailure),
}

/// Everything guarded by the service lock
#[derive(Debug)]
struct LimiterCore {
    state: RateLimitState,
    breaker: CircuitBreaker,
    consecutive_upstream_failures: u32,
}

impl LimiterCore {
    /// Ok(trial) when the request may be dispatched
    fn admission_verdict(
        &mut self,
        priority: RequestPriority,
        trial_spent: bool,
    ) -> Result<bool, RateLimitError> {
        if !self.breaker.is_open() {
            return Ok(false);
        }
        match priority {
            RequestPriority::Critical if !trial_spent => Ok(true),
            RequestPriority::Critical => Err(RateLimitError::RateLimited {
                retry_after: self.last_retry_after(),
            }),
            _ => Err(RateLimitError::CircuitOpen {
                retry_after: self.breaker.time_until_half_open(),
            }),
        }
    }

    /// How long dispatch should pause before the next admission, if at all.
    /// `reserved` counts admitted calls whose responses are still pending.
    fn admission_delay(
        &self,
        now: DateTime<Utc>,
        config: &RateLimiterConfig,
        reserved: u64,
    ) -> Option<Duration> {
        if let Some(wait) = self.state.quota_exhausted_wait(now, reserved) {
            return Some(wait.min(config.max_delay));
        }
        if config.preemptive_delay.is_zero() {
            return None;
        }
        match self.state.effective_remaining(reserved) {
            Some(remaining) if remaining <= config.low_quota_watermark => {
                Some(config.preemptive_delay.min(config.max_delay))
            }
            _ => None,
        }
    }

    fn last_retry_after(&self) -> Option<Duration> {
        self.state.retry_after.map(Duration::from_secs)
    }
}

/// Point-in-time view of the limiter, for logs and status output
#[derive(Debug, Clone)]
pub struct LimiterStats {
    pub state: RateLimitState,
    pub breaker_phase: CircuitPhase,
    pub consecutive_throttles: u32,
    pub consecutive_upstream_failures: u32,
    pub times_opened: u64,
    pub queue_depth: Vec<(RequestPriority, usize)>,
    pub available_slots: usize,
}

impl LimiterStats {
    pub fn queued(&self) -> usize {
        self.queue_depth.iter().map(|(_, n)| n).sum()
    }
}

impl fmt::Display for LimiterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quota = self
            .state
            .remaining_quota
            .map(|q| q.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let depth = self
            .queue_depth
            .iter()
            .map(|(p, n)| format!("{}={}", p, n))
            .collect::<Vec<_>>()
            .join(" ");
        write!(
            f,
            "quota: {}, breaker: {} (throttles: {}, opened: {}x), upstream failures: {}, queue: [{}], free slots: {}",
            quota,
            self.breaker_phase,
            self.consecutive_throttles,
            self.times_opened,
            self.consecutive_upstream_failures,
            depth,
            self.available_slots
        )
    }
}

struct ServiceInner {
    config: RateLimiterConfig,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    backoff: BackoffCalculator,
    queue: PriorityQueue<Admission>,
    permits: Arc<Semaphore>,
    core: Mutex<LimiterCore>,
    /// Admissions since the last authoritative quota, deducted from it
    reserved: Arc<AtomicU64>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ServiceInner {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Makes state and breaker durable in one write. Failure here is the one
    /// loud error.
    async fn persist(&self, core: &LimiterCore) -> Result<(), RateLimitError> {
        let result = self
            .store
            .save_snapshot(&core.state, &core.breaker.snapshot())
            .await;
        if let Err(e) = result {
            error!("💥 Failed to persist rate limiter state, crash-safety degraded: {}", e);
            return Err(RateLimitError::StatePersistence(e));
        }
        Ok(())
    }
}

/// Resolves once shutdown has been requested (or the service is gone)
async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Handle to the limiter. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct RateLimiterService {
    inner: Arc<ServiceInner>,
}

impl fmt::Debug for RateLimiterService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterService")
            .field("config", &self.inner.config)
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}

impl RateLimiterService {
    /// Validates `config`, loads persisted state and starts the dispatcher
    pub async fn init(
        config: RateLimiterConfig,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, RateLimitError> {
        Self::init_with(config, store, Arc::new(SystemClock::new()), JitterSource::Random).await
    }

    /// Like [`init`](Self::init) with an explicit clock and jitter source
    pub async fn init_with(
        config: RateLimiterConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        jitter: JitterSource,
    ) -> Result<Self, RateLimitError> {
        config.validate()?;
        config.log_summary();

        let state = store.load().await?;
        let snapshot = store.load_circuit().await?;
        info!(
            "📂 Loaded rate limit state: remaining={:?}, reset={:?}, retry_after={:?}",
            state.remaining_quota, state.reset_timestamp, state.retry_after
        );

        let mut breaker = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_cooldown,
            clock.clone(),
        );
        breaker.restore(snapshot);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(ServiceInner {
            backoff: BackoffCalculator::new(config.backoff_policy(), jitter),
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            queue: PriorityQueue::new(),
            core: Mutex::new(LimiterCore {
                state,
                breaker,
                consecutive_upstream_failures: 0,
            }),
            reserved: Arc::new(AtomicU64::new(0)),
            next_id: AtomicU64::new(1),
            shutdown_tx,
            dispatcher: std::sync::Mutex::new(None),
            config,
            store,
            clock,
        });

        let handle = tokio::spawn(dispatch_loop(inner.clone(), shutdown_rx));
        *inner.dispatcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!(
            "✅ Rate limiter service started{}",
            if inner.config.test_mode { " [TEST MODE]" } else { "" }
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    /// Runs `work` under admission control, retrying up to `max_retries`
    /// times after the first attempt.
    ///
    /// `work` must perform exactly one network attempt per call. Responses
    /// other than 429 and 5xx are returned to the caller as-is.
    pub async fn execute<T, F, Fut>(
        &self,
        priority: RequestPriority,
        max_retries: u32,
        mut work: F,
    ) -> Result<Exchange<T>, RateLimitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Exchange<T>, TransportError>>,
    {
        if !self.inner.config.enabled {
            return work().await.map_err(|e| RateLimitError::UpstreamFailure {
                status: None,
                message: e.to_string(),
                attempts: 1,
            });
        }
        if self.inner.is_shutting_down() {
            return Err(RateLimitError::ServiceShuttingDown);
        }

        let started = Instant::now();
        let deadline = started + priority.timeout_budget();
        let max_attempts = max_retries.saturating_add(1);
        let mut trial_spent = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            // Fast path: reject before queueing when the breaker forbids it
            self.inner
                .core
                .lock()
                .await
                .admission_verdict(priority, trial_spent)?;

            let mut admission = self
                .wait_for_turn(priority, started, deadline, trial_spent)
                .await?;
            if admission.trial {
                trial_spent = true;
                warn!("🚨 {} trial call admitted through open circuit breaker", priority);
            }

            let call_started = Instant::now();
            let result = work().await;
            let outcome = self
                .record_attempt(result, call_started.elapsed(), &mut admission)
                .await?;
            drop(admission);

            let failure = match outcome {
                AttemptOutcome::Delivered(exchange) => return Ok(exchange),
                AttemptOutcome::Retryable(failure) => failure,
            };

            if attempt >= max_attempts {
                let last_retry_after = self.inner.core.lock().await.last_retry_after();
                warn!(
                    "❌ {} request gave up after {} attempt(s): {}",
                    priority, attempt, failure.message
                );
                return Err(failure.into_terminal(attempt, last_retry_after));
            }

            let delay = self.inner.backoff.delay(attempt, failure.retry_after);
            if Instant::now() + delay > deadline {
                let last_retry_after = self.inner.core.lock().await.last_retry_after();
                warn!(
                    "⌛ {} request cannot wait {:?} for retry within its {:?} budget: {}",
                    priority,
                    delay,
                    priority.timeout_budget(),
                    failure.message
                );
                return Err(failure.into_terminal(attempt, last_retry_after));
            }
            warn!(
                "🔁 Attempt {}/{} for {} failed ({}), retrying in {:?}",
                attempt, max_attempts, priority, failure.message, delay
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_signal(self.inner.shutdown_tx.subscribe()) => {
                    return Err(RateLimitError::ServiceShuttingDown);
                }
            }
        }
    }

    async fn wait_for_turn(
        &self,
        priority: RequestPriority,
        started: Instant,
        deadline: Instant,
        trial_spent: bool,
    ) -> Result<Admission, RateLimitError> {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .queue
            .enqueue(QueuedRequest::new(id, priority, deadline, trial_spent, tx));

        match timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            // Completion handle dropped without an answer: the dispatcher is gone
            Ok(Err(_)) => Err(RateLimitError::ServiceShuttingDown),
            Err(_) => Err(RateLimitError::QueueTimeout {
                waited: started.elapsed(),
            }),
        }
    }

    /// Folds one attempt into the shared state and persists it
    async fn record_attempt<T>(
        &self,
        result: Result<Exchange<T>, TransportError>,
        response_time: Duration,
        admission: &mut Admission,
    ) -> Result<AttemptOutcome<T>, RateLimitError> {
        let now = self.inner.clock.now();
        let mut core = self.inner.core.lock().await;
        admission.reservation.release();

        let (outcome, metric) = match result {
            Ok(exchange) => {
                let meta = &exchange.meta;
                core.state.update_from_headers(meta, now);
                if meta.header("x-ratelimit-remaining").is_some() {
                    // fresh authoritative quota, older reservations no longer apply
                    self.inner.reserved.store(0, Ordering::SeqCst);
                }
                let class = meta.classify();
                let metric = RequestMetric {
                    timestamp: now,
                    endpoint: meta.endpoint.clone(),
                    status_code: Some(meta.status),
                    response_time,
                    was_rate_limited: class == ResponseClass::Throttled,
                };
                let outcome = match class {
                    ResponseClass::Delivered => {
                        core.state.record_validators(meta);
                        if admission.trial {
                            core.breaker.record_trial_success();
                        } else {
                            core.breaker.record_success();
                        }
                        core.consecutive_upstream_failures = 0;
                        AttemptOutcome::Delivered(exchange)
                    }
                    ResponseClass::Throttled => {
                        core.breaker.record_failure();
                        AttemptOutcome::Retryable(RetryableFailure {
                            kind: FailureKind::Throttled,
                            status: Some(meta.status),
                            retry_after: meta.retry_after(now),
                            message: format!("{} throttled (HTTP 429)", meta.endpoint),
                        })
                    }
                    ResponseClass::Upstream => {
                        core.consecutive_upstream_failures += 1;
                        AttemptOutcome::Retryable(RetryableFailure {
                            kind: FailureKind::Upstream,
                            status: Some(meta.status),
                            retry_after: None,
                            message: format!("{} returned HTTP {}", meta.endpoint, meta.status),
                        })
                    }
                };
                (outcome, metric)
            }
            Err(err) => {
                core.consecutive_upstream_failures += 1;
                let metric = RequestMetric {
                    timestamp: now,
                    endpoint: err.endpoint.clone(),
                    status_code: None,
                    response_time,
                    was_rate_limited: false,
                };
                let outcome = AttemptOutcome::Retryable(RetryableFailure {
                    kind: FailureKind::Upstream,
                    status: None,
                    retry_after: None,
                    message: err.to_string(),
                });
                (outcome, metric)
            }
        };

        self.inner.persist(&core).await?;
        if let Err(e) = self.inner.store.append_metric(&metric).await {
            warn!("⚠️ Failed to record request metric: {}", e);
        }
        debug!(
            "📊 {} -> {:?} in {:?}",
            metric.endpoint, metric.status_code, metric.response_time
        );
        Ok(outcome)
    }

    /// Conditional-request headers for `url` from the cached validators
    pub async fn conditional_headers(&self, url: &str) -> Vec<(String, String)> {
        self.inner.core.lock().await.state.conditional_headers(url)
    }

    pub async fn state_snapshot(&self) -> RateLimitState {
        self.inner.core.lock().await.state.clone()
    }

    pub async fn stats(&self) -> LimiterStats {
        let mut core = self.inner.core.lock().await;
        // refresh OPEN -> HALF_OPEN before reporting
        core.breaker.is_open();
        LimiterStats {
            state: core.state.clone(),
            breaker_phase: core.breaker.phase(),
            consecutive_throttles: core.breaker.consecutive_failures(),
            consecutive_upstream_failures: core.consecutive_upstream_failures,
            times_opened: core.breaker.times_opened(),
            queue_depth: self.inner.queue.depth_by_priority(),
            available_slots: self.inner.permits.available_permits(),
        }
    }

    /// Stops admission, fails everything still queued with
    /// `ServiceShuttingDown` and flushes state one last time.
    pub async fn shutdown(&self) -> Result<(), RateLimitError> {
        if self.inner.shutdown_tx.send_replace(true) {
            return Ok(());
        }
        info!("🛑 Shutting down rate limiter service...");

        let drained = self.inner.queue.close();
        if drained > 0 {
            warn!("🛑 Drained {} queued request(s) on shutdown", drained);
        }
        self.inner.permits.close();

        let handle = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Dispatcher task ended abnormally: {}", e);
            }
        }

        let core = self.inner.core.lock().await;
        self.inner.persist(&core).await?;
        info!("✅ Rate limiter stopped ({} drained)", drained);
        Ok(())
    }
}

/// Admits queued requests one at a time, highest priority first
async fn dispatch_loop(inner: Arc<ServiceInner>, shutdown_rx: watch::Receiver<bool>) {
    let mut held: Option<OwnedSemaphorePermit> = None;

    loop {
        let permit = match held.take() {
            Some(permit) => permit,
            None => match inner.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break, // semaphore closed on shutdown
            },
        };

        let Some(mut request) = inner.queue.dequeue().await else {
            break;
        };

        let pause = {
            let core = inner.core.lock().await;
            core.admission_delay(
                inner.clock.now(),
                &inner.config,
                inner.reserved.load(Ordering::SeqCst),
            )
        };
        if let Some(pause) = pause.filter(|_| !request.paused) {
            info!(
                "⏳ Quota low or exhausted, holding {} request #{} for {:?}",
                request.priority, request.id, pause
            );
            request.paused = true;
            inner.queue.enqueue(request);
            held = Some(permit);
            tokio::select! {
                _ = sleep_until(Instant::now() + pause) => {}
                _ = shutdown_signal(shutdown_rx.clone()) => break,
            }
            continue;
        }

        let mut core = inner.core.lock().await;
        match core.admission_verdict(request.priority, request.trial_spent) {
            Ok(trial) => {
                debug!("🚦 Admitting {} request #{}", request.priority, request.id);
                let admission = Admission {
                    _permit: permit,
                    trial,
                    reservation: Reservation::take(&inner.reserved),
                };
                // an abandoned caller drops the admission, returning slot and quota
                let id = request.id;
                if !request.complete(Ok(admission)) {
                    debug!("Request #{} was abandoned before admission", id);
                }
            }
            Err(err) => {
                debug!("🚫 Rejecting {} request #{}: {}", request.priority, request.id, err);
                request.complete(Err(err));
                held = Some(permit);
            }
        }
    }

    debug!("Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::state_store::MemoryStateStore;
    use crate::rate_limiter::types::ResponseMeta;
    use std::sync::atomic::AtomicU32;

    async fn service(store: Arc<MemoryStateStore>) -> RateLimiterService {
        let _ = env_logger::try_init();
        RateLimiterService::init_with(
            RateLimiterConfig::for_tests(),
            store,
            Arc::new(SystemClock::new()),
            JitterSource::None,
        )
        .await
        .unwrap()
    }

    fn respond(status: u16) -> Result<Exchange<u16>, TransportError> {
        Ok(Exchange::new(ResponseMeta::new("test", status), status))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_passes_value_through_and_persists() {
        let store = Arc::new(MemoryStateStore::new());
        let limiter = service(store.clone()).await;

        let exchange = limiter
            .execute(RequestPriority::Normal, 3, || async {
                Ok(Exchange::new(
                    ResponseMeta::new("collection", 200).with_header("x-ratelimit-remaining", "41"),
                    "body",
                ))
            })
            .await
            .unwrap();

        assert_eq!(exchange.value, "body");
        assert_eq!(store.saved_state().unwrap().remaining_quota, Some(41));
        assert_eq!(store.metrics().len(), 1);
        limiter.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_failures_retry_without_tripping_breaker() {
        let store = Arc::new(MemoryStateStore::new());
        let limiter = service(store.clone()).await;
        let calls = Arc::new(AtomicU32::new(0));

        let err = limiter
            .execute(RequestPriority::Critical, 3, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    respond(503)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(
            err,
            RateLimitError::UpstreamFailure {
                status: Some(503),
                attempts: 4,
                ..
            }
        ));
        let stats = limiter.stats().await;
        assert_eq!(stats.breaker_phase, CircuitPhase::Closed);
        assert_eq!(stats.consecutive_upstream_failures, 4);
        assert_eq!(stats.consecutive_throttles, 0);
        limiter.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_upstream_failures() {
        let limiter = service(Arc::new(MemoryStateStore::new())).await;

        let err = limiter
            .execute(RequestPriority::High, 1, || async {
                Err::<Exchange<()>, _>(TransportError::new("price", "connection reset"))
            })
            .await
            .unwrap_err();

        match err {
            RateLimitError::UpstreamFailure {
                status,
                message,
                attempts,
            } => {
                assert_eq!(status, None);
                assert_eq!(attempts, 2);
                assert!(message.contains("connection reset"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        limiter.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_exhausts_into_rate_limited_with_hint() {
        let limiter = service(Arc::new(MemoryStateStore::new())).await;

        let err = limiter
            .execute(RequestPriority::Critical, 1, || async {
                Ok(Exchange::new(
                    ResponseMeta::new("buy", 429).with_header("retry-after", "2"),
                    (),
                ))
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RateLimitError::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(2)
        ));
        limiter.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_beyond_budget_reports_the_hint() {
        let _ = env_logger::try_init();
        let limiter = RateLimiterService::init_with(
            RateLimiterConfig::default(),
            Arc::new(MemoryStateStore::new()),
            Arc::new(SystemClock::new()),
            JitterSource::None,
        )
        .await
        .unwrap();
        let started = Instant::now();

        let err = limiter
            .execute(RequestPriority::Critical, 5, || async {
                Ok(Exchange::new(
                    ResponseMeta::new("buy", 429).with_header("retry-after", "60"),
                    (),
                ))
            })
            .await
            .unwrap_err();

        match err {
            RateLimitError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(60)))
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
        limiter.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_call_gives_back_slot_and_reservation() {
        let _ = env_logger::try_init();
        let config = RateLimiterConfig {
            max_in_flight: 1,
            ..RateLimiterConfig::for_tests()
        };
        let limiter = RateLimiterService::init_with(
            config,
            Arc::new(MemoryStateStore::new()),
            Arc::new(SystemClock::new()),
            JitterSource::None,
        )
        .await
        .unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            limiter.execute(RequestPriority::Normal, 0, || async {
                sleep(Duration::from_secs(5)).await;
                respond(200)
            }),
        )
        .await;
        assert!(abandoned.is_err());

        assert_eq!(limiter.inner.reserved.load(Ordering::SeqCst), 0);

        // the only in-flight slot is free again
        let started = Instant::now();
        let exchange = limiter
            .execute(RequestPriority::Low, 0, || async { respond(200) })
            .await
            .unwrap();
        assert_eq!(exchange.value, 200);
        assert_eq!(started.elapsed(), Duration::ZERO);
        limiter.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_is_surfaced() {
        let store = Arc::new(MemoryStateStore::new());
        let limiter = service(store.clone()).await;
        store.set_fail_writes(true);

        let err = limiter
            .execute(RequestPriority::Normal, 0, || async { respond(200) })
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::StatePersistence(_)));

        store.set_fail_writes(false);
        limiter.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_limiter_passes_through_once() {
        let config = RateLimiterConfig {
            enabled: false,
            ..RateLimiterConfig::for_tests()
        };
        let store = Arc::new(MemoryStateStore::new());
        let limiter = RateLimiterService::init(config, store.clone()).await.unwrap();

        let exchange = limiter
            .execute(RequestPriority::Low, 5, || async { respond(429) })
            .await
            .unwrap();
        assert_eq!(exchange.status(), 429);
        assert!(store.metrics().is_empty());
        limiter.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_after_shutdown_is_rejected() {
        let limiter = service(Arc::new(MemoryStateStore::new())).await;
        limiter.shutdown().await.unwrap();
        let err = limiter
            .execute(RequestPriority::Critical, 0, || async { respond(200) })
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::ServiceShuttingDown));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_at_init() {
        let config = RateLimiterConfig {
            max_in_flight: 0,
            ..RateLimiterConfig::for_tests()
        };
        let err = RateLimiterService::init(config, Arc::new(MemoryStateStore::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidConfig(_)));
    }
}
