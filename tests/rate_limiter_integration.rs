use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use sticker_hunter::error::RateLimitError;
use sticker_hunter::rate_limiter::{
    compute_delay, BackoffPolicy, CircuitPhase, Clock, Exchange, JitterSource, MemoryStateStore,
    RateLimitState, RateLimiterConfig, RateLimiterService, RequestPriority, ResponseMeta,
    SqliteStateStore, SystemClock, TransportError,
};
use tokio::time::{sleep, Instant};

fn respond(status: u16) -> Result<Exchange<u16>, TransportError> {
    Ok(Exchange::new(ResponseMeta::new("test", status), status))
}

async fn limiter_with(
    config: RateLimiterConfig,
    store: Arc<MemoryStateStore>,
    clock: Arc<SystemClock>,
) -> RateLimiterService {
    let _ = env_logger::try_init();
    RateLimiterService::init_with(config, store, clock, JitterSource::None)
        .await
        .unwrap()
}

async fn limiter(config: RateLimiterConfig) -> RateLimiterService {
    limiter_with(
        config,
        Arc::new(MemoryStateStore::new()),
        Arc::new(SystemClock::new()),
    )
    .await
}

/// Occupies the only in-flight slot for `hold`
fn spawn_blocker(limiter: &RateLimiterService, hold: Duration) -> tokio::task::JoinHandle<()> {
    let limiter = limiter.clone();
    tokio::spawn(async move {
        limiter
            .execute(RequestPriority::Critical, 0, || async move {
                sleep(hold).await;
                respond(200)
            })
            .await
            .unwrap();
    })
}

async fn throttle_until_open(limiter: &RateLimiterService) {
    let err = limiter
        .execute(RequestPriority::Critical, 2, || async { respond(429) })
        .await
        .unwrap_err();
    assert!(matches!(err, RateLimitError::RateLimited { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_higher_priority_dispatched_first() {
    let config = RateLimiterConfig {
        max_in_flight: 1,
        ..RateLimiterConfig::for_tests()
    };
    let limiter = limiter(config).await;
    let blocker = spawn_blocker(&limiter, Duration::from_millis(100));
    tokio::task::yield_now().await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for priority in [
        RequestPriority::Low,
        RequestPriority::Normal,
        RequestPriority::Low,
        RequestPriority::High,
        RequestPriority::Critical,
    ] {
        let limiter = limiter.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            limiter
                .execute(priority, 0, || {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(priority);
                        respond(200)
                    }
                })
                .await
        }));
    }

    blocker.await.unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(
        *order.lock().unwrap(),
        vec![
            RequestPriority::Critical,
            RequestPriority::High,
            RequestPriority::Normal,
            RequestPriority::Low,
            RequestPriority::Low,
        ]
    );
    limiter.shutdown().await.unwrap();
}

#[test]
fn test_backoff_monotonic_and_capped() {
    let policy = BackoffPolicy {
        max_delay: Duration::from_secs(10),
        ..BackoffPolicy::default()
    };
    let mut previous = Duration::ZERO;
    for attempt in 1..=12 {
        let delay = compute_delay(&policy, attempt, None, 0.0);
        assert!(delay >= previous);
        assert!(delay <= policy.max_delay);
        previous = delay;
    }
    assert_eq!(previous, Duration::from_secs(10));

    for hint in [1, 10, 3600, 86_400] {
        let delay = compute_delay(&policy, 1, Some(Duration::from_secs(hint)), 1.0);
        assert!(delay <= policy.max_delay);
    }
    // jitter never escapes the ceiling either
    assert!(compute_delay(&policy, 4, None, 1.0) <= policy.max_delay);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_three_throttles_and_recovers() {
    let limiter = limiter(RateLimiterConfig::for_tests()).await;
    throttle_until_open(&limiter).await;

    let stats = limiter.stats().await;
    assert_eq!(stats.breaker_phase, CircuitPhase::Open);
    assert_eq!(stats.consecutive_throttles, 3);

    // cool-down is 5s in test mode
    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(limiter.stats().await.breaker_phase, CircuitPhase::Open);
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(limiter.stats().await.breaker_phase, CircuitPhase::HalfOpen);

    limiter
        .execute(RequestPriority::Normal, 0, || async { respond(200) })
        .await
        .unwrap();
    let stats = limiter.stats().await;
    assert_eq!(stats.breaker_phase, CircuitPhase::Closed);
    assert_eq!(stats.times_opened, 1);
    limiter.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_critical_call_admitted_while_normal_rejected() {
    let limiter = limiter(RateLimiterConfig::for_tests()).await;
    throttle_until_open(&limiter).await;

    let calls = Arc::new(AtomicU32::new(0));
    let counted = |status: u16| {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                respond(status)
            }
        }
    };

    let err = limiter
        .execute(RequestPriority::Normal, 3, counted(200))
        .await
        .unwrap_err();
    match err {
        RateLimitError::CircuitOpen { retry_after } => {
            assert!(retry_after > Duration::ZERO && retry_after <= Duration::from_secs(5))
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // A throttled trial call is not retried through the open breaker
    let err = limiter
        .execute(RequestPriority::Critical, 3, counted(429))
        .await
        .unwrap_err();
    assert!(matches!(err, RateLimitError::RateLimited { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A fresh CRITICAL caller gets its own trial call, and success closes the breaker
    let exchange = limiter
        .execute(RequestPriority::Critical, 3, counted(200))
        .await
        .unwrap();
    assert_eq!(exchange.value, 200);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(limiter.stats().await.breaker_phase, CircuitPhase::Closed);
    limiter.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_quota_holds_dispatch_until_reset() {
    let clock = Arc::new(SystemClock::new());
    let state = RateLimitState {
        remaining_quota: Some(0),
        reset_timestamp: Some(clock.now() + chrono::Duration::seconds(2)),
        ..RateLimitState::default()
    };
    let limiter = limiter_with(
        RateLimiterConfig::for_tests(),
        Arc::new(MemoryStateStore::with_state(state)),
        clock,
    )
    .await;

    let started = Instant::now();
    let dispatched_at = Arc::new(Mutex::new(None));
    let seen = dispatched_at.clone();
    limiter
        .execute(RequestPriority::Normal, 0, move || {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = Some(Instant::now());
                Ok(Exchange::new(
                    ResponseMeta::new("collection", 200).with_header("x-ratelimit-remaining", "50"),
                    (),
                ))
            }
        })
        .await
        .unwrap();

    let dispatched_at = dispatched_at.lock().unwrap().unwrap();
    assert!(dispatched_at - started >= Duration::from_secs(2));
    assert_eq!(limiter.state_snapshot().await.remaining_quota, Some(50));
    limiter.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_twenty_concurrent_requests_with_periodic_throttling() {
    let limiter = limiter(RateLimiterConfig::for_tests()).await;
    let calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = limiter.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            let budget = RequestPriority::Normal.timeout_budget();
            tokio::time::timeout(
                budget + Duration::from_secs(1),
                limiter.execute(RequestPriority::Normal, 3, || {
                    let calls = calls.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        respond(if n % 5 == 0 { 429 } else { 200 })
                    }
                }),
            )
            .await
        }));
    }

    let mut delivered = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().expect("request hung past its budget");
        match outcome {
            Ok(exchange) => {
                assert_eq!(exchange.value, 200);
                delivered += 1;
            }
            Err(RateLimitError::RateLimited { .. })
            | Err(RateLimitError::CircuitOpen { .. })
            | Err(RateLimitError::QueueTimeout { .. }) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert!(delivered > 0);
    assert!(limiter.stats().await.times_opened <= 1);
    limiter.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_queued_requests() {
    let config = RateLimiterConfig {
        max_in_flight: 1,
        ..RateLimiterConfig::for_tests()
    };
    let limiter = limiter(config).await;
    let blocker = spawn_blocker(&limiter, Duration::from_millis(200));
    tokio::task::yield_now().await;

    let mut queued = Vec::new();
    for _ in 0..3 {
        let limiter = limiter.clone();
        queued.push(tokio::spawn(async move {
            limiter
                .execute(RequestPriority::High, 0, || async { respond(200) })
                .await
        }));
    }
    sleep(Duration::from_millis(10)).await;
    assert_eq!(limiter.stats().await.queued(), 3);

    limiter.shutdown().await.unwrap();
    for handle in queued {
        assert!(matches!(
            handle.await.unwrap(),
            Err(RateLimitError::ServiceShuttingDown)
        ));
    }
    // the call already admitted still finishes
    blocker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_wait_beyond_budget_is_queue_timeout() {
    let config = RateLimiterConfig {
        max_in_flight: 1,
        ..RateLimiterConfig::for_tests()
    };
    let limiter = limiter(config).await;
    let blocker = spawn_blocker(&limiter, Duration::from_secs(6));
    tokio::task::yield_now().await;

    let started = Instant::now();
    let err = limiter
        .execute(RequestPriority::Low, 0, || async { respond(200) })
        .await
        .unwrap_err();
    match err {
        RateLimitError::QueueTimeout { waited } => {
            assert!(waited >= RequestPriority::Low.timeout_budget());
            assert!(started.elapsed() < Duration::from_secs(6));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    blocker.await.unwrap();
    limiter.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_open_breaker_survives_restart_with_sqlite() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state").join("rate_limiter.db");
    let config = RateLimiterConfig {
        base_delay: Duration::from_millis(10),
        db_path: db_path.clone(),
        ..RateLimiterConfig::for_tests()
    };

    {
        let store = Arc::new(SqliteStateStore::open(&db_path).await.unwrap());
        let limiter = RateLimiterService::init(config.clone(), store.clone())
            .await
            .unwrap();
        let err = limiter
            .execute(RequestPriority::Critical, 2, || async {
                Ok(Exchange::new(
                    ResponseMeta::new("buy", 429).with_header("x-ratelimit-remaining", "0"),
                    (),
                ))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::RateLimited { .. }));
        limiter.shutdown().await.unwrap();
        assert_eq!(store.metric_count().await.unwrap(), 3);
        store.close().await;
    }

    let store = Arc::new(SqliteStateStore::open(&db_path).await.unwrap());
    let limiter = RateLimiterService::init(config, store.clone()).await.unwrap();
    let stats = limiter.stats().await;
    assert_eq!(stats.breaker_phase, CircuitPhase::Open);
    assert_eq!(stats.state.remaining_quota, Some(0));

    let err = limiter
        .execute(RequestPriority::Normal, 0, || async { respond(200) })
        .await
        .unwrap_err();
    assert!(matches!(err, RateLimitError::CircuitOpen { .. }));
    limiter.shutdown().await.unwrap();
    store.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_straggler_success_leaves_breaker_open() {
    let limiter = limiter(RateLimiterConfig::for_tests()).await;
    let straggler = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .execute(RequestPriority::Normal, 0, || async {
                    sleep(Duration::from_secs(4)).await;
                    respond(200)
                })
                .await
        })
    };
    tokio::task::yield_now().await;

    // throttles at t=0s, 1s and 3s open the breaker until t=8s
    throttle_until_open(&limiter).await;
    assert_eq!(limiter.stats().await.breaker_phase, CircuitPhase::Open);

    // admitted before the trip, answers at t=4s
    assert_eq!(straggler.await.unwrap().unwrap().value, 200);
    let stats = limiter.stats().await;
    assert_eq!(stats.breaker_phase, CircuitPhase::Open);
    assert_eq!(stats.consecutive_throttles, 3);

    let err = limiter
        .execute(RequestPriority::Normal, 0, || async { respond(200) })
        .await
        .unwrap_err();
    assert!(matches!(err, RateLimitError::CircuitOpen { .. }));
    limiter.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_low_quota_slows_dispatch_preemptively() {
    let clock = Arc::new(SystemClock::new());
    let config = RateLimiterConfig {
        preemptive_delay: Duration::from_secs(2),
        low_quota_watermark: 10,
        ..RateLimiterConfig::for_tests()
    };
    let state = RateLimitState {
        remaining_quota: Some(5),
        ..RateLimitState::default()
    };
    let limiter = limiter_with(config, Arc::new(MemoryStateStore::with_state(state)), clock).await;

    let dispatch = |remaining: &'static str| {
        let limiter = limiter.clone();
        async move {
            let started = Instant::now();
            let dispatched_at = Arc::new(Mutex::new(None));
            let seen = dispatched_at.clone();
            limiter
                .execute(RequestPriority::Normal, 0, move || {
                    let seen = seen.clone();
                    async move {
                        *seen.lock().unwrap() = Some(Instant::now());
                        Ok(Exchange::new(
                            ResponseMeta::new("collection", 200)
                                .with_header("x-ratelimit-remaining", remaining),
                            (),
                        ))
                    }
                })
                .await
                .unwrap();
            let dispatched_at = dispatched_at.lock().unwrap().unwrap();
            dispatched_at - started
        }
    };

    assert_eq!(dispatch("50").await, Duration::from_secs(2));
    // quota recovered above the watermark
    assert_eq!(dispatch("49").await, Duration::ZERO);
    limiter.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_admissions_reserve_known_quota() {
    let clock = Arc::new(SystemClock::new());
    let state = RateLimitState {
        remaining_quota: Some(2),
        reset_timestamp: Some(clock.now() + chrono::Duration::seconds(3)),
        ..RateLimitState::default()
    };
    let limiter = limiter_with(
        RateLimiterConfig::for_tests(),
        Arc::new(MemoryStateStore::with_state(state)),
        clock,
    )
    .await;

    let started = Instant::now();
    let starts = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for _ in 0..3 {
        let limiter = limiter.clone();
        let starts = starts.clone();
        handles.push(tokio::spawn(async move {
            limiter
                .execute(RequestPriority::Normal, 0, || {
                    let starts = starts.clone();
                    async move {
                        starts.lock().unwrap().push(Instant::now() - started);
                        sleep(Duration::from_secs(1)).await;
                        respond(200)
                    }
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // two admissions use up the quota of 2, the third waits for the reset
    let mut starts = starts.lock().unwrap().clone();
    starts.sort();
    assert_eq!(starts[0], Duration::ZERO);
    assert_eq!(starts[1], Duration::ZERO);
    assert!(starts[2] >= Duration::from_secs(3));
    limiter.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retries_stop_when_next_backoff_misses_the_deadline() {
    let limiter = limiter(RateLimiterConfig::for_tests()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let started = Instant::now();

    let err = limiter
        .execute(RequestPriority::Critical, 10, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                respond(503)
            }
        })
        .await
        .unwrap_err();

    // attempts at 0, 1, 3, 7, 15 and 25s; the next 10s backoff would end past 30s
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(started.elapsed(), Duration::from_secs(25));
    assert!(matches!(
        err,
        RateLimitError::UpstreamFailure {
            status: Some(503),
            attempts: 6,
            ..
        }
    ));
    limiter.shutdown().await.unwrap();
}
