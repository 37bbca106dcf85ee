use async_trait::async_trait;
use bulkhead::{
    BoxError, BreakerConfig, BreakerState, DispatchError, Dispatcher, EngineBuilder, EngineConfig,
    ErrorKind, HealthStatus, Operation, PoolKind, QuotaConfig, RateLimit, Task, TierConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Stand-in for a downstream query.
#[derive(Clone, Default)]
struct Query {
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

impl Query {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operation for Query {
    type Output = Vec<String>;

    async fn execute(&self) -> Result<Vec<String>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            Err("relation does not exist".into())
        } else {
            Ok(vec!["row".to_string()])
        }
    }
}

fn default_dispatcher() -> Dispatcher {
    Dispatcher::from_config(&EngineConfig::default()).unwrap()
}

#[tokio::test]
async fn test_free_tier_quota_scenario() {
    let dispatcher = default_dispatcher();
    let query = Query::default();

    let mut allowed = 0;
    let mut limited = 0;
    for _ in 0..105 {
        match dispatcher
            .submit("free", Task::execute(query.clone()), "203.0.113.7")
            .await
        {
            Ok(_) => allowed += 1,
            Err(DispatchError::RateLimitExceeded { retry_after, .. }) => {
                assert!(retry_after <= Duration::from_secs(60));
                limited += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(allowed, 100);
    assert_eq!(limited, 5);
    assert_eq!(query.calls(), 100);

    let metrics = dispatcher.snapshot();
    let free = metrics.tier("free").unwrap();
    assert_eq!(free.rate_limiter.consumed, 100);
    assert_eq!(free.rate_limiter.quota, Some(100));
    // Denied requests never reach the breaker.
    assert_eq!(free.breaker.failure_count, 0);
}

#[tokio::test]
async fn test_quota_is_per_admission_key() {
    let dispatcher = EngineBuilder::new()
        .tier(
            "free",
            TierConfig::free().with_rate_limit(RateLimit::Quota(QuotaConfig::per_minute(3))),
        )
        .build()
        .unwrap();

    for _ in 0..3 {
        dispatcher
            .submit("free", Task::execute(Query::default()), "a")
            .await
            .unwrap();
    }
    let err = dispatcher
        .submit("free", Task::execute(Query::default()), "a")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);

    assert!(dispatcher
        .submit("free", Task::execute(Query::default()), "b")
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_trip_and_half_open_scenario() {
    let dispatcher = default_dispatcher();

    for _ in 0..10 {
        let err = dispatcher
            .submit("free", Task::<Query>::inject_fault(), "10.0.0.1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FaultInjected);
    }
    assert_eq!(
        dispatcher.snapshot().tier("free").unwrap().breaker.state,
        BreakerState::Open
    );

    // Within the reset timeout: rejected without running the body or
    // taking a permit from either pool.
    let free = dispatcher.registry().get("free").unwrap();
    let acquired = (
        free.resources().stats().total_acquired,
        free.workers().stats().total_acquired,
    );
    let query = Query::default();
    let err = dispatcher
        .submit("free", Task::execute(query.clone()), "10.0.0.1")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::CircuitOpen { .. }));
    assert_eq!(err.status_code(), http::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(query.calls(), 0);
    assert_eq!(
        (
            free.resources().stats().total_acquired,
            free.workers().stats().total_acquired,
        ),
        acquired
    );

    tokio::time::advance(Duration::from_secs(10)).await;

    // The next request is the half-open trial.
    let registry = dispatcher.registry().clone();
    let observed = Arc::new(AtomicUsize::new(usize::MAX));
    let trial = {
        let observed = observed.clone();
        bulkhead::operation(move || {
            let registry = registry.clone();
            let observed = observed.clone();
            async move {
                let state = registry.get("free").map(|tier| tier.breaker().state());
                observed.store(
                    usize::from(state == Some(BreakerState::HalfOpen)),
                    Ordering::SeqCst,
                );
                Ok::<_, BoxError>(())
            }
        })
    };
    dispatcher
        .submit("free", Task::execute(trial), "10.0.0.1")
        .await
        .unwrap();

    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert_eq!(
        dispatcher.snapshot().tier("free").unwrap().breaker.state,
        BreakerState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_exactly_one_trial() {
    let dispatcher = default_dispatcher();
    for _ in 0..10 {
        let _ = dispatcher
            .submit("pro", Task::<Query>::inject_fault(), "k")
            .await;
    }
    tokio::time::advance(Duration::from_secs(10)).await;

    let trial = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .submit("pro", Task::execute(Query::slow(Duration::from_secs(1))), "k")
                .await
        })
    };
    tokio::task::yield_now().await;

    let pro = dispatcher.registry().get("pro").unwrap();
    let acquired = (
        pro.resources().stats().total_acquired,
        pro.workers().stats().total_acquired,
    );
    let concurrent = Query::default();
    for _ in 0..5 {
        let err = dispatcher
            .submit("pro", Task::execute(concurrent.clone()), "k")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }
    assert_eq!(concurrent.calls(), 0);
    assert_eq!(
        (
            pro.resources().stats().total_acquired,
            pro.workers().stats().total_acquired,
        ),
        acquired
    );

    trial.await.unwrap().unwrap();
    assert_eq!(
        dispatcher.registry().get("pro").unwrap().breaker().state(),
        BreakerState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_enterprise_unaffected_while_free_is_open_and_saturated() {
    let dispatcher = EngineBuilder::new()
        .config(EngineConfig::default())
        .tier(
            "free",
            TierConfig::free()
                .with_acquire_timeout_ms(100)
                .with_breaker(BreakerConfig::new(60_000, 50, 10_000)),
        )
        .build()
        .unwrap();
    let enterprise_before = dispatcher.snapshot().tier("enterprise").cloned().unwrap();

    // Saturate free: two long queries hold both workers and both connections.
    let hogs: Vec<_> = (0..2)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .submit(
                        "free",
                        Task::execute(Query::slow(Duration::from_secs(30))),
                        &format!("hog-{i}"),
                    )
                    .await
            })
        })
        .collect();
    tokio::task::yield_now().await;

    // Starved callers time out in acquire and trip the breaker.
    for _ in 0..10 {
        let err = dispatcher
            .submit("free", Task::execute(Query::default()), "starved")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ResourceExhausted {
                pool: PoolKind::Worker,
                ..
            }
        ));
    }

    let free = dispatcher.snapshot().tier("free").cloned().unwrap();
    assert_eq!(free.breaker.state, BreakerState::Open);
    assert_eq!(free.workers.active, free.workers.max);
    assert_eq!(free.pool.active, free.pool.max);
    assert_eq!(free.health_status(), HealthStatus::Critical);

    // Nothing in enterprise moved.
    assert_eq!(
        dispatcher.snapshot().tier("enterprise").cloned().unwrap(),
        enterprise_before
    );

    let started = Instant::now();
    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .submit("enterprise", Task::execute(Query::default()), &format!("c{i}"))
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), vec!["row".to_string()]);
    }
    assert!(started.elapsed() < Duration::from_millis(50));

    let enterprise = dispatcher.snapshot().tier("enterprise").cloned().unwrap();
    assert_eq!(enterprise.breaker.state, BreakerState::Closed);
    assert_eq!(enterprise.pool.active, 0);
    assert_eq!(enterprise.health_status(), HealthStatus::Healthy);

    for hog in hogs {
        hog.await.unwrap().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_bound_concurrency_under_load() {
    let dispatcher = EngineBuilder::new()
        .tier(
            "pro",
            TierConfig::new(3, 3).with_breaker(BreakerConfig::new(30_000, 50, 10_000)),
        )
        .build()
        .unwrap();
    let query = Query::slow(Duration::from_millis(5));

    let tasks: Vec<_> = (0..30)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            let query = query.clone();
            tokio::spawn(async move {
                dispatcher
                    .submit("pro", Task::execute(query), &format!("k{i}"))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(query.peak.load(Ordering::SeqCst) <= 3);
    let tier = dispatcher.registry().get("pro").unwrap();
    let resources = tier.resources().stats();
    assert!(resources.peak_active <= 3);
    assert_eq!(resources.active, 0);
    assert_eq!(resources.total_acquired, 30);
    assert_eq!(tier.workers().stats().total_acquired, 30);
}

#[tokio::test]
async fn test_permits_released_after_downstream_failures() {
    let dispatcher = default_dispatcher();
    let query = Query::failing();

    for _ in 0..4 {
        let err = dispatcher
            .submit("enterprise", Task::execute(query.clone()), "k")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Downstream);
        assert!(err.to_string().contains("relation does not exist"));
    }

    let metrics = dispatcher.snapshot();
    let enterprise = metrics.tier("enterprise").unwrap();
    assert_eq!(enterprise.pool.active, 0);
    assert_eq!(enterprise.pool.idle, 10);
    assert_eq!(enterprise.workers.active, 0);
    assert_eq!(enterprise.breaker.failure_count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_submit_releases_permits() {
    let dispatcher = default_dispatcher();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(100),
        dispatcher.submit("pro", Task::execute(Query::slow(Duration::from_secs(2))), "k"),
    )
    .await;
    assert!(cancelled.is_err());

    let tier = dispatcher.registry().get("pro").unwrap();
    assert_eq!(tier.resources().active(), 0);
    assert_eq!(tier.workers().active(), 0);
    assert_eq!(tier.breaker().stats().window_len, 0);
}

#[tokio::test]
async fn test_error_kinds_map_to_distinct_statuses() {
    let dispatcher = EngineBuilder::new()
        .tier(
            "free",
            TierConfig::free().with_rate_limit(RateLimit::Quota(QuotaConfig::per_minute(1))),
        )
        .build()
        .unwrap();

    let invalid = dispatcher
        .submit("gold", Task::execute(Query::default()), "k")
        .await
        .unwrap_err();
    assert_eq!(invalid.status_code().as_u16(), 400);
    assert!(!invalid.is_retryable());

    dispatcher
        .submit("free", Task::execute(Query::default()), "k")
        .await
        .unwrap();
    let limited = dispatcher
        .submit("free", Task::execute(Query::default()), "k")
        .await
        .unwrap_err();
    assert_eq!(limited.status_code().as_u16(), 429);
    assert!(limited.is_retryable());

    let fault = dispatcher
        .submit("free", Task::<Query>::inject_fault(), "other")
        .await
        .unwrap_err();
    assert_eq!(fault.status_code().as_u16(), 500);
}

#[tokio::test]
async fn test_toml_configured_engine() {
    let config = EngineConfig::from_toml_str(
        r#"
        [tiers.basic]
        pool_capacity = 1
        worker_capacity = 1
        rate_limit = { quota = { points = 2, window_ms = 60000 } }

        [tiers.premium]
        pool_capacity = 4
        worker_capacity = 4
        rate_limit = "unlimited"
        breaker = { timeout_ms = 1000, error_threshold_percentage = 25, reset_timeout_ms = 500 }
        "#,
    )
    .unwrap();
    let dispatcher = EngineBuilder::new().config(config).build().unwrap();

    for _ in 0..2 {
        dispatcher
            .submit("basic", Task::execute(Query::default()), "k")
            .await
            .unwrap();
    }
    assert!(dispatcher
        .submit("basic", Task::execute(Query::default()), "k")
        .await
        .is_err());

    let json: serde_json::Value =
        serde_json::from_str(&dispatcher.snapshot().to_json().unwrap()).unwrap();
    assert_eq!(json["basic"]["rateLimiter"]["consumed"], 2);
    assert_eq!(json["premium"]["pool"]["max"], 4);
    assert_eq!(json["premium"]["breaker"]["state"], "CLOSED");
}
