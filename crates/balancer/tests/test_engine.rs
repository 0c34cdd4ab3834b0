use async_trait::async_trait;
use balancer::{
    BalancerConfig, BalancerError, BalancerRequest, Clock, DrainOutcome, HealthProbe,
    LoadBalancer, LoadedRows, ManualClock, ProbeSet, Provider, ProviderKind, ProviderSpec, ProviderStore, RequestLogEntry,
    RequestPriority, RequestStatus, ScaleAction, ScalingPolicy, ScalingPolicySpec, StoreError,
    StrategyConfig, TriggerMetric,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

async fn engine_with(config: BalancerConfig, clock: &ManualClock) -> LoadBalancer {
    LoadBalancer::builder(config)
        .probes(ProbeSet::new())
        .clock(Arc::new(clock.clone()))
        .build()
        .await
        .expect("failed to build engine")
}

fn openai(name: &str) -> ProviderSpec {
    ProviderSpec::new(name, ProviderKind::OpenAi, "https://api.openai.com/v1")
        .credential("sk-test")
        .model("gpt-4o")
        .rate_limits(1_000, 10_000_000)
}

#[tokio::test]
async fn test_single_request_budget_reopens_after_window() {
    let clock = ManualClock::default();
    let engine = engine_with(BalancerConfig::in_memory(), &clock).await;
    let id = engine
        .add_provider(openai("tight").rate_limits(1, 1_000_000))
        .await
        .expect("failed to add provider");
    let request = BalancerRequest::new("gpt-4o", 100, 100);

    let selection = engine.route_request(&request).await.expect("first request routes");
    assert_eq!(selection.provider.id, id);
    assert!(engine.get_available_providers(&request).await.is_empty());

    let err = engine.route_request(&request).await.unwrap_err();
    assert!(matches!(err, BalancerError::NoAvailableProviders { ref model } if model == "gpt-4o"));

    clock.advance(Duration::seconds(59));
    assert!(engine.get_available_providers(&request).await.is_empty());

    clock.advance(Duration::seconds(1));
    let available = engine.get_available_providers(&request).await;
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].rate_limit.current_requests, 0);
    assert_eq!(available[0].rate_limit.last_reset_at, clock.now());
}

#[tokio::test]
async fn test_periodic_reset_zeroes_counters() {
    let clock = ManualClock::default();
    let engine = engine_with(BalancerConfig::in_memory(), &clock).await;
    let id = engine.add_provider(openai("p")).await.expect("failed to add provider");

    engine
        .charge_provider(id, &BalancerRequest::new("gpt-4o", 500, 500))
        .await
        .expect("provider exists");
    assert_eq!(engine.reset_rate_limits().await, 1);

    let provider = engine.provider(id).await.expect("provider exists");
    assert_eq!(provider.rate_limit.current_requests, 0);
    assert_eq!(provider.rate_limit.current_tokens, 0);
}

#[tokio::test]
async fn test_least_cost_prefers_cheaper_provider() {
    let clock = ManualClock::default();
    let engine = engine_with(BalancerConfig::in_memory(), &clock).await;
    let cheap = engine
        .add_provider(openai("cheap").cost(1.0, 2.0))
        .await
        .expect("failed to add provider");
    engine
        .add_provider(openai("pricey").cost(5.0, 10.0))
        .await
        .expect("failed to add provider");

    engine
        .set_strategy(StrategyConfig::LeastCost { max_cost: None })
        .await;
    let selection = engine
        .route_request(&BalancerRequest::new("gpt-4o", 1_000, 500))
        .await
        .expect("routable");

    assert_eq!(selection.provider.id, cheap);
    assert!((selection.estimated_cost - 0.002).abs() < 1e-12);
}

#[tokio::test]
async fn test_round_robin_visits_each_provider_once() {
    let clock = ManualClock::default();
    let engine = engine_with(BalancerConfig::in_memory(), &clock).await;
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        ids.push(engine.add_provider(openai(name)).await.expect("failed to add provider"));
    }

    engine.set_strategy(StrategyConfig::RoundRobin).await;
    let mut visited = Vec::new();
    for _ in 0..3 {
        let selection = engine
            .route_request(&BalancerRequest::new("gpt-4o", 1, 1))
            .await
            .expect("routable");
        visited.push(selection.provider.id);
    }
    visited.sort();
    ids.sort();
    assert_eq!(visited, ids);
}

#[tokio::test]
async fn test_deactivated_and_unhealthy_providers_are_skipped() {
    let clock = ManualClock::default();
    let engine = engine_with(BalancerConfig::in_memory(), &clock).await;
    let a = engine.add_provider(openai("a")).await.expect("failed to add provider");
    let b = engine.add_provider(openai("b")).await.expect("failed to add provider");
    let c = engine.add_provider(openai("c")).await.expect("failed to add provider");

    engine.set_provider_active(a, false).await.expect("provider exists");
    engine
        .update_provider_health(
            b,
            balancer::HealthUpdate {
                is_healthy: Some(false),
                last_check: Some(clock.now()),
                ..Default::default()
            },
        )
        .await
        .expect("provider exists");

    let available = engine
        .get_available_providers(&BalancerRequest::new("gpt-4o", 1, 1))
        .await;
    let ids: Vec<_> = available.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![c]);
}

#[tokio::test]
async fn test_failover_order_respected() {
    let clock = ManualClock::default();
    let engine = engine_with(BalancerConfig::in_memory(), &clock).await;
    let a = engine.add_provider(openai("a")).await.expect("failed to add provider");
    let b = engine.add_provider(openai("b")).await.expect("failed to add provider");

    engine
        .set_strategy(StrategyConfig::Failover { order: vec![b, a] })
        .await;
    let selection = engine
        .route_request(&BalancerRequest::new("gpt-4o", 1, 1))
        .await
        .expect("routable");
    assert_eq!(selection.provider.id, b);

    engine.set_provider_active(b, false).await.expect("provider exists");
    let selection = engine
        .route_request(&BalancerRequest::new("gpt-4o", 1, 1))
        .await
        .expect("routable");
    assert_eq!(selection.provider.id, a);
}

#[tokio::test]
async fn test_invalid_spec_is_configuration_error() {
    let clock = ManualClock::default();
    let engine = engine_with(BalancerConfig::in_memory(), &clock).await;

    let err = engine
        .add_provider(openai("no-key").credential(""))
        .await
        .unwrap_err();
    assert!(matches!(err, BalancerError::Configuration(_)));
    assert!(engine.list_providers().await.is_empty());
}

#[tokio::test]
async fn test_bounded_queue_rejects_when_full() {
    let clock = ManualClock::default();
    let mut config = BalancerConfig::in_memory();
    config.queue.capacity = Some(1);
    let engine = engine_with(config, &clock).await;

    engine
        .queue_request(BalancerRequest::new("gpt-4o", 1, 1))
        .await
        .expect("queue has room");
    let err = engine
        .queue_request(BalancerRequest::new("gpt-4o", 1, 1).priority(RequestPriority::Critical))
        .await
        .unwrap_err();
    assert!(matches!(err, BalancerError::QueueFull { capacity: 1 }));
    assert!(err.is_transient());
    assert_eq!(engine.queue_depth().await.total(), 1);
}

#[tokio::test]
async fn test_empty_snapshot_has_no_nan() {
    let clock = ManualClock::default();
    let engine = engine_with(BalancerConfig::in_memory(), &clock).await;

    let snapshot = engine.get_metrics_snapshot().await.expect("snapshot builds");
    assert_eq!(snapshot.total_providers, 0);
    assert_eq!(snapshot.active_providers, 0);
    assert_eq!(snapshot.healthy_providers, 0);
    assert_eq!(snapshot.total_requests, 0);
    assert_eq!(snapshot.queue_depth, 0);
    for value in [
        snapshot.average_response_time,
        snapshot.error_rate,
        snapshot.request_rate,
        snapshot.total_cost,
    ] {
        assert_eq!(value, 0.0);
    }
    assert_eq!(snapshot.generated_at, clock.now());
}

#[tokio::test]
async fn test_snapshot_utilization_expires_with_window() {
    let clock = ManualClock::default();
    let engine = engine_with(BalancerConfig::in_memory(), &clock).await;
    let id = engine
        .add_provider(openai("small").rate_limits(2, 1_000_000))
        .await
        .expect("failed to add provider");
    let request = BalancerRequest::new("gpt-4o", 10, 10);
    engine.route_request(&request).await.expect("first request routes");
    engine.route_request(&request).await.expect("second request routes");

    let busy = engine.get_metrics_snapshot().await.expect("snapshot builds");
    assert_eq!(busy.provider_utilization[&id].request_budget_used_pct, 100.0);

    clock.advance(Duration::minutes(10));
    let idle = engine.get_metrics_snapshot().await.expect("snapshot builds");
    assert_eq!(idle.provider_utilization[&id].request_budget_used_pct, 0.0);
    assert_eq!(idle.provider_utilization[&id].token_budget_used_pct, 0.0);
}

#[tokio::test]
async fn test_recorded_requests_feed_snapshot() {
    let clock = ManualClock::default();
    let engine = engine_with(BalancerConfig::in_memory(), &clock).await;
    let id = engine.add_provider(openai("p")).await.expect("failed to add provider");

    for (ms, status) in [(100.0, RequestStatus::Success), (300.0, RequestStatus::Error)] {
        engine
            .record_request(RequestLogEntry {
                provider_id: id,
                response_time_ms: ms,
                status,
                cost: 0.01,
                timestamp: clock.now(),
            })
            .await
            .expect("log appended");
    }

    let snapshot = engine.get_metrics_snapshot().await.expect("snapshot builds");
    assert_eq!(snapshot.total_requests, 2);
    assert!((snapshot.average_response_time - 200.0).abs() < 1e-9);
    assert!((snapshot.error_rate - 50.0).abs() < 1e-9);
    assert!((snapshot.cost_breakdown[&id] - 0.02).abs() < 1e-9);
    assert_eq!(snapshot.provider_utilization[&id].requests, 2);

    let provider = engine.provider(id).await.expect("provider exists");
    assert!(provider.health.error_rate > 0.0);
}

#[tokio::test]
async fn test_scaling_policy_cooldown() {
    let clock = ManualClock::default();
    let engine = engine_with(BalancerConfig::in_memory(), &clock).await;
    let id = engine.add_provider(openai("p")).await.expect("failed to add provider");
    engine
        .add_scaling_policy(ScalingPolicySpec::new(
            "error spike",
            TriggerMetric::ErrorRate,
            80.0,
            ScaleAction::SwitchProvider,
            300,
        ))
        .await
        .expect("valid policy");

    // 17 of 20 failed: 85% error rate
    for i in 0..20 {
        let status = if i < 17 {
            RequestStatus::Error
        } else {
            RequestStatus::Success
        };
        engine
            .record_request(RequestLogEntry {
                provider_id: id,
                response_time_ms: 150.0,
                status,
                cost: 0.0,
                timestamp: clock.now(),
            })
            .await
            .expect("log appended");
    }

    let events = engine.evaluate_scaling_policies().await.expect("evaluated");
    assert_eq!(events.len(), 1);
    assert!((events[0].observed - 85.0).abs() < 1e-9);
    assert_eq!(events[0].action, ScaleAction::SwitchProvider);

    clock.advance(Duration::seconds(100));
    assert!(engine.evaluate_scaling_policies().await.expect("evaluated").is_empty());

    clock.advance(Duration::seconds(200));
    assert_eq!(engine.evaluate_scaling_policies().await.expect("evaluated").len(), 1);
}

/// Store whose writes always fail
#[derive(Debug, Default)]
struct ReadOnlyStore;

#[async_trait]
impl ProviderStore for ReadOnlyStore {
    async fn load_providers(&self) -> Result<LoadedRows<Provider>, StoreError> {
        Ok(LoadedRows {
            rows: Vec::new(),
            quarantined: Vec::new(),
        })
    }

    async fn save_provider(&self, _provider: &Provider) -> Result<(), StoreError> {
        Err(StoreError::Corrupted("disk is read-only".to_string()))
    }

    async fn load_scaling_policies(&self) -> Result<LoadedRows<ScalingPolicy>, StoreError> {
        Ok(LoadedRows {
            rows: Vec::new(),
            quarantined: Vec::new(),
        })
    }

    async fn save_scaling_policy(&self, _policy: &ScalingPolicy) -> Result<(), StoreError> {
        Err(StoreError::Corrupted("disk is read-only".to_string()))
    }

    async fn append_request_log(&self, _entry: &RequestLogEntry) -> Result<(), StoreError> {
        Err(StoreError::Corrupted("disk is read-only".to_string()))
    }

    async fn request_logs_since(
        &self,
        _since: DateTime<Utc>,
    ) -> Result<LoadedRows<RequestLogEntry>, StoreError> {
        Err(StoreError::Corrupted("disk is read-only".to_string()))
    }
}

#[tokio::test]
async fn test_persistence_failure_keeps_provider_routable() {
    let clock = ManualClock::default();
    let engine = LoadBalancer::builder(BalancerConfig::in_memory())
        .store(Arc::new(ReadOnlyStore))
        .probes(ProbeSet::new())
        .clock(Arc::new(clock.clone()))
        .build()
        .await
        .expect("failed to build engine");

    let err = engine.add_provider(openai("p")).await.unwrap_err();
    assert!(matches!(err, BalancerError::Persistence(_)));

    let providers = engine.list_providers().await;
    assert_eq!(providers.len(), 1);
    let selection = engine
        .route_request(&BalancerRequest::new("gpt-4o", 1, 1))
        .await
        .expect("in-memory registry still routes");
    assert_eq!(selection.provider.id, providers[0].id);

    let err = engine.get_metrics_snapshot().await.unwrap_err();
    assert!(matches!(err, BalancerError::MetricsAggregation(_)));
}

/// Counts how often the health loop reached it
#[derive(Debug, Default)]
struct CountingProbe {
    calls: AtomicUsize,
}

#[async_trait]
impl HealthProbe for CountingProbe {
    async fn probe(&self, _provider: &Provider) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

fn local(name: &str) -> ProviderSpec {
    ProviderSpec::new(name, ProviderKind::Custom, "http://localhost:11434")
        .model("llama3")
        .rate_limits(100, 1_000_000)
}

#[tokio::test(start_paused = true)]
async fn test_started_engine_runs_its_loops() {
    let clock = ManualClock::default();
    let probe = Arc::new(CountingProbe::default());
    let config = BalancerConfig::in_memory();
    let engine = LoadBalancer::builder(config.clone())
        .probes(ProbeSet::new().register(ProviderKind::Custom, probe.clone()))
        .clock(Arc::new(clock.clone()))
        .build()
        .await
        .expect("failed to build engine");
    let id = engine.add_provider(local("ollama")).await.expect("failed to add provider");

    engine.start().await.expect("loops start");
    engine
        .queue_request(BalancerRequest::new("llama3", 10, 10).operation("queued"))
        .await
        .expect("unbounded queue");

    tokio::time::sleep(config.drain_interval() * 3).await;
    let outcomes = engine.take_drain_outcomes().await;
    assert!(matches!(
        outcomes.as_slice(),
        [DrainOutcome::Routed { request, selection }]
            if request.operation == "queued" && selection.provider.id == id
    ));
    assert_eq!(engine.queue_depth().await.total(), 0);
    assert!(probe.calls.load(Ordering::SeqCst) >= 1);

    engine
        .charge_provider(id, &BalancerRequest::new("llama3", 500, 500))
        .await
        .expect("provider exists");
    let charged = engine.provider(id).await.expect("provider exists");
    assert!(charged.rate_limit.current_requests >= 1);

    // The manual clock never moves, so only the reset loop can zero these
    tokio::time::sleep(config.reset_interval() + std::time::Duration::from_secs(1)).await;
    let reset = engine.provider(id).await.expect("provider exists");
    assert_eq!(reset.rate_limit.current_requests, 0);
    assert_eq!(reset.rate_limit.current_tokens, 0);

    engine.stop().await;
    assert!(!engine.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn test_running_engine_retains_bounded_outcomes() {
    let clock = ManualClock::default();
    let mut config = BalancerConfig::in_memory();
    config.queue.outcome_buffer = 16;
    let engine = engine_with(config, &clock).await;
    engine.add_provider(local("ollama")).await.expect("failed to add provider");

    engine.start().await.expect("loops start");
    for _ in 0..200 {
        engine
            .queue_request(BalancerRequest::new("llama3", 1, 1))
            .await
            .expect("unbounded queue");
    }
    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    engine.stop().await;

    assert_eq!(engine.queue_depth().await.total(), 0);
    assert_eq!(engine.take_drain_outcomes().await.len(), 16);
}
