//! Load balancer engine - owns every component and the background loops

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::BalancerConfig;
use crate::error::{BalancerError, Result};
use crate::health::{HealthMonitor, HealthMonitorConfig, ProbeSet};
use crate::metrics::{MetricsAggregator, MetricsSnapshot, RequestLogEntry};
use crate::queue::{AdmissionQueue, QueueDepth};
use crate::registry::ProviderRegistry;
use crate::scaling::{
    LoggingScaleHandler, ScalingActionHandler, ScalingEngine, ScalingEvent, ScalingPolicy,
    ScalingPolicySpec,
};
use crate::store::{ProviderStore, SqliteStore};
use crate::strategies::{SelectionStrategy, StrategyConfig};
use crate::types::{
    BalancerRequest, HealthUpdate, Provider, ProviderId, ProviderSpec, Selection,
};

/// What happened to a request taken off the admission queue
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    Routed {
        request: BalancerRequest,
        selection: Selection,
    },
    /// Routing failed; the request is dropped, not re-queued
    Discarded {
        request: BalancerRequest,
        reason: String,
    },
}

impl DrainOutcome {
    pub fn request(&self) -> &BalancerRequest {
        match self {
            DrainOutcome::Routed { request, .. } | DrainOutcome::Discarded { request, .. } => {
                request
            }
        }
    }
}

#[derive(Debug)]
struct ActiveStrategy {
    config: StrategyConfig,
    strategy: Arc<dyn SelectionStrategy>,
}

/// Builder for [`LoadBalancer`]; every collaborator has a default
pub struct LoadBalancerBuilder {
    config: BalancerConfig,
    store: Option<Arc<dyn ProviderStore>>,
    probes: Option<ProbeSet>,
    scale_handler: Option<Arc<dyn ScalingActionHandler>>,
    clock: Option<Arc<dyn Clock>>,
}

impl LoadBalancerBuilder {
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            store: None,
            probes: None,
            scale_handler: None,
            clock: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn ProviderStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn probes(mut self, probes: ProbeSet) -> Self {
        self.probes = Some(probes);
        self
    }

    pub fn scale_handler(mut self, handler: Arc<dyn ScalingActionHandler>) -> Self {
        self.scale_handler = Some(handler);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the config, open the store and load persisted state.
    ///
    /// Background loops are not started; call [`LoadBalancer::start`].
    pub async fn build(self) -> Result<LoadBalancer> {
        let config = self.config;
        config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let store: Arc<dyn ProviderStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                SqliteStore::open(&config.database_path)
                    .await
                    .map_err(BalancerError::Persistence)?,
            ),
        };
        let probes = match self.probes {
            Some(probes) => probes,
            None => default_probes(&config)?,
        };
        let handler = self
            .scale_handler
            .unwrap_or_else(|| Arc::new(LoggingScaleHandler) as Arc<dyn ScalingActionHandler>);

        let registry = ProviderRegistry::new(clock.clone(), config.rate_limit_window());
        let providers = store
            .load_providers()
            .await
            .map_err(BalancerError::Persistence)?;
        if !providers.quarantined.is_empty() {
            warn!(
                count = providers.quarantined.len(),
                "Skipped malformed provider rows"
            );
        }
        registry.load(providers.rows).await;

        let scaling = ScalingEngine::new(handler, clock.clone());
        let policies = store
            .load_scaling_policies()
            .await
            .map_err(BalancerError::Persistence)?;
        if !policies.quarantined.is_empty() {
            warn!(
                count = policies.quarantined.len(),
                "Skipped malformed scaling policy rows"
            );
        }
        scaling.load(policies.rows).await;

        let health = HealthMonitor::new(
            registry.clone(),
            probes,
            clock.clone(),
            HealthMonitorConfig::from(&config.health),
        );
        let metrics = MetricsAggregator::new(store.clone(), config.metrics_window());

        let cursor = Arc::new(AtomicUsize::new(0));
        let strategy = ActiveStrategy {
            strategy: Arc::from(config.default_strategy.build(cursor.clone())),
            config: config.default_strategy.clone(),
        };

        let (drain_tx, drain_rx) = mpsc::channel(config.queue.outcome_buffer);

        let provider_count = registry.len().await;
        let policy_count = scaling.list().await.len();
        info!(
            providers = provider_count,
            policies = policy_count,
            strategy = strategy.config.name(),
            "Load balancer initialized"
        );

        Ok(LoadBalancer {
            queue: AdmissionQueue::with_capacity(config.queue.capacity),
            config: Arc::new(config),
            clock,
            store,
            registry,
            health,
            scaling,
            metrics,
            strategy: Arc::new(RwLock::new(strategy)),
            round_robin_cursor: cursor,
            drain_tx,
            drain_rx: Arc::new(Mutex::new(drain_rx)),
            background_tasks: Arc::new(RwLock::new(Vec::new())),
        })
    }
}

#[cfg(feature = "http-probe")]
fn default_probes(config: &BalancerConfig) -> Result<ProbeSet> {
    ProbeSet::http(config.probe_timeout())
        .map_err(|e| BalancerError::Configuration(format!("failed to build HTTP probe: {e}")))
}

#[cfg(not(feature = "http-probe"))]
fn default_probes(_config: &BalancerConfig) -> Result<ProbeSet> {
    Ok(ProbeSet::new())
}

/// In-process request router with admission control.
///
/// Cloning is cheap and every clone drives the same engine.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    config: Arc<BalancerConfig>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn ProviderStore>,
    registry: ProviderRegistry,
    queue: AdmissionQueue,
    health: HealthMonitor,
    scaling: ScalingEngine,
    metrics: MetricsAggregator,
    strategy: Arc<RwLock<ActiveStrategy>>,
    /// Shared by every round-robin instance so swaps keep the position
    round_robin_cursor: Arc<AtomicUsize>,
    drain_tx: mpsc::Sender<DrainOutcome>,
    drain_rx: Arc<Mutex<mpsc::Receiver<DrainOutcome>>>,
    background_tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl LoadBalancer {
    pub fn builder(config: BalancerConfig) -> LoadBalancerBuilder {
        LoadBalancerBuilder::new(config)
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Spawn the health, reset, drain and scaling loops
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.background_tasks.write().await;
        if !tasks.is_empty() {
            warn!("Background loops already running");
            return Ok(());
        }

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.health_check_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                engine.run_health_checks().await;
            }
        }));

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.reset_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                engine.reset_rate_limits().await;
            }
        }));

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.drain_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                engine.drain_once().await;
            }
        }));

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.scaling_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(e) = engine.evaluate_scaling_policies().await {
                    warn!("Scaling evaluation skipped: {}", e);
                }
            }
        }));

        info!("Background loops started");
        Ok(())
    }

    /// Abort every background loop. The engine stays usable.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut tasks = self.background_tasks.write().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
        info!("Background loops stopped");
    }

    pub async fn is_running(&self) -> bool {
        !self.background_tasks.read().await.is_empty()
    }

    /// Pick a provider for `request` and charge its budget in one step
    #[instrument(skip(self, request), fields(request_id = %request.id, model = %request.model))]
    pub async fn route_request(&self, request: &BalancerRequest) -> Result<Selection> {
        let strategy = self.strategy.read().await.strategy.clone();

        match self.registry.reserve(request, strategy.as_ref()).await {
            Ok(selection) => {
                info!(
                    provider_id = %selection.provider.id,
                    provider = %selection.provider.name,
                    strategy = strategy.name(),
                    estimated_cost = selection.estimated_cost,
                    "Request routed"
                );
                Ok(selection)
            }
            Err(e) => {
                debug!("Routing failed: {}", e);
                Err(e)
            }
        }
    }

    #[instrument(skip(self, request), fields(request_id = %request.id))]
    pub async fn queue_request(&self, request: BalancerRequest) -> Result<()> {
        self.queue.enqueue(request).await
    }

    /// Swap the selection strategy. The round-robin cursor carries over.
    #[instrument(skip(self))]
    pub async fn set_strategy(&self, config: StrategyConfig) {
        let strategy: Arc<dyn SelectionStrategy> =
            Arc::from(config.build(self.round_robin_cursor.clone()));
        let mut active = self.strategy.write().await;
        info!(from = active.config.name(), to = config.name(), "Strategy changed");
        *active = ActiveStrategy { config, strategy };
    }

    pub async fn current_strategy(&self) -> StrategyConfig {
        self.strategy.read().await.config.clone()
    }

    /// Register a provider. On a store failure the provider is still
    /// registered and routable, and the `Persistence` error is returned.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn add_provider(&self, spec: ProviderSpec) -> Result<ProviderId> {
        let provider = self.registry.add(spec).await?;
        self.persist_provider(&provider).await?;
        Ok(provider.id)
    }

    pub async fn get_available_providers(&self, request: &BalancerRequest) -> Vec<Provider> {
        self.registry.get_available_providers(request).await
    }

    /// Charge without selecting, for callers that pick providers themselves
    pub async fn charge_provider(
        &self,
        id: ProviderId,
        request: &BalancerRequest,
    ) -> Result<Provider> {
        self.registry.charge_provider(id, request).await
    }

    #[instrument(skip(self, update))]
    pub async fn update_provider_health(
        &self,
        id: ProviderId,
        update: HealthUpdate,
    ) -> Result<Provider> {
        let provider = self.registry.update_provider_health(id, &update).await?;
        self.persist_provider(&provider).await?;
        Ok(provider)
    }

    #[instrument(skip(self))]
    pub async fn set_provider_active(&self, id: ProviderId, active: bool) -> Result<Provider> {
        let provider = self.registry.set_provider_active(id, active).await?;
        self.persist_provider(&provider).await?;
        Ok(provider)
    }

    pub async fn provider(&self, id: ProviderId) -> Option<Provider> {
        self.registry.provider(id).await
    }

    pub async fn list_providers(&self) -> Vec<Provider> {
        self.registry.list_providers().await
    }

    /// Append a completed request to the log and fold its outcome into
    /// the provider's error rate
    #[instrument(skip(self, entry), fields(provider_id = %entry.provider_id))]
    pub async fn record_request(&self, entry: RequestLogEntry) -> Result<()> {
        self.registry
            .record_outcome(entry.provider_id, entry.status.is_success())
            .await?;
        self.store.append_request_log(&entry).await.map_err(|e| {
            error!(error = %e, "Failed to append request log");
            BalancerError::Persistence(e)
        })
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn add_scaling_policy(&self, spec: ScalingPolicySpec) -> Result<Uuid> {
        let policy = self.scaling.add(spec).await?;
        self.persist_policy(&policy).await?;
        Ok(policy.id)
    }

    #[instrument(skip(self))]
    pub async fn set_policy_active(&self, id: Uuid, active: bool) -> Result<ScalingPolicy> {
        let policy = self.scaling.set_active(id, active).await?;
        self.persist_policy(&policy).await?;
        Ok(policy)
    }

    pub async fn list_scaling_policies(&self) -> Vec<ScalingPolicy> {
        self.scaling.list().await
    }

    pub async fn get_metrics_snapshot(&self) -> Result<MetricsSnapshot> {
        let providers = self.registry.current_view().await;
        let depth = self.queue.depth().await;
        self.metrics
            .snapshot(&providers, depth, self.clock.now())
            .await
    }

    pub async fn queue_depth(&self) -> QueueDepth {
        self.queue.depth().await
    }

    /// One health pass over every provider. Returns how many were probed.
    #[instrument(skip(self))]
    pub async fn run_health_checks(&self) -> usize {
        let updated = self.health.check_all().await;
        for provider in &updated {
            // Health already applied in memory; the store catches up later
            let _ = self.persist_provider(provider).await;
        }
        updated.len()
    }

    /// Unconditional window reset of every provider
    #[instrument(skip(self))]
    pub async fn reset_rate_limits(&self) -> usize {
        let count = self.registry.reset_all_windows().await;
        debug!("Reset rate limit windows for {} providers", count);
        count
    }

    /// Route the head of the queue, if any. The outcome is also
    /// published for [`take_drain_outcomes`](Self::take_drain_outcomes)
    /// unless `queue.outcome_buffer` outcomes are already waiting.
    pub async fn drain_once(&self) -> Option<DrainOutcome> {
        let request = self.queue.dequeue_next().await?;

        let outcome = match self.route_request(&request).await {
            Ok(selection) => DrainOutcome::Routed { request, selection },
            Err(e) => {
                warn!(
                    request_id = %request.id,
                    priority = request.priority.as_str(),
                    error = %e,
                    "Queued request discarded"
                );
                DrainOutcome::Discarded {
                    request,
                    reason: e.to_string(),
                }
            }
        };

        match self.drain_tx.try_send(outcome.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => warn!(
                request_id = %dropped.request().id,
                capacity = self.config.queue.outcome_buffer,
                "Drain outcome buffer full, outcome dropped"
            ),
            Err(TrySendError::Closed(_)) => debug!("Drain outcome receiver closed"),
        }
        Some(outcome)
    }

    /// Outcomes published by the drain loop since the last call
    pub async fn take_drain_outcomes(&self) -> Vec<DrainOutcome> {
        let mut rx = self.drain_rx.lock().await;
        let mut outcomes = Vec::new();
        while let Ok(outcome) = rx.try_recv() {
            outcomes.push(outcome);
        }
        outcomes
    }

    #[instrument(skip(self))]
    pub async fn evaluate_scaling_policies(&self) -> Result<Vec<ScalingEvent>> {
        let snapshot = self.get_metrics_snapshot().await?;
        let events = self.scaling.evaluate(&snapshot).await;
        if !events.is_empty() {
            info!("{} scaling policies fired", events.len());
        }
        Ok(events)
    }

    async fn persist_provider(&self, provider: &Provider) -> Result<()> {
        self.store.save_provider(provider).await.map_err(|e| {
            error!(
                provider_id = %provider.id,
                error = %e,
                "Failed to persist provider, in-memory state kept"
            );
            BalancerError::Persistence(e)
        })
    }

    async fn persist_policy(&self, policy: &ScalingPolicy) -> Result<()> {
        self.store.save_scaling_policy(policy).await.map_err(|e| {
            error!(
                policy_id = %policy.id,
                error = %e,
                "Failed to persist scaling policy, in-memory state kept"
            );
            BalancerError::Persistence(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{ProviderKind, RequestPriority};

    async fn engine() -> LoadBalancer {
        LoadBalancer::builder(BalancerConfig::in_memory())
            .probes(ProbeSet::new())
            .clock(Arc::new(ManualClock::default()))
            .build()
            .await
            .expect("in-memory engine")
    }

    fn spec(name: &str) -> ProviderSpec {
        ProviderSpec::new(name, ProviderKind::Custom, "http://localhost:8000")
            .model("llama3")
            .rate_limits(100, 1_000_000)
    }

    #[tokio::test]
    async fn test_route_without_providers_fails() {
        let engine = engine().await;
        let err = engine
            .route_request(&BalancerRequest::new("llama3", 10, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::NoAvailableProviders { .. }));
    }

    #[tokio::test]
    async fn test_round_robin_cursor_survives_strategy_swap() {
        let engine = engine().await;
        let a = engine.add_provider(spec("a")).await.expect("valid");
        let b = engine.add_provider(spec("b")).await.expect("valid");
        let request = BalancerRequest::new("llama3", 1, 1);

        engine.set_strategy(StrategyConfig::RoundRobin).await;
        let first = engine.route_request(&request).await.expect("routable");
        assert_eq!(first.provider.id, a);

        engine.set_strategy(StrategyConfig::default()).await;
        engine.set_strategy(StrategyConfig::RoundRobin).await;
        let second = engine.route_request(&request).await.expect("routable");
        assert_eq!(second.provider.id, b);
    }

    #[tokio::test]
    async fn test_drain_discards_unroutable_request() {
        let engine = engine().await;
        engine
            .queue_request(BalancerRequest::new("gpt-4o", 1, 1).priority(RequestPriority::High))
            .await
            .expect("unbounded queue");

        let outcome = engine.drain_once().await.expect("queue had a request");
        assert!(matches!(outcome, DrainOutcome::Discarded { .. }));
        assert!(engine.drain_once().await.is_none());

        let published = engine.take_drain_outcomes().await;
        assert_eq!(published, vec![outcome]);
        assert!(engine.take_drain_outcomes().await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_routes_highest_priority_first() {
        let engine = engine().await;
        engine.add_provider(spec("a")).await.expect("valid");
        engine
            .queue_request(
                BalancerRequest::new("llama3", 1, 1)
                    .operation("low")
                    .priority(RequestPriority::Low),
            )
            .await
            .expect("unbounded queue");
        engine
            .queue_request(
                BalancerRequest::new("llama3", 1, 1)
                    .operation("critical")
                    .priority(RequestPriority::Critical),
            )
            .await
            .expect("unbounded queue");

        match engine.drain_once().await {
            Some(DrainOutcome::Routed { request, .. }) => assert_eq!(request.operation, "critical"),
            other => panic!("expected routed critical request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unread_outcomes_are_capped() {
        let mut config = BalancerConfig::in_memory();
        config.queue.outcome_buffer = 3;
        let engine = LoadBalancer::builder(config)
            .probes(ProbeSet::new())
            .clock(Arc::new(ManualClock::default()))
            .build()
            .await
            .expect("in-memory engine");

        for _ in 0..5 {
            engine
                .queue_request(BalancerRequest::new("llama3", 1, 1))
                .await
                .expect("unbounded queue");
        }
        for _ in 0..5 {
            assert!(engine.drain_once().await.is_some());
        }

        assert_eq!(engine.take_drain_outcomes().await.len(), 3);
        assert!(engine.drain_once().await.is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop_loops() {
        let engine = engine().await;
        engine.start().await.expect("start");
        assert!(engine.is_running().await);
        engine.start().await.expect("second start is a no-op");
        engine.stop().await;
        assert!(!engine.is_running().await);
    }
}
