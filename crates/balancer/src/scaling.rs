//! Threshold-triggered scaling policies

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BalancerError, Result};
use crate::metrics::MetricsSnapshot;

/// Snapshot figure a policy watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMetric {
    RequestRate,
    ErrorRate,
    ResponseTime,
    Cost,
    QueueDepth,
}

impl TriggerMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMetric::RequestRate => "request_rate",
            TriggerMetric::ErrorRate => "error_rate",
            TriggerMetric::ResponseTime => "response_time",
            TriggerMetric::Cost => "cost",
            TriggerMetric::QueueDepth => "queue_depth",
        }
    }

    pub fn observe(&self, snapshot: &MetricsSnapshot) -> f64 {
        match self {
            TriggerMetric::RequestRate => snapshot.request_rate,
            TriggerMetric::ErrorRate => snapshot.error_rate,
            TriggerMetric::ResponseTime => snapshot.average_response_time,
            TriggerMetric::Cost => snapshot.total_cost,
            TriggerMetric::QueueDepth => snapshot.queue_depth as f64,
        }
    }
}

impl fmt::Display for TriggerMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerMetric {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "request_rate" => Ok(TriggerMetric::RequestRate),
            "error_rate" => Ok(TriggerMetric::ErrorRate),
            "response_time" => Ok(TriggerMetric::ResponseTime),
            "cost" => Ok(TriggerMetric::Cost),
            "queue_depth" => Ok(TriggerMetric::QueueDepth),
            other => Err(format!("unknown trigger metric: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    SwitchProvider,
    Throttle,
}

impl ScaleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleAction::ScaleUp => "scale_up",
            ScaleAction::ScaleDown => "scale_down",
            ScaleAction::SwitchProvider => "switch_provider",
            ScaleAction::Throttle => "throttle",
        }
    }
}

impl fmt::Display for ScaleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScaleAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scale_up" => Ok(ScaleAction::ScaleUp),
            "scale_down" => Ok(ScaleAction::ScaleDown),
            "switch_provider" => Ok(ScaleAction::SwitchProvider),
            "throttle" => Ok(ScaleAction::Throttle),
            other => Err(format!("unknown scale action: {other}")),
        }
    }
}

/// Input to `add_scaling_policy`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicySpec {
    pub name: String,
    pub trigger_metric: TriggerMetric,
    pub threshold: f64,
    pub scale_action: ScaleAction,
    pub cooldown_period_secs: u64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl ScalingPolicySpec {
    pub fn new(
        name: &str,
        trigger_metric: TriggerMetric,
        threshold: f64,
        scale_action: ScaleAction,
        cooldown_period_secs: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            trigger_metric,
            threshold,
            scale_action,
            cooldown_period_secs,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub id: Uuid,
    pub name: String,
    pub trigger_metric: TriggerMetric,
    pub threshold: f64,
    pub scale_action: ScaleAction,
    pub cooldown_period_secs: u64,
    pub is_active: bool,
    /// Not persisted; a restart clears every cooldown
    #[serde(skip)]
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl ScalingPolicy {
    pub fn from_spec(spec: ScalingPolicySpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: spec.name,
            trigger_metric: spec.trigger_metric,
            threshold: spec.threshold,
            scale_action: spec.scale_action,
            cooldown_period_secs: spec.cooldown_period_secs,
            is_active: spec.is_active,
            last_fired_at: None,
        }
    }

    fn cooldown(&self) -> Duration {
        let secs = i64::try_from(self.cooldown_period_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs.min(i64::MAX / 1_000))
    }

    /// Whether the cooldown since the last firing has fully elapsed
    pub fn cooled_down(&self, now: DateTime<Utc>) -> bool {
        match self.last_fired_at {
            None => true,
            Some(fired) => now - fired >= self.cooldown(),
        }
    }
}

/// Record of one policy firing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub policy_id: Uuid,
    pub policy_name: String,
    pub metric: TriggerMetric,
    pub action: ScaleAction,
    pub observed: f64,
    pub threshold: f64,
    pub fired_at: DateTime<Utc>,
    /// Set when the action handler failed; the cooldown still applies
    pub handler_error: Option<String>,
}

/// Performs the side effect of a fired policy
#[async_trait]
pub trait ScalingActionHandler: Send + Sync + fmt::Debug {
    async fn execute(&self, policy: &ScalingPolicy, observed: f64) -> anyhow::Result<()>;
}

/// Default handler: records the decision in the log and does nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingScaleHandler;

#[async_trait]
impl ScalingActionHandler for LoggingScaleHandler {
    async fn execute(&self, policy: &ScalingPolicy, observed: f64) -> anyhow::Result<()> {
        info!(
            policy = %policy.name,
            action = policy.scale_action.as_str(),
            metric = policy.trigger_metric.as_str(),
            observed,
            threshold = policy.threshold,
            "Scaling action triggered"
        );
        Ok(())
    }
}

/// Holds the policy set and evaluates it against metrics snapshots
#[derive(Debug, Clone)]
pub struct ScalingEngine {
    policies: Arc<RwLock<Vec<ScalingPolicy>>>,
    handler: Arc<dyn ScalingActionHandler>,
    clock: Arc<dyn Clock>,
}

impl ScalingEngine {
    pub fn new(handler: Arc<dyn ScalingActionHandler>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies: Arc::new(RwLock::new(Vec::new())),
            handler,
            clock,
        }
    }

    pub fn validate(spec: &ScalingPolicySpec) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(BalancerError::Configuration(
                "scaling policy name is required".to_string(),
            ));
        }
        if !spec.threshold.is_finite() {
            return Err(BalancerError::Configuration(format!(
                "scaling policy {} has a non-finite threshold",
                spec.name
            )));
        }
        Ok(())
    }

    pub async fn add(&self, spec: ScalingPolicySpec) -> Result<ScalingPolicy> {
        Self::validate(&spec)?;
        let policy = ScalingPolicy::from_spec(spec);
        info!(
            policy_id = %policy.id,
            policy = %policy.name,
            metric = policy.trigger_metric.as_str(),
            threshold = policy.threshold,
            "Scaling policy added"
        );
        self.policies.write().await.push(policy.clone());
        Ok(policy)
    }

    /// Replace the policy set with rows loaded from the store
    pub async fn load(&self, policies: Vec<ScalingPolicy>) {
        *self.policies.write().await = policies;
    }

    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<ScalingPolicy> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(BalancerError::PolicyNotFound(id))?;
        policy.is_active = active;
        Ok(policy.clone())
    }

    pub async fn list(&self) -> Vec<ScalingPolicy> {
        self.policies.read().await.clone()
    }

    /// Fire every active policy whose metric exceeds its threshold and
    /// whose cooldown has elapsed.
    ///
    /// `last_fired_at` is stamped before the handler runs, so a failing
    /// handler does not cause a retry storm.
    pub async fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<ScalingEvent> {
        let now = self.clock.now();

        let fired: Vec<(ScalingPolicy, f64)> = {
            let mut policies = self.policies.write().await;
            policies
                .iter_mut()
                .filter(|p| p.is_active)
                .filter_map(|policy| {
                    let observed = policy.trigger_metric.observe(snapshot);
                    if observed <= policy.threshold {
                        return None;
                    }
                    if !policy.cooled_down(now) {
                        debug!(
                            policy = %policy.name,
                            observed,
                            "Scaling policy in cooldown"
                        );
                        return None;
                    }
                    policy.last_fired_at = Some(now);
                    Some((policy.clone(), observed))
                })
                .collect()
        };

        let mut events = Vec::with_capacity(fired.len());
        for (policy, observed) in fired {
            let handler_error = match self.handler.execute(&policy, observed).await {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        policy = %policy.name,
                        action = policy.scale_action.as_str(),
                        error = %e,
                        "Scaling action handler failed"
                    );
                    Some(format!("{e:#}"))
                }
            };
            events.push(ScalingEvent {
                policy_id: policy.id,
                policy_name: policy.name.clone(),
                metric: policy.trigger_metric,
                action: policy.scale_action,
                observed,
                threshold: policy.threshold,
                fired_at: now,
                handler_error,
            });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScalingActionHandler for CountingHandler {
        async fn execute(&self, _policy: &ScalingPolicy, _observed: f64) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("autoscaler unreachable");
            }
            Ok(())
        }
    }

    fn snapshot_with_error_rate(error_rate: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            error_rate,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_threshold_must_be_exceeded() {
        let clock = ManualClock::default();
        let handler = Arc::new(CountingHandler::default());
        let engine = ScalingEngine::new(handler.clone(), Arc::new(clock));
        engine
            .add(ScalingPolicySpec::new(
                "errors",
                TriggerMetric::ErrorRate,
                80.0,
                ScaleAction::SwitchProvider,
                300,
            ))
            .await
            .expect("valid policy");

        assert!(engine.evaluate(&snapshot_with_error_rate(80.0)).await.is_empty());
        assert_eq!(engine.evaluate(&snapshot_with_error_rate(80.1)).await.len(), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_still_starts_cooldown() {
        let clock = ManualClock::default();
        let handler = Arc::new(CountingHandler {
            fail: true,
            ..Default::default()
        });
        let engine = ScalingEngine::new(handler.clone(), Arc::new(clock.clone()));
        engine
            .add(ScalingPolicySpec::new(
                "queue",
                TriggerMetric::QueueDepth,
                10.0,
                ScaleAction::ScaleUp,
                60,
            ))
            .await
            .expect("valid policy");

        let snapshot = MetricsSnapshot {
            queue_depth: 25,
            ..Default::default()
        };
        let events = engine.evaluate(&snapshot).await;
        assert_eq!(events.len(), 1);
        assert!(events[0]
            .handler_error
            .as_deref()
            .is_some_and(|e| e.contains("unreachable")));

        clock.advance(Duration::seconds(30));
        assert!(engine.evaluate(&snapshot).await.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inactive_policy_never_fires() {
        let engine = ScalingEngine::new(
            Arc::new(LoggingScaleHandler),
            Arc::new(ManualClock::default()),
        );
        let policy = engine
            .add(ScalingPolicySpec::new(
                "cost",
                TriggerMetric::Cost,
                1.0,
                ScaleAction::Throttle,
                0,
            ))
            .await
            .expect("valid policy");
        engine.set_active(policy.id, false).await.expect("policy exists");

        let snapshot = MetricsSnapshot {
            total_cost: 50.0,
            ..Default::default()
        };
        assert!(engine.evaluate(&snapshot).await.is_empty());

        let err = engine.set_active(Uuid::new_v4(), true).await.unwrap_err();
        assert!(matches!(err, BalancerError::PolicyNotFound(_)));
    }

    #[test]
    fn test_rejects_non_finite_threshold() {
        let spec = ScalingPolicySpec::new(
            "bad",
            TriggerMetric::ResponseTime,
            f64::NAN,
            ScaleAction::ScaleDown,
            10,
        );
        assert!(matches!(
            ScalingEngine::validate(&spec),
            Err(BalancerError::Configuration(_))
        ));
    }
}
