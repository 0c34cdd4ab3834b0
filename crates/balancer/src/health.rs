//! Health checking for registered providers
//!
//! Probes are registered per provider kind. A probe error or timeout is
//! turned into an unhealthy observation here and never escapes the monitor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::error::BalancerError;
use crate::registry::ProviderRegistry;
use crate::types::{HealthStatus, Provider, ProviderKind};

/// Liveness check for one provider kind
#[async_trait]
pub trait HealthProbe: Send + Sync + std::fmt::Debug {
    /// `Ok(true)` when the provider answered and looks usable
    async fn probe(&self, provider: &Provider) -> anyhow::Result<bool>;
}

/// Probes keyed by provider kind
#[derive(Debug, Clone, Default)]
pub struct ProbeSet {
    probes: HashMap<ProviderKind, Arc<dyn HealthProbe>>,
}

impl ProbeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: ProviderKind, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.insert(kind, probe);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn HealthProbe>> {
        self.probes.get(&kind).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// The HTTP probe registered for every provider kind
    #[cfg(feature = "http-probe")]
    pub fn http(timeout: Duration) -> anyhow::Result<Self> {
        let probe: Arc<dyn HealthProbe> = Arc::new(HttpHealthProbe::new(timeout)?);
        Ok(Self::new()
            .register(ProviderKind::OpenAi, probe.clone())
            .register(ProviderKind::Anthropic, probe.clone())
            .register(ProviderKind::Custom, probe))
    }
}

/// `GET {endpoint}` with the provider credential. Any status below 500
/// counts as alive, since auth and routing errors still prove the host
/// is answering.
#[cfg(feature = "http-probe")]
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

#[cfg(feature = "http-probe")]
impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http-probe")]
#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, provider: &Provider) -> anyhow::Result<bool> {
        let mut request = self.client.get(&provider.endpoint);
        if !provider.credential.is_empty() {
            request = match provider.kind {
                ProviderKind::Anthropic => request.header("x-api-key", &provider.credential),
                _ => request.bearer_auth(&provider.credential),
            };
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(
            provider = %provider.name,
            status = status.as_u16(),
            "Health probe response"
        );
        Ok(!status.is_server_error())
    }
}

/// Result of a single probe attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// The probe returned; `alive` is its verdict
    Completed { alive: bool, response_time_ms: f64 },
    /// The probe errored or timed out; no latency is recorded
    Failed { reason: String },
}

/// Hysteresis settings and probe timeout
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub probe_timeout: Duration,
    /// Consecutive failures that flip a healthy provider to unhealthy
    pub failure_threshold: u32,
    /// Consecutive successes that restore an unhealthy provider
    pub recovery_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            failure_threshold: 1,
            recovery_threshold: 1,
        }
    }
}

impl From<&HealthConfig> for HealthMonitorConfig {
    fn from(config: &HealthConfig) -> Self {
        Self {
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            failure_threshold: config.failure_threshold.max(1),
            recovery_threshold: config.recovery_threshold.max(1),
        }
    }
}

impl HealthStatus {
    /// Fold one probe outcome into the status, applying hysteresis
    pub fn record_probe(
        &mut self,
        outcome: &ProbeOutcome,
        now: DateTime<Utc>,
        config: &HealthMonitorConfig,
    ) {
        self.total_checks += 1;
        self.last_check = now;

        let passed = match outcome {
            ProbeOutcome::Completed {
                alive,
                response_time_ms,
            } => {
                self.response_time_ms = *response_time_ms;
                if !alive {
                    self.last_error = Some("probe reported provider unavailable".to_string());
                }
                *alive
            }
            ProbeOutcome::Failed { reason } => {
                self.last_error = Some(reason.clone());
                false
            }
        };

        if passed {
            self.successful_checks += 1;
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.last_error = None;
            if !self.is_healthy && self.consecutive_successes >= config.recovery_threshold {
                self.is_healthy = true;
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if self.is_healthy && self.consecutive_failures >= config.failure_threshold {
                self.is_healthy = false;
            }
        }

        self.uptime_percent = if self.total_checks == 0 {
            100.0
        } else {
            self.successful_checks as f64 / self.total_checks as f64 * 100.0
        };
    }
}

/// Runs probes and writes the results into the registry
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    registry: ProviderRegistry,
    probes: ProbeSet,
    clock: Arc<dyn Clock>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: ProviderRegistry,
        probes: ProbeSet,
        clock: Arc<dyn Clock>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            probes,
            clock,
            config,
        }
    }

    /// Probe one provider. Never fails: errors and timeouts become a
    /// `Failed` outcome.
    pub async fn probe(&self, probe: &dyn HealthProbe, provider: &Provider) -> ProbeOutcome {
        let started = Instant::now();
        match tokio::time::timeout(self.config.probe_timeout, probe.probe(provider)).await {
            Ok(Ok(alive)) => ProbeOutcome::Completed {
                alive,
                response_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            },
            Ok(Err(e)) => {
                let err = BalancerError::HealthProbe {
                    provider: provider.id,
                    reason: format!("{e:#}"),
                };
                warn!("{}", err);
                ProbeOutcome::Failed {
                    reason: format!("{e:#}"),
                }
            }
            Err(_) => {
                let reason = format!("timed out after {:?}", self.config.probe_timeout);
                let err = BalancerError::HealthProbe {
                    provider: provider.id,
                    reason: reason.clone(),
                };
                warn!("{}", err);
                ProbeOutcome::Failed { reason }
            }
        }
    }

    /// Probe and record one provider. `None` when no probe is registered
    /// for its kind or the provider vanished meanwhile.
    pub async fn check_provider(&self, provider: Provider) -> Option<Provider> {
        let Some(probe) = self.probes.get(provider.kind) else {
            debug!(
                provider = %provider.name,
                kind = provider.kind.as_str(),
                "No health probe registered, skipping"
            );
            return None;
        };

        let outcome = self.probe(probe.as_ref(), &provider).await;
        let now = self.clock.now();
        let was_healthy = provider.health.is_healthy;

        let updated = self
            .registry
            .modify(provider.id, |p| p.health.record_probe(&outcome, now, &self.config))
            .await
            .ok()?;

        if updated.health.is_healthy != was_healthy {
            info!(
                provider_id = %updated.id,
                provider = %updated.name,
                healthy = updated.health.is_healthy,
                consecutive_failures = updated.health.consecutive_failures,
                "Provider health changed"
            );
        }
        Some(updated)
    }

    /// Probe every registered provider concurrently and return the
    /// records that were updated.
    pub async fn check_all(&self) -> Vec<Provider> {
        let providers = self.registry.list_providers().await;
        debug!("Running health checks for {} providers", providers.len());

        let mut tasks = JoinSet::new();
        for provider in providers {
            let monitor = self.clone();
            tasks.spawn(async move { monitor.check_provider(provider).await });
        }

        let mut updated = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(provider)) => updated.push(provider),
                Ok(None) => {}
                Err(e) => warn!("Health check task failed: {}", e),
            }
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HealthUpdate;

    fn config(failure_threshold: u32, recovery_threshold: u32) -> HealthMonitorConfig {
        HealthMonitorConfig {
            probe_timeout: Duration::from_millis(50),
            failure_threshold,
            recovery_threshold,
        }
    }

    fn failed() -> ProbeOutcome {
        ProbeOutcome::Failed {
            reason: "connection refused".to_string(),
        }
    }

    fn passed(ms: f64) -> ProbeOutcome {
        ProbeOutcome::Completed {
            alive: true,
            response_time_ms: ms,
        }
    }

    #[test]
    fn test_single_failure_flips_with_default_thresholds() {
        let now = Utc::now();
        let mut status = HealthStatus::healthy(now);
        let config = HealthMonitorConfig::default();

        status.record_probe(&failed(), now, &config);
        assert!(!status.is_healthy);
        assert_eq!(status.last_error.as_deref(), Some("connection refused"));

        status.record_probe(&passed(40.0), now, &config);
        assert!(status.is_healthy);
        assert_eq!(status.response_time_ms, 40.0);
        assert!((status.uptime_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_hysteresis_needs_consecutive_failures() {
        let now = Utc::now();
        let mut status = HealthStatus::healthy(now);
        let config = config(2, 2);

        status.record_probe(&failed(), now, &config);
        assert!(status.is_healthy);
        status.record_probe(&passed(10.0), now, &config);
        status.record_probe(&failed(), now, &config);
        assert!(status.is_healthy, "streak was broken by a success");
        status.record_probe(&failed(), now, &config);
        assert!(!status.is_healthy);

        status.record_probe(&passed(10.0), now, &config);
        assert!(!status.is_healthy);
        status.record_probe(&passed(10.0), now, &config);
        assert!(status.is_healthy);
    }

    #[test]
    fn test_forced_unhealthy_needs_full_recovery_streak() {
        let now = Utc::now();
        let mut status = HealthStatus::healthy(now);
        let config = config(1, 3);
        for _ in 0..5 {
            status.record_probe(&passed(10.0), now, &config);
        }

        status.apply(&HealthUpdate {
            is_healthy: Some(false),
            ..Default::default()
        });

        status.record_probe(&passed(10.0), now, &config);
        status.record_probe(&passed(10.0), now, &config);
        assert!(!status.is_healthy, "two good probes are below the threshold");
        status.record_probe(&passed(10.0), now, &config);
        assert!(status.is_healthy);
    }

    #[test]
    fn test_failed_probe_keeps_previous_latency() {
        let now = Utc::now();
        let mut status = HealthStatus::healthy(now);
        status.response_time_ms = 250.0;

        status.record_probe(&failed(), now, &HealthMonitorConfig::default());
        assert_eq!(status.response_time_ms, 250.0);
        assert_eq!(status.total_checks, 1);
        assert_eq!(status.uptime_percent, 0.0);
    }

    #[test]
    fn test_dead_verdict_records_latency() {
        let now = Utc::now();
        let mut status = HealthStatus::healthy(now);

        let outcome = ProbeOutcome::Completed {
            alive: false,
            response_time_ms: 900.0,
        };
        status.record_probe(&outcome, now, &HealthMonitorConfig::default());
        assert!(!status.is_healthy);
        assert_eq!(status.response_time_ms, 900.0);
    }
}
