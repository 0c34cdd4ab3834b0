//! Metrics snapshot built from the registry and the trailing request log

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::error::{BalancerError, Result};
use crate::queue::QueueDepth;
use crate::store::ProviderStore;
use crate::types::{Provider, ProviderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestStatus::Success)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(RequestStatus::Success),
            "error" => Ok(RequestStatus::Error),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

/// One completed request as reported by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub provider_id: ProviderId,
    pub response_time_ms: f64,
    pub status: RequestStatus,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// Per-provider figures over the metrics window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUtilization {
    pub name: String,
    pub requests: u64,
    pub average_response_time: f64,
    /// Percentage, 0-100
    pub error_rate: f64,
    pub request_budget_used_pct: f64,
    pub token_budget_used_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_providers: usize,
    pub active_providers: usize,
    pub healthy_providers: usize,
    pub total_requests: u64,
    /// Requests per minute over the window
    pub request_rate: f64,
    pub queue_depth: usize,
    pub queue_depth_by_priority: QueueDepth,
    pub average_response_time: f64,
    /// Percentage, 0-100
    pub error_rate: f64,
    pub total_cost: f64,
    pub provider_utilization: BTreeMap<ProviderId, ProviderUtilization>,
    pub cost_breakdown: BTreeMap<ProviderId, f64>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LogTotals {
    requests: u64,
    errors: u64,
    response_time_sum: f64,
    cost: f64,
}

impl LogTotals {
    fn add(&mut self, entry: &RequestLogEntry) {
        self.requests += 1;
        if !entry.status.is_success() {
            self.errors += 1;
        }
        self.response_time_sum += entry.response_time_ms;
        self.cost += entry.cost;
    }

    fn average_response_time(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.response_time_sum / self.requests as f64
        }
    }

    fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64 * 100.0
        }
    }
}

/// Combine registry state, queue depth and log entries into a snapshot.
///
/// Log entries for providers no longer registered still count toward the
/// totals and the cost breakdown.
pub fn aggregate(
    providers: &[Provider],
    queue_depth: QueueDepth,
    logs: &[RequestLogEntry],
    window: Duration,
    now: DateTime<Utc>,
) -> MetricsSnapshot {
    let mut overall = LogTotals::default();
    let mut by_provider: BTreeMap<ProviderId, LogTotals> = BTreeMap::new();
    for entry in logs {
        overall.add(entry);
        by_provider.entry(entry.provider_id).or_default().add(entry);
    }

    let provider_utilization = providers
        .iter()
        .map(|provider| {
            let totals = by_provider.get(&provider.id);
            let utilization = ProviderUtilization {
                name: provider.name.clone(),
                requests: totals.map_or(0, |t| t.requests),
                average_response_time: totals.map_or(0.0, LogTotals::average_response_time),
                error_rate: totals.map_or(0.0, LogTotals::error_rate),
                request_budget_used_pct: provider.rate_limit.request_utilization_pct(),
                token_budget_used_pct: provider.rate_limit.token_utilization_pct(),
            };
            (provider.id, utilization)
        })
        .collect();

    let cost_breakdown = by_provider
        .iter()
        .map(|(id, totals)| (*id, totals.cost))
        .collect();

    let window_minutes = window.num_milliseconds() as f64 / 60_000.0;
    let request_rate = if window_minutes > 0.0 {
        overall.requests as f64 / window_minutes
    } else {
        0.0
    };

    MetricsSnapshot {
        total_providers: providers.len(),
        active_providers: providers.iter().filter(|p| p.is_active).count(),
        healthy_providers: providers.iter().filter(|p| p.health.is_healthy).count(),
        total_requests: overall.requests,
        request_rate,
        queue_depth: queue_depth.total(),
        queue_depth_by_priority: queue_depth,
        average_response_time: overall.average_response_time(),
        error_rate: overall.error_rate(),
        total_cost: overall.cost,
        provider_utilization,
        cost_breakdown,
        generated_at: now,
    }
}

/// Reads the trailing window of the request log from the store
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    store: Arc<dyn ProviderStore>,
    window: Duration,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn ProviderStore>, window: Duration) -> Self {
        Self { store, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Fails as a whole if the log cannot be read; no partial snapshot
    pub async fn snapshot(
        &self,
        providers: &[Provider],
        queue_depth: QueueDepth,
        now: DateTime<Utc>,
    ) -> Result<MetricsSnapshot> {
        let loaded = self
            .store
            .request_logs_since(now - self.window)
            .await
            .map_err(BalancerError::MetricsAggregation)?;

        debug!(
            entries = loaded.rows.len(),
            quarantined = loaded.quarantined.len(),
            "Aggregating request log"
        );

        Ok(aggregate(providers, queue_depth, &loaded.rows, self.window, now))
    }
}
