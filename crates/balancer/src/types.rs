//! Core data model: providers, requests and selections

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Server-generated provider identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(Uuid);

impl ProviderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProviderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ProviderId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for ProviderId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Supported provider families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Custom => "custom",
        }
    }

    /// Hosted kinds cannot be reached without a credential
    pub fn requires_credential(&self) -> bool {
        !matches!(self, ProviderKind::Custom)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "custom" => Ok(ProviderKind::Custom),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

/// Per-minute request and token budget with live counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    #[serde(default)]
    pub current_requests: u64,
    #[serde(default)]
    pub current_tokens: u64,
    pub last_reset_at: DateTime<Utc>,
}

impl RateLimitState {
    pub fn new(requests_per_minute: u64, tokens_per_minute: u64, now: DateTime<Utc>) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute,
            current_requests: 0,
            current_tokens: 0,
            last_reset_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub last_check: DateTime<Utc>,
    #[serde(default)]
    pub response_time_ms: f64,
    /// Percentage of failed requests, exponentially smoothed
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default = "default_uptime")]
    pub uptime_percent: f64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub total_checks: u64,
    #[serde(default)]
    pub successful_checks: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_uptime() -> f64 {
    100.0
}

impl HealthStatus {
    pub fn healthy(now: DateTime<Utc>) -> Self {
        Self {
            is_healthy: true,
            last_check: now,
            response_time_ms: 0.0,
            error_rate: 0.0,
            uptime_percent: 100.0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_checks: 0,
            successful_checks: 0,
            last_error: None,
        }
    }

    /// Merge the set fields of a partial update.
    ///
    /// An explicit `is_healthy` restarts both probe streaks, so the next
    /// transition needs a full threshold of probes.
    pub fn apply(&mut self, update: &HealthUpdate) {
        if let Some(is_healthy) = update.is_healthy {
            self.is_healthy = is_healthy;
            self.consecutive_successes = 0;
            self.consecutive_failures = 0;
        }
        if let Some(last_check) = update.last_check {
            self.last_check = last_check;
        }
        if let Some(response_time_ms) = update.response_time_ms {
            self.response_time_ms = response_time_ms;
        }
        if let Some(error_rate) = update.error_rate {
            self.error_rate = error_rate;
        }
        if let Some(uptime_percent) = update.uptime_percent {
            self.uptime_percent = uptime_percent;
        }
    }
}

/// Partial health status; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthUpdate {
    pub is_healthy: Option<bool>,
    pub last_check: Option<DateTime<Utc>>,
    pub response_time_ms: Option<f64>,
    pub error_rate: Option<f64>,
    pub uptime_percent: Option<f64>,
}

/// USD per million tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCost {
    pub input_cost_per_1m_tokens: f64,
    pub output_cost_per_1m_tokens: f64,
}

impl ProviderCost {
    pub fn new(input: f64, output: f64) -> Self {
        Self {
            input_cost_per_1m_tokens: input,
            output_cost_per_1m_tokens: output,
        }
    }

    pub fn estimate(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 / 1_000_000.0 * self.input_cost_per_1m_tokens
            + output_tokens as f64 / 1_000_000.0 * self.output_cost_per_1m_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    pub credential: String,
    pub models: BTreeSet<String>,
    pub rate_limit: RateLimitState,
    pub health: HealthStatus,
    pub cost: ProviderCost,
    /// 1-10, higher is preferred
    pub priority: u8,
    pub is_active: bool,
}

impl Provider {
    pub fn from_spec(id: ProviderId, spec: ProviderSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            endpoint: spec.endpoint,
            credential: spec.credential,
            models: spec.models,
            rate_limit: RateLimitState::new(spec.requests_per_minute, spec.tokens_per_minute, now),
            health: HealthStatus::healthy(now),
            cost: spec.cost,
            priority: spec.priority,
            is_active: spec.is_active,
        }
    }

    pub fn supports(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    pub fn estimate_cost(&self, request: &BalancerRequest) -> f64 {
        self.cost
            .estimate(request.input_tokens, request.estimated_output_tokens)
    }
}

/// Input to `add_provider`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    #[serde(default)]
    pub credential: String,
    pub models: BTreeSet<String>,
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    #[serde(default)]
    pub cost: ProviderCost,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_priority() -> u8 {
    5
}

fn default_active() -> bool {
    true
}

impl ProviderSpec {
    pub fn new(name: &str, kind: ProviderKind, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            endpoint: endpoint.to_string(),
            credential: String::new(),
            models: BTreeSet::new(),
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            cost: ProviderCost::default(),
            priority: default_priority(),
            is_active: true,
        }
    }

    pub fn credential(mut self, credential: &str) -> Self {
        self.credential = credential.to_string();
        self
    }

    pub fn model(mut self, model: &str) -> Self {
        self.models.insert(model.to_string());
        self
    }

    pub fn rate_limits(mut self, requests_per_minute: u64, tokens_per_minute: u64) -> Self {
        self.requests_per_minute = requests_per_minute;
        self.tokens_per_minute = tokens_per_minute;
        self
    }

    pub fn cost(mut self, input_per_1m: f64, output_per_1m: f64) -> Self {
        self.cost = ProviderCost::new(input_per_1m, output_per_1m);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Request priority lanes, declared in drain order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl RequestPriority {
    pub const DRAIN_ORDER: [RequestPriority; 4] = [
        RequestPriority::Critical,
        RequestPriority::High,
        RequestPriority::Medium,
        RequestPriority::Low,
    ];

    pub fn lane(&self) -> usize {
        match self {
            RequestPriority::Critical => 0,
            RequestPriority::High => 1,
            RequestPriority::Medium => 2,
            RequestPriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPriority::Critical => "critical",
            RequestPriority::High => "high",
            RequestPriority::Medium => "medium",
            RequestPriority::Low => "low",
        }
    }
}

impl FromStr for RequestPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(RequestPriority::Critical),
            "high" => Ok(RequestPriority::High),
            "medium" => Ok(RequestPriority::Medium),
            "low" => Ok(RequestPriority::Low),
            other => Err(format!("unknown request priority: {other}")),
        }
    }
}

/// An inference request awaiting routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerRequest {
    pub id: String,
    pub operation: String,
    pub model: String,
    pub input_tokens: u64,
    pub estimated_output_tokens: u64,
    pub priority: RequestPriority,
    pub max_retries: u32,
    /// Carried for the caller; not enforced by the engine
    pub timeout_ms: u64,
    pub requester_id: Option<String>,
    pub organization_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl BalancerRequest {
    pub fn new(model: &str, input_tokens: u64, estimated_output_tokens: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation: "completion".to_string(),
            model: model.to_string(),
            input_tokens,
            estimated_output_tokens,
            priority: RequestPriority::Medium,
            max_retries: 3,
            timeout_ms: 30_000,
            requester_id: None,
            organization_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.operation = operation.to_string();
        self
    }

    pub fn priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn requester(mut self, requester_id: &str, organization_id: &str) -> Self {
        self.requester_id = Some(requester_id.to_string());
        self.organization_id = Some(organization_id.to_string());
        self
    }

    pub fn metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.estimated_output_tokens)
    }
}

/// Outcome of a successful routing decision
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Provider record as it was at selection time
    pub provider: Provider,
    pub reason: String,
    pub estimated_cost: f64,
    pub estimated_latency_ms: f64,
}
