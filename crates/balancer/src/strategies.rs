//! Provider selection strategies
//!
//! Every strategy receives an already-filtered, non-empty candidate list
//! (active, healthy, model-capable, within budget) and picks one entry.
//! Strategies never charge the rate budget; the registry does that in the
//! same guarded step that runs the selection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::types::{BalancerRequest, Provider, ProviderId, Selection};

/// Trait for provider selection strategies
pub trait SelectionStrategy: Send + Sync + std::fmt::Debug {
    /// Pick one provider. Returns `None` only when `candidates` is empty.
    fn select(&self, candidates: &[Provider], request: &BalancerRequest) -> Option<Selection>;

    /// Get strategy name for logging and debugging
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;
}

/// Serializable strategy choice with its kind-specific settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StrategyConfig {
    RoundRobin,
    LeastCost {
        /// Prefer candidates whose estimated cost is at or under this value
        #[serde(default)]
        max_cost: Option<f64>,
    },
    LeastLatency {
        #[serde(default)]
        max_latency_ms: Option<f64>,
    },
    Weighted {
        /// Score multiplier per provider, 1.0 when absent
        #[serde(default)]
        weights: HashMap<ProviderId, f64>,
    },
    Failover {
        order: Vec<ProviderId>,
    },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::Weighted {
            weights: HashMap::new(),
        }
    }
}

impl StrategyConfig {
    /// Parse a bare strategy name with empty settings
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().replace('_', "-").as_str() {
            "round-robin" => Some(StrategyConfig::RoundRobin),
            "least-cost" => Some(StrategyConfig::LeastCost { max_cost: None }),
            "least-latency" => Some(StrategyConfig::LeastLatency {
                max_latency_ms: None,
            }),
            "weighted" => Some(StrategyConfig::default()),
            "failover" => Some(StrategyConfig::Failover { order: Vec::new() }),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StrategyConfig::RoundRobin => "round-robin",
            StrategyConfig::LeastCost { .. } => "least-cost",
            StrategyConfig::LeastLatency { .. } => "least-latency",
            StrategyConfig::Weighted { .. } => "weighted",
            StrategyConfig::Failover { .. } => "failover",
        }
    }

    /// Instantiate the strategy. `cursor` is the engine-wide round-robin
    /// position and survives strategy swaps.
    pub fn build(&self, cursor: Arc<AtomicUsize>) -> Box<dyn SelectionStrategy> {
        match self.clone() {
            StrategyConfig::RoundRobin => Box::new(RoundRobinStrategy::new(cursor)),
            StrategyConfig::LeastCost { max_cost } => Box::new(LeastCostStrategy { max_cost }),
            StrategyConfig::LeastLatency { max_latency_ms } => {
                Box::new(LeastLatencyStrategy { max_latency_ms })
            }
            StrategyConfig::Weighted { weights } => Box::new(WeightedStrategy { weights }),
            StrategyConfig::Failover { order } => Box::new(FailoverStrategy { order }),
        }
    }
}

fn selection_for(provider: &Provider, request: &BalancerRequest, reason: String) -> Selection {
    Selection {
        provider: provider.clone(),
        reason,
        estimated_cost: provider.estimate_cost(request),
        estimated_latency_ms: provider.health.response_time_ms,
    }
}

/// Index of the first minimum; earlier candidates win ties
fn first_min_by<F>(candidates: &[&Provider], key: F) -> Option<usize>
where
    F: Fn(&Provider) -> f64,
{
    let mut best: Option<(usize, f64)> = None;
    for (idx, provider) in candidates.iter().enumerate() {
        let value = key(provider);
        match best {
            Some((_, best_value)) if value >= best_value => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Candidates satisfying `keep`, or all of them when none do
fn preferred<'a, F>(candidates: &'a [Provider], keep: F) -> Vec<&'a Provider>
where
    F: Fn(&Provider) -> bool,
{
    let within: Vec<&Provider> = candidates.iter().filter(|p| keep(p)).collect();
    if within.is_empty() {
        candidates.iter().collect()
    } else {
        within
    }
}

/// Rotates a shared cursor over the candidate list.
///
/// The cursor indexes whatever list it is handed, so when membership
/// changes between calls a provider can be skipped or visited twice.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    cursor: Arc<AtomicUsize>,
}

impl RoundRobinStrategy {
    pub fn new(cursor: Arc<AtomicUsize>) -> Self {
        Self { cursor }
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn select(&self, candidates: &[Provider], request: &BalancerRequest) -> Option<Selection> {
        if candidates.is_empty() {
            return None;
        }

        let counter = self.cursor.fetch_add(1, Ordering::Relaxed);
        let index = counter % candidates.len();
        let provider = &candidates[index];
        debug!(index, provider = %provider.id, "Round-robin selection");

        Some(selection_for(
            provider,
            request,
            format!("Round-robin selection (index: {index})"),
        ))
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn description(&self) -> &'static str {
        "Rotates through eligible providers using a shared cursor"
    }
}

#[derive(Debug, Default)]
pub struct LeastCostStrategy {
    pub max_cost: Option<f64>,
}

impl SelectionStrategy for LeastCostStrategy {
    fn select(&self, candidates: &[Provider], request: &BalancerRequest) -> Option<Selection> {
        let pool = match self.max_cost {
            Some(max) => preferred(candidates, |p| p.estimate_cost(request) <= max),
            None => candidates.iter().collect(),
        };
        let index = first_min_by(&pool, |p| p.estimate_cost(request))?;
        let provider = pool[index];
        let cost = provider.estimate_cost(request);

        Some(selection_for(
            provider,
            request,
            format!("Lowest estimated cost: ${cost:.6}"),
        ))
    }

    fn name(&self) -> &'static str {
        "least-cost"
    }

    fn description(&self) -> &'static str {
        "Selects the provider with the lowest estimated request cost"
    }
}

#[derive(Debug, Default)]
pub struct LeastLatencyStrategy {
    pub max_latency_ms: Option<f64>,
}

impl SelectionStrategy for LeastLatencyStrategy {
    fn select(&self, candidates: &[Provider], request: &BalancerRequest) -> Option<Selection> {
        let pool = match self.max_latency_ms {
            Some(max) => preferred(candidates, |p| p.health.response_time_ms <= max),
            None => candidates.iter().collect(),
        };
        let index = first_min_by(&pool, |p| p.health.response_time_ms)?;
        let provider = pool[index];

        Some(selection_for(
            provider,
            request,
            format!(
                "Lowest observed latency: {:.0}ms",
                provider.health.response_time_ms
            ),
        ))
    }

    fn name(&self) -> &'static str {
        "least-latency"
    }

    fn description(&self) -> &'static str {
        "Selects the provider with the lowest health-check response time"
    }
}

/// Blends cost, latency and priority into one score.
///
/// `1000/(cost+1) + 5000/(latency+1) + priority*100`, scaled by the
/// provider's configured weight.
#[derive(Debug, Default)]
pub struct WeightedStrategy {
    pub weights: HashMap<ProviderId, f64>,
}

impl WeightedStrategy {
    pub fn score(&self, provider: &Provider, request: &BalancerRequest) -> f64 {
        let cost = provider.estimate_cost(request);
        let latency = provider.health.response_time_ms;
        let base = 1000.0 / (cost + 1.0) + 5000.0 / (latency + 1.0) + provider.priority as f64 * 100.0;
        base * self.weights.get(&provider.id).copied().unwrap_or(1.0)
    }
}

impl SelectionStrategy for WeightedStrategy {
    fn select(&self, candidates: &[Provider], request: &BalancerRequest) -> Option<Selection> {
        let mut best: Option<(&Provider, f64)> = None;
        for provider in candidates {
            let score = self.score(provider, request);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((provider, score)),
            }
        }

        let (provider, score) = best?;
        Some(selection_for(
            provider,
            request,
            format!("Weighted score: {score:.1}"),
        ))
    }

    fn name(&self) -> &'static str {
        "weighted"
    }

    fn description(&self) -> &'static str {
        "Scores providers on cost, latency and priority"
    }
}

/// Walks an explicit provider order, degrading to any healthy candidate
/// and finally to the first candidate.
#[derive(Debug, Default)]
pub struct FailoverStrategy {
    pub order: Vec<ProviderId>,
}

impl SelectionStrategy for FailoverStrategy {
    fn select(&self, candidates: &[Provider], request: &BalancerRequest) -> Option<Selection> {
        for (rank, id) in self.order.iter().enumerate() {
            if let Some(provider) = candidates
                .iter()
                .find(|p| p.id == *id && p.health.is_healthy)
            {
                return Some(selection_for(
                    provider,
                    request,
                    format!("Failover order position {rank}"),
                ));
            }
        }

        if let Some(provider) = candidates.iter().find(|p| p.health.is_healthy) {
            return Some(selection_for(
                provider,
                request,
                "No ordered provider available, first healthy candidate".to_string(),
            ));
        }

        candidates.first().map(|provider| {
            selection_for(
                provider,
                request,
                "No healthy candidate, using first candidate".to_string(),
            )
        })
    }

    fn name(&self) -> &'static str {
        "failover"
    }

    fn description(&self) -> &'static str {
        "Follows an explicit provider order with health-based fallback"
    }
}
