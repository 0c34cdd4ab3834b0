//! Error types for the balancer engine

use thiserror::Error;

use crate::types::ProviderId;

/// Errors surfaced by engine operations
#[derive(Error, Debug)]
pub enum BalancerError {
    /// Invalid engine configuration or provider spec. Fatal at construction.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The eligible provider set was empty at routing time.
    #[error("No providers available for model {model}")]
    NoAvailableProviders { model: String },

    /// A liveness probe failed or timed out. Only ever logged by the health monitor.
    #[error("Health probe failed for provider {provider}: {reason}")]
    HealthProbe { provider: ProviderId, reason: String },

    /// The in-memory change was applied but could not be written to the store.
    #[error("Persistence error: {0}")]
    Persistence(#[source] StoreError),

    #[error("Metrics aggregation failed: {0}")]
    MetricsAggregation(#[source] StoreError),

    #[error("Admission queue full ({capacity} requests)")]
    QueueFull { capacity: usize },

    #[error("Provider not found: {0}")]
    ProviderNotFound(ProviderId),

    #[error("Scaling policy not found: {0}")]
    PolicyNotFound(uuid::Uuid),
}

/// Store boundary errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupted row: {0}")]
    Corrupted(String),
}

pub type Result<T, E = BalancerError> = std::result::Result<T, E>;

impl BalancerError {
    /// Whether the caller may reasonably retry the same request later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BalancerError::NoAvailableProviders { .. } | BalancerError::QueueFull { .. }
        )
    }
}
