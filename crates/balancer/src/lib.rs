//! Balancer
//!
//! In-process routing and admission control for requests to hosted AI
//! model providers. It covers provider registration with per-minute
//! request/token budgets, pluggable selection strategies, a priority
//! admission queue, health probing, scaling policies driven by a metrics
//! snapshot, and SQLite persistence.
//!
//! ```no_run
//! use balancer::{BalancerConfig, BalancerRequest, LoadBalancer, ProviderKind, ProviderSpec};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = LoadBalancer::builder(BalancerConfig::from_env()?).build().await?;
//!
//!     engine
//!         .add_provider(
//!             ProviderSpec::new("openai-primary", ProviderKind::OpenAi, "https://api.openai.com/v1")
//!                 .credential("sk-...")
//!                 .model("gpt-4o")
//!                 .rate_limits(500, 200_000)
//!                 .cost(2.5, 10.0),
//!         )
//!         .await?;
//!     engine.start().await?;
//!
//!     let selection = engine
//!         .route_request(&BalancerRequest::new("gpt-4o", 1_200, 400))
//!         .await?;
//!     println!("{} ({})", selection.provider.name, selection.reason);
//!
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod scaling;
pub mod store;
pub mod strategies;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::BalancerConfig;
pub use engine::{DrainOutcome, LoadBalancer, LoadBalancerBuilder};
pub use error::{BalancerError, Result, StoreError};
#[cfg(feature = "http-probe")]
pub use health::HttpHealthProbe;
pub use health::{HealthProbe, ProbeSet};
pub use metrics::{MetricsSnapshot, ProviderUtilization, RequestLogEntry, RequestStatus};
pub use queue::QueueDepth;
pub use scaling::{
    LoggingScaleHandler, ScaleAction, ScalingActionHandler, ScalingEvent, ScalingPolicy,
    ScalingPolicySpec, TriggerMetric,
};
pub use store::{LoadedRows, ProviderStore, QuarantinedRow, SqliteStore};
pub use strategies::{SelectionStrategy, StrategyConfig};
pub use types::*;
