//! Engine configuration

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::{BalancerError, Result};
use crate::rate_limit::RATE_LIMIT_WINDOW_MS;
use crate::strategies::StrategyConfig;

/// Runtime configuration for the load balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// SQLite database path; `:memory:` keeps everything in process
    pub database_path: String,
    /// Strategy used until `set_strategy` is called
    pub default_strategy: StrategyConfig,
    pub rate_limit: RateLimitConfig,
    pub health: HealthConfig,
    pub queue: QueueConfig,
    pub scaling: ScalingConfig,
    /// Trailing request-log window used by the metrics snapshot
    pub metrics_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Budget window length
    pub window_ms: u64,
    /// Interval of the unconditional reset loop
    pub reset_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Consecutive failed probes before a healthy provider is marked unhealthy
    pub failure_threshold: u32,
    /// Consecutive good probes before an unhealthy provider is restored
    pub recovery_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub drain_interval_ms: u64,
    /// `None` keeps the admission queue unbounded
    pub capacity: Option<usize>,
    /// Drain outcomes retained for `take_drain_outcomes`; newer ones are
    /// dropped once it is full
    #[serde(default = "default_outcome_buffer")]
    pub outcome_buffer: usize,
}

fn default_outcome_buffer() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub evaluation_interval_secs: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            database_path: "balancer.db".to_string(),
            default_strategy: StrategyConfig::default(),
            rate_limit: RateLimitConfig::default(),
            health: HealthConfig::default(),
            queue: QueueConfig::default(),
            scaling: ScalingConfig::default(),
            metrics_window_secs: 3600,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: RATE_LIMIT_WINDOW_MS,
            reset_interval_secs: 60,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            probe_timeout_secs: 10,
            failure_threshold: 1,
            recovery_threshold: 1,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: 100,
            capacity: None,
            outcome_buffer: default_outcome_buffer(),
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 60,
        }
    }
}

impl BalancerConfig {
    /// Build configuration from `BALANCER_*` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    /// Unset variables keep their defaults; malformed ones are rejected.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Ok(path) = env::var("BALANCER_DATABASE_PATH") {
            config.database_path = path;
        }
        if let Ok(strategy) = env::var("BALANCER_STRATEGY") {
            config.default_strategy = StrategyConfig::from_name(&strategy).ok_or_else(|| {
                BalancerError::Configuration(format!("unknown strategy: {strategy}"))
            })?;
        }
        read_var("BALANCER_RATE_LIMIT_WINDOW_MS", &mut config.rate_limit.window_ms)?;
        read_var(
            "BALANCER_RATE_LIMIT_RESET_SECS",
            &mut config.rate_limit.reset_interval_secs,
        )?;
        read_var(
            "BALANCER_HEALTH_INTERVAL_SECS",
            &mut config.health.check_interval_secs,
        )?;
        read_var(
            "BALANCER_PROBE_TIMEOUT_SECS",
            &mut config.health.probe_timeout_secs,
        )?;
        read_var(
            "BALANCER_HEALTH_FAILURE_THRESHOLD",
            &mut config.health.failure_threshold,
        )?;
        read_var(
            "BALANCER_HEALTH_RECOVERY_THRESHOLD",
            &mut config.health.recovery_threshold,
        )?;
        read_var("BALANCER_DRAIN_INTERVAL_MS", &mut config.queue.drain_interval_ms)?;
        if let Ok(raw) = env::var("BALANCER_QUEUE_CAPACITY") {
            config.queue.capacity = Some(parse_var("BALANCER_QUEUE_CAPACITY", &raw)?);
        }
        read_var(
            "BALANCER_DRAIN_OUTCOME_BUFFER",
            &mut config.queue.outcome_buffer,
        )?;
        read_var(
            "BALANCER_SCALING_INTERVAL_SECS",
            &mut config.scaling.evaluation_interval_secs,
        )?;
        read_var("BALANCER_METRICS_WINDOW_SECS", &mut config.metrics_window_secs)?;

        config.validate()?;
        debug!("Loaded balancer config from environment: {:?}", config);
        Ok(config)
    }

    /// In-memory database, default timings
    pub fn in_memory() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, u64); 6] = [
            ("rate_limit.window_ms", self.rate_limit.window_ms),
            (
                "rate_limit.reset_interval_secs",
                self.rate_limit.reset_interval_secs,
            ),
            ("health.check_interval_secs", self.health.check_interval_secs),
            ("queue.drain_interval_ms", self.queue.drain_interval_ms),
            (
                "scaling.evaluation_interval_secs",
                self.scaling.evaluation_interval_secs,
            ),
            ("metrics_window_secs", self.metrics_window_secs),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(BalancerError::Configuration(format!(
                    "{field} must be greater than zero"
                )));
            }
        }

        if self.health.failure_threshold == 0 || self.health.recovery_threshold == 0 {
            return Err(BalancerError::Configuration(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        if self.queue.capacity == Some(0) {
            return Err(BalancerError::Configuration(
                "queue.capacity must be greater than zero when set".to_string(),
            ));
        }
        if self.queue.outcome_buffer == 0 {
            return Err(BalancerError::Configuration(
                "queue.outcome_buffer must be greater than zero".to_string(),
            ));
        }
        if self.database_path.trim().is_empty() {
            return Err(BalancerError::Configuration(
                "database_path is required".to_string(),
            ));
        }

        Ok(())
    }

    pub fn rate_limit_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.rate_limit.window_ms as i64)
    }

    pub fn metrics_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.metrics_window_secs as i64)
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit.reset_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health.probe_timeout_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.queue.drain_interval_ms)
    }

    pub fn scaling_interval(&self) -> Duration {
        Duration::from_secs(self.scaling.evaluation_interval_secs)
    }
}

fn read_var<T: FromStr>(name: &str, target: &mut T) -> Result<()> {
    if let Ok(raw) = env::var(name) {
        *target = parse_var(name, &raw)?;
    }
    Ok(())
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| BalancerError::Configuration(format!("{name} has invalid value: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_loop_cadences() {
        let config = BalancerConfig::default();
        assert_eq!(config.health_check_interval(), Duration::from_secs(30));
        assert_eq!(config.reset_interval(), Duration::from_secs(60));
        assert_eq!(config.rate_limit_window(), chrono::Duration::seconds(60));
        assert_eq!(config.queue.capacity, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = BalancerConfig::in_memory();
        config.queue.drain_interval_ms = 0;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, BalancerError::Configuration(_)));
        assert!(err.to_string().contains("drain_interval_ms"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity_and_thresholds() {
        let mut config = BalancerConfig::in_memory();
        config.queue.capacity = Some(0);
        assert!(config.validate().is_err());

        let mut config = BalancerConfig::in_memory();
        config.health.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = BalancerConfig::in_memory();
        config.queue.outcome_buffer = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("outcome_buffer"));
    }

    #[test]
    fn test_parse_var_reports_name() {
        let err = parse_var::<u64>("BALANCER_X", "abc").unwrap_err();
        assert!(err.to_string().contains("BALANCER_X"));
    }
}
