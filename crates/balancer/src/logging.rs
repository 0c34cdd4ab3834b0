//! Subscriber setup for binaries embedding the engine

use std::str::FromStr;
use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set
    pub level: Level,
    /// One JSON object per event, for log shippers
    pub json_output: bool,
    /// ANSI colors (human-readable output only)
    pub color_output: bool,
    pub include_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_output: false,
            color_output: true,
            include_line_numbers: cfg!(debug_assertions),
        }
    }
}

impl LoggingConfig {
    /// Reads `BALANCER_LOG_LEVEL` and `BALANCER_LOG_JSON`; anything
    /// unparsable keeps the default
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(level) = std::env::var("BALANCER_LOG_LEVEL")
            .ok()
            .and_then(|raw| Level::from_str(raw.trim()).ok())
        {
            config.level = level;
        }
        if let Ok(raw) = std::env::var("BALANCER_LOG_JSON") {
            config.json_output = matches!(raw.trim(), "1" | "true" | "yes");
        }
        config
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: LoggingConfig) -> anyhow::Result<()> {
    tracing::subscriber::set_global_default(build_subscriber(&config))?;
    Ok(())
}

/// The subscriber [`init_logging`] installs, for callers that scope it
/// with `tracing::subscriber::with_default` instead
pub fn build_subscriber(config: &LoggingConfig) -> Box<dyn Subscriber + Send + Sync> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    if config.json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_line_number(config.include_line_numbers);

        Box::new(Registry::default().with(env_filter).with(json_layer))
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(config.include_line_numbers)
            .with_ansi(config.color_output)
            .with_span_events(FmtSpan::CLOSE);

        Box::new(Registry::default().with(env_filter).with(fmt_layer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_human_readable_info() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json_output);
    }

    #[test]
    fn test_scoped_subscriber_honors_level() {
        let config = LoggingConfig {
            level: Level::WARN,
            json_output: true,
            ..LoggingConfig::default()
        };

        tracing::subscriber::with_default(build_subscriber(&config), || {
            assert!(tracing::enabled!(Level::ERROR));
            if std::env::var("RUST_LOG").is_err() {
                assert!(!tracing::enabled!(Level::INFO));
            }
        });
    }
}
