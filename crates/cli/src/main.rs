use anyhow::{Context, Result};
use balancer::logging::{init_logging, LoggingConfig};
use balancer::{
    BalancerConfig, BalancerRequest, LoadBalancer, ProviderId, ProviderKind, ProviderSpec,
    RequestPriority, ScaleAction, ScalingPolicySpec, StrategyConfig, TriggerMetric,
};
use clap::{Parser, Subcommand};
use console::style;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "balancerctl")]
#[command(about = "Operate the AI provider load balancer")]
#[command(version)]
struct Cli {
    /// SQLite database path (overrides BALANCER_DATABASE_PATH)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage providers
    Providers {
        #[command(subcommand)]
        command: ProviderCommands,
    },
    /// Manage scaling policies
    Policies {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// Print the current metrics snapshot as JSON
    Snapshot,
    /// Route one request and print the selection
    Route {
        #[arg(long)]
        model: String,
        #[arg(long, default_value_t = 1_000)]
        input_tokens: u64,
        #[arg(long, default_value_t = 500)]
        output_tokens: u64,
        #[arg(long, default_value = "medium")]
        priority: RequestPriority,
        /// Strategy name, e.g. least-cost
        #[arg(long)]
        strategy: Option<String>,
    },
    /// Run the background loops until Ctrl-C
    Run {
        #[arg(long)]
        strategy: Option<String>,
    },
}

#[derive(Subcommand)]
enum ProviderCommands {
    /// Register a provider
    Add {
        #[arg(long)]
        name: String,
        /// openai, anthropic or custom
        #[arg(long)]
        kind: ProviderKind,
        #[arg(long)]
        endpoint: String,
        /// API key; falls back to BALANCER_PROVIDER_CREDENTIAL
        #[arg(long, env = "BALANCER_PROVIDER_CREDENTIAL", hide_env_values = true)]
        credential: Option<String>,
        /// Supported model, repeatable
        #[arg(long = "model", required = true)]
        models: Vec<String>,
        #[arg(long, default_value_t = 60)]
        rpm: u64,
        #[arg(long, default_value_t = 100_000)]
        tpm: u64,
        /// USD per million input tokens
        #[arg(long, default_value_t = 0.0)]
        input_cost: f64,
        /// USD per million output tokens
        #[arg(long, default_value_t = 0.0)]
        output_cost: f64,
        #[arg(long, default_value_t = 5)]
        priority: u8,
    },
    /// List registered providers
    List,
    /// Take a provider out of rotation
    Disable { id: ProviderId },
    /// Put a provider back into rotation
    Enable { id: ProviderId },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Add a scaling policy
    Add {
        #[arg(long)]
        name: String,
        /// request_rate, error_rate, response_time, cost or queue_depth
        #[arg(long)]
        metric: TriggerMetric,
        #[arg(long)]
        threshold: f64,
        /// scale_up, scale_down, switch_provider or throttle
        #[arg(long)]
        action: ScaleAction,
        #[arg(long, default_value_t = 300)]
        cooldown: u64,
    },
    /// List scaling policies
    List,
    Disable { id: Uuid },
    Enable { id: Uuid },
}

fn parse_strategy(name: &str) -> Result<StrategyConfig> {
    StrategyConfig::from_name(name).with_context(|| format!("unknown strategy: {name}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env();
    logging.json_output |= cli.json_logs;
    init_logging(logging)?;

    let mut config = BalancerConfig::from_env()?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    let engine = LoadBalancer::builder(config).build().await?;

    match cli.command {
        Commands::Providers { command } => handle_providers(&engine, command).await?,
        Commands::Policies { command } => handle_policies(&engine, command).await?,
        Commands::Snapshot => {
            let snapshot = engine.get_metrics_snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Route {
            model,
            input_tokens,
            output_tokens,
            priority,
            strategy,
        } => {
            if let Some(name) = strategy {
                engine.set_strategy(parse_strategy(&name)?).await;
            }
            let request =
                BalancerRequest::new(&model, input_tokens, output_tokens).priority(priority);
            let selection = engine.route_request(&request).await?;
            println!(
                "{} {} ({})",
                style("→").green().bold(),
                style(&selection.provider.name).bold(),
                selection.provider.id
            );
            println!("  reason:         {}", selection.reason);
            println!("  estimated cost: ${:.6}", selection.estimated_cost);
            println!("  latency:        {:.0}ms", selection.estimated_latency_ms);
        }
        Commands::Run { strategy } => {
            if let Some(name) = strategy {
                engine.set_strategy(parse_strategy(&name)?).await;
            }
            engine.start().await?;
            println!(
                "{} balancer running with strategy {}, press Ctrl-C to stop",
                style("●").green(),
                style(engine.current_strategy().await.name()).cyan()
            );
            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            engine.stop().await;
        }
    }

    Ok(())
}

async fn handle_providers(engine: &LoadBalancer, command: ProviderCommands) -> Result<()> {
    match command {
        ProviderCommands::Add {
            name,
            kind,
            endpoint,
            credential,
            models,
            rpm,
            tpm,
            input_cost,
            output_cost,
            priority,
        } => {
            let mut spec = ProviderSpec::new(&name, kind, &endpoint)
                .rate_limits(rpm, tpm)
                .cost(input_cost, output_cost)
                .priority(priority);
            if let Some(credential) = credential {
                spec = spec.credential(&credential);
            }
            for model in &models {
                spec = spec.model(model);
            }
            let id = engine.add_provider(spec).await?;
            println!("{} provider {} added: {}", style("✓").green(), name, id);
        }
        ProviderCommands::List => {
            let providers = engine.list_providers().await;
            if providers.is_empty() {
                println!("{}", style("No providers registered").dim());
            }
            for provider in providers {
                let state = match (provider.is_active, provider.health.is_healthy) {
                    (false, _) => style("inactive").dim(),
                    (true, true) => style("healthy").green(),
                    (true, false) => style("unhealthy").red(),
                };
                println!(
                    "{} {} [{}] {} p{} {}/{} rpm {:.0}ms",
                    provider.id,
                    style(&provider.name).bold(),
                    provider.kind,
                    state,
                    provider.priority,
                    provider.rate_limit.current_requests,
                    provider.rate_limit.requests_per_minute,
                    provider.health.response_time_ms,
                );
                let models: Vec<&str> = provider.models.iter().map(String::as_str).collect();
                println!("    models: {}", models.join(", "));
            }
        }
        ProviderCommands::Disable { id } => {
            let provider = engine.set_provider_active(id, false).await?;
            println!("{} provider {} disabled", style("✓").green(), provider.name);
        }
        ProviderCommands::Enable { id } => {
            let provider = engine.set_provider_active(id, true).await?;
            println!("{} provider {} enabled", style("✓").green(), provider.name);
        }
    }
    Ok(())
}

async fn handle_policies(engine: &LoadBalancer, command: PolicyCommands) -> Result<()> {
    match command {
        PolicyCommands::Add {
            name,
            metric,
            threshold,
            action,
            cooldown,
        } => {
            let spec = ScalingPolicySpec::new(&name, metric, threshold, action, cooldown);
            let id = engine.add_scaling_policy(spec).await?;
            println!("{} policy {} added: {}", style("✓").green(), name, id);
        }
        PolicyCommands::List => {
            let policies = engine.list_scaling_policies().await;
            if policies.is_empty() {
                println!("{}", style("No scaling policies").dim());
            }
            for policy in policies {
                let state = if policy.is_active {
                    style("active").green()
                } else {
                    style("inactive").dim()
                };
                println!(
                    "{} {} {}: {} > {} → {} (cooldown {}s)",
                    policy.id,
                    style(&policy.name).bold(),
                    state,
                    policy.trigger_metric,
                    policy.threshold,
                    policy.scale_action,
                    policy.cooldown_period_secs,
                );
            }
        }
        PolicyCommands::Disable { id } => {
            let policy = engine.set_policy_active(id, false).await?;
            println!("{} policy {} disabled", style("✓").green(), policy.name);
        }
        PolicyCommands::Enable { id } => {
            let policy = engine.set_policy_active(id, true).await?;
            println!("{} policy {} enabled", style("✓").green(), policy.name);
        }
    }
    Ok(())
}
