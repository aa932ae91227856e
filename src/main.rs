use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use rampart::config::RampartConfig;
use rampart::ratelimit::RateLimitContext;
use rampart::telemetry;

#[derive(Parser)]
#[command(name = "rampart")]
#[command(version, about = "Circuit breaker and rate limit configuration tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Replay requests against the configured rate limits
    Simulate {
        #[arg(short, long)]
        config: PathBuf,

        /// Limiters to check; all when omitted
        #[arg(short, long)]
        limiter: Vec<String>,

        #[arg(short = 'n', long, default_value_t = 10)]
        requests: u32,

        #[arg(long)]
        tenant: Option<String>,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        api_key: Option<String>,

        #[arg(long)]
        ip: Option<String>,

        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        method: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config: path } => {
            let config = RampartConfig::from_file(&path)?;
            telemetry::init_tracing(&config.logging)?;
            info!(path = %path.display(), "Loaded configuration");

            let breakers = config.circuit_breaker_registry()?;
            let limiters = config.rate_limiter_registry()?;
            info!(
                circuit_breakers = breakers.len(),
                rate_limits = limiters.len(),
                "Configuration is valid"
            );

            let summary = json!({
                "valid": true,
                "circuit_breakers": breakers.all_metrics(),
                "rate_limits": config.rate_limits,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Simulate {
            config: path,
            limiter,
            requests,
            tenant,
            user,
            api_key,
            ip,
            endpoint,
            method,
        } => {
            let config = RampartConfig::from_file(&path)?;
            telemetry::init_tracing(&config.logging)?;
            info!(path = %path.display(), "Loaded configuration");
            let registry = config.rate_limiter_registry()?;

            let context = RateLimitContext {
                tenant_id: tenant,
                user_id: user,
                api_key_id: api_key,
                ip_address: ip,
                endpoint,
                method,
            };
            let names: Vec<&str> = limiter.iter().map(String::as_str).collect();
            let selection = (!names.is_empty()).then_some(names.as_slice());

            let mut allowed = 0;
            for request in 1..=requests {
                let outcome = registry.check_all(&context, selection).await?;
                if outcome.allowed {
                    allowed += 1;
                }
                let line = json!({
                    "request": request,
                    "allowed": outcome.allowed,
                    "denying_limiter": outcome.denying_limiter,
                    "headers": outcome.denial().map(|denial| &denial.headers),
                });
                println!("{}", serde_json::to_string(&line)?);
            }

            info!(requests, allowed, denied = requests - allowed, "Simulation finished");
        }
    }

    Ok(())
}
