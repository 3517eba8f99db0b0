use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bulwark::clock;
use bulwark::config::BulwarkConfig;
use bulwark::metrics::{MetricsSink, RecorderMetrics};
use bulwark::{CircuitRegistry, RateLimitRegistry};

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(about = "Rate limiting and circuit breaking toolkit", long_about = None)]
struct Cli {
    /// YAML configuration file; BULWARK__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate configuration, then print the effective settings
    Validate,
    /// Drive the limiters and breakers with synthetic traffic
    Simulate {
        /// Rate limit scope to exercise
        #[arg(long, default_value = "/api")]
        scope: String,

        /// Client identifier for per-client buckets
        #[arg(long)]
        client: Option<String>,

        /// Number of requests to issue
        #[arg(short = 'n', long, default_value_t = 100)]
        requests: u32,

        /// Downstream service to guard
        #[arg(long, default_value = "downstream")]
        service: String,

        /// Probability that a guarded call fails
        #[arg(long, default_value_t = 0.5)]
        failure_rate: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    let config = BulwarkConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate => {
            info!("Configuration is valid");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate {
            scope,
            client,
            requests,
            service,
            failure_rate,
        } => {
            anyhow::ensure!(
                (0.0..=1.0).contains(&failure_rate),
                "failure rate must be between 0 and 1, got {}",
                failure_rate
            );
            simulate(&config, &scope, client.as_deref(), requests, &service, failure_rate).await?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "bulwark=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn simulate(
    config: &BulwarkConfig,
    scope: &str,
    client: Option<&str>,
    requests: u32,
    service: &str,
    failure_rate: f64,
) -> anyhow::Result<()> {
    let metrics: Arc<dyn MetricsSink> = Arc::new(RecorderMetrics);
    let limiter = RateLimitRegistry::new(&config.rate_limiting, clock::system(), metrics.clone())?;
    let breakers = CircuitRegistry::new(&config.circuit_breakers, clock::system(), metrics)?;

    info!(scope = %scope, requests, "Issuing rate limited requests");
    let mut admitted = 0u32;
    let mut last = None;
    for _ in 0..requests {
        let admission = limiter.check(scope, client).await;
        if admission.allowed() {
            admitted += 1;
        }
        last = Some(admission);
    }

    info!(service = %service, failure_rate, "Issuing guarded calls");
    let calls = (0..requests).map(|i| {
        breakers.guard(service, move || async move {
            if rand::random::<f64>() < failure_rate {
                Err(io::Error::new(io::ErrorKind::TimedOut, format!("call {} timed out", i)))
            } else {
                Ok(i)
            }
        })
    });
    let results = join_all(calls).await;

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let short_circuited = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_open()))
        .count();

    let report = json!({
        "rate_limiting": {
            "scope": scope,
            "requests": requests,
            "admitted": admitted,
            "rejected": requests - admitted,
            "last": last,
        },
        "circuit_breaking": {
            "calls": results.len(),
            "succeeded": succeeded,
            "failed": results.len() - succeeded - short_circuited,
            "short_circuited": short_circuited,
            "circuits": breakers.snapshots(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
