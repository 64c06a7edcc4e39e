//! Controller binary

use clap::Parser;
use replistore::common::{Config, ControllerConfig};
use replistore::Controller;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "replistore-controller")]
#[command(about = "replistore controller - tracks placement and drives replication")]
#[command(version)]
struct Args {
    /// Port to listen on for clients and dstores
    #[arg(long)]
    port: Option<u16>,

    /// Number of dstores holding every file
    #[arg(long, short = 'r')]
    replication_factor: Option<usize>,

    /// Per-operation timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Rebalance period in milliseconds
    #[arg(long)]
    rebalance_period_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load config from file and environment, then override with CLI arguments
    let file_config = Config::load()?;
    let log_level = args.log_level.clone().unwrap_or(file_config.log_level);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config: ControllerConfig = file_config.controller.unwrap_or_default();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(r) = args.replication_factor {
        config.replication_factor = r;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(period) = args.rebalance_period_ms {
        config.rebalance_period_ms = period;
    }

    let controller = Controller::bind(config).await?;

    tokio::select! {
        res = controller.serve() => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down controller");
        }
    }

    Ok(())
}
