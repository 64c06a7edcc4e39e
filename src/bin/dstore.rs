use anyhow::Context;
use clap::Parser;
use replistore::common::{Config, DstoreConfig};
use replistore::Dstore;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "replistore-dstore")]
#[command(about = "replistore dstore - stores file replicas for the controller")]
#[command(version)]
struct Args {
    /// Port to listen on; also identifies this dstore
    #[arg(long)]
    port: Option<u16>,

    /// Controller port to join
    #[arg(long)]
    controller_port: Option<u16>,

    /// Timeout for peer transfers in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Data directory (emptied on startup)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let file_config = Config::load()?;
    let log_level = args.log_level.clone().unwrap_or(file_config.log_level);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let file_dstore = file_config.dstore;
    let port = args
        .port
        .or(file_dstore.as_ref().map(|d| d.port))
        .context("--port is required")?;
    let data_dir = args
        .data_dir
        .or(file_dstore.as_ref().map(|d| d.data_dir.clone()))
        .context("--data-dir is required")?;
    let defaults = ControllerDefaults::from(file_dstore.as_ref());

    let config = DstoreConfig {
        port,
        controller_port: args.controller_port.unwrap_or(defaults.controller_port),
        timeout_ms: args.timeout_ms.unwrap_or(defaults.timeout_ms),
        data_dir,
    };

    let dstore = Dstore::bind(config).await?;

    tokio::select! {
        res = dstore.serve() => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down dstore");
        }
    }

    Ok(())
}

/// Settings that fall back to the config file, then to built-in defaults
struct ControllerDefaults {
    controller_port: u16,
    timeout_ms: u64,
}

impl From<Option<&DstoreConfig>> for ControllerDefaults {
    fn from(file: Option<&DstoreConfig>) -> Self {
        let builtin = replistore::common::ControllerConfig::default();
        match file {
            Some(d) => Self {
                controller_port: d.controller_port,
                timeout_ms: d.timeout_ms,
            },
            None => Self {
                controller_port: builtin.port,
                timeout_ms: builtin.timeout_ms,
            },
        }
    }
}
