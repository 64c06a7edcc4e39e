//! CLI for file operations

use clap::{Parser, Subcommand};
use replistore::Client;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "replistore")]
#[command(about = "replistore replicated file store CLI")]
#[command(version)]
struct Cli {
    /// Controller port
    #[arg(long, default_value = "4321")]
    controller_port: u16,

    /// Reply timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file
    Store {
        /// Name in the store
        name: String,

        /// Local file to upload
        #[arg(long)]
        file: PathBuf,
    },

    /// Load a file
    Load {
        /// Name in the store
        name: String,

        /// Output file
        #[arg(long)]
        output: PathBuf,
    },

    /// Remove a file
    Remove {
        /// Name in the store
        name: String,
    },

    /// List stored files
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut client = Client::connect(cli.controller_port, Duration::from_millis(cli.timeout_ms)).await?;

    match cli.command {
        Commands::Store { name, file } => {
            let data = tokio::fs::read(&file).await?;
            client.store(&name, &data).await?;
            println!("Stored {} ({} bytes)", name, data.len());
        }

        Commands::Load { name, output } => {
            let data = client.load(&name).await?;
            tokio::fs::write(&output, &data).await?;
            println!("Loaded {} ({} bytes) to {}", name, data.len(), output.display());
        }

        Commands::Remove { name } => {
            client.remove(&name).await?;
            println!("Removed {}", name);
        }

        Commands::List => {
            for name in client.list().await? {
                println!("{}", name);
            }
        }
    }

    Ok(())
}
