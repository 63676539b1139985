//! `nacc-node` entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use nacc_node::config::NodeConfig;
use nacc_node::context::RootContext;
use nacc_node::server::{AppState, serve};

#[derive(Parser)]
#[command(name = "nacc-node", about = "NACC node tool server", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tool server.
    Serve {
        /// Path to the node TOML config.
        #[arg(long, default_value = "node.toml")]
        config: PathBuf,
    },
    /// Validate a config file and exit.
    CheckConfig {
        #[arg(long, default_value = "node.toml")]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => run(config),
        Commands::CheckConfig { config } => {
            let loaded = NodeConfig::load(&config)
                .with_context(|| format!("config {} failed validation", config.display()))?;
            println!("ok: node_id={} root_dir={}", loaded.node_id, loaded.root_dir.display());
            Ok(())
        }
    }
}

#[tokio::main]
async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = NodeConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let bind = config.bind.clone();
    let bearer_token = config.bearer_token.clone();
    let ctx = RootContext::from_config(&config).map_err(|err| anyhow::anyhow!(err))?;

    tracing::info!("nacc-node v{} starting", env!("CARGO_PKG_VERSION"));
    serve(
        AppState {
            ctx: Arc::new(ctx),
            bearer_token,
        },
        &bind,
    )
    .await
}
