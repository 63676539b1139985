//! `nacc-orchestrator` entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use nacc_orchestrator::config::OrchestratorConfig;
use nacc_orchestrator::server::{AppState, serve};
use nacc_orchestrator::service::OrchestratorService;

#[derive(Parser)]
#[command(name = "nacc-orchestrator", about = "NACC orchestrator control plane", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator.
    Serve {
        /// Path to the orchestrator TOML config.
        #[arg(long, default_value = "orchestrator.toml")]
        config: PathBuf,
    },
    /// Validate a config file and exit.
    CheckConfig {
        #[arg(long, default_value = "orchestrator.toml")]
        config: PathBuf,
    },
    /// Query a running orchestrator for its node table.
    Nodes {
        #[arg(long, default_value = "http://127.0.0.1:8700")]
        url: String,
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
            let loaded = OrchestratorConfig::load(&config)
                .with_context(|| format!("config {} failed validation", config.display()))?;
            println!(
                "ok: {} node(s), backend kind '{}'",
                loaded.nodes.len(),
                loaded.backend.kind
            );
            Ok(())
        }
        Commands::Nodes { url } => show_nodes(url),
    }
}

#[tokio::main]
async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    tracing::info!("nacc-orchestrator v{} starting", env!("CARGO_PKG_VERSION"));
    let service = Arc::new(
        OrchestratorService::from_config(&config)
            .await
            .context("service startup failed")?,
    );

    // Ctrl+C stops the health loops and drains the server.
    let shutdown = service.shutdown_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("signal received, shutting down");
        shutdown.cancel();
    });

    serve(AppState { service }, &config.bind).await
}

#[tokio::main]
async fn show_nodes(url: String) -> anyhow::Result<()> {
    let nodes: Vec<serde_json::Value> = reqwest::get(format!("{url}/nodes"))
        .await
        .context("orchestrator unreachable")?
        .json()
        .await?;
    for node in nodes {
        println!(
            "{:<20} healthy={:<5} tags={}",
            node["node_id"].as_str().unwrap_or("?"),
            node["healthy"].as_bool().unwrap_or(false),
            node["tags"].to_string(),
        );
    }
    Ok(())
}
