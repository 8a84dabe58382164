use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gansauditor_codex::{AuditorConfig, GansAuditorServer};
use rmcp::{transport::stdio, ServiceExt};

/// GansAuditor Codex: iterative code auditing over MCP stdio
#[derive(Parser, Debug)]
#[command(name = "gansauditor-codex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the session state directory
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Override the reviewer executable
    #[arg(long)]
    codex_binary: Option<String>,

    /// Enable verbose logging (stderr; stdout carries the transport)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout belongs to the JSON-RPC transport; all logging goes to stderr.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = AuditorConfig::load_with_env(cli.config.as_ref())?;
    if let Some(state_dir) = cli.state_dir {
        config.session.state_directory = state_dir;
    }
    if let Some(binary) = cli.codex_binary {
        config.codex.binary = binary;
    }

    for warning in config.validate() {
        warn!("config: {warning}");
    }
    if let Some(fatal) = config.startup_fatal() {
        eprintln!("fatal: {fatal}");
        std::process::exit(1);
    }

    info!(
        state_dir = %config.session.state_directory.display(),
        reviewer = %config.codex.binary,
        synchronous = config.audit.synchronous,
        "gansauditor-codex starting"
    );

    let server = GansAuditorServer::new(config).context("failed to build server")?;

    let service = server
        .clone()
        .serve(stdio())
        .await
        .context("failed to start MCP transport")?;
    service.waiting().await?;

    server.shutdown().await;
    info!("clean shutdown");
    Ok(())
}
