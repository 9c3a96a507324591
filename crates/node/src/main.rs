//! # Tailgate Entry Point
//!
//! ## Initialization Flow
//! 1. Parse CLI flags
//! 2. Load the env file (before tracing, so `RUST_LOG` can come from it)
//! 3. Initialize tracing
//! 4. Load layered configuration
//! 5. Bootstrap the overlay node, then serve until a signal arrives
//!
//! Any failure exits with status 1.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tailgate_common::config::{load_env_file, GatewayConfig};
use tailgate_node::cli::Cli;
use tailgate_node::gateway;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let env_file = match load_env_file(cli.env_file.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    if let Some(path) = env_file {
        info!(path = %path.display(), "loaded env file");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "tailgate exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = GatewayConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(path) = &config.loaded_from {
        info!(path = %path.display(), "loaded config file");
    }

    if cli.check_config {
        config.validate().context("invalid configuration")?;
        println!("configuration ok");
        println!("  database      {}", config.redacted_database_url());
        println!("  hostname      {}", config.hostname);
        println!("  backend       {}", config.backend_url);
        println!("  proxy port    {}", config.proxy_port);
        println!("  public port   {}", config.public_port.unwrap_or_default());
        println!("  state file    {}", config.state_file.display());
        println!("  socket        {}", config.socket_path.display());
        println!("  auth key      {}", if config.auth_key.is_some() { "set" } else { "unset" });
        return Ok(());
    }

    gateway::run(config, shutdown_signal()).await
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
