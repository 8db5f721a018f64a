//! Chorus Daemon
//!
//! HTTP front end for multi-model streaming. A browser page posts one prompt
//! and a list of models; the daemon streams every model's output back as a
//! single server-sent-event feed.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address (127.0.0.1:5000), Ollama on localhost:11434
//! chorus-daemon
//!
//! # Point at another inference server and listen on all interfaces
//! chorus-daemon --ollama-host gpu-box --listen 0.0.0.0:5000
//!
//! # With verbose logging
//! RUST_LOG=debug chorus-daemon
//! ```
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: stop accepting connections and let open responses finish

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use chorus_core::{load_config, Aggregator, AggregatorConfig, ConfigOverrides, LlmBackend, OllamaBackend};

use crate::server::AppState;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "chorus-daemon", version, about = "Stream one prompt to many models at once")]
struct Args {
    /// Configuration file (default: $XDG_CONFIG_HOME/chorus/config.toml)
    #[arg(long, env = "CHORUS_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    listen: Option<String>,

    /// Inference server host, or a full base URL
    #[arg(long)]
    ollama_host: Option<String>,

    /// Inference server port
    #[arg(long)]
    ollama_port: Option<u16>,

    /// Model used by /query when the request names none
    #[arg(long)]
    default_model: Option<String>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(addr) = &self.listen {
            overrides = overrides.with_listen_addr(addr.clone());
        }
        if let Some(host) = &self.ollama_host {
            overrides = overrides.with_ollama_host(host.clone());
        }
        if let Some(port) = self.ollama_port {
            overrides = overrides.with_ollama_port(port);
        }
        if let Some(model) = &self.default_model {
            overrides = overrides.with_default_model(model.clone());
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chorus_daemon=info".parse()?)
                .add_directive("chorus_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.clone(), &args.overrides())
        .context("Failed to load configuration")?;

    info!(
        source = ?config.source(),
        listen = %config.server.listen_addr,
        backend = %config.backend.base_url(),
        "Starting Chorus Daemon"
    );

    let backend = OllamaBackend::from_config(config.backend.clone())
        .context("Failed to create inference server client")?;
    if backend.health_check().await {
        info!("Inference server reachable");
    } else {
        warn!(
            url = %config.backend.base_url(),
            "Inference server not reachable yet; requests will fail until it is"
        );
    }

    let aggregator = Aggregator::new(Arc::new(backend), AggregatorConfig::from(&config.session));
    let state = AppState::new(aggregator, config.backend.default_model.clone());

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen_addr))?;

    server::serve(listener, state, shutdown_signal()).await?;

    info!("Chorus daemon stopped cleanly");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
