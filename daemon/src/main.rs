//! Edgewarden node agent daemon
//!
//! Supervises the local proxy and keeps its users in step with the
//! configured management mode.

use anyhow::{Context, Result};
use clap::Parser;
use edgewarden_daemon::supervisor::{Supervisor, SupervisorSettings};
use edgewarden_daemon::{Agent, DaemonConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Edgewarden node agent
#[derive(Parser, Debug)]
#[command(name = "edgewardend")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "agent.toml")]
    config: String,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Validate the generated proxy configuration with the proxy binary and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match DaemonConfig::load(&args.config).await {
        Ok(config) => config,
        Err(e) if !std::path::Path::new(&args.config).exists() => {
            eprintln!("{e}, using defaults and environment");
            DaemonConfig::default()
        }
        Err(e) => return Err(e).context("Failed to load configuration"),
    };
    config.apply_env();

    // RUST_LOG wins, then --verbose, then the configured level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if args.verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Edgewarden agent v{}", env!("CARGO_PKG_VERSION"));
    config.validate().context("Invalid configuration")?;
    info!("Loaded configuration from {}", args.config);

    if args.check_config {
        let supervisor = Supervisor::new(SupervisorSettings::from_config(&config.proxy));
        supervisor
            .check_config()
            .await
            .context("Proxy configuration check failed")?;
        info!("Proxy configuration is valid");
        return Ok(());
    }

    let agent = Agent::new(config).await?;
    agent.run(shutdown_signal()).await
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
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
