//! XIVOmega - session-scoped proxy routing for FFXIV traffic
//!
//! Entry point: loads configuration, checks privileges, wires the `ip` and
//! Podman adapters into the lifecycle controller and exits with the
//! session's exit code.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use xivomega::config::AppConfig;
use xivomega::container::{ContainerRuntime, Podman};
use xivomega::error::SessionError;
use xivomega::lifecycle::{purge, LifecycleController};
use xivomega::logging::init_logging;
use xivomega::network::{HostNetwork, IpRoute2};

/// XIVOmega - route game traffic through a latency-mitigation proxy
#[derive(Parser)]
#[command(name = "xivomega")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Provision the XIVOmega proxy for one session and clean up afterwards", long_about = None)]
struct Cli {
    /// Configuration file (TOML, INI, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy, Default)]
enum Commands {
    /// Run a session until interrupted or the proxy exits (default)
    #[default]
    Run,

    /// Remove resources left behind by a previous run, then exit
    Cleanup,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Fatal error");
            eprintln!("xivomega: {e:#}");
            1
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    // Load configuration
    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("xivomega: {e:#}");
            return Ok(SessionError::Config(e.to_string()).exit_code());
        }
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    // Initialize logging
    let log_file = init_logging(&config.log_level, &config.log_dir)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_file.display(),
        "Starting XIVOmega"
    );

    if unsafe { libc::geteuid() } != 0 {
        let err = SessionError::Config("xivomega must run as root".to_string());
        error!(error = %err, "Insufficient privileges");
        return Ok(err.exit_code());
    }

    let plan = match config.resolve() {
        Ok(plan) => plan,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Ok(e.exit_code());
        }
    };

    let host: Arc<dyn HostNetwork> = Arc::new(IpRoute2::new(config.ip_path.clone()));
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(Podman::detect(config.podman_path.clone()).await?);

    match cli.command.unwrap_or_default() {
        Commands::Run => {
            let controller = LifecycleController::new(plan, host, runtime);
            let span = info_span!("session", id = %controller.session_id());

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Termination signal received");
                trigger.cancel();
            });

            let outcome = controller.run(cancel).instrument(span).await;
            if let Err(e) = &outcome.result {
                error!(error = %e, exit_code = outcome.exit_code(), "Session ended with an error");
            }
            info!(exit_code = outcome.exit_code(), "XIVOmega stopped");
            Ok(outcome.exit_code())
        }
        Commands::Cleanup => {
            match purge(&plan, host, runtime)
                .instrument(info_span!("cleanup"))
                .await
            {
                Ok(report) => {
                    for failure in &report.failed {
                        warn!(error = %failure, "Could not remove");
                    }
                    info!(
                        removed = report.removed.len(),
                        failed = report.failed.len(),
                        "Cleanup complete"
                    );
                    Ok(report.exit_code())
                }
                Err(e) => {
                    error!(error = %e, "Cleanup refused");
                    Ok(e.exit_code())
                }
            }
        }
    }
}

/// Handle shutdown signals gracefully
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
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
