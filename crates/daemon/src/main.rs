//! ptybridge daemon
//!
//! WebSocket bridge between browser terminals and host shells or containers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config, LoggingConfig};
use daemon::orchestrator::{Orchestrator, OrchestratorEvent, ShutdownOutcome};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// ptybridge - WebSocket bridge to interactive shells.
#[derive(Parser, Debug)]
#[command(name = "ptybridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the bridge in the foreground
    Start {
        /// Port to listen on (overrides the configuration)
        #[arg(long, short)]
        port: Option<u16>,

        /// Address to bind to (overrides the configuration)
        #[arg(long, short, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Configuration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Start { port, bind } => {
            let mut config = Config::load(&config_path)?;
            let overrides = config.apply_env_overrides();

            let _guard = init_logging(cli.verbose, &config.logging)?;
            tracing::info!("Using config file: {:?}", config_path);
            for applied in &overrides {
                applied.log();
            }

            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            config.validate()?;

            run_foreground(config).await?;
        }
        Commands::Config(ConfigCommands::Show) => {
            let mut config = Config::load(&config_path)?;
            config.apply_env_overrides();
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}

/// Initializes tracing. Returns the guard that flushes the log file, if any.
fn init_logging(verbose: bool, logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let Some(directory) = &logging.directory else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;
    let appender = tracing_appender::rolling::daily(directory, "ptybridge.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(Some(guard))
}

/// Runs the bridge until a termination signal arrives.
async fn run_foreground(config: Config) -> anyhow::Result<()> {
    let orchestrator = Arc::new(Orchestrator::new(config));

    // Subscribe before starting so no event is missed
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::debug!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::SessionOpened { session_id, peer } => {
                    tracing::debug!(session_id = %session_id, peer = %peer, "Client connected");
                }
                OrchestratorEvent::SessionClosed { session_id, reason } => {
                    tracing::debug!(session_id = %session_id, reason = %reason, "Client disconnected");
                }
                OrchestratorEvent::SessionRefused { peer } => {
                    tracing::debug!(peer = %peer, "Client refused");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    let addr = orchestrator.start().await?;
    println!("ptybridge listening on ws://{}", addr);

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    // Later signals join the shutdown already in progress
    tokio::spawn(async {
        loop {
            if wait_for_shutdown_signal().await.is_err() {
                break;
            }
            tracing::info!("Shutdown already in progress");
        }
    });

    match orchestrator.shutdown().await {
        ShutdownOutcome::Graceful => Ok(()),
        ShutdownOutcome::Forced { remaining } => {
            tracing::error!(remaining, "Forcing exit with sessions still open");
            std::process::exit(1);
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}
