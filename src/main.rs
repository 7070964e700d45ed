use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use bridgegate::bridge::convert::CommandConverter;
use bridgegate::bridge::memory::MemoryBridge;
use bridgegate::cli::{self, Cli, Command, ConfigCommand};
use bridgegate::config;
use bridgegate::gateway::supervisor::{LsofProbe, Supervisor};
use bridgegate::gateway::{Collaborators, GatewayContext, GatewayServer};
use bridgegate::logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => run_server().await,

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => cli::handle_config_show()?,
                ConfigCommand::Path => cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

/// Run the gateway until a shutdown signal arrives.
async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging(logging::LogConfig::from_env())?;

    let config_path = config::get_config_path();
    let store = Arc::new(config::ConfigStore::from_path(config_path.clone())?);
    let cfg = store.snapshot();
    let data_dir = cfg.resolved_data_dir();
    std::fs::create_dir_all(&data_dir)?;
    if cfg.password.trim().is_empty() {
        warn!(target: "config", "No password configured; every client will be rejected");
    }

    let bridge = Arc::new(MemoryBridge::new());
    let converter = Arc::new(CommandConverter::new(cfg.convert_command.clone()));
    let ctx = GatewayContext::new(store, Collaborators::in_memory(bridge, converter)).await?;

    let server = Arc::new(GatewayServer::new(ctx.clone()));
    let addr = server.start().await?;
    info!(
        "bridgegate {} listening on {} (config: {}, data: {})",
        env!("CARGO_PKG_VERSION"),
        addr,
        config_path.display(),
        data_dir.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = ctx
        .chunks
        .clone()
        .start_sweep_task(cfg.chunk_sweep_interval(), shutdown_rx.clone());
    let supervisor = Arc::new(Supervisor::new(Arc::new(LsofProbe), server.clone()));
    let watchdog = supervisor.start(cfg.health_check_interval(), shutdown_rx);

    let reason = await_shutdown_trigger().await?;
    info!("Shutdown signal received ({})", reason);

    let _ = shutdown_tx.send(true);
    server.stop().await;
    let _ = tokio::join!(sweep, watchdog);

    info!("Gateway shut down");
    Ok(())
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                res = tokio::signal::ctrl_c() => res.map(|_| "ctrl-c"),
                _ = sigterm.recv() => Ok("SIGTERM"),
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}
