use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pilotgate_core::config::{self, GatewayConfig};
use pilotgate_core::logging;
use pilotgate_server::{build, router, wiring, AppState};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pilotgate", version, about = "OpenAI-compatible gateway for hosted coding models")]
struct Cli {
    /// Configuration file (JSON or YAML)
    #[arg(long, env = "PILOTGATE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive, overrides the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve {
        /// Address to bind, e.g. 127.0.0.1:4141
        #[arg(long)]
        listen: Option<String>,
    },
    /// Obtain and persist an identity token
    Login,
    /// Forget the persisted identity token
    Logout,
}

/// Graceful shutdown signal handler for SIGTERM and Ctrl+C
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
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

    info!("shutdown signal received, draining connections");
}

async fn serve(config: GatewayConfig, listen: Option<String>) -> anyhow::Result<()> {
    let gateway = build(&config).await.context("failed to set up upstream client")?;
    let state = AppState::new(gateway.orchestrator);
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let addr = listen.unwrap_or(config.listen);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on http://{}", addr);

    let signal = {
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    };
    axum::serve(listener, app).with_graceful_shutdown(signal).await?;

    shutdown.cancel();
    if let Some(bridge) = gateway.bridge {
        bridge.stop().await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn login(config: &GatewayConfig) -> anyhow::Result<()> {
    let upstream = wiring::http_upstream(config)?;
    let manager = wiring::credential_manager(config, upstream);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    manager.login(&cancel).await.context("login failed")?;
    println!("Logged in.");
    Ok(())
}

async fn logout(config: &GatewayConfig) -> anyhow::Result<()> {
    let upstream = wiring::http_upstream(config)?;
    wiring::credential_manager(config, upstream).logout().await?;
    println!("Logged out.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    logging::init(&config.log).context("failed to open log file")?;

    match cli.command.unwrap_or(Command::Serve { listen: None }) {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Login => login(&config).await,
        Command::Logout => logout(&config).await,
    }
}
