// HookBridge - Main Entry Point
//
// Wires together:
// - Configuration (TOML file + environment)
// - Logging and metrics
// - The broker connection manager
// - The HTTP server
//
// Exit codes: 0 after a signal-triggered shutdown, 1 on fatal errors
// (invalid config, bind failure, exhausted reconnects, panics).

use anyhow::{Context, Result};
use clap::Parser;
use hookbridge::broker::{AmqpConnector, BrokerError, ConnectionManager};
use hookbridge::config::{Config, EnvPresence};
use hookbridge::server::{self, AppState};
use hookbridge::{logging, metrics, shutdown};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// HookBridge: webhook to RabbitMQ bridge
#[derive(Parser, Debug)]
#[command(name = "hookbridge")]
#[command(author = "HookBridge Contributors")]
#[command(version)]
#[command(about = "Republishes authenticated webhooks onto RabbitMQ fanout exchanges", long_about = None)]
struct Args {
    /// Optional TOML configuration file (environment variables take precedence)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the HTTP port
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    install_panic_hook();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal: {:#}", e);
            eprintln!("hookbridge: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Any panic, on any thread, ends the process
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("Unrecoverable panic: {}", panic_info);
        default_hook(panic_info);
        std::process::exit(1);
    }));
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = Config::load(args.config.as_deref()).context("Invalid configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    logging::init(&config.logging, args.verbose)?;
    metrics::init().context("Failed to initialize metrics")?;

    info!("HookBridge v{} starting", env!("CARGO_PKG_VERSION"));
    if config.webhook.token.is_none() {
        warn!("No webhook token configured, every webhook will be rejected");
    }

    let settings = config.manager_settings()?;
    let connector = Arc::new(AmqpConnector::new(config.broker.publisher_confirms));
    let manager = ConnectionManager::spawn(connector, settings);

    match manager.connect().await {
        Ok(()) => {}
        Err(BrokerError::ReconnectExhausted { attempts }) => {
            error!(attempts, "Could not reach the broker, exiting");
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => {
            warn!("Initial broker connect failed, retrying in background: {}", e);
            manager.schedule_reconnect();
        }
    }

    let bind_addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    let state = AppState::new(
        manager.clone(),
        config.webhook.token.clone(),
        EnvPresence::from_env(),
    );
    let exhausted = manager.exhausted();

    let code = tokio::select! {
        result = server::serve(listener, state, shutdown::shutdown_signal()) => {
            result?;
            ExitCode::SUCCESS
        }
        _ = exhausted.cancelled() => {
            error!("Broker reconnect attempts exhausted, exiting");
            ExitCode::FAILURE
        }
    };

    manager.shutdown().await;
    info!("HookBridge stopped");
    Ok(code)
}
