//! Event Gateway
//!
//! Real-time WebSocket gateway. Accepts client connections, dispatches named
//! events between clients and a backend worker, and answers a plain HTTP
//! health check on the same port.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use event_gateway::gateway::handlers;
use event_gateway::{
    Backend, EchoProcessor, Gateway, GatewayConfig, LocalWorker, Overrides, WebSocketServer,
    CONFIG_FILE,
};

/// Event Gateway
///
/// WebSocket event gateway for real-time clients
#[derive(Parser, Debug)]
#[command(name = "event-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on [default: 4000]
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "BIND")]
    bind: Option<String>,

    /// Message queue / cache connection string
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Persistent storage connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    // Values from a .env file fill in variables the environment does not set
    let dotenv = dotenvy::dotenv();
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Event Gateway v{}", env!("CARGO_PKG_VERSION"));
    match dotenv {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => warn!("Ignoring .env file: {}", e),
    }

    if let Err(e) = run(args).await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }

    info!("Server shutdown complete");
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?
        .apply(Overrides {
            bind: args.bind,
            port: args.port,
            redis_url: args.redis_url,
            database_url: args.database_url,
        });
    config.validate()?;

    if !config.events.forward.is_empty() {
        info!("Forwarding events to backend: {:?}", config.events.forward);
    }

    // Gateway loop, with the built-in handlers on every connection
    let worker = Arc::new(LocalWorker::new(config.backend.clone(), EchoProcessor));
    let forward = config.events.forward.clone();
    let gateway = Gateway::new(worker.clone())
        .on_connection(move |socket| handlers::install(socket, &forward));

    worker
        .start(gateway.result_sink())
        .context("starting worker")?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server = Arc::new(WebSocketServer::new(
        config.server_config(),
        gateway.handle(),
        shutdown_tx.clone(),
    ));

    // Bind before the loop starts so a busy port fails fast
    let listener = server.bind().await.context("binding listener")?;
    let gateway_task = tokio::spawn(gateway.run(shutdown_tx.subscribe()));

    // Spawn shutdown signal handler
    let server_handle = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.serve(listener).await?;
    gateway_task.await?;
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
