//! TextQueue Dev Monolith
//!
//! Runs the ingress, the reverse-text worker and the websocket relay in one
//! process, on the in-memory broker and counter store. No RabbitMQ or Redis
//! needed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tq_api::{create_ingress_router, create_relay_router, IngressState, RelayState};
use tq_config::AppConfig;
use tq_limiter::{InMemoryCounterStore, RateLimiter};
use tq_queue::{BrokerSettings, InMemoryBroker, MessageBroker};
use tq_worker::{ConsumerSettings, RetryAwareConsumer, ReverseText};

#[derive(Parser, Debug)]
#[command(name = "tq-dev")]
#[command(about = "TextQueue dev monolith")]
struct Args {
    /// Path to a TOML config file
    #[arg(long, env = "TQ_CONFIG")]
    config: Option<PathBuf>,

    /// Ingress port, overrides api.port
    #[arg(long)]
    api_port: Option<u16>,

    /// Relay port, overrides ws.port
    #[arg(long)]
    ws_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;
    let api_port = args.api_port.unwrap_or(config.api.port);
    let ws_port = args.ws_port.unwrap_or(config.ws.port);

    info!("Starting TextQueue Dev Monolith");
    info!("Ingress port: {}, Relay port: {}", api_port, ws_port);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // 1. Broker and topology
    let broker: Arc<dyn MessageBroker> =
        Arc::new(InMemoryBroker::new(BrokerSettings::from_config(&config)));
    broker.idempotent_startup().await?;
    info!(broker = broker.identifier(), "Retry topology declared");

    // 2. Rate limiter
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(InMemoryCounterStore::new()),
        u64::from(config.api.rate_limit),
        config.backoff_config(),
    ));

    // 3. Worker
    let worker_handle = {
        let consumer = Arc::new(RetryAwareConsumer::new(
            broker.clone(),
            Arc::new(ReverseText),
            ConsumerSettings::from(&config.rabbit),
        ));
        let broker = broker.clone();
        let queue = config.rabbit.alive_queue.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = broker.consume(&queue, consumer) => {
                    match result {
                        Ok(()) => info!("Worker stopped by kill signal"),
                        Err(e) => error!("Worker error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Worker shutting down");
                }
            }
        })
    };

    // 4. Ingress
    let ingress_app = create_ingress_router(IngressState {
        broker: broker.clone(),
        limiter,
        queue: config.rabbit.alive_queue.clone(),
        kill_signal: config.rabbit.kill_signal_bytes(),
    })
    .layer(TraceLayer::new_for_http());

    let ingress_addr = format!("{}:{}", config.api.host, api_port);
    info!("Ingress listening on http://{}", ingress_addr);

    let ingress_listener = TcpListener::bind(&ingress_addr).await?;
    let ingress_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(ingress_listener, ingress_app);
            tokio::select! {
                result = server => {
                    if let Err(e) = result {
                        error!("Ingress server error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Ingress server shutting down");
                }
            }
        })
    };

    // 5. Relay
    let relay_app = create_relay_router(RelayState {
        broker: broker.clone(),
        queue: config.rabbit.websocket_queue.clone(),
    })
    .layer(TraceLayer::new_for_http());

    let relay_addr = format!("{}:{}", config.ws.host, ws_port);
    info!("Relay listening on ws://{}/listen_results", relay_addr);

    let relay_listener = TcpListener::bind(&relay_addr).await?;
    let relay_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(relay_listener, relay_app);
            tokio::select! {
                result = server => {
                    if let Err(e) = result {
                        error!("Relay server error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Relay server shutting down");
                }
            }
        })
    };

    info!("TextQueue Dev Monolith started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = worker_handle.await;
        let _ = ingress_handle.await;
        let _ = relay_handle.await;
    })
    .await;

    info!("TextQueue Dev Monolith shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
