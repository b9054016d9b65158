//! TextQueue Websocket Relay
//!
//! Serves `GET /listen_results`: every connected client consumes the results
//! queue and receives each result body as a text frame.

use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tq_api::{create_relay_router, RelayState};
use tq_config::AppConfig;
use tq_queue::{BrokerSettings, MessageBroker, RabbitMessageBroker};

#[derive(Parser, Debug)]
#[command(name = "tq-relay")]
#[command(about = "TextQueue websocket relay")]
struct Args {
    /// Path to a TOML config file
    #[arg(long, env = "TQ_CONFIG")]
    config: Option<PathBuf>,

    /// Listen port, overrides ws.port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;

    info!("Starting TextQueue relay");

    let broker: Arc<dyn MessageBroker> = Arc::new(RabbitMessageBroker::new(
        config.rabbit.amqp_uri(),
        BrokerSettings::from_config(&config),
    ));
    broker.idempotent_startup().await?;

    let app = create_relay_router(RelayState {
        broker,
        queue: config.rabbit.websocket_queue.clone(),
    })
    .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.ws.host, args.port.unwrap_or(config.ws.port));
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, queue = %config.rabbit.websocket_queue, "Relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Relay shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let json = std::env::var("TQ_LOG_JSON")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
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

    info!("Shutdown signal received");
}
