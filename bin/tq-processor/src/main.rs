//! TextQueue Processor
//!
//! Declares the retry topology, then consumes the alive queue until the kill
//! signal arrives or the process is stopped.

use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tq_config::AppConfig;
use tq_queue::{BrokerSettings, MessageBroker, RabbitMessageBroker};
use tq_worker::{ConsumerSettings, RetryAwareConsumer, ReverseText};

#[derive(Parser, Debug)]
#[command(name = "tq-processor")]
#[command(about = "TextQueue worker")]
struct Args {
    /// Path to a TOML config file
    #[arg(long, env = "TQ_CONFIG")]
    config: Option<PathBuf>,

    /// Queue to consume, overrides rabbit.alive_queue
    #[arg(long)]
    queue: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;
    let queue = args.queue.unwrap_or_else(|| config.rabbit.alive_queue.clone());

    let broker: Arc<dyn MessageBroker> = Arc::new(RabbitMessageBroker::new(
        config.rabbit.amqp_uri(),
        BrokerSettings::from_config(&config),
    ));
    broker.idempotent_startup().await?;

    let consumer = Arc::new(RetryAwareConsumer::new(
        broker.clone(),
        Arc::new(ReverseText),
        ConsumerSettings::from(&config.rabbit),
    ));

    info!(
        broker = broker.identifier(),
        queue = %queue,
        max_retry_count = config.rabbit.max_retry_count,
        downstream = %config.rabbit.websocket_queue,
        "Starting TextQueue processor"
    );

    tokio::select! {
        result = broker.consume(&queue, consumer) => {
            result?;
            info!(queue = %queue, "Consumer stopped by kill signal");
        }
        _ = shutdown_signal() => {}
    }

    info!("Processor shutdown complete");
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
