//! Websocket relay
//!
//! Each connected client gets its own consumer on the results queue. A message
//! is acked once its body has been written to the socket and rejected if the
//! write fails or the client is gone.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use tq_queue::{Delivery, MessageBroker, MessageHandler};

const FRAME_BUFFER: usize = 32;

#[derive(Clone)]
pub struct RelayState {
    pub broker: Arc<dyn MessageBroker>,
    /// Queue the worker publishes results to
    pub queue: String,
}

pub fn create_relay_router(state: RelayState) -> Router {
    Router::new()
        .route("/listen_results", get(listen_results))
        .route("/health", get(crate::health))
        .with_state(state)
}

async fn listen_results(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| relay_socket(socket, state))
}

/// A body to write, and where to report whether the write succeeded
pub struct Frame {
    pub text: String,
    pub written: oneshot::Sender<bool>,
}

/// Hands each delivery to the socket writer and settles it on the result
pub struct RelayHandler {
    frames: mpsc::Sender<Frame>,
}

impl RelayHandler {
    pub fn new(frames: mpsc::Sender<Frame>) -> Self {
        Self { frames }
    }
}

#[async_trait]
impl MessageHandler for RelayHandler {
    async fn handle(&self, delivery: Delivery) {
        let request_id = delivery.envelope().request_id().unwrap_or("-").to_string();
        let (written_tx, written_rx) = oneshot::channel();
        let frame = Frame {
            text: delivery.envelope().body_lossy(),
            written: written_tx,
        };

        let written = self.frames.send(frame).await.is_ok() && written_rx.await.unwrap_or(false);

        let settled = if written {
            debug!(request_id = %request_id, "Result relayed");
            delivery.ack().await
        } else {
            warn!(request_id = %request_id, "Client unavailable, rejecting result");
            delivery.reject().await
        };
        if let Err(e) = settled {
            warn!(request_id = %request_id, error = %e, "Failed to settle relayed message");
        }
    }
}

async fn relay_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (frames_tx, mut frames) = mpsc::channel::<Frame>(FRAME_BUFFER);

    let handler = Arc::new(RelayHandler::new(frames_tx));
    let consume = state.broker.consume(&state.queue, handler);
    tokio::pin!(consume);

    info!(queue = %state.queue, "Relay client connected");

    loop {
        tokio::select! {
            Some(frame) = frames.recv() => {
                let ok = sender.send(Message::Text(frame.text)).await.is_ok();
                let _ = frame.written.send(ok);
                if !ok {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            result = &mut consume => {
                match result {
                    Ok(()) => info!(queue = %state.queue, "Relay queue closed"),
                    Err(e) => error!(queue = %state.queue, error = %e, "Relay consumer failed"),
                }
                break;
            }
        }
    }

    info!(queue = %state.queue, "Relay client disconnected");
}
