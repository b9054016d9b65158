//! TextQueue HTTP surfaces
//!
//! - Ingress: `POST /queue_reverse_text` behind the per-user rate limiter
//! - Relay: `GET /listen_results` websocket fed from the results queue
//! - `GET /health` on both

pub mod error;
pub mod ingress;
pub mod relay;
pub mod token;

use axum::Json;
use serde::Serialize;

pub use error::{ApiError, AppError};
pub use ingress::{create_ingress_router, IngressState};
pub use relay::{create_relay_router, RelayHandler, RelayState};
pub use token::{parse_payload_from_token, AccessTokenData, TokenError};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP",
        version: env!("CARGO_PKG_VERSION"),
    })
}
