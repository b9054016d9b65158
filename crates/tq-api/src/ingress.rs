use axum::{
    extract::{Query, Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use tq_common::{Headers, REQUEST_ID_HEADER};
use tq_limiter::RateLimiter;
use tq_queue::MessageBroker;

use crate::error::AppError;
use crate::token::{parse_payload_from_token, AccessTokenData, TokenError};

#[derive(Clone)]
pub struct IngressState {
    pub broker: Arc<dyn MessageBroker>,
    pub limiter: Arc<RateLimiter>,
    /// Alive queue that receives submitted text
    pub queue: String,
    /// Body that stops consumers; refused as text, reversed or not
    pub kill_signal: Vec<u8>,
}

impl IngressState {
    fn is_kill_text(&self, text: &str) -> bool {
        let reversed: String = text.chars().rev().collect();
        text.as_bytes() == self.kill_signal || reversed.as_bytes() == self.kill_signal
    }
}

pub fn create_ingress_router(state: IngressState) -> Router {
    Router::new()
        .route("/queue_reverse_text", post(queue_reverse_text))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .route("/health", get(crate::health))
        .with_state(state)
}

/// Count the request against the caller's per-minute quota for this path.
///
/// The caller is identified by the `user_id` of the access token; the parsed
/// token is passed on to the handler as a request extension.
pub async fn rate_limit(
    State(state): State<IngressState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match access_token(request.headers()) {
        Ok(token) => token,
        Err(e) => return AppError::from(e).into_response(),
    };

    let path = request.uri().path().to_string();
    match state.limiter.check(&path, &token.user_id).await {
        Ok(count) => {
            debug!(path = %path, user_id = %token.user_id, count, "Rate limit check passed");
            request.extensions_mut().insert(token);
            next.run(request).await
        }
        Err(e) => AppError::from(e).into_response(),
    }
}

fn access_token(headers: &HeaderMap) -> Result<AccessTokenData, TokenError> {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(TokenError::Missing)?;
    parse_payload_from_token(authorization)
}

#[derive(Debug, Deserialize)]
pub struct TextQuery {
    pub text: String,
}

async fn queue_reverse_text(
    State(state): State<IngressState>,
    headers: HeaderMap,
    Query(query): Query<TextQuery>,
) -> Result<Json<Value>, AppError> {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("Missing {} header", REQUEST_ID_HEADER)))?;

    if state.is_kill_text(&query.text) {
        warn!(request_id = %request_id, "Refused text matching the kill signal");
        return Err(AppError::BadRequest("Text not allowed".to_string()));
    }

    let mut message_headers = Headers::new();
    message_headers.insert(REQUEST_ID_HEADER.to_string(), request_id.to_string());

    let result = state
        .broker
        .publish(query.text.as_bytes(), &state.queue, message_headers, Duration::ZERO)
        .await?;

    info!(request_id = %request_id, queue = %state.queue, result, "Text queued");
    Ok(Json(json!({ "SUCCESS": result })))
}
