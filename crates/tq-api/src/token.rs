//! Access-token payload parsing
//!
//! The signature is not checked here: tokens are verified by the gateway in
//! front of the ingress. Only the payload's `sub` claim is read.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Missing Authorization header")]
    Missing,

    #[error("Malformed token: expected header.payload.signature")]
    Malformed,

    #[error("Token payload is not base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Token payload is not a valid claim set: {0}")]
    Payload(#[from] serde_json::Error),
}

/// User data carried in the token's `sub` claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenData {
    #[serde(deserialize_with = "string_or_number")]
    pub iat: String,
    pub ttl: i64,
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    #[serde(default)]
    pub user_roles: Option<Vec<String>>,
    #[serde(default)]
    pub user_fingerprint: Option<String>,
    pub access_token_id: String,
    pub refresh_token_id: String,
}

#[derive(Deserialize)]
struct Claims {
    sub: AccessTokenData,
}

/// Parse the `Authorization` header value (with or without `Bearer `)
pub fn parse_payload_from_token(authorization: &str) -> Result<AccessTokenData, TokenError> {
    let token = authorization.trim();
    let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
    if token.is_empty() {
        return Err(TokenError::Missing);
    }

    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next()) {
        (Some(_), Some(payload)) if !payload.is_empty() => payload,
        _ => return Err(TokenError::Malformed),
    };

    let bytes = decode_segment(payload)?;
    let claims: Claims = serde_json::from_slice(&bytes)?;
    Ok(claims.sub)
}

/// URL-safe or standard alphabet, padded or not
fn decode_segment(segment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let unpadded = segment.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(unpadded)
        .or_else(|_| STANDARD_NO_PAD.decode(unpadded))
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}
