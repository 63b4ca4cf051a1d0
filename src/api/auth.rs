// =============================================================================
// Bearer Token Authentication — Axum Extractor
// =============================================================================
//
// Control-surface requests must present `Authorization: Bearer <token>`,
// checked against the `MERIDIAN_API_TOKEN` environment variable. An unset or
// empty variable rejects every authenticated request rather than opening the
// API: a misconfigured server must never accept trading commands.
//
// Usage:
//
//   async fn handler(_auth: AuthBearer, ...) { ... }
//
// A missing or invalid token short-circuits with 403 before the handler runs.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const TOKEN_ENV: &str = "MERIDIAN_API_TOKEN";

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Byte-for-byte comparison that touches every position regardless of where
/// a mismatch occurs, so response timing does not narrow down the token.
/// A length mismatch is rejected outright; the expected token's length is
/// not attacker-controlled.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// The configured token, re-read per request so rotation needs no restart.
fn expected_token() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
}

// =============================================================================
// Extractor
// =============================================================================

/// Extractor guarding the REST control surface. Yields the presented token
/// for audit logging when validation succeeds.
pub struct AuthBearer(pub String);

/// 403 response emitted when authentication fails.
pub struct AuthRejection {
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(expected) = expected_token() else {
            warn!("{TOKEN_ENV} is not set — rejecting authenticated request");
            return Err(AuthRejection {
                message: "Server authentication not configured",
            });
        };

        let presented = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        let Some(token) = presented else {
            warn!("missing or malformed Authorization header");
            return Err(AuthRejection {
                message: "Missing or invalid authorization token",
            });
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid API token presented");
            return Err(AuthRejection {
                message: "Invalid authorization token",
            });
        }

        Ok(AuthBearer(token.to_string()))
    }
}

// =============================================================================
// Token validation helper (for WebSocket query-param auth)
// =============================================================================

/// Validate a token outside the extractor path (the WebSocket upgrade
/// carries it as a `?token=` query parameter). Fails closed when no token
/// is configured.
pub fn validate_token(token: &str) -> bool {
    match expected_token() {
        Some(expected) => constant_time_eq(token.as_bytes(), expected.as_bytes()),
        None => false,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn constant_time_eq_single_bit_diff() {
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    // Single test: the token variable is process-global state.
    #[test]
    fn token_validation_fails_closed() {
        std::env::remove_var(TOKEN_ENV);
        assert!(!validate_token("anything"));
        assert!(!validate_token(""));

        std::env::set_var(TOKEN_ENV, "secret-token");
        assert!(!validate_token("short"));
        assert!(!validate_token(""));
        assert!(validate_token("secret-token"));

        std::env::set_var(TOKEN_ENV, "");
        assert!(!validate_token(""));
        std::env::remove_var(TOKEN_ENV);
    }
}
