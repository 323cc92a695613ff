// =============================================================================
// Bearer Token Authentication — Axum Middleware
// =============================================================================
//
// The admin token is read from `SCAN_ENGINE_ADMIN_TOKEN` exactly once, at
// `init()` during startup, and cached — matching `Config::apply_env_overrides`'s
// read-once-at-load convention rather than re-reading the environment on
// every request. Comparison is performed in constant time to prevent timing
// side-channel attacks.
//
// Usage as an Axum extractor:
//
//   async fn handler(AuthBearer(token): AuthBearer, ...) { ... }
//
// If the token is missing or invalid, the extractor short-circuits the request
// with a 403 Forbidden response before the handler body executes.
// =============================================================================

use std::sync::OnceLock;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use async_trait::async_trait;
use tracing::warn;

static ADMIN_TOKEN: OnceLock<String> = OnceLock::new();

/// Reads `SCAN_ENGINE_ADMIN_TOKEN` once and caches it for the process
/// lifetime. Must be called before the dashboard API starts serving
/// requests; safe to call more than once (later calls are no-ops).
pub fn init() {
    let token = std::env::var("SCAN_ENGINE_ADMIN_TOKEN").unwrap_or_default();
    if token.is_empty() {
        warn!("SCAN_ENGINE_ADMIN_TOKEN is not set — all authenticated requests will be rejected");
    }
    let _ = ADMIN_TOKEN.set(token);
}

fn expected_token() -> &'static str {
    ADMIN_TOKEN.get().map(String::as_str).unwrap_or("")
}

/// Compare two byte slices in constant time. Returns `true` if they are
/// identical.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Axum extractor that validates the `Authorization: Bearer <token>` header
/// against the cached admin token.
///
/// If the token is valid the extractor yields the raw token string (useful for
/// downstream logging or audit). If validation fails a 403 response is
/// returned immediately.
pub struct AuthBearer(pub String);

/// Rejection type returned when authentication fails.
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = expected_token();
        if expected.is_empty() {
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Server authentication not configured",
            });
        }

        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match auth_header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("Missing or malformed Authorization header");
                return Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "Missing or invalid authorization token",
                });
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("Invalid admin token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Invalid authorization token",
            });
        }

        Ok(AuthBearer(token.to_string()))
    }
}

/// Validate a token string against the cached admin token. Intended for
/// contexts where the Axum extractor is not usable (e.g. WebSocket upgrade
/// where the token arrives as a query parameter).
pub fn validate_token(token: &str) -> bool {
    let expected = expected_token();
    if expected.is_empty() {
        return false;
    }
    constant_time_eq(token.as_bytes(), expected.as_bytes())
}

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
    fn constant_time_eq_empty() {
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn constant_time_eq_single_bit_diff() {
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }
}
