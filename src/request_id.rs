//! Request-ID generation and validation
//!
//! Every request through the sidecar carries an `X-Request-ID` that appears in
//! the response, the upstream request, and every log record for that request.
//! Client-supplied IDs are honored when they are safe to echo into headers and
//! logs; anything else is replaced with a fresh UUID.

use axum::http::HeaderMap;
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/// Header used for trace propagation in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]{1,128}$").expect("valid request-id regex"))
}

/// Generate a fresh request ID (UUID v4).
pub fn generate() -> String {
    Uuid::new_v4().to_string()
}

/// A client-supplied ID is acceptable when it is 1-128 characters drawn from
/// `[A-Za-z0-9_.-]`. This keeps IDs header-safe and log-safe.
pub fn validate(s: &str) -> bool {
    id_pattern().is_match(s)
}

/// Pick the request ID for an incoming request: propagate a valid
/// `X-Request-ID` unchanged, otherwise generate one.
pub fn resolve(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| validate(s))
        .map(str::to_string)
        .unwrap_or_else(generate)
}
