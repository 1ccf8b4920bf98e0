// Header policy module - decides which inbound headers reach the upstream
//
// The sidecar is the sole injector of authentication, so every inbound auth
// or proxy-identifying header is untrusted and dropped; forwarding one would
// let the agent override the injected credential. Hop-by-hop headers are
// dropped as well since the outbound client negotiates its own connection.
// Everything else passes through verbatim.

use axum::http::HeaderMap;

/// Headers stripped by exact, case-insensitive match.
const STRIPPED_EXACT: [&str; 10] = [
    "host",
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "forwarded",
    "via",
    // Hop-by-hop: the outbound client sets these itself.
    "connection",
    "transfer-encoding",
    "content-length",
    "x-request-id",
];

/// Header name prefixes stripped case-insensitively.
const STRIPPED_PREFIXES: [&str; 1] = ["x-forwarded-"];

/// Should this inbound header be dropped before forwarding?
///
/// `x-request-id` is in the stripped set because the forwarder re-adds the
/// validated ID itself; the raw client value never passes through.
pub fn is_stripped(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    STRIPPED_EXACT.contains(&lower.as_str())
        || STRIPPED_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Copy the forwardable subset of `headers`. Header names in an http
/// `HeaderMap` are already lowercase, so the exact-match check is direct.
pub fn filter_for_upstream(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if !is_stripped(name.as_str()) {
            filtered.append(name, value.clone());
        }
    }
    filtered
}
