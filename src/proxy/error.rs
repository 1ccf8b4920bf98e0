//! Proxy error types and response handling

use crate::request_id::REQUEST_ID_HEADER;
use crate::util::sanitize;
use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

/// Errors surfaced to the client during proxying. Every variant maps to one
/// HTTP status; the forwarder does its metrics/log accounting before
/// constructing one of these.
#[derive(Debug)]
pub(crate) enum ProxyErrorKind {
    /// Path rejected or the client's request stream broke mid-read.
    BadRequest,
    /// Request body crossed the hard size cap.
    PayloadTooLarge,
    /// Upstream connection or response failure.
    Upstream,
}

#[derive(Debug)]
pub(crate) struct ProxyError {
    pub kind: ProxyErrorKind,
    pub message: String,
    pub request_id: String,
}

impl ProxyError {
    pub fn new(kind: ProxyErrorKind, message: impl Into<String>, request_id: &str) -> Self {
        Self {
            kind,
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            ProxyErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        }
    }

    fn label(&self) -> &'static str {
        match self.kind {
            ProxyErrorKind::BadRequest => "bad_request",
            ProxyErrorKind::PayloadTooLarge => "payload_too_large",
            ProxyErrorKind::Upstream => "bad_gateway",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let body = json!({
            "error": self.label(),
            "message": sanitize(&self.message),
        });

        Response::builder()
            .status(self.status())
            .header("content-type", "application/json")
            .header(REQUEST_ID_HEADER, self.request_id)
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| {
                let mut fallback = Response::new(Body::from("{\"error\":\"internal\"}"));
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }
}
