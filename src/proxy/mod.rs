// Proxy module - the per-request forwarding pipeline
//
// Each provider listener funnels requests through `forward`: rate-limit
// check, request-ID handling, path validation, capped body read, header
// scrubbing, credential injection, and the upstream round trip. Response
// bodies stream back chunk by chunk while a side-channel extractor watches
// for token usage, so the client sees exactly the bytes the upstream sent
// with no added latency.

pub mod error;
pub mod server;

use crate::config::{Config, MAX_REQUEST_BODY_BYTES};
use crate::headers::filter_for_upstream;
use crate::log_fields;
use crate::logging::EventLogger;
use crate::metrics::{status_class, MetricsRegistry};
use crate::providers::{ProviderConfig, ProviderId};
use crate::ratelimit::{Decision, RateLimiter, Rejection, SystemClock};
use crate::request_id::{self, REQUEST_ID_HEADER};
use crate::usage::UsageExtractor;
use crate::util::sanitize;
use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::CONTENT_LENGTH, HeaderValue, Method, Response, StatusCode},
};
use bytes::Bytes;
use error::{ProxyError, ProxyErrorKind};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Buffer size for the client-facing response channel. Some cushion without
/// excessive memory use; the channel only smooths bursts, backpressure still
/// reaches the upstream read.
const RESPONSE_CHANNEL_CAPACITY: usize = 64;

/// Process-wide services built once at startup and threaded to every request
/// handler through axum state. No globals.
pub struct Core {
    pub config: Config,
    pub metrics: MetricsRegistry,
    pub limiter: RateLimiter,
    pub events: EventLogger,
    pub client: reqwest::Client,
}

impl Core {
    pub fn new(config: Config, events: EventLogger) -> anyhow::Result<Self> {
        let client = build_client(config.upstream_proxy.as_deref())?;
        let limiter = RateLimiter::new(config.rate_limit.clone(), Box::new(SystemClock));
        Ok(Self {
            metrics: MetricsRegistry::new(),
            limiter,
            events,
            client,
            config,
        })
    }
}

/// Build the shared upstream HTTP client.
///
/// No default User-Agent is set - the agent's own User-Agent is forwarded.
/// HTTP/1.1 is forced to avoid HTTP/2 connection resets seen with some
/// providers, and it matches the CONNECT-tunnel model of the upstream proxy.
fn build_client(proxy: Option<&str>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .pool_max_idle_per_host(10)
        .http1_only();
    builder = match proxy {
        Some(url) => {
            builder.proxy(reqwest::Proxy::all(url).context("invalid upstream proxy URL")?)
        }
        None => builder.no_proxy(),
    };
    builder.build().context("failed to build HTTP client")
}

/// Per-listener handler state: the shared core plus this listener's provider.
#[derive(Clone)]
pub struct ProxyState {
    pub core: Arc<Core>,
    pub provider: Arc<ProviderConfig>,
}

/// How the response pump ended.
enum PumpOutcome {
    Completed,
    UpstreamError(String),
    ClientDisconnected,
}

/// Forward one request to this listener's provider.
pub(crate) async fn forward(
    State(state): State<ProxyState>,
    req: Request,
) -> Result<Response<Body>, ProxyError> {
    let start = Instant::now();
    let core = &state.core;
    let provider = state.provider.id;
    let request_id = request_id::resolve(req.headers());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let declared_len: u64 = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    // Rate limiting comes first, before the request is counted as active.
    // The check uses the client-declared body size.
    if let Decision::Rejected(rejection) = core.limiter.check(provider, declared_len) {
        core.metrics.increment(
            "rate_limit_rejected_total",
            &[provider.as_str(), rejection.kind.as_str()],
            1,
        );
        core.events.warn(
            "rate_limited",
            log_fields! {
                "request_id" => &request_id,
                "provider" => provider.as_str(),
                "limit_type" => rejection.kind.as_str(),
                "limit" => rejection.limit,
                "retry_after" => rejection.retry_after_secs,
            },
        );
        return Ok(rate_limited_response(provider, &rejection, &request_id));
    }

    core.metrics.gauge_inc("active_requests", &[provider.as_str()]);
    core.events.info(
        "request_start",
        log_fields! {
            "request_id" => &request_id,
            "provider" => provider.as_str(),
            "method" => method.as_str(),
            "path" => sanitize(&path),
        },
    );

    // Absolute-form URIs and paths not rooted at / could smuggle a different
    // target through the upstream proxy.
    if req.uri().authority().is_some() || !path.starts_with('/') {
        return Err(complete_rejected(
            core,
            provider,
            &method,
            &path,
            ProxyErrorKind::BadRequest,
            "request path must start with /",
            &request_id,
            start,
        ));
    }

    if declared_len > MAX_REQUEST_BODY_BYTES as u64 {
        return Err(complete_rejected(
            core,
            provider,
            &method,
            &path,
            ProxyErrorKind::PayloadTooLarge,
            "request body exceeds 10 MiB limit",
            &request_id,
            start,
        ));
    }

    let client_headers = req.headers().clone();

    // Read the body incrementally so the cap triggers the moment it is
    // crossed, whether or not Content-Length was honest.
    let mut body: Vec<u8> = Vec::new();
    let mut request_stream = req.into_body().into_data_stream();
    while let Some(chunk) = request_stream.next().await {
        match chunk {
            Ok(chunk) => {
                if body.len() + chunk.len() > MAX_REQUEST_BODY_BYTES {
                    return Err(complete_rejected(
                        core,
                        provider,
                        &method,
                        &path,
                        ProxyErrorKind::PayloadTooLarge,
                        "request body exceeds 10 MiB limit",
                        &request_id,
                        start,
                    ));
                }
                body.extend_from_slice(&chunk);
            }
            Err(e) => {
                return Err(complete_error(
                    core,
                    provider,
                    ProxyErrorKind::BadRequest,
                    &format!("client stream error: {e}"),
                    &request_id,
                ));
            }
        }
    }
    let request_bytes = body.len() as u64;

    // Scrub, then re-add the validated request ID and inject credentials.
    let mut outbound = filter_for_upstream(&client_headers);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        outbound.insert(REQUEST_ID_HEADER, value);
    }
    state.provider.inject(&mut outbound, &client_headers);

    let url = format!("https://{}{}", state.provider.upstream_host, target);
    let upstream = core
        .client
        .request(method.clone(), &url)
        .headers(outbound)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            complete_error(
                core,
                provider,
                ProxyErrorKind::Upstream,
                &format!("upstream connection error: {e}"),
                &request_id,
            )
        })?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let mut extractor = UsageExtractor::for_response(provider, &upstream_headers);

    // Stream the response through a channel: every chunk goes to the client
    // first, then to the extractor's copy. Final accounting happens when the
    // upstream body ends.
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(RESPONSE_CHANNEL_CAPACITY);
    let pump_core = state.core.clone();
    let pump_provider = state.provider.clone();
    let pump_request_id = request_id.clone();
    let pump_method = method.clone();
    let pump_path = path.clone();
    tokio::spawn(async move {
        let mut byte_stream = upstream.bytes_stream();
        let mut response_bytes: u64 = 0;
        let mut outcome = PumpOutcome::Completed;

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(chunk) => {
                    response_bytes += chunk.len() as u64;
                    extractor.feed(&chunk);
                    if tx.send(Ok(chunk)).await.is_err() {
                        outcome = PumpOutcome::ClientDisconnected;
                        break;
                    }
                }
                Err(e) => {
                    let message = format!("upstream stream error: {e}");
                    let _ = tx
                        .send(Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            message.clone(),
                        )))
                        .await;
                    outcome = PumpOutcome::UpstreamError(message);
                    break;
                }
            }
        }
        drop(tx);

        let core = pump_core;
        let provider = pump_provider.id;
        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            PumpOutcome::Completed => {
                core.metrics.increment(
                    "requests_total",
                    &[
                        provider.as_str(),
                        pump_method.as_str(),
                        status_class(status.as_u16()),
                    ],
                    1,
                );
                core.metrics
                    .increment("request_bytes_total", &[provider.as_str()], request_bytes);
                core.metrics.increment(
                    "response_bytes_total",
                    &[provider.as_str()],
                    response_bytes,
                );
                core.metrics
                    .observe("request_duration_ms", &[provider.as_str()], duration_ms);
                core.metrics.gauge_dec("active_requests", &[provider.as_str()]);

                let counts = extractor.finish();
                if !counts.is_zero() {
                    core.limiter.record_tokens(provider, counts.total);
                    core.events.info(
                        "tokens",
                        log_fields! {
                            "request_id" => &pump_request_id,
                            "provider" => provider.as_str(),
                            "input" => counts.input,
                            "output" => counts.output,
                            "total" => counts.total,
                        },
                    );
                }

                core.events.info(
                    "request_complete",
                    log_fields! {
                        "request_id" => &pump_request_id,
                        "provider" => provider.as_str(),
                        "method" => pump_method.as_str(),
                        "path" => sanitize(&pump_path),
                        "status" => status.as_u16(),
                        "duration_ms" => duration_ms,
                        "request_bytes" => request_bytes,
                        "response_bytes" => response_bytes,
                        "upstream_host" => &pump_provider.upstream_host,
                    },
                );
            }
            PumpOutcome::UpstreamError(message) => {
                record_stream_error(&core, provider, &pump_request_id, 502, &message);
            }
            PumpOutcome::ClientDisconnected => {
                record_stream_error(
                    &core,
                    provider,
                    &pump_request_id,
                    400,
                    "client disconnected mid-response",
                );
            }
        }
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *response.status_mut() = status;
    let response_headers = response.headers_mut();
    for (name, value) in upstream_headers.iter() {
        // Framing is renegotiated for the streamed body.
        if name == "transfer-encoding" || name == "connection" || name == "content-length" {
            continue;
        }
        response_headers.append(name, value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response_headers.insert(REQUEST_ID_HEADER, value);
    }
    Ok(response)
}

/// Accounting for requests rejected before forwarding (bad path, body cap):
/// these complete normally from the metrics' point of view.
#[allow(clippy::too_many_arguments)]
fn complete_rejected(
    core: &Core,
    provider: ProviderId,
    method: &Method,
    path: &str,
    kind: ProxyErrorKind,
    message: &str,
    request_id: &str,
    start: Instant,
) -> ProxyError {
    let error = ProxyError::new(kind, message, request_id);
    let status = error.status();
    core.metrics.increment(
        "requests_total",
        &[
            provider.as_str(),
            method.as_str(),
            status_class(status.as_u16()),
        ],
        1,
    );
    core.metrics.gauge_dec("active_requests", &[provider.as_str()]);
    core.events.info(
        "request_complete",
        log_fields! {
            "request_id" => request_id,
            "provider" => provider.as_str(),
            "method" => method.as_str(),
            "path" => sanitize(path),
            "status" => status.as_u16(),
            "duration_ms" => start.elapsed().as_millis() as u64,
            "request_bytes" => 0,
            "response_bytes" => 0,
        },
    );
    error
}

/// Accounting for genuine failures (client stream broke, upstream unreachable).
fn complete_error(
    core: &Core,
    provider: ProviderId,
    kind: ProxyErrorKind,
    message: &str,
    request_id: &str,
) -> ProxyError {
    let error = ProxyError::new(kind, message, request_id);
    core.metrics
        .increment("requests_errors_total", &[provider.as_str()], 1);
    core.metrics.gauge_dec("active_requests", &[provider.as_str()]);
    core.events.error(
        "request_error",
        log_fields! {
            "request_id" => request_id,
            "provider" => provider.as_str(),
            "status" => error.status().as_u16(),
            "message" => sanitize(message),
        },
    );
    error
}

/// Same accounting for failures after response headers were already sent.
fn record_stream_error(
    core: &Core,
    provider: ProviderId,
    request_id: &str,
    status: u16,
    message: &str,
) {
    core.metrics
        .increment("requests_errors_total", &[provider.as_str()], 1);
    core.metrics.gauge_dec("active_requests", &[provider.as_str()]);
    core.events.error(
        "request_error",
        log_fields! {
            "request_id" => request_id,
            "provider" => provider.as_str(),
            "status" => status,
            "message" => sanitize(message),
        },
    );
}

/// Wire schema of the 429 body.
#[derive(Serialize)]
struct RateLimitErrorBody<'a> {
    error: RateLimitErrorDetail<'a>,
}

#[derive(Serialize)]
struct RateLimitErrorDetail<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
    provider: &'a str,
    limit: u64,
    window: &'static str,
    retry_after: u64,
}

/// 429 response carrying the standard rate-limit headers and body schema.
fn rate_limited_response(
    provider: ProviderId,
    rejection: &Rejection,
    request_id: &str,
) -> Response<Body> {
    let body = RateLimitErrorBody {
        error: RateLimitErrorDetail {
            kind: "rate_limit_error",
            message: format!(
                "Rate limit exceeded for {}: limit {} ({})",
                provider.as_str(),
                rejection.limit,
                rejection.kind.window_label()
            ),
            provider: provider.as_str(),
            limit: rejection.limit,
            window: rejection.kind.window_label(),
            retry_after: rejection.retry_after_secs,
        },
    };
    let body = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());

    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header("content-type", "application/json")
        .header("retry-after", rejection.retry_after_secs.to_string())
        .header("x-ratelimit-limit", rejection.limit.to_string())
        .header("x-ratelimit-remaining", "0")
        .header("x-ratelimit-reset", rejection.retry_after_secs.to_string())
        .header(REQUEST_ID_HEADER, request_id)
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::TOO_MANY_REQUESTS;
            fallback
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::LimitKind;

    #[test]
    fn test_build_client_without_proxy() {
        assert!(build_client(None).is_ok());
    }

    #[test]
    fn test_build_client_with_proxy() {
        assert!(build_client(Some("http://squid:3128")).is_ok());
    }

    #[test]
    fn test_build_client_rejects_bad_proxy_url() {
        assert!(build_client(Some("::not a url::")).is_err());
    }

    #[test]
    fn test_rate_limited_response_shape() {
        let rejection = Rejection {
            kind: LimitKind::Rpm,
            limit: 2,
            retry_after_secs: 30,
        };
        let response = rate_limited_response(ProviderId::Anthropic, &rejection, "trace-1");

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers["retry-after"], "30");
        assert_eq!(headers["x-ratelimit-limit"], "2");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["x-ratelimit-reset"], "30");
        assert_eq!(headers["x-request-id"], "trace-1");
        assert_eq!(headers["content-type"], "application/json");
    }
}
