//! Listener setup - one HTTP server per enabled provider
//!
//! The OpenAI port doubles as the management port: it serves `/health` and
//! `/metrics` whether or not an OpenAI credential is configured. Without a
//! credential it becomes a stub that answers management requests and returns
//! 404 for everything else. The Anthropic and Copilot listeners answer
//! `GET /health` locally and forward the rest to their provider.

use super::{forward, Core, ProxyState};
use crate::config::OPENAI_PORT;
use crate::log_fields;
use crate::providers::{ProviderConfig, ProviderId};
use anyhow::Context as _;
use axum::{
    body::Body,
    extract::State,
    http::{Response, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

/// Full management health document served on the OpenAI port.
async fn management_health(State(core): State<Arc<Core>>) -> Json<Value> {
    let mut rate_limits = Map::new();
    for id in ProviderId::ALL {
        rate_limits.insert(id.as_str().to_string(), core.limiter.health(id));
    }

    Json(json!({
        "status": "healthy",
        "service": "sidekey",
        "squid_proxy": core.config.upstream_proxy.is_some(),
        "providers": {
            "openai": core.config.provider_enabled(ProviderId::OpenAi),
            "anthropic": core.config.provider_enabled(ProviderId::Anthropic),
            "copilot": core.config.provider_enabled(ProviderId::Copilot),
        },
        "metrics_summary": core.metrics.summary(),
        "rate_limits": rate_limits,
    }))
}

/// Metrics snapshot served on the OpenAI port.
async fn metrics_snapshot(State(core): State<Arc<Core>>) -> Json<Value> {
    Json(core.metrics.snapshot())
}

/// Lightweight liveness answer on the per-provider listeners.
async fn provider_health(State(state): State<ProxyState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": state.provider.id.service_name(),
    }))
}

/// Fallback on the management stub when no OpenAI credential is configured.
async fn management_not_found() -> Response<Body> {
    (
        StatusCode::NOT_FOUND,
        [("content-type", "application/json")],
        json!({
            "error": "not_found",
            "message": "OpenAI proxying is not configured on this sidecar",
        })
        .to_string(),
    )
        .into_response()
}

/// Router for the OpenAI/management port.
pub fn openai_router(core: Arc<Core>) -> Router {
    let management = Router::new()
        .route("/health", get(management_health))
        .route("/metrics", get(metrics_snapshot))
        .with_state(core.clone());

    match &core.config.openai {
        Some(provider) => {
            let state = ProxyState {
                core: core.clone(),
                provider: Arc::new(provider.clone()),
            };
            management.merge(Router::new().fallback(forward).with_state(state))
        }
        None => management.fallback(management_not_found),
    }
}

/// Router for the Anthropic and Copilot listeners.
pub fn provider_router(core: Arc<Core>, provider: ProviderConfig) -> Router {
    let state = ProxyState {
        core,
        provider: Arc::new(provider),
    };
    Router::new()
        .route("/health", get(provider_health))
        .fallback(forward)
        .with_state(state)
}

/// Bind every listener and return the set of running server tasks. Binding
/// happens up front so port conflicts fail startup instead of surfacing
/// later.
pub async fn start_listeners(core: Arc<Core>) -> anyhow::Result<JoinSet<anyhow::Result<()>>> {
    let mut servers = JoinSet::new();

    let openai_service = match &core.config.openai {
        Some(_) => ProviderId::OpenAi.service_name(),
        None => "management",
    };
    bind_and_spawn(
        &mut servers,
        &core,
        openai_router(core.clone()),
        OPENAI_PORT,
        openai_service,
    )
    .await?;

    if let Some(provider) = core.config.anthropic.clone() {
        let port = provider.port;
        let app = provider_router(core.clone(), provider);
        bind_and_spawn(
            &mut servers,
            &core,
            app,
            port,
            ProviderId::Anthropic.service_name(),
        )
        .await?;
    }

    if let Some(provider) = core.config.copilot.clone() {
        let port = provider.port;
        let app = provider_router(core.clone(), provider);
        bind_and_spawn(
            &mut servers,
            &core,
            app,
            port,
            ProviderId::Copilot.service_name(),
        )
        .await?;
    }

    Ok(servers)
}

async fn bind_and_spawn(
    servers: &mut JoinSet<anyhow::Result<()>>,
    core: &Arc<Core>,
    app: Router,
    port: u16,
    service: &str,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port} for {service}"))?;

    core.events.info(
        "server_start",
        log_fields! {
            "service" => service,
            "port" => port,
        },
    );
    tracing::info!("{service} listening on port {port}");

    let service = service.to_string();
    servers.spawn(async move {
        axum::serve(listener, app)
            .await
            .with_context(|| format!("{service} server error"))
    });
    Ok(())
}
