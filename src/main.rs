// Process supervisor - starts the enabled listeners and waits for a signal
//
// Standard output carries the NDJSON event log; diagnostic tracing goes to
// stderr so the two streams never mix. SIGTERM and SIGINT log a `shutdown`
// event and exit 0 with no drain; in-flight requests may be cut off. A
// listener dying is fatal: the supervisor logs `shutdown` and exits non-zero
// so the surrounding container restarts the sidecar.

use anyhow::Result;
use sidekey::config::Config;
use sidekey::log_fields;
use sidekey::logging::EventLogger;
use sidekey::providers::ProviderId;
use sidekey::proxy::{server, Core};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "sidekey=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env();
    if config.upstream_proxy.is_none() {
        tracing::warn!("no upstream proxy configured (HTTP_PROXY/HTTPS_PROXY unset); connecting to providers directly");
    }

    let events = EventLogger::stdout();
    let core = match Core::new(config, events) {
        Ok(core) => Arc::new(core),
        Err(e) => {
            EventLogger::stdout().error("shutdown", log_fields! {"message" => e.to_string()});
            return Err(e);
        }
    };

    let fingerprints: Vec<_> = core
        .config
        .enabled_providers()
        .iter()
        .map(|p| {
            serde_json::json!({
                "provider": p.id.as_str(),
                "upstream_host": &p.upstream_host,
                "port": p.port,
                "credential_sha256": p.credential_fingerprint(),
            })
        })
        .collect();
    let enabled: Vec<&str> = ProviderId::ALL
        .iter()
        .filter(|id| core.config.provider_enabled(**id))
        .map(|id| id.as_str())
        .collect();
    core.events.info(
        "startup",
        log_fields! {
            "version" => sidekey::config::VERSION,
            "providers" => enabled,
            "upstream_proxy_configured" => core.config.upstream_proxy.is_some(),
            "rate_limit_enabled" => core.config.rate_limit.enabled,
            "credentials" => fingerprints,
        },
    );

    let mut servers = match server::start_listeners(core.clone()).await {
        Ok(servers) => servers,
        Err(e) => {
            core.events
                .error("shutdown", log_fields! {"message" => e.to_string()});
            return Err(e);
        }
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            core.events.info("shutdown", log_fields! {"signal" => "SIGINT"});
        }
        _ = sigterm.recv() => {
            core.events.info("shutdown", log_fields! {"signal" => "SIGTERM"});
        }
        result = servers.join_next() => {
            // A listener task ended; that only happens on server failure or a
            // panic, either of which is fatal.
            let message = match result {
                Some(Ok(Err(e))) => e.to_string(),
                Some(Err(e)) => format!("listener panicked: {e}"),
                _ => "listener exited unexpectedly".to_string(),
            };
            core.events.error("shutdown", log_fields! {"message" => message});
            std::process::exit(1);
        }
    }

    std::process::exit(0);
}
