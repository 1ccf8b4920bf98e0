//! Configuration for the sidecar
//!
//! Everything comes from environment variables at startup and is immutable
//! afterwards. A provider listener exists only when its credential is set;
//! the OpenAI port is special in that it always binds so the management
//! endpoints stay reachable.

use crate::providers::{
    derive_copilot_host, ProviderConfig, ProviderId, ANTHROPIC_HOST, OPENAI_HOST,
};
use crate::ratelimit::RateLimitSettings;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Listener ports, one per provider. The OpenAI port doubles as the
/// management port.
pub const OPENAI_PORT: u16 = 10000;
pub const ANTHROPIC_PORT: u16 = 10001;
pub const COPILOT_PORT: u16 = 10002;

/// Hard cap on request bodies, enforced incrementally while reading.
pub const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Startup configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai: Option<ProviderConfig>,
    pub anthropic: Option<ProviderConfig>,
    pub copilot: Option<ProviderConfig>,
    /// CONNECT-capable forward proxy for all upstream traffic; `None` means
    /// direct connections (warned about at startup).
    pub upstream_proxy: Option<String>,
    pub rate_limit: RateLimitSettings,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// The same assembly with an injectable environment, for tests.
    fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| env(name).filter(|v| !v.is_empty());

        let openai = non_empty("OPENAI_API_KEY").map(|credential| ProviderConfig {
            id: ProviderId::OpenAi,
            credential,
            upstream_host: OPENAI_HOST.to_string(),
            port: OPENAI_PORT,
        });

        let anthropic = non_empty("ANTHROPIC_API_KEY").map(|credential| ProviderConfig {
            id: ProviderId::Anthropic,
            credential,
            upstream_host: ANTHROPIC_HOST.to_string(),
            port: ANTHROPIC_PORT,
        });

        let copilot = non_empty("COPILOT_GITHUB_TOKEN").map(|credential| ProviderConfig {
            id: ProviderId::Copilot,
            credential,
            upstream_host: derive_copilot_host(
                env("COPILOT_API_TARGET").as_deref(),
                env("GITHUB_SERVER_URL").as_deref(),
            ),
            port: COPILOT_PORT,
        });

        // HTTPS_PROXY wins when both are set; upstream traffic is TLS.
        let upstream_proxy = non_empty("HTTPS_PROXY").or_else(|| non_empty("HTTP_PROXY"));

        let defaults = RateLimitSettings::default();
        let rate_limit = RateLimitSettings {
            enabled: env("AWF_RATE_LIMIT_ENABLED")
                .map(|v| v == "true")
                .unwrap_or(false),
            rpm: parse_positive(env("AWF_RATE_LIMIT_RPM")).unwrap_or(defaults.rpm),
            rph: parse_positive(env("AWF_RATE_LIMIT_RPH")).unwrap_or(defaults.rph),
            bytes_pm: parse_positive(env("AWF_RATE_LIMIT_BYTES_PM")).unwrap_or(defaults.bytes_pm),
            tokens_pm: parse_positive(env("AWF_RATE_LIMIT_TOKENS_PM")),
        };

        Self {
            openai,
            anthropic,
            copilot,
            upstream_proxy,
            rate_limit,
        }
    }

    /// Is the given provider enabled (credential present)?
    pub fn provider_enabled(&self, id: ProviderId) -> bool {
        match id {
            ProviderId::OpenAi => self.openai.is_some(),
            ProviderId::Anthropic => self.anthropic.is_some(),
            ProviderId::Copilot => self.copilot.is_some(),
        }
    }

    /// The enabled providers, in listener-port order.
    pub fn enabled_providers(&self) -> Vec<&ProviderConfig> {
        [&self.openai, &self.anthropic, &self.copilot]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Parse a numeric environment value; non-numeric or non-positive input is
/// treated as unset so the caller's default applies.
fn parse_positive(value: Option<String>) -> Option<u64> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}
