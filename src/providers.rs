// Provider module - the closed set of upstream LLM APIs
//
// Each provider pairs a loopback listener with an upstream host and an
// injection style. The set is closed by design, so injection is a match on
// the enum rather than a trait hierarchy.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use url::Url;

/// Anthropic requires a version header; injected only when the client did not
/// pick one itself.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default upstream hosts.
pub const OPENAI_HOST: &str = "api.openai.com";
pub const ANTHROPIC_HOST: &str = "api.anthropic.com";
pub const COPILOT_DEFAULT_HOST: &str = "api.githubcopilot.com";

/// One of the supported upstream APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Copilot,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::Copilot,
    ];

    /// Stable name used in metrics labels, log fields, and health documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Copilot => "copilot",
        }
    }

    /// Service name reported by the per-listener health endpoint.
    pub fn service_name(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai-proxy",
            ProviderId::Anthropic => "anthropic-proxy",
            ProviderId::Copilot => "copilot-proxy",
        }
    }
}

/// Startup-immutable configuration for one enabled provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub id: ProviderId,
    /// Opaque credential; the whole point of the sidecar is that this never
    /// reaches the agent.
    pub credential: String,
    pub upstream_host: String,
    pub port: u16,
}

impl ProviderConfig {
    /// Add this provider's authentication headers to an outbound request.
    /// Runs after header scrubbing, so any client-supplied value is already
    /// gone and the sidecar's credential always wins.
    pub fn inject(&self, headers: &mut HeaderMap, client_headers: &HeaderMap) {
        match self.id {
            ProviderId::OpenAi | ProviderId::Copilot => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.credential)) {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            ProviderId::Anthropic => {
                if let Ok(value) = HeaderValue::from_str(&self.credential) {
                    headers.insert(HeaderName::from_static("x-api-key"), value);
                }
                if !client_headers.contains_key("anthropic-version") {
                    headers.insert(
                        HeaderName::from_static("anthropic-version"),
                        HeaderValue::from_static(ANTHROPIC_VERSION),
                    );
                }
            }
        }
    }

    /// Short SHA-256 fingerprint of the credential for the startup log.
    /// Never log the actual key.
    pub fn credential_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.credential.as_bytes());
        let digest = hasher.finalize();
        format!("{digest:x}")[..16].to_string()
    }
}

/// Pick the Copilot upstream host.
///
/// An explicit target always wins. Otherwise the GitHub server URL decides:
/// github.com uses the public Copilot API, `*.ghe.com` tenants get their
/// tenant API host, and any other parseable URL is treated as GitHub
/// Enterprise Server. Unparseable or absent input falls back to the public
/// host.
pub fn derive_copilot_host(target: Option<&str>, github_server_url: Option<&str>) -> String {
    if let Some(target) = target {
        if !target.is_empty() {
            return target.to_string();
        }
    }
    if let Some(server_url) = github_server_url {
        if let Some(host) = Url::parse(server_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
        {
            if host == "github.com" {
                return COPILOT_DEFAULT_HOST.to_string();
            }
            if let Some(subdomain) = host.strip_suffix(".ghe.com") {
                return format!("api.{subdomain}.ghe.com");
            }
            return "api.enterprise.githubcopilot.com".to_string();
        }
    }
    COPILOT_DEFAULT_HOST.to_string()
}
