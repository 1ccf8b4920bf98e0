// sidekey - credential-isolating reverse proxy sidecar for LLM APIs
//
// The sidecar sits between an untrusted agent process and the real provider
// endpoints. Each provider gets its own plaintext-HTTP listener on a distinct
// port; requests are scrubbed of client-supplied auth headers, stamped with
// the provider credential, and forwarded over TLS (through an upstream
// CONNECT proxy when one is configured). Credentials never reach the agent.
//
// Architecture:
// - proxy: per-request forwarding pipeline and the per-provider listeners
// - headers / request_id / util: the scrubbing and tracing primitives
// - ratelimit: per-provider sliding-window limits (fail-open)
// - usage: byte-transparent token-usage extraction from responses
// - metrics / logging: in-process counters and the NDJSON event stream

pub mod config;
pub mod headers;
pub mod logging;
pub mod metrics;
pub mod providers;
pub mod proxy;
pub mod ratelimit;
pub mod request_id;
pub mod usage;
pub mod util;
