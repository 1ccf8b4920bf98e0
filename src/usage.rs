// Usage extraction module - recovers token counts from upstream responses
//
// The extractor is a side-channel observer: the forwarder hands it a copy of
// every response chunk while the original bytes stream to the client
// untouched. At end of response it yields the token usage the upstream
// reported, or zeros when there was nothing parseable. It never errors and
// never interferes with forwarding.
//
// Two parse modes, selected by Content-Type:
// - SSE (`text/event-stream`): process `data:` lines as they complete,
//   holding only the trailing partial line between chunks.
// - Buffered JSON: accumulate the body and parse once at stream end.
//
// Compressed bodies (gzip/br/deflate) are passed through without extraction;
// the sidecar does not decompress.

use crate::providers::ProviderId;
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE};
use serde_json::Value;

/// Largest JSON body the extractor will buffer for parsing. Bigger bodies
/// still stream through verbatim; extraction just gives up.
const MAX_JSON_BUFFER: usize = 10 * 1024 * 1024;

/// Largest single SSE line the extractor will hold while waiting for its
/// newline.
const MAX_SSE_LINE: usize = 1024 * 1024;

/// Token usage reported by the upstream for one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenCounts {
    pub fn is_zero(&self) -> bool {
        self.input == 0 && self.output == 0 && self.total == 0
    }
}

enum Mode {
    /// Compressed body; counts stay zero.
    Skipped,
    /// Accumulate and parse at end of stream.
    Json { buf: Vec<u8>, overflowed: bool },
    /// Parse `data:` lines incrementally.
    Sse {
        pending: Vec<u8>,
        /// Set after an oversized line was abandoned; the tail up to the next
        /// newline is discarded.
        skipping: bool,
        input: u64,
        output: u64,
        reported_total: Option<u64>,
    },
}

/// Side-channel usage parser for one response.
pub struct UsageExtractor {
    provider: ProviderId,
    mode: Mode,
}

fn is_compressed(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',').any(|enc| {
                let enc = enc.trim();
                enc.eq_ignore_ascii_case("gzip")
                    || enc.eq_ignore_ascii_case("br")
                    || enc.eq_ignore_ascii_case("deflate")
            })
        })
        .unwrap_or(false)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false)
}

impl UsageExtractor {
    /// Choose the parse mode for a response from its headers.
    pub fn for_response(provider: ProviderId, headers: &HeaderMap) -> Self {
        let mode = if is_compressed(headers) {
            Mode::Skipped
        } else if is_event_stream(headers) {
            Mode::Sse {
                pending: Vec::new(),
                skipping: false,
                input: 0,
                output: 0,
                reported_total: None,
            }
        } else {
            Mode::Json {
                buf: Vec::new(),
                overflowed: false,
            }
        };
        Self { provider, mode }
    }

    /// Observe one response chunk. The caller forwards the original bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        match &mut self.mode {
            Mode::Skipped => {}
            Mode::Json { buf, overflowed } => {
                if *overflowed {
                    return;
                }
                if buf.len() + chunk.len() > MAX_JSON_BUFFER {
                    buf.clear();
                    *overflowed = true;
                } else {
                    buf.extend_from_slice(chunk);
                }
            }
            Mode::Sse {
                pending,
                skipping,
                input,
                output,
                reported_total,
            } => {
                pending.extend_from_slice(chunk);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    if *skipping {
                        // Tail of an abandoned oversized line.
                        *skipping = false;
                        continue;
                    }
                    if let Ok(line) = std::str::from_utf8(&line[..line.len() - 1]) {
                        apply_sse_line(
                            self.provider,
                            line.trim_end_matches('\r'),
                            input,
                            output,
                            reported_total,
                        );
                    }
                }
                if pending.len() > MAX_SSE_LINE {
                    pending.clear();
                    *skipping = true;
                }
            }
        }
    }

    /// End of response: produce the counts. Malformed or absent usage yields
    /// zeros.
    pub fn finish(self) -> TokenCounts {
        match self.mode {
            Mode::Skipped => TokenCounts::default(),
            Mode::Json { buf, overflowed } => {
                if overflowed {
                    return TokenCounts::default();
                }
                parse_json_body(self.provider, &buf)
            }
            Mode::Sse {
                input,
                output,
                reported_total,
                ..
            } => TokenCounts {
                input,
                output,
                total: reported_total.unwrap_or(input + output),
            },
        }
    }
}

fn parse_json_body(provider: ProviderId, body: &[u8]) -> TokenCounts {
    let Ok(root) = serde_json::from_slice::<Value>(body) else {
        return TokenCounts::default();
    };
    let Some(usage) = root.get("usage") else {
        return TokenCounts::default();
    };
    match provider {
        ProviderId::Anthropic => {
            let input = u64_field(usage, "input_tokens").unwrap_or(0);
            let output = u64_field(usage, "output_tokens").unwrap_or(0);
            TokenCounts {
                input,
                output,
                total: input + output,
            }
        }
        ProviderId::OpenAi | ProviderId::Copilot => {
            let input = u64_field(usage, "prompt_tokens").unwrap_or(0);
            let output = u64_field(usage, "completion_tokens").unwrap_or(0);
            TokenCounts {
                input,
                output,
                total: u64_field(usage, "total_tokens").unwrap_or(input + output),
            }
        }
    }
}

/// Process one complete SSE line. Only `data:` lines with a JSON payload
/// matter; `[DONE]` markers and comment/event lines are skipped.
fn apply_sse_line(
    provider: ProviderId,
    line: &str,
    input: &mut u64,
    output: &mut u64,
    reported_total: &mut Option<u64>,
) {
    let Some(payload) = line.strip_prefix("data:") else {
        return;
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return;
    }
    let Ok(data) = serde_json::from_str::<Value>(payload) else {
        return;
    };

    match provider {
        ProviderId::Anthropic => {
            match data.get("type").and_then(Value::as_str) {
                Some("message_start") => {
                    if let Some(v) = data
                        .get("message")
                        .and_then(|m| m.get("usage"))
                        .and_then(|u| u64_field(u, "input_tokens"))
                    {
                        *input = v;
                    }
                }
                Some("message_delta") => {
                    if let Some(v) = data
                        .get("usage")
                        .and_then(|u| u64_field(u, "output_tokens"))
                    {
                        *output = v;
                    }
                }
                _ => {}
            }
        }
        ProviderId::OpenAi | ProviderId::Copilot => {
            // Usage typically arrives in the final chunk before [DONE], but
            // any event carrying it updates the counters.
            if let Some(usage) = data.get("usage") {
                if let Some(v) = u64_field(usage, "prompt_tokens") {
                    *input = v;
                }
                if let Some(v) = u64_field(usage, "completion_tokens") {
                    *output = v;
                }
                if let Some(v) = u64_field(usage, "total_tokens") {
                    *reported_total = Some(v);
                }
            }
        }
    }
}

fn u64_field(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(content_type: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        h
    }

    fn run(provider: ProviderId, headers: &HeaderMap, chunks: &[&[u8]]) -> TokenCounts {
        let mut extractor = UsageExtractor::for_response(provider, headers);
        for chunk in chunks {
            extractor.feed(chunk);
        }
        extractor.finish()
    }

    const ANTHROPIC_SSE: &[u8] = b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":100}}}\n\nevent: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":50}}\n\n";

    #[test]
    fn test_anthropic_sse_usage() {
        let counts = run(
            ProviderId::Anthropic,
            &headers("text/event-stream"),
            &[ANTHROPIC_SSE],
        );
        assert_eq!(
            counts,
            TokenCounts {
                input: 100,
                output: 50,
                total: 150
            }
        );
    }

    #[test]
    fn test_sse_partial_lines_across_chunks() {
        // Split mid-line; the extractor must hold the fragment.
        let (a, b) = ANTHROPIC_SSE.split_at(40);
        let counts = run(ProviderId::Anthropic, &headers("text/event-stream"), &[a, b]);
        assert_eq!(counts.total, 150);
    }

    #[test]
    fn test_openai_sse_final_usage_chunk() {
        let body: &[u8] = b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5,\"total_tokens\":15}}\n\ndata: [DONE]\n\n";
        let counts = run(ProviderId::OpenAi, &headers("text/event-stream"), &[body]);
        assert_eq!(
            counts,
            TokenCounts {
                input: 10,
                output: 5,
                total: 15
            }
        );
    }

    #[test]
    fn test_openai_sse_without_total_sums() {
        let body: &[u8] = b"data: {\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3}}\n\n";
        let counts = run(ProviderId::Copilot, &headers("text/event-stream"), &[body]);
        assert_eq!(counts.total, 10);
    }

    #[test]
    fn test_anthropic_json_body() {
        let body = br#"{"id":"msg_1","usage":{"input_tokens":42,"output_tokens":8}}"#;
        let counts = run(ProviderId::Anthropic, &headers("application/json"), &[body]);
        assert_eq!(
            counts,
            TokenCounts {
                input: 42,
                output: 8,
                total: 50
            }
        );
    }

    #[test]
    fn test_openai_json_preserves_reported_total() {
        // Cached tokens make total differ from input + output; the upstream's
        // number wins.
        let body =
            br#"{"usage":{"prompt_tokens":100,"completion_tokens":20,"total_tokens":220}}"#;
        let counts = run(ProviderId::OpenAi, &headers("application/json"), &[body]);
        assert_eq!(counts.total, 220);
    }

    #[test]
    fn test_openai_json_total_fallback() {
        let body = br#"{"usage":{"prompt_tokens":100,"completion_tokens":20}}"#;
        let counts = run(ProviderId::OpenAi, &headers("application/json"), &[body]);
        assert_eq!(counts.total, 120);
    }

    #[test]
    fn test_malformed_inputs_yield_zeros() {
        let h = headers("application/json");
        assert!(run(ProviderId::Anthropic, &h, &[b"not json"]).is_zero());
        assert!(run(ProviderId::Anthropic, &h, &[b"{}"]).is_zero());
        assert!(run(ProviderId::Anthropic, &h, &[b""]).is_zero());
        let sse = headers("text/event-stream");
        assert!(run(ProviderId::OpenAi, &sse, &[b"data: {broken\n\n"]).is_zero());
    }

    #[test]
    fn test_compressed_body_skips_extraction() {
        let mut h = headers("application/json");
        h.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let body = br#"{"usage":{"prompt_tokens":5,"completion_tokens":5}}"#;
        assert!(run(ProviderId::OpenAi, &h, &[body]).is_zero());

        h.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        assert!(run(ProviderId::OpenAi, &h, &[body]).is_zero());
    }

    #[test]
    fn test_identity_encoding_still_extracts() {
        let mut h = headers("application/json");
        h.insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
        let body = br#"{"usage":{"prompt_tokens":5,"completion_tokens":5}}"#;
        assert_eq!(run(ProviderId::OpenAi, &h, &[body]).total, 10);
    }

    #[test]
    fn test_sse_crlf_line_endings() {
        let body: &[u8] = b"data: {\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":6}}\r\n\r\n";
        let counts = run(ProviderId::OpenAi, &headers("text/event-stream"), &[body]);
        assert_eq!(counts.total, 10);
    }

    #[test]
    fn test_sse_later_usage_event_wins() {
        let body: &[u8] = b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1}}\n\ndata: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":20,\"total_tokens\":30}}\n\n";
        let counts = run(ProviderId::OpenAi, &headers("text/event-stream"), &[body]);
        assert_eq!(
            counts,
            TokenCounts {
                input: 10,
                output: 20,
                total: 30
            }
        );
    }

    #[test]
    fn test_feed_leaves_observed_bytes_untouched() {
        // The extractor receives a borrowed copy; the caller's chunk is what
        // actually reaches the client and must be forwardable as-is.
        let chunk = ANTHROPIC_SSE.to_vec();
        let mut extractor =
            UsageExtractor::for_response(ProviderId::Anthropic, &headers("text/event-stream"));
        extractor.feed(&chunk);
        assert_eq!(chunk, ANTHROPIC_SSE);
    }

    #[test]
    fn test_oversized_json_body_abandons_extraction() {
        let mut extractor =
            UsageExtractor::for_response(ProviderId::OpenAi, &headers("application/json"));
        let chunk = vec![b'x'; 4 * 1024 * 1024];
        for _ in 0..4 {
            extractor.feed(&chunk);
        }
        assert!(extractor.finish().is_zero());
    }

    #[test]
    fn test_oversized_sse_line_is_dropped_but_later_lines_parse() {
        let mut extractor =
            UsageExtractor::for_response(ProviderId::OpenAi, &headers("text/event-stream"));
        extractor.feed(&vec![b'y'; 2 * 1024 * 1024]);
        extractor.feed(b"\ndata: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2}}\n");
        assert_eq!(extractor.finish().total, 3);
    }
}
