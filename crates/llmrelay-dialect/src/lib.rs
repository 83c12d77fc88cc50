//! §4.H Dialect Adapters: one per upstream `ServiceType`, each able to
//! act in two roles — as the *upstream* dialect (building requests,
//! parsing upstream responses) and as the *inbound* dialect (parsing
//! the client's body, rendering the client's response) — so that any
//! (inbound kind, channel dialect) pair can be bridged by composing two
//! adapters. Translation bodies are field-level, not full-fidelity: the
//! required invariant is that model, stream flag, and message count
//! survive a one-way translation, per the round-trip property in the
//! testable-properties section.

mod claude;
mod error;
mod gemini;
mod normalized;
mod openai;
mod request;
mod responses;
pub mod sse;

pub use error::DialectError;
pub use normalized::{NormalizedMessage, NormalizedRequest, NormalizedResponse, NormalizedStreamDelta, StreamState};
pub use request::{join_url, UpstreamRequest};
pub use sse::{encode_sse, SseEvent, SseParser, DONE_FRAME};

use llmrelay_config::{ServiceType, UpstreamConfig};

/// The capability set every dialect adapter implements, selected by
/// `ServiceType` (when acting upstream) or by the inbound `Kind` mapped
/// onto its equivalent `ServiceType` (when acting inbound — `Kind::Chat`
/// uses the `openai` adapter, `Kind::Messages` the `claude` adapter, and
/// so on).
pub trait Dialect: Send + Sync {
    /// Parses a client request body written in this dialect.
    fn parse_request(&self, body: &[u8]) -> Result<NormalizedRequest, DialectError>;

    /// Builds the upstream HTTP request for `channel`/`key`, applying
    /// `channel.model_mapping`, auth headers, custom headers, and any
    /// dialect-specific feature flags. The request `body` supplied to
    /// failover is never mutated in place — flag handling clones.
    fn build_upstream_request(
        &self,
        norm: &NormalizedRequest,
        channel: &UpstreamConfig,
        base_url: &str,
        key: &str,
        mapped_model: &str,
    ) -> Result<UpstreamRequest, DialectError>;

    /// Parses a non-streaming upstream response already known to be 2xx.
    fn parse_unary_response(&self, body: &[u8]) -> Result<NormalizedResponse, DialectError>;

    /// Renders a normalized response in this (inbound) dialect.
    fn render_unary_response(&self, norm: &NormalizedResponse) -> Vec<u8>;

    /// Parses one upstream SSE frame into a content delta, if any.
    /// Non-content frames (e.g. `ping`) return `None`.
    fn parse_stream_event(&self, event: &SseEvent, state: &mut StreamState) -> Option<NormalizedStreamDelta>;

    /// Renders a normalized delta as an outbound SSE frame in this
    /// (inbound) dialect.
    fn render_stream_event(&self, delta: &NormalizedStreamDelta, state: &mut StreamState) -> String;

    /// The final `data: [DONE]` frame this dialect expects on stream
    /// close, if any — emitted exactly once by the caller.
    fn render_done(&self) -> Option<&'static str> {
        None
    }

    /// Renders a synthesized error envelope (e.g. all-channels-failed
    /// 503) in this dialect.
    fn render_error(&self, status: u16, message: &str) -> Vec<u8>;
}

pub fn adapter_for(service_type: ServiceType) -> &'static dyn Dialect {
    match service_type {
        ServiceType::Claude => &claude::ClaudeDialect,
        ServiceType::OpenAi => &openai::OpenAiDialect,
        ServiceType::Gemini => &gemini::GeminiDialect,
        ServiceType::Responses => &responses::ResponsesDialect,
    }
}

/// Maps an inbound `Kind` onto the adapter that speaks its wire format.
pub fn adapter_for_kind(kind: llmrelay_common::Kind) -> &'static dyn Dialect {
    match kind {
        llmrelay_common::Kind::Messages => &claude::ClaudeDialect,
        llmrelay_common::Kind::Chat => &openai::OpenAiDialect,
        llmrelay_common::Kind::Gemini => &gemini::GeminiDialect,
        llmrelay_common::Kind::Responses => &responses::ResponsesDialect,
    }
}

pub(crate) fn auth_headers(service_type: ServiceType, key: &str) -> Vec<(String, String)> {
    match service_type {
        ServiceType::Claude => vec![
            ("x-api-key".to_string(), key.to_string()),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
        ],
        ServiceType::Gemini => vec![("x-goog-api-key".to_string(), key.to_string())],
        ServiceType::OpenAi | ServiceType::Responses => {
            vec![("authorization".to_string(), format!("Bearer {key}"))]
        }
    }
}

pub(crate) fn apply_custom_headers(mut req: UpstreamRequest, channel: &UpstreamConfig) -> UpstreamRequest {
    if let Some(custom) = &channel.custom_headers {
        for (name, value) in custom {
            req.headers.push((name.clone(), value.clone()));
        }
    }
    req
}
