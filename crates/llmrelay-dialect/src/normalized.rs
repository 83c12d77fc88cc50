use llmrelay_metrics::TokenUsage;
use serde_json::Value;

/// A single chat turn, dialect-agnostic.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub role: String,
    pub content: String,
}

/// The field-level common shape every inbound request is parsed into
/// before being re-rendered in the upstream channel's dialect. This is
/// *not* a full-fidelity AST of any one wire format — only enough detail
/// to satisfy the round-trip invariants (model, stream flag, message
/// count survive a one-way translation).
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub model: String,
    pub stream: bool,
    pub messages: Vec<NormalizedMessage>,
    pub max_tokens: Option<u64>,
    /// The original parsed body, kept so a same-dialect passthrough can
    /// forward it close to verbatim instead of lossily round-tripping
    /// through the normalized fields.
    pub raw: Value,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedResponse {
    pub id: String,
    pub model: String,
    pub role: String,
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedStreamDelta {
    pub content_delta: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Per-stream state an adapter may need across frames (e.g. an assigned
/// message id for the inbound side, or a running content-block index).
#[derive(Debug, Default)]
pub struct StreamState {
    pub message_id: String,
    pub model: String,
    pub started: bool,
    pub chunk_index: u64,
}
