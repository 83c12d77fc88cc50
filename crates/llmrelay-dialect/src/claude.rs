use bytes::Bytes;
use llmrelay_config::UpstreamConfig;
use llmrelay_metrics::TokenUsage;
use serde_json::{json, Value};

use crate::error::DialectError;
use crate::normalized::{NormalizedMessage, NormalizedRequest, NormalizedResponse, NormalizedStreamDelta, StreamState};
use crate::request::{join_url, UpstreamRequest};
use crate::sse::SseEvent;
use crate::{apply_custom_headers, auth_headers, Dialect};

pub struct ClaudeDialect;

impl Dialect for ClaudeDialect {
    fn parse_request(&self, body: &[u8]) -> Result<NormalizedRequest, DialectError> {
        let raw: Value = serde_json::from_slice(body).map_err(|e| DialectError::InvalidRequest(e.to_string()))?;
        let model = raw
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| DialectError::InvalidRequest("missing model".to_string()))?
            .to_string();
        let stream = raw.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let max_tokens = raw.get("max_tokens").and_then(Value::as_u64);
        let messages = raw
            .get("messages")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().map(claude_message_to_normalized).collect())
            .unwrap_or_default();
        Ok(NormalizedRequest { model, stream, messages, max_tokens, raw })
    }

    fn build_upstream_request(
        &self,
        norm: &NormalizedRequest,
        channel: &UpstreamConfig,
        base_url: &str,
        key: &str,
        mapped_model: &str,
    ) -> Result<UpstreamRequest, DialectError> {
        let mut body = norm.raw.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), json!(mapped_model));
            if !obj.contains_key("messages") {
                obj.insert(
                    "messages".to_string(),
                    json!(norm.messages.iter().map(message_json).collect::<Vec<_>>()),
                );
            }
            if !obj.contains_key("max_tokens") {
                obj.insert("max_tokens".to_string(), json!(norm.max_tokens.unwrap_or(4096)));
            }
        }
        let url = join_url(base_url, "/messages");
        let bytes = serde_json::to_vec(&body).map_err(|e| DialectError::InvalidRequest(e.to_string()))?;
        let mut req = UpstreamRequest::post(url, Bytes::from(bytes));
        for (name, value) in auth_headers(llmrelay_config::ServiceType::Claude, key) {
            req = req.with_header(&name, value);
        }
        Ok(apply_custom_headers(req, channel))
    }

    fn parse_unary_response(&self, body: &[u8]) -> Result<NormalizedResponse, DialectError> {
        let raw: Value = serde_json::from_slice(body).map_err(|e| DialectError::InvalidResponseBody(e.to_string()))?;
        let content = raw
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if content.is_empty() && raw.get("content").is_none() {
            return Err(DialectError::EmptyResponseEnvelope);
        }
        let usage = extract_usage(&raw);
        Ok(NormalizedResponse {
            id: raw.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            model: raw.get("model").and_then(Value::as_str).unwrap_or_default().to_string(),
            role: "assistant".to_string(),
            content,
            finish_reason: raw.get("stop_reason").and_then(Value::as_str).map(str::to_string),
            usage,
        })
    }

    fn render_unary_response(&self, norm: &NormalizedResponse) -> Vec<u8> {
        let body = json!({
            "id": norm.id,
            "type": "message",
            "role": norm.role,
            "model": norm.model,
            "content": [{"type": "text", "text": norm.content}],
            "stop_reason": norm.finish_reason,
            "usage": {
                "input_tokens": norm.usage.input_tokens,
                "output_tokens": norm.usage.output_tokens,
                "cache_creation_input_tokens": norm.usage.cache_creation_tokens,
                "cache_read_input_tokens": norm.usage.cache_read_tokens,
            },
        });
        serde_json::to_vec(&body).unwrap_or_default()
    }

    fn parse_stream_event(&self, event: &SseEvent, state: &mut StreamState) -> Option<NormalizedStreamDelta> {
        let raw: Value = serde_json::from_str(&event.data).ok()?;
        match raw.get("type").and_then(Value::as_str)? {
            "message_start" => {
                state.message_id = raw
                    .pointer("/message/id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                state.model = raw
                    .pointer("/message/model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                None
            }
            "content_block_delta" => {
                let text = raw.pointer("/delta/text").and_then(Value::as_str)?.to_string();
                Some(NormalizedStreamDelta { content_delta: text, ..Default::default() })
            }
            "message_delta" => {
                let usage = raw.get("usage").map(extract_usage);
                let finish_reason = raw.pointer("/delta/stop_reason").and_then(Value::as_str).map(str::to_string);
                Some(NormalizedStreamDelta { finish_reason, usage, ..Default::default() })
            }
            _ => None,
        }
    }

    fn render_stream_event(&self, delta: &NormalizedStreamDelta, state: &mut StreamState) -> String {
        if !state.started {
            state.started = true;
            let start = crate::sse::encode_sse(
                Some("message_start"),
                &json!({
                    "type": "message_start",
                    "message": {"id": state.message_id, "type": "message", "role": "assistant", "model": state.model, "content": [], "usage": {"input_tokens": 0, "output_tokens": 0}}
                })
                .to_string(),
            );
            let block_start = crate::sse::encode_sse(
                Some("content_block_start"),
                &json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}).to_string(),
            );
            let mut out = start;
            out.push_str(&block_start);
            out.push_str(&crate::sse::encode_sse(
                Some("content_block_delta"),
                &json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": delta.content_delta}}).to_string(),
            ));
            return out;
        }
        if let Some(reason) = &delta.finish_reason {
            let stop = crate::sse::encode_sse(
                Some("message_delta"),
                &json!({"type": "message_delta", "delta": {"stop_reason": reason}}).to_string(),
            );
            let mut out = crate::sse::encode_sse(
                Some("content_block_stop"),
                &json!({"type": "content_block_stop", "index": 0}).to_string(),
            );
            out.push_str(&stop);
            out.push_str(&crate::sse::encode_sse(Some("message_stop"), &json!({"type": "message_stop"}).to_string()));
            return out;
        }
        crate::sse::encode_sse(
            Some("content_block_delta"),
            &json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": delta.content_delta}}).to_string(),
        )
    }

    fn render_error(&self, _status: u16, message: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({"type": "error", "error": {"type": "api_error", "message": message}})).unwrap_or_default()
    }
}

fn claude_message_to_normalized(value: &Value) -> NormalizedMessage {
    let role = value.get("role").and_then(Value::as_str).unwrap_or("user").to_string();
    let content = match value.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    };
    NormalizedMessage { role, content }
}

fn message_json(m: &NormalizedMessage) -> Value {
    json!({"role": m.role, "content": m.content})
}

/// Reads `cache_creation_input_tokens`/`cache_read_input_tokens` and
/// `input_tokens`/`output_tokens`. If `cache_creation_input_tokens` is
/// absent or zero, falls back to the sum of the dialect-specific 5m/1h
/// ephemeral cache fields (Claude's extended cache TTL beta fields).
fn extract_usage(raw: &Value) -> TokenUsage {
    let usage = raw.get("usage").unwrap_or(raw);
    let mut cache_creation = usage.get("cache_creation_input_tokens").and_then(Value::as_u64).unwrap_or(0);
    if cache_creation == 0 {
        let five_min = usage.pointer("/cache_creation/ephemeral_5m_input_tokens").and_then(Value::as_u64).unwrap_or(0);
        let one_hour = usage.pointer("/cache_creation/ephemeral_1h_input_tokens").and_then(Value::as_u64).unwrap_or(0);
        if five_min + one_hour > 0 {
            cache_creation = five_min + one_hour;
        }
    }
    TokenUsage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        cache_creation_tokens: cache_creation,
        cache_read_tokens: usage.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0),
        estimated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_survives_model_stream_and_message_count() {
        let body = br#"{"model":"claude-3-5-sonnet","stream":true,"messages":[{"role":"user","content":"hi"}]}"#;
        let norm = ClaudeDialect.parse_request(body).unwrap();
        assert_eq!(norm.model, "claude-3-5-sonnet");
        assert!(norm.stream);
        assert_eq!(norm.messages.len(), 1);
    }

    #[test]
    fn cache_creation_falls_back_to_5m_plus_1h_sum() {
        let raw = json!({"usage": {"input_tokens": 1, "output_tokens": 2, "cache_creation_input_tokens": 0, "cache_creation": {"ephemeral_5m_input_tokens": 10, "ephemeral_1h_input_tokens": 5}}});
        let usage = extract_usage(&raw);
        assert_eq!(usage.cache_creation_tokens, 15);
    }
}
