use bytes::Bytes;
use llmrelay_config::UpstreamConfig;
use llmrelay_metrics::TokenUsage;
use serde_json::{json, Value};

use crate::error::DialectError;
use crate::normalized::{NormalizedMessage, NormalizedRequest, NormalizedResponse, NormalizedStreamDelta, StreamState};
use crate::request::{join_url, UpstreamRequest};
use crate::sse::SseEvent;
use crate::{apply_custom_headers, auth_headers, Dialect};

pub struct OpenAiDialect;

impl Dialect for OpenAiDialect {
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
            .map(|arr| {
                arr.iter()
                    .map(|m| NormalizedMessage {
                        role: m.get("role").and_then(Value::as_str).unwrap_or("user").to_string(),
                        content: m.get("content").and_then(Value::as_str).unwrap_or_default().to_string(),
                    })
                    .collect()
            })
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
                    json!(norm.messages.iter().map(|m| json!({"role": m.role, "content": m.content})).collect::<Vec<_>>()),
                );
            }
        }
        let url = join_url(base_url, "/chat/completions");
        let bytes = serde_json::to_vec(&body).map_err(|e| DialectError::InvalidRequest(e.to_string()))?;
        let mut req = UpstreamRequest::post(url, Bytes::from(bytes));
        for (name, value) in auth_headers(llmrelay_config::ServiceType::OpenAi, key) {
            req = req.with_header(&name, value);
        }
        Ok(apply_custom_headers(req, channel))
    }

    fn parse_unary_response(&self, body: &[u8]) -> Result<NormalizedResponse, DialectError> {
        let raw: Value = serde_json::from_slice(body).map_err(|e| DialectError::InvalidResponseBody(e.to_string()))?;
        let choice = raw.pointer("/choices/0");
        let Some(choice) = choice else {
            return Err(DialectError::EmptyResponseEnvelope);
        };
        let content = choice.pointer("/message/content").and_then(Value::as_str).unwrap_or_default().to_string();
        Ok(NormalizedResponse {
            id: raw.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            model: raw.get("model").and_then(Value::as_str).unwrap_or_default().to_string(),
            role: "assistant".to_string(),
            content,
            finish_reason: choice.get("finish_reason").and_then(Value::as_str).map(str::to_string),
            usage: extract_usage(&raw),
        })
    }

    fn render_unary_response(&self, norm: &NormalizedResponse) -> Vec<u8> {
        let body = json!({
            "id": norm.id,
            "object": "chat.completion",
            "model": norm.model,
            "choices": [{
                "index": 0,
                "message": {"role": norm.role, "content": norm.content},
                "finish_reason": norm.finish_reason,
            }],
            "usage": {
                "prompt_tokens": norm.usage.input_tokens,
                "completion_tokens": norm.usage.output_tokens,
                "total_tokens": norm.usage.input_tokens + norm.usage.output_tokens,
            },
        });
        serde_json::to_vec(&body).unwrap_or_default()
    }

    fn parse_stream_event(&self, event: &SseEvent, _state: &mut StreamState) -> Option<NormalizedStreamDelta> {
        if event.data.trim() == "[DONE]" {
            return None;
        }
        let raw: Value = serde_json::from_str(&event.data).ok()?;
        let choice = raw.pointer("/choices/0")?;
        let content_delta = choice.pointer("/delta/content").and_then(Value::as_str).unwrap_or_default().to_string();
        let finish_reason = choice.get("finish_reason").and_then(Value::as_str).map(str::to_string);
        let usage = raw.get("usage").map(extract_usage);
        Some(NormalizedStreamDelta { content_delta, finish_reason, usage })
    }

    fn render_stream_event(&self, delta: &NormalizedStreamDelta, state: &mut StreamState) -> String {
        state.chunk_index += 1;
        let body = json!({
            "id": state.message_id,
            "object": "chat.completion.chunk",
            "model": state.model,
            "choices": [{
                "index": 0,
                "delta": {"content": delta.content_delta},
                "finish_reason": delta.finish_reason,
            }],
        });
        crate::sse::encode_sse(None, &body.to_string())
    }

    fn render_done(&self) -> Option<&'static str> {
        Some(crate::sse::DONE_FRAME)
    }

    fn render_error(&self, status: u16, message: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({"error": {"message": message, "type": "api_error", "code": status}})).unwrap_or_default()
    }
}

fn extract_usage(raw: &Value) -> TokenUsage {
    let usage = raw.get("usage").cloned().unwrap_or_default();
    TokenUsage {
        input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
        cache_creation_tokens: 0,
        cache_read_tokens: usage
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        estimated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_survives_model_stream_and_message_count() {
        let body = br#"{"model":"gpt-4o","stream":false,"messages":[{"role":"user","content":"hi"},{"role":"assistant","content":"hey"}]}"#;
        let norm = OpenAiDialect.parse_request(body).unwrap();
        assert_eq!(norm.model, "gpt-4o");
        assert!(!norm.stream);
        assert_eq!(norm.messages.len(), 2);
    }

    #[test]
    fn empty_choices_is_treated_as_empty_envelope() {
        let err = OpenAiDialect.parse_unary_response(br#"{"id":"x","choices":[]}"#).unwrap_err();
        assert!(matches!(err, DialectError::EmptyResponseEnvelope));
    }
}
