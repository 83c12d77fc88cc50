use bytes::Bytes;
use llmrelay_config::UpstreamConfig;
use llmrelay_metrics::TokenUsage;
use serde_json::{json, Value};

use crate::error::DialectError;
use crate::normalized::{NormalizedMessage, NormalizedRequest, NormalizedResponse, NormalizedStreamDelta, StreamState};
use crate::request::{join_url, UpstreamRequest};
use crate::sse::SseEvent;
use crate::{apply_custom_headers, auth_headers, Dialect};

/// The OpenAI Responses API: `input` instead of `messages`, `output`
/// instead of `choices`, `response.*` typed SSE events instead of
/// `chat.completion.chunk` deltas.
pub struct ResponsesDialect;

impl Dialect for ResponsesDialect {
    fn parse_request(&self, body: &[u8]) -> Result<NormalizedRequest, DialectError> {
        let raw: Value = serde_json::from_slice(body).map_err(|e| DialectError::InvalidRequest(e.to_string()))?;
        let model = raw
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| DialectError::InvalidRequest("missing model".to_string()))?
            .to_string();
        let stream = raw.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let messages = match raw.get("input") {
            Some(Value::String(s)) => vec![NormalizedMessage { role: "user".to_string(), content: s.clone() }],
            Some(Value::Array(items)) => items
                .iter()
                .map(|m| NormalizedMessage {
                    role: m.get("role").and_then(Value::as_str).unwrap_or("user").to_string(),
                    content: input_item_text(m),
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(NormalizedRequest {
            model,
            stream,
            messages,
            max_tokens: raw.get("max_output_tokens").and_then(Value::as_u64),
            raw,
        })
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
            if !obj.contains_key("input") {
                obj.insert(
                    "input".to_string(),
                    json!(norm
                        .messages
                        .iter()
                        .map(|m| json!({"role": m.role, "content": [{"type": "input_text", "text": m.content}]}))
                        .collect::<Vec<_>>()),
                );
            }
        }
        let url = join_url(base_url, "/responses");
        let bytes = serde_json::to_vec(&body).map_err(|e| DialectError::InvalidRequest(e.to_string()))?;
        let mut req = UpstreamRequest::post(url, Bytes::from(bytes));
        for (name, value) in auth_headers(llmrelay_config::ServiceType::Responses, key) {
            req = req.with_header(&name, value);
        }
        Ok(apply_custom_headers(req, channel))
    }

    fn parse_unary_response(&self, body: &[u8]) -> Result<NormalizedResponse, DialectError> {
        let raw: Value = serde_json::from_slice(body).map_err(|e| DialectError::InvalidResponseBody(e.to_string()))?;
        let Some(output) = raw.get("output").and_then(Value::as_array) else {
            return Err(DialectError::EmptyResponseEnvelope);
        };
        let content = output
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
            .flat_map(|item| item.get("content").and_then(Value::as_array).cloned().unwrap_or_default())
            .filter_map(|c| c.get("text").and_then(Value::as_str).map(str::to_string))
            .collect::<Vec<_>>()
            .join("");
        Ok(NormalizedResponse {
            id: raw.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            model: raw.get("model").and_then(Value::as_str).unwrap_or_default().to_string(),
            role: "assistant".to_string(),
            content,
            finish_reason: raw.get("status").and_then(Value::as_str).map(str::to_string),
            usage: extract_usage(&raw),
        })
    }

    fn render_unary_response(&self, norm: &NormalizedResponse) -> Vec<u8> {
        let body = json!({
            "id": norm.id,
            "object": "response",
            "model": norm.model,
            "status": norm.finish_reason.clone().unwrap_or_else(|| "completed".to_string()),
            "output": [{
                "type": "message",
                "role": norm.role,
                "content": [{"type": "output_text", "text": norm.content}],
            }],
            "usage": {
                "input_tokens": norm.usage.input_tokens,
                "output_tokens": norm.usage.output_tokens,
            },
        });
        serde_json::to_vec(&body).unwrap_or_default()
    }

    fn parse_stream_event(&self, event: &SseEvent, _state: &mut StreamState) -> Option<NormalizedStreamDelta> {
        let raw: Value = serde_json::from_str(&event.data).ok()?;
        match raw.get("type").and_then(Value::as_str)? {
            "response.output_text.delta" => {
                let text = raw.get("delta").and_then(Value::as_str)?.to_string();
                Some(NormalizedStreamDelta { content_delta: text, ..Default::default() })
            }
            "response.completed" => {
                let usage = raw.pointer("/response/usage").map(extract_usage);
                Some(NormalizedStreamDelta {
                    finish_reason: Some("completed".to_string()),
                    usage,
                    ..Default::default()
                })
            }
            _ => None,
        }
    }

    fn render_stream_event(&self, delta: &NormalizedStreamDelta, state: &mut StreamState) -> String {
        if let Some(reason) = &delta.finish_reason {
            return crate::sse::encode_sse(
                Some("response.completed"),
                &json!({"type": "response.completed", "response": {"status": reason, "id": state.message_id}}).to_string(),
            );
        }
        crate::sse::encode_sse(
            Some("response.output_text.delta"),
            &json!({"type": "response.output_text.delta", "delta": delta.content_delta}).to_string(),
        )
    }

    fn render_done(&self) -> Option<&'static str> {
        Some(crate::sse::DONE_FRAME)
    }

    fn render_error(&self, _status: u16, message: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({"error": {"message": message, "type": "api_error"}})).unwrap_or_default()
    }
}

fn input_item_text(item: &Value) -> String {
    match item.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn extract_usage(raw: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: raw.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: raw.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        cache_creation_tokens: 0,
        cache_read_tokens: raw
            .pointer("/input_tokens_details/cached_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        estimated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_input_becomes_a_single_user_message() {
        let norm = ResponsesDialect.parse_request(br#"{"model":"gpt-4o","input":"hi"}"#).unwrap();
        assert_eq!(norm.messages.len(), 1);
        assert_eq!(norm.messages[0].content, "hi");
    }

    #[test]
    fn missing_output_is_an_empty_envelope() {
        let err = ResponsesDialect.parse_unary_response(br#"{"id":"x"}"#).unwrap_err();
        assert!(matches!(err, DialectError::EmptyResponseEnvelope));
    }
}
