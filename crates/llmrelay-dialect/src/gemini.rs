use bytes::Bytes;
use llmrelay_config::UpstreamConfig;
use llmrelay_metrics::TokenUsage;
use serde_json::{json, Value};

use crate::error::DialectError;
use crate::normalized::{NormalizedMessage, NormalizedRequest, NormalizedResponse, NormalizedStreamDelta, StreamState};
use crate::request::{join_url, UpstreamRequest};
use crate::sse::SseEvent;
use crate::{apply_custom_headers, auth_headers, Dialect};

pub struct GeminiDialect;

impl Dialect for GeminiDialect {
    /// `model` is not part of Gemini's request body (it's a path
    /// segment: `/v1beta/models/{model}:generateContent`) — callers on
    /// the Gemini inbound surface overwrite `NormalizedRequest::model`
    /// from the path after parsing.
    fn parse_request(&self, body: &[u8]) -> Result<NormalizedRequest, DialectError> {
        let raw: Value = serde_json::from_slice(body).map_err(|e| DialectError::InvalidRequest(e.to_string()))?;
        let messages = raw
            .get("contents")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().map(gemini_content_to_normalized).collect())
            .unwrap_or_default();
        Ok(NormalizedRequest {
            model: String::new(),
            stream: false,
            messages,
            max_tokens: raw.pointer("/generationConfig/maxOutputTokens").and_then(Value::as_u64),
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
            if !obj.contains_key("contents") {
                obj.insert(
                    "contents".to_string(),
                    json!(norm.messages.iter().map(normalized_to_gemini_content).collect::<Vec<_>>()),
                );
            }
        }
        apply_thought_signature_flags(&mut body, channel);

        let action = if norm.stream { "streamGenerateContent" } else { "generateContent" };
        let url = join_url(base_url, &format!("/models/{mapped_model}:{action}"));
        let bytes = serde_json::to_vec(&body).map_err(|e| DialectError::InvalidRequest(e.to_string()))?;
        let mut req = UpstreamRequest::post(url, Bytes::from(bytes));
        for (name, value) in auth_headers(llmrelay_config::ServiceType::Gemini, key) {
            req = req.with_header(&name, value);
        }
        Ok(apply_custom_headers(req, channel))
    }

    fn parse_unary_response(&self, body: &[u8]) -> Result<NormalizedResponse, DialectError> {
        let raw: Value = serde_json::from_slice(body).map_err(|e| DialectError::InvalidResponseBody(e.to_string()))?;
        let Some(candidate) = raw.pointer("/candidates/0") else {
            return Err(DialectError::EmptyResponseEnvelope);
        };
        let content = gemini_parts_text(candidate.pointer("/content/parts"));
        Ok(NormalizedResponse {
            id: String::new(),
            model: raw.get("modelVersion").and_then(Value::as_str).unwrap_or_default().to_string(),
            role: "model".to_string(),
            content,
            finish_reason: candidate.get("finishReason").and_then(Value::as_str).map(str::to_string),
            usage: extract_usage(&raw),
        })
    }

    fn render_unary_response(&self, norm: &NormalizedResponse) -> Vec<u8> {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": norm.content}]},
                "finishReason": norm.finish_reason,
            }],
            "modelVersion": norm.model,
            "usageMetadata": {
                "promptTokenCount": norm.usage.input_tokens,
                "candidatesTokenCount": norm.usage.output_tokens,
                "cachedContentTokenCount": norm.usage.cache_read_tokens,
            },
        });
        serde_json::to_vec(&body).unwrap_or_default()
    }

    fn parse_stream_event(&self, event: &SseEvent, _state: &mut StreamState) -> Option<NormalizedStreamDelta> {
        let raw: Value = serde_json::from_str(&event.data).ok()?;
        let candidate = raw.pointer("/candidates/0")?;
        let content_delta = gemini_parts_text(candidate.pointer("/content/parts"));
        let finish_reason = candidate.get("finishReason").and_then(Value::as_str).map(str::to_string);
        let usage = raw.get("usageMetadata").map(extract_usage);
        Some(NormalizedStreamDelta { content_delta, finish_reason, usage })
    }

    fn render_stream_event(&self, delta: &NormalizedStreamDelta, _state: &mut StreamState) -> String {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": delta.content_delta}]},
                "finishReason": delta.finish_reason,
            }],
        });
        crate::sse::encode_sse(None, &body.to_string())
    }

    fn render_error(&self, status: u16, message: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({"error": {"code": status, "message": message, "status": "INTERNAL"}})).unwrap_or_default()
    }
}

fn gemini_content_to_normalized(value: &Value) -> NormalizedMessage {
    NormalizedMessage {
        role: value.get("role").and_then(Value::as_str).unwrap_or("user").to_string(),
        content: gemini_parts_text(value.get("parts")),
    }
}

fn normalized_to_gemini_content(m: &NormalizedMessage) -> Value {
    let role = if m.role == "assistant" { "model" } else { m.role.as_str() };
    json!({"role": role, "parts": [{"text": m.content}]})
}

fn gemini_parts_text(parts: Option<&Value>) -> String {
    parts
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn extract_usage(raw: &Value) -> TokenUsage {
    let usage = raw.get("usageMetadata").unwrap_or(raw);
    TokenUsage {
        input_tokens: usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0),
        cache_creation_tokens: 0,
        cache_read_tokens: usage.get("cachedContentTokenCount").and_then(Value::as_u64).unwrap_or(0),
        estimated: false,
    }
}

/// `strip_thought_signature` wins when both flags are set. Mutates the
/// already-cloned `body`, never the caller's original request — the
/// clone happened in `build_upstream_request` before this call.
fn apply_thought_signature_flags(body: &mut Value, channel: &UpstreamConfig) {
    if !channel.strip_thought_signature && !channel.inject_dummy_thought_signature {
        return;
    }
    let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) else {
        return;
    };
    for content in contents {
        let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
            continue;
        };
        for part in parts {
            let Some(obj) = part.as_object_mut() else { continue };
            if channel.strip_thought_signature {
                obj.remove("thoughtSignature");
            } else if channel.inject_dummy_thought_signature
                && obj.contains_key("functionCall")
                && !obj.contains_key("thoughtSignature")
            {
                obj.insert("thoughtSignature".to_string(), json!(""));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmrelay_config::{ChannelStatus, ServiceType};

    fn channel() -> UpstreamConfig {
        UpstreamConfig {
            name: "g".to_string(),
            service_type: ServiceType::Gemini,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            base_urls: vec![],
            api_keys: vec!["k".to_string()],
            historical_api_keys: vec![],
            model_mapping: Default::default(),
            priority: 0,
            status: ChannelStatus::Active,
            promotion_until: None,
            low_quality: false,
            supported_models: None,
            insecure_skip_verify: false,
            proxy: None,
            custom_headers: None,
            inject_dummy_thought_signature: false,
            strip_thought_signature: true,
        }
    }

    #[test]
    fn strip_wins_over_inject_when_both_set() {
        let mut ch = channel();
        ch.inject_dummy_thought_signature = true;
        let mut body = json!({"contents": [{"role": "model", "parts": [{"functionCall": {}, "thoughtSignature": "abc"}]}]});
        apply_thought_signature_flags(&mut body, &ch);
        assert!(body["contents"][0]["parts"][0].get("thoughtSignature").is_none());
    }

    #[test]
    fn build_request_uses_path_style_url_with_model_and_action() {
        let norm = NormalizedRequest {
            model: String::new(),
            stream: true,
            messages: vec![],
            max_tokens: None,
            raw: json!({}),
        };
        let req = GeminiDialect.build_upstream_request(&norm, &channel(), "https://generativelanguage.googleapis.com", "k", "gemini-1.5-pro").unwrap();
        assert!(req.url.ends_with("/models/gemini-1.5-pro:streamGenerateContent"));
    }
}
