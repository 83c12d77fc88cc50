use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use futures_util::Stream;
use llmrelay_common::Kind;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::authenticate;
use crate::cancel::CancelSignal;
use crate::error::ProxyError;
use crate::failover::{self, ChannelBody};
use crate::runtime::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/responses", post(responses_handler))
        .route("/v1beta/models/{model_action}", post(gemini_handler))
        .route("/v1/chat/completions", post(chat_handler))
        .with_state(state)
}

async fn messages_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    handle(state, Kind::Messages, headers, body).await
}

async fn chat_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    handle(state, Kind::Chat, headers, body).await
}

async fn responses_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    handle(state, Kind::Responses, headers, body).await
}

/// `model_action` is `{model}:generateContent` or `{model}:streamGenerateContent`;
/// the distinction is carried in the body's own `stream` flag by the
/// Gemini dialect adapter, so the path segment itself only needs
/// recognizing, not parsing further.
async fn gemini_handler(
    State(state): State<Arc<AppState>>,
    Path(_model_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, Kind::Gemini, headers, body).await
}

async fn handle(state: Arc<AppState>, kind: Kind, headers: HeaderMap, body: Bytes) -> Response {
    let trace_id = Uuid::new_v4().to_string();

    if let Err(err) = authenticate(&headers, &state.global.load().proxy_key) {
        return error_response(err, &trace_id);
    }

    let user_id = extract_user_id(&body);
    let started_at = Instant::now();
    let cancel = CancelSignal::new();

    info!(event = "downstream_received", trace_id = %trace_id, kind = %kind, bytes = body.len());

    let resp = failover::dispatch(&state, kind, &body, &user_id, &cancel).await;

    let is_stream = matches!(resp.body, ChannelBody::Stream(_));
    info!(
        event = "downstream_responded",
        trace_id = %trace_id,
        kind = %kind,
        status = resp.status,
        elapsed_ms = started_at.elapsed().as_millis(),
        is_stream
    );
    if resp.status >= 500 {
        warn!(event = "channel_exhausted", trace_id = %trace_id, kind = %kind, status = resp.status);
    }

    channel_response(resp, &trace_id, cancel)
}

fn channel_response(resp: failover::ChannelResponse, trace_id: &str, cancel: CancelSignal) -> Response {
    let mut builder = Response::builder().status(resp.status);
    if let Some(headers) = builder.headers_mut() {
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            headers.insert("x-llmrelay-request-id", value);
        }
    }

    match resp.body {
        ChannelBody::Bytes(bytes) => builder
            .header("content-type", "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        ChannelBody::Stream(rx) => builder
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .header("connection", "keep-alive")
            .header("x-accel-buffering", "no")
            .body(Body::from_stream(CancelOnDisconnect { inner: ReceiverStream::new(rx), cancel }))
            .unwrap_or_else(|_| Response::new(Body::empty())),
    }
}

/// The body stream axum hands to hyper; dropped as soon as the client
/// disconnects mid-stream, whether or not the pump task has anything
/// left to send. Firing `cancel` from `Drop` rather than relying on the
/// pump's next `tx.send` means the upstream read loop in
/// `upstream_client` notices the disconnect immediately instead of
/// lingering up to its idle timeout.
struct CancelOnDisconnect {
    inner: ReceiverStream<Bytes>,
    cancel: CancelSignal,
}

impl Stream for CancelOnDisconnect {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx).map(|item| item.map(Ok))
    }
}

impl Drop for CancelOnDisconnect {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn error_response(err: ProxyError, trace_id: &str) -> Response {
    let body = serde_json::json!({ "error": { "message": err.message() } }).to_string();
    let mut builder = Response::builder().status(err.status()).header("content-type", "application/json");
    if let Some(headers) = builder.headers_mut() {
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            headers.insert("x-llmrelay-request-id", value);
        }
    }
    builder.body(Body::from(body)).unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Best-effort conversation/user token extraction, tried across the
/// field names the four dialects use for it: Claude/Responses
/// `metadata.user_id`, OpenAI Chat `user`, or a bare `conversation_id`/
/// `session_id`. Absent in all of them, affinity is simply skipped for
/// this request (empty id short-circuits both affinity methods).
fn extract_user_id(body: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return String::new();
    };
    let candidates = [
        value.pointer("/metadata/user_id"),
        value.pointer("/user"),
        value.pointer("/conversation_id"),
        value.pointer("/session_id"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_claude_style_metadata_user_id() {
        let body = br#"{"metadata":{"user_id":"u-1"}}"#;
        assert_eq!(extract_user_id(body), "u-1");
    }

    #[test]
    fn extracts_openai_style_user_field() {
        let body = br#"{"user":"u-2"}"#;
        assert_eq!(extract_user_id(body), "u-2");
    }

    #[test]
    fn missing_token_yields_empty_string() {
        assert_eq!(extract_user_id(br#"{"model":"x"}"#), "");
    }

    #[test]
    fn malformed_json_yields_empty_string() {
        assert_eq!(extract_user_id(b"not json"), "");
    }
}
