//! Integration tests driving `failover::dispatch` against real local HTTP
//! servers, mirroring the mock-server pattern used elsewhere in the
//! workspace for transport-level tests (spawn an axum app on an
//! ephemeral port, point the engine at it, assert on both the client-
//! visible response and the metrics it left behind).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use llmrelay_common::{GlobalConfig, Kind};
use llmrelay_config::{ChannelStatus, ServiceType, UpstreamConfig};
use llmrelay_core::cancel::CancelSignal;
use llmrelay_core::failover::{self, ChannelBody};
use llmrelay_core::runtime::{AppState, InitialChannels};
use serde_json::{json, Value};
use time::OffsetDateTime;

fn global() -> GlobalConfig {
    GlobalConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        proxy_key: "secret".to_string(),
        proxy: None,
        fuzzy_mode_enabled: false,
        strip_billing_header: false,
    }
}

fn channel(name: &str, base_url: &str, keys: &[&str]) -> UpstreamConfig {
    UpstreamConfig {
        name: name.to_string(),
        service_type: ServiceType::Claude,
        base_url: base_url.to_string(),
        base_urls: vec![],
        api_keys: keys.iter().map(|k| k.to_string()).collect(),
        historical_api_keys: vec![],
        model_mapping: HashMap::new(),
        priority: 0,
        status: ChannelStatus::Active,
        promotion_until: None,
        low_quality: false,
        supported_models: None,
        insecure_skip_verify: false,
        proxy: None,
        custom_headers: None,
        inject_dummy_thought_signature: false,
        strip_thought_signature: false,
    }
}

async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn messages_body() -> Bytes {
    Bytes::from(
        json!({
            "model": "claude-3-5-sonnet",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false,
        })
        .to_string(),
    )
}

fn claude_message(text: &str) -> Value {
    json!({
        "id": "msg_1",
        "model": "claude-3-5-sonnet",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 1, "output_tokens": 1},
    })
}

/// Scenario 1: single channel, single key, 200 upstream.
#[tokio::test]
async fn single_channel_success() {
    async fn ok() -> Json<Value> {
        Json(claude_message("hello"))
    }
    let base_url = spawn_server(Router::new().route("/v1/messages", post(ok))).await;

    let state = AppState::new(
        global(),
        InitialChannels { messages: vec![channel("c0", &base_url, &["k1"])], ..Default::default() },
    );
    let cancel = CancelSignal::new();
    let resp = failover::dispatch(&state, Kind::Messages, &messages_body(), "", &cancel).await;

    assert_eq!(resp.status, 200);
    let ChannelBody::Bytes(body) = resp.body else { panic!("expected a buffered body") };
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["content"][0]["text"], "hello");

    let metrics = &state.runtime(Kind::Messages).metrics;
    let stats = metrics.window_stats(&base_url, "k1", Duration::from_secs(3600));
    assert_eq!(stats.request_count, 1);
    assert_eq!(stats.success_count, 1);
    assert_eq!(stats.fail_count, 0);
}

/// Scenario 2: K1 returns 401, K2 returns 200; client only ever sees 200,
/// and a second immediate request prefers K2 without re-probing K1.
#[tokio::test]
async fn key_failover_prefers_surviving_key_on_retry() {
    #[derive(Clone, Default)]
    struct Counts(Arc<AtomicUsize>, Arc<AtomicUsize>);

    async fn handler(State(counts): State<Counts>, headers: axum::http::HeaderMap) -> (StatusCode, Json<Value>) {
        let key = headers.get("x-api-key").and_then(|v| v.to_str().ok()).unwrap_or_default();
        if key == "k1" {
            counts.0.fetch_add(1, Ordering::SeqCst);
            (StatusCode::UNAUTHORIZED, Json(json!({"type": "error", "error": {"message": "bad key"}})))
        } else {
            counts.1.fetch_add(1, Ordering::SeqCst);
            (StatusCode::OK, Json(claude_message("hi from k2")))
        }
    }

    let counts = Counts::default();
    let app = Router::new().route("/v1/messages", post(handler)).with_state(counts.clone());
    let base_url = spawn_server(app).await;

    let state = AppState::new(
        global(),
        InitialChannels { messages: vec![channel("c0", &base_url, &["k1", "k2"])], ..Default::default() },
    );

    let cancel = CancelSignal::new();
    let resp = failover::dispatch(&state, Kind::Messages, &messages_body(), "", &cancel).await;
    assert_eq!(resp.status, 200);

    let metrics = &state.runtime(Kind::Messages).metrics;
    let k1_stats = metrics.window_stats(&base_url, "k1", Duration::from_secs(3600));
    let k2_stats = metrics.window_stats(&base_url, "k2", Duration::from_secs(3600));
    assert_eq!(k1_stats.fail_count, 1);
    assert_eq!(k2_stats.success_count, 1);

    // Second immediate request: k1 is in its cooldown window, so the
    // engine should go straight to k2 without probing k1 again.
    let cancel2 = CancelSignal::new();
    let resp2 = failover::dispatch(&state, Kind::Messages, &messages_body(), "", &cancel2).await;
    assert_eq!(resp2.status, 200);
    assert_eq!(counts.0.load(Ordering::SeqCst), 1, "k1 must not be retried while cooling down");
    assert_eq!(counts.1.load(Ordering::SeqCst), 2);
}

/// Scenario 3: a promoted channel bypasses health checks. A healthy 200
/// response from the promoted channel sets affinity; a 500 instead fails
/// over to the other channel without setting affinity to the promoted one.
#[tokio::test]
async fn promotion_bypasses_health_and_gates_affinity_on_success() {
    async fn ok() -> Json<Value> {
        Json(claude_message("from promoted"))
    }
    let good_url = spawn_server(Router::new().route("/v1/messages", post(ok))).await;

    async fn fail() -> (StatusCode, Json<Value>) {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"type": "error", "error": {"message": "boom"}})))
    }
    let promoted_url_healthy_case = good_url.clone();

    let mut promoted = channel("promoted", &promoted_url_healthy_case, &["k1"]);
    promoted.priority = 2;
    promoted.promotion_until = Some(OffsetDateTime::now_utc() + time::Duration::minutes(5));
    let mut fallback = channel("fallback", &good_url, &["k1"]);
    fallback.priority = 1;

    let state = AppState::new(
        global(),
        InitialChannels { messages: vec![promoted, fallback], ..Default::default() },
    );
    let cancel = CancelSignal::new();
    let resp = failover::dispatch(&state, Kind::Messages, &messages_body(), "user-a", &cancel).await;
    assert_eq!(resp.status, 200);
    assert_eq!(state.affinity.get_preferred_channel(Kind::Messages, "user-a"), Some(0));

    // Now the promoted channel's URL starts failing: its own low health
    // must not matter (promotion bypasses the health gate), but a 500
    // response still fails over to the healthy channel and must not
    // overwrite affinity with the promoted (now-failing) index.
    let failing_url = spawn_server(Router::new().route("/v1/messages", post(fail))).await;
    let mut promoted2 = channel("promoted", &failing_url, &["k1"]);
    promoted2.priority = 2;
    promoted2.promotion_until = Some(OffsetDateTime::now_utc() + time::Duration::minutes(5));
    let mut fallback2 = channel("fallback", &good_url, &["k1"]);
    fallback2.priority = 1;

    let state2 = AppState::new(
        global(),
        InitialChannels { messages: vec![promoted2, fallback2], ..Default::default() },
    );
    let cancel2 = CancelSignal::new();
    let resp2 = failover::dispatch(&state2, Kind::Messages, &messages_body(), "user-b", &cancel2).await;
    assert_eq!(resp2.status, 200);
    assert_eq!(state2.affinity.get_preferred_channel(Kind::Messages, "user-b"), Some(1));
}

/// Scenario 4: the client cancels while the engine is still waiting on
/// the upstream connection. `RecordRequestFinalizeClientCancel` fires;
/// success/failure counters are untouched, only volume (`RequestCount`)
/// grows.
#[tokio::test]
async fn client_cancel_during_connect_is_recorded_distinctly() {
    async fn slow() -> Json<Value> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Json(claude_message("too late"))
    }
    let base_url = spawn_server(Router::new().route("/v1/messages", post(slow))).await;

    let state = AppState::new(
        global(),
        InitialChannels { messages: vec![channel("c0", &base_url, &["k1"])], ..Default::default() },
    );

    let cancel = CancelSignal::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_clone.cancel();
    });

    let started = std::time::Instant::now();
    let resp = failover::dispatch(&state, Kind::Messages, &messages_body(), "user-cancel", &cancel).await;
    assert_eq!(resp.status, 499);
    assert!(started.elapsed() < Duration::from_secs(5), "cancellation must abort the wait promptly");

    let metrics = &state.runtime(Kind::Messages).metrics;
    let stats = metrics.window_stats(&base_url, "k1", Duration::from_secs(3600));
    assert_eq!(stats.request_count, 1);
    assert_eq!(stats.success_count, 0);
    assert_eq!(stats.fail_count, 0);
    assert_eq!(state.affinity.get_preferred_channel(Kind::Messages, "user-cancel"), None);
}

/// Scenario 5: the first key's upstream answers 200 with an empty body
/// before any SSE event — no byte has reached the client yet, so the
/// engine treats it as a failure and fails over to the next key.
#[tokio::test]
async fn empty_upstream_stream_triggers_key_failover() {
    async fn empty_body() -> (StatusCode, String) {
        (StatusCode::OK, String::new())
    }
    async fn sse_ok() -> axum::response::Response {
        let frame = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n\n";
        axum::response::Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(axum::body::Body::from(frame))
            .unwrap()
    }

    #[derive(Clone, Default)]
    struct Keyed(Arc<AtomicUsize>);

    async fn handler(State(calls): State<Keyed>, headers: axum::http::HeaderMap) -> axum::response::Response {
        let key = headers.get("x-api-key").and_then(|v| v.to_str().ok()).unwrap_or_default();
        calls.0.fetch_add(1, Ordering::SeqCst);
        if key == "k1" {
            let (status, body) = empty_body().await;
            axum::response::Response::builder().status(status).body(axum::body::Body::from(body)).unwrap()
        } else {
            sse_ok().await
        }
    }

    let calls = Keyed::default();
    let app = Router::new().route("/v1/messages", post(handler)).with_state(calls.clone());
    let base_url = spawn_server(app).await;

    let state = AppState::new(
        global(),
        InitialChannels { messages: vec![channel("c0", &base_url, &["k1", "k2"])], ..Default::default() },
    );

    let mut body = serde_json::from_slice::<Value>(&messages_body()).unwrap();
    body["stream"] = json!(true);
    let body = Bytes::from(body.to_string());

    let cancel = CancelSignal::new();
    let resp = failover::dispatch(&state, Kind::Messages, &body, "", &cancel).await;
    assert_eq!(resp.status, 200);
    let ChannelBody::Stream(mut rx) = resp.body else { panic!("expected an SSE stream") };
    let mut collected = Vec::new();
    while let Some(chunk) = rx.recv().await {
        collected.extend_from_slice(&chunk);
    }
    assert!(String::from_utf8_lossy(&collected).contains("hi"));

    let metrics = &state.runtime(Kind::Messages).metrics;
    let k1_stats = metrics.window_stats(&base_url, "k1", Duration::from_secs(3600));
    let k2_stats = metrics.window_stats(&base_url, "k2", Duration::from_secs(3600));
    assert_eq!(k1_stats.fail_count, 1);
    assert_eq!(k2_stats.success_count, 1);
}

/// A streamed response's token usage only becomes known once the final
/// `message_delta` frame arrives; `record_request_finalize_success` must
/// reflect it rather than the zeroed placeholder available at commit time.
#[tokio::test]
async fn streaming_usage_is_captured_from_the_final_frame() {
    async fn sse_with_usage() -> axum::response::Response {
        let body = concat!(
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},",
            "\"usage\":{\"input_tokens\":11,\"output_tokens\":7}}\n\n",
        );
        axum::response::Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(axum::body::Body::from(body))
            .unwrap()
    }

    let base_url = spawn_server(Router::new().route("/v1/messages", post(sse_with_usage))).await;
    let state = AppState::new(
        global(),
        InitialChannels { messages: vec![channel("c0", &base_url, &["k1"])], ..Default::default() },
    );

    let mut body = serde_json::from_slice::<Value>(&messages_body()).unwrap();
    body["stream"] = json!(true);
    let body = Bytes::from(body.to_string());

    let cancel = CancelSignal::new();
    let resp = failover::dispatch(&state, Kind::Messages, &body, "", &cancel).await;
    assert_eq!(resp.status, 200);
    let ChannelBody::Stream(mut rx) = resp.body else { panic!("expected an SSE stream") };
    while rx.recv().await.is_some() {}

    let metrics = &state.runtime(Kind::Messages).metrics;
    let stats = metrics.window_stats(&base_url, "k1", Duration::from_secs(3600));
    assert_eq!(stats.success_count, 1);
    assert_eq!(stats.input_tokens, 11, "usage from the trailing message_delta frame must be captured, not zeroed");
    assert_eq!(stats.output_tokens, 7);
}

/// Scenario 6: two channels share a `(BaseURL, Key)` pair. Deleting one
/// channel's metrics must not remove the shared entry, only the keys
/// exclusive to the deleted channel.
#[tokio::test]
async fn delete_channel_preserves_shared_metrics_key() {
    let state = AppState::new(global(), InitialChannels::default());
    let metrics = &state.runtime(Kind::Messages).metrics;

    let shared_url = "https://shared.example.com";
    let id = metrics.record_request_connected(shared_url, "shared-key", "m");
    metrics.record_request_finalize_success(shared_url, "shared-key", id, Default::default());

    let exclusive_url = "https://a-only.example.com";
    let id2 = metrics.record_request_connected(exclusive_url, "a-only-key", "m");
    metrics.record_request_finalize_success(exclusive_url, "a-only-key", id2, Default::default());

    // Channel A owns both pairs; channel B also owns the shared pair.
    let a_pairs = vec![
        (shared_url.to_string(), "shared-key".to_string()),
        (exclusive_url.to_string(), "a-only-key".to_string()),
    ];
    metrics.delete_channel_metrics(&a_pairs);

    let shared_stats = metrics.window_stats(shared_url, "shared-key", Duration::from_secs(3600));
    assert_eq!(shared_stats.request_count, 1, "pair still referenced by channel B must survive");

    let exclusive_stats = metrics.window_stats(exclusive_url, "a-only-key", Duration::from_secs(3600));
    assert_eq!(exclusive_stats.request_count, 0, "A-exclusive pair must be gone");
}
