use std::collections::HashSet;

use bytes::Bytes;
use llmrelay_common::Kind;
use llmrelay_config::UpstreamConfig;
use llmrelay_dialect::{adapter_for, adapter_for_kind, Dialect, NormalizedRequest, SseEvent, SseParser, StreamState};
use llmrelay_metrics::TokenUsage;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cancel::CancelSignal;
use crate::runtime::{AppState, KindRuntime};
use crate::upstream_client::{ResponseBody, TransportError};

/// §4.G's sum-typed inner-loop result. `Handled` always means a response
/// has been produced (possibly an error passed straight through);
/// `Retry` carries the last retryable body so exhaustion can emit it.
enum TryChannelOutcome {
    Handled(ChannelResponse),
    Retry { last_error: Option<(u16, Bytes)> },
}

pub struct ChannelResponse {
    pub status: u16,
    pub body: ChannelBody,
    pub success_key: Option<String>,
}

pub enum ChannelBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

/// The outer loop: `failedChannels` grows across channel attempts until
/// the scheduler is exhausted or a channel handles the request.
pub async fn dispatch(
    state: &AppState,
    kind: Kind,
    body: &[u8],
    user_id: &str,
    cancel: &CancelSignal,
) -> ChannelResponse {
    let runtime = state.runtime(kind);
    let inbound = adapter_for_kind(kind);

    let norm = match inbound.parse_request(body) {
        Ok(norm) => norm,
        Err(err) => {
            return ChannelResponse {
                status: 400,
                body: ChannelBody::Bytes(Bytes::from(inbound.render_error(400, &err.to_string()))),
                success_key: None,
            };
        }
    };

    let fuzzy_mode = state.global.load().fuzzy_mode_enabled;
    let mut failed_channels: HashSet<usize> = HashSet::new();
    let channel_count = runtime.config.snapshot().len().max(1);
    let mut last_error: Option<(u16, Bytes)> = None;

    for _attempt in 0..channel_count {
        if cancel.is_cancelled() {
            return cancelled_response(inbound);
        }

        let selection = match crate::scheduler::select_channel(
            &runtime.config,
            &runtime.metrics,
            &state.affinity,
            kind,
            user_id,
            &norm.model,
            &failed_channels,
        ) {
            Ok(selection) => selection,
            Err(_) => break,
        };

        let base_urls = selection.channel.all_base_urls();
        let ranked = state.urls.get_sorted_urls(kind, selection.index, &base_urls);

        match try_channel(state, runtime, kind, &selection.channel, &ranked, &norm, inbound, fuzzy_mode, cancel).await {
            TryChannelOutcome::Handled(resp) => {
                if resp.success_key.is_some() && !user_id.is_empty() {
                    state.affinity.set_preferred_channel(kind, user_id, selection.index);
                }
                return resp;
            }
            TryChannelOutcome::Retry { last_error: err } => {
                failed_channels.insert(selection.index);
                if err.is_some() {
                    last_error = err;
                }
            }
        }
    }

    warn!(kind = %kind, "all channels exhausted");
    match last_error {
        Some((status, body)) => ChannelResponse { status, body: ChannelBody::Bytes(body), success_key: None },
        None => ChannelResponse {
            status: 503,
            body: ChannelBody::Bytes(Bytes::from(inbound.render_error(503, "all upstream channels failed"))),
            success_key: None,
        },
    }
}

fn cancelled_response(inbound: &'static dyn Dialect) -> ChannelResponse {
    ChannelResponse {
        status: 499,
        body: ChannelBody::Bytes(Bytes::from(inbound.render_error(499, "client cancelled"))),
        success_key: None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn try_channel(
    state: &AppState,
    runtime: &KindRuntime,
    kind: Kind,
    channel: &UpstreamConfig,
    ranked: &[llmrelay_urlmgr::RankedUrl],
    norm: &NormalizedRequest,
    inbound: &'static dyn Dialect,
    fuzzy_mode: bool,
    cancel: &CancelSignal,
) -> TryChannelOutcome {
    let upstream = adapter_for(channel.service_type);
    let mapped_model = channel.model_mapping.get(&norm.model).cloned().unwrap_or_else(|| norm.model.clone());

    let force_probe = ranked
        .first()
        .map(|first| {
            channel
                .api_keys
                .iter()
                .all(|key| runtime.metrics.is_circuit_broken(&first.url, key))
        })
        .unwrap_or(false);

    let mut last_error: Option<(u16, Bytes)> = None;
    let mut deprioritize_later: Vec<String> = Vec::new();

    for ranked_url in ranked {
        let url = &ranked_url.url;
        let mut failed_keys: HashSet<String> = HashSet::new();

        for _attempt in 0..channel.api_keys.len().max(1) {
            if cancel.is_cancelled() {
                return TryChannelOutcome::Handled(cancelled_channel_response(inbound));
            }

            let Some(key) = pick_next_key(channel, &state.cooldown, kind, &failed_keys) else {
                break;
            };

            if !force_probe && runtime.metrics.should_suspend_key(url, &key) {
                failed_keys.insert(key);
                continue;
            }

            let req = match upstream.build_upstream_request(norm, channel, url, &key, &mapped_model) {
                Ok(req) => req,
                Err(err) => {
                    return TryChannelOutcome::Handled(ChannelResponse {
                        status: 400,
                        body: ChannelBody::Bytes(Bytes::from(inbound.render_error(400, &err.to_string()))),
                        success_key: None,
                    });
                }
            };

            let request_id = runtime.metrics.record_request_connected(url, &key, &mapped_model);
            let started = std::time::Instant::now();
            runtime.metrics.record_request_start(url, &key);
            let _active_guard = ActiveRequestGuard { metrics: &runtime.metrics, url, key: &key };

            let global_proxy = state.global.load().proxy.clone();
            let proxy = channel.proxy.as_deref().or(global_proxy.as_deref());
            let send_result = if norm.stream {
                state.http.send_stream(req, channel.insecure_skip_verify, proxy, cancel).await
            } else {
                state.http.send_unary(req, channel.insecure_skip_verify, proxy, cancel).await
            };

            let resp = match send_result {
                Ok(resp) => resp,
                Err(TransportError::Cancelled) => {
                    runtime.metrics.record_request_finalize_client_cancel(url, &key, request_id);
                    return TryChannelOutcome::Handled(cancelled_channel_response(inbound));
                }
                Err(err) => {
                    info!(kind = %kind, channel = %channel.name, %url, key_mask = %mask_key(&key), error = %err, "upstream transport failure");
                    failed_keys.insert(key.clone());
                    state.cooldown.mark_key_as_failed(kind, &key);
                    runtime.metrics.record_request_finalize_failure(url, &key, request_id);
                    state.urls.mark_failure(kind, ranked_url.original_index, url);
                    continue;
                }
            };

            if !(200..300).contains(&resp.status) {
                let body = match resp.body {
                    ResponseBody::Bytes(b) => b,
                    ResponseBody::Stream(mut rx) => drain(&mut rx).await,
                };
                let classification = crate::classify::classify(resp.status, &body, fuzzy_mode);
                match classification {
                    crate::classify::Classification::Retryable { quota_like } => {
                        failed_keys.insert(key.clone());
                        state.cooldown.mark_key_as_failed(kind, &key);
                        runtime.metrics.record_request_finalize_failure(url, &key, request_id);
                        state.urls.mark_failure(kind, ranked_url.original_index, url);
                        last_error = Some((resp.status, body));
                        if quota_like {
                            deprioritize_later.push(key);
                        }
                        continue;
                    }
                    crate::classify::Classification::NonRetryable => {
                        runtime.metrics.record_request_finalize_failure(url, &key, request_id);
                        return TryChannelOutcome::Handled(ChannelResponse {
                            status: resp.status,
                            body: ChannelBody::Bytes(body),
                            success_key: None,
                        });
                    }
                }
            }

            for quota_key in deprioritize_later.drain(..) {
                let _ = runtime.config.deprioritize_key(&channel.name, &quota_key);
            }
            state.urls.mark_success(kind, ranked_url.original_index, url, Some(started.elapsed()));

            let handled = match resp.body {
                ResponseBody::Bytes(body) => handle_unary_2xx(inbound, &body),
                ResponseBody::Stream(rx) => {
                    handle_stream_2xx(
                        inbound,
                        rx,
                        std::sync::Arc::clone(&runtime.metrics),
                        url.to_string(),
                        key.clone(),
                        request_id,
                    )
                    .await
                }
            };

            match handled {
                UnaryOutcome::Success { body, usage } => {
                    runtime.metrics.record_request_finalize_success(url, &key, request_id, usage);
                    return TryChannelOutcome::Handled(ChannelResponse {
                        status: 200,
                        body,
                        success_key: Some(key),
                    });
                }
                UnaryOutcome::StreamCommitted { body } => {
                    // The background task records the finalize-success call
                    // itself, once the stream drains and the real token
                    // usage (if any arrived) is known — see
                    // `handle_stream_2xx`.
                    return TryChannelOutcome::Handled(ChannelResponse {
                        status: 200,
                        body,
                        success_key: Some(key),
                    });
                }
                UnaryOutcome::Empty | UnaryOutcome::Invalid => {
                    failed_keys.insert(key.clone());
                    state.cooldown.mark_key_as_failed(kind, &key);
                    runtime.metrics.record_request_finalize_failure(url, &key, request_id);
                    state.urls.mark_failure(kind, ranked_url.original_index, url);
                    continue;
                }
            }
        }
    }

    TryChannelOutcome::Retry { last_error }
}

fn cancelled_channel_response(inbound: &'static dyn Dialect) -> ChannelResponse {
    ChannelResponse {
        status: 499,
        body: ChannelBody::Bytes(Bytes::from(inbound.render_error(499, "client cancelled"))),
        success_key: None,
    }
}

async fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Bytes {
    let mut buf = Vec::new();
    while let Some(chunk) = rx.recv().await {
        buf.extend_from_slice(&chunk);
    }
    Bytes::from(buf)
}

enum UnaryOutcome {
    Success { body: ChannelBody, usage: TokenUsage },
    /// A stream attempt committed a client-visible write; the eventual
    /// `record_request_finalize_success` call happens inside the
    /// background pump task once real usage (if any) is known, rather
    /// than here with a placeholder zero usage.
    StreamCommitted { body: ChannelBody },
    Empty,
    Invalid,
}

fn handle_unary_2xx(inbound: &'static dyn Dialect, body: &[u8]) -> UnaryOutcome {
    if body.is_empty() {
        return UnaryOutcome::Empty;
    }
    match inbound.parse_unary_response(body) {
        Ok(norm) => {
            let usage = norm.usage;
            let rendered = inbound.render_unary_response(&norm);
            UnaryOutcome::Success { body: ChannelBody::Bytes(Bytes::from(rendered)), usage }
        }
        Err(_) => UnaryOutcome::Invalid,
    }
}

/// Reads the upstream stream until the first translatable delta is
/// produced (or the stream ends empty). Once a delta exists the
/// response is "committed": no further failover may occur, matching the
/// exactly-once client write invariant, so the remainder is pumped by a
/// background task into an outbound channel the caller streams to the
/// client. The background task also owns the eventual
/// `record_request_finalize_success` call, since a stream's usage
/// figures (if the upstream sends them at all) only become known once
/// the stream drains — finalizing synchronously here would always
/// record a zeroed `TokenUsage`.
#[allow(clippy::too_many_arguments)]
async fn handle_stream_2xx(
    inbound: &'static dyn Dialect,
    mut upstream_rx: mpsc::Receiver<Bytes>,
    metrics: std::sync::Arc<llmrelay_metrics::MetricsManager>,
    url: String,
    key: String,
    request_id: u64,
) -> UnaryOutcome {
    let mut parser = SseParser::new();
    let mut state = StreamState::default();
    let mut pending: Vec<SseEvent> = Vec::new();
    let mut first_frame: Option<String> = None;
    let mut usage = TokenUsage::default();

    while let Some(chunk) = upstream_rx.recv().await {
        pending.extend(parser.push_bytes(&chunk));
        if let Some((event, frame_usage)) = pop_translatable(&mut pending, inbound, &mut state) {
            first_frame = Some(event);
            if let Some(u) = frame_usage {
                usage = u;
            }
            break;
        }
    }

    let Some(first_frame) = first_frame else {
        for event in parser.finish() {
            if let Some(delta) = inbound.parse_stream_event(&event, &mut state) {
                if let Some(u) = delta.usage {
                    usage = u;
                }
                let frame = inbound.render_stream_event(&delta, &mut state);
                let (tx, rx) = mpsc::channel::<Bytes>(4);
                tokio::spawn(async move {
                    let _ = tx.send(Bytes::from(frame)).await;
                    if let Some(done) = inbound.render_done() {
                        let _ = tx.send(Bytes::from(done)).await;
                    }
                    metrics.record_request_finalize_success(&url, &key, request_id, usage);
                });
                return UnaryOutcome::StreamCommitted { body: ChannelBody::Stream(rx) };
            }
        }
        return UnaryOutcome::Empty;
    };

    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        // Once the first frame is on the wire the client write is
        // committed: a disconnect from here on is a client cancel, not a
        // failure, but the provisional history row and request counter
        // still need exactly one finalize call (§8 invariant 1).
        let disconnected = 'pump: {
            if tx.send(Bytes::from(first_frame)).await.is_err() {
                break 'pump true;
            }
            loop {
                while let Some(event) = pending.first().cloned() {
                    pending.remove(0);
                    if let Some(delta) = inbound.parse_stream_event(&event, &mut state) {
                        if let Some(u) = delta.usage {
                            usage = u;
                        }
                        let frame = inbound.render_stream_event(&delta, &mut state);
                        if tx.send(Bytes::from(frame)).await.is_err() {
                            break 'pump true;
                        }
                    }
                }
                match upstream_rx.recv().await {
                    Some(chunk) => pending.extend(parser.push_bytes(&chunk)),
                    None => break,
                }
            }
            for event in parser.finish() {
                if let Some(delta) = inbound.parse_stream_event(&event, &mut state) {
                    if let Some(u) = delta.usage {
                        usage = u;
                    }
                    let frame = inbound.render_stream_event(&delta, &mut state);
                    if tx.send(Bytes::from(frame)).await.is_err() {
                        break 'pump true;
                    }
                }
            }
            if let Some(done) = inbound.render_done() {
                let _ = tx.send(Bytes::from(done)).await;
            }
            false
        };

        if disconnected {
            metrics.record_request_finalize_client_cancel(&url, &key, request_id);
        } else {
            metrics.record_request_finalize_success(&url, &key, request_id, usage);
        }
    });

    UnaryOutcome::StreamCommitted { body: ChannelBody::Stream(rx) }
}

fn pop_translatable(
    pending: &mut Vec<SseEvent>,
    dialect: &'static dyn Dialect,
    state: &mut StreamState,
) -> Option<(String, Option<TokenUsage>)> {
    while !pending.is_empty() {
        let event = pending.remove(0);
        if let Some(delta) = dialect.parse_stream_event(&event, state) {
            let usage = delta.usage;
            return Some((dialect.render_stream_event(&delta, state), usage));
        }
    }
    None
}

/// Cooldown-aware key selection: skips keys already tried this URL and
/// keys currently in their advisory cooldown window.
fn pick_next_key(
    channel: &UpstreamConfig,
    cooldown: &llmrelay_metrics::CooldownCache,
    kind: Kind,
    failed_keys: &HashSet<String>,
) -> Option<String> {
    channel
        .api_keys
        .iter()
        .find(|key| !failed_keys.contains(*key) && !cooldown.is_key_failed(kind, key))
        .or_else(|| channel.api_keys.iter().find(|key| !failed_keys.contains(*key)))
        .cloned()
}

/// Balances `record_request_start`/`record_request_end` across every exit
/// path of a single attempt (success, retry, cancel, or early return) so
/// `ActiveRequests` never drifts even when the attempt bails out early.
struct ActiveRequestGuard<'a> {
    metrics: &'a llmrelay_metrics::MetricsManager,
    url: &'a str,
    key: &'a str,
}

impl Drop for ActiveRequestGuard<'_> {
    fn drop(&mut self) {
        self.metrics.record_request_end(self.url, self.key);
    }
}

fn mask_key(key: &str) -> String {
    if key.len() <= 4 {
        "*".repeat(key.len())
    } else {
        format!("***{}", &key[key.len() - 4..])
    }
}
