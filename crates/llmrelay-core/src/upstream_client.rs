use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use wreq::{Client, Proxy};

use crate::cancel::CancelSignal;
use llmrelay_dialect::UpstreamRequest;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(86_400);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    insecure_skip_verify: bool,
    proxy: Option<String>,
}

/// A received upstream response, unary body fully buffered or a live byte
/// stream for SSE. Status and headers are always available up front;
/// §5 suspension points live inside `bytes()`/stream consumption only.
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

pub enum ResponseBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("upstream connect failed: {0}")]
    Connect(String),
    #[error("upstream timed out: {0}")]
    Timeout(String),
    #[error("upstream request cancelled by client")]
    Cancelled,
    #[error("upstream transport error: {0}")]
    Other(String),
}

/// Pooled `wreq` clients keyed by the per-channel knobs that change the
/// underlying connector (TLS verification, proxy). Timeouts are process-
/// wide constants, so they are not part of the pool key.
#[derive(Clone)]
pub struct UpstreamClient {
    clients: Arc<Mutex<HashMap<ClientKey, Client>>>,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn client_for(&self, insecure_skip_verify: bool, proxy: Option<&str>) -> Result<Client, TransportError> {
        let key = ClientKey {
            insecure_skip_verify,
            proxy: normalize_proxy(proxy),
        };
        let mut guard = self.clients.lock().expect("upstream client pool lock poisoned");
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(&key)?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    /// Sends `req`, buffering the whole body before returning. Used for
    /// non-streaming dispatch, where the failover engine needs the full
    /// body in hand to classify and possibly retry.
    pub async fn send_unary(
        &self,
        req: UpstreamRequest,
        insecure_skip_verify: bool,
        proxy: Option<&str>,
        cancel: &CancelSignal,
    ) -> Result<UpstreamResponse, TransportError> {
        let client = self.client_for(insecure_skip_verify, proxy)?;
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = dispatch(&client, req) => result?,
        };
        let status = resp.status().as_u16();
        let headers = headers_from_wreq(resp.headers());
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = resp.bytes() => result.map_err(map_wreq_error)?,
        };
        Ok(UpstreamResponse {
            status,
            headers,
            body: ResponseBody::Bytes(body),
        })
    }

    /// Sends `req` and relays the response body as a live stream of
    /// chunks. Each chunk read races the idle timeout and the caller's
    /// cancellation signal so a client disconnect stops the upstream
    /// read loop promptly instead of draining to completion.
    pub async fn send_stream(
        &self,
        req: UpstreamRequest,
        insecure_skip_verify: bool,
        proxy: Option<&str>,
        cancel: &CancelSignal,
    ) -> Result<UpstreamResponse, TransportError> {
        let client = self.client_for(insecure_skip_verify, proxy)?;
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = dispatch(&client, req) => result?,
        };
        let status = resp.status().as_u16();
        let headers = headers_from_wreq(resp.headers());

        if !(200..300).contains(&status) {
            let body = resp.bytes().await.map_err(map_wreq_error)?;
            return Ok(UpstreamResponse {
                status,
                headers,
                body: ResponseBody::Bytes(body),
            });
        }

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()) => next,
                };
                let Ok(item) = next else {
                    break;
                };
                let Some(item) = item else {
                    break;
                };
                let Ok(chunk) = item else {
                    break;
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(UpstreamResponse {
            status,
            headers,
            body: ResponseBody::Stream(rx),
        })
    }
}

async fn dispatch(client: &Client, req: UpstreamRequest) -> Result<wreq::Response, TransportError> {
    let method = match req.method {
        "GET" => wreq::Method::GET,
        "DELETE" => wreq::Method::DELETE,
        _ => wreq::Method::POST,
    };
    let mut builder = client.request(method, &req.url);
    for (k, v) in &req.headers {
        builder = builder.header(k, v);
    }
    builder = builder.body(req.body.to_vec());
    builder.send().await.map_err(map_wreq_error)
}

fn normalize_proxy(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn build_client(key: &ClientKey) -> Result<Client, TransportError> {
    let mut builder = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .read_timeout(STREAM_IDLE_TIMEOUT);

    if key.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(proxy) = &key.proxy {
        let proxy = Proxy::all(proxy).map_err(|e| TransportError::Other(e.to_string()))?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|e| TransportError::Other(e.to_string()))
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Vec<(String, String)> {
    map.iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.as_str().to_string(), s.to_string())))
        .collect()
}

fn map_wreq_error(err: wreq::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout(err.to_string());
    }
    if err.is_connect() {
        return TransportError::Connect(err.to_string());
    }
    TransportError::Other(err.to_string())
}
