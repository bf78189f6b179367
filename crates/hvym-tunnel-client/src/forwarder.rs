//! Concurrent dispatch of relayed requests to local HTTP services.
//!
//! Each inbound `request` frame is dispatched on its own task so a slow
//! local handler never stalls the control loop or other requests. A
//! semaphore bounds in-flight dispatches, and every spawned task is
//! tracked by request id so the whole set can be aborted when the
//! connection drops.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use hvym_tunnel_proto::{Message, codec};

/// Headers that are meaningful only for a single HTTP hop and must not
/// be forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// One relayed request, decoded from the wire.
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    pub id: String,
    pub service: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// Forwards relayed requests to bound local services and pushes the
/// answers back through the transport's outbound channel.
pub struct Forwarder {
    bindings: BTreeMap<String, u16>,
    http: reqwest::Client,
    outbound: mpsc::Sender<Message>,
    limiter: Arc<Semaphore>,
    pending: Arc<Mutex<HashMap<String, Option<AbortHandle>>>>,
    dispatch_timeout: Duration,
}

impl Forwarder {
    pub fn new(
        bindings: BTreeMap<String, u16>,
        outbound: mpsc::Sender<Message>,
        dispatch_timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            bindings,
            http: reqwest::Client::new(),
            outbound,
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            dispatch_timeout,
        }
    }

    /// Dispatch one request on its own task. Returns immediately; the
    /// answer (or a request-scoped error) is pushed on the outbound
    /// channel when the local service responds.
    pub async fn dispatch(&self, request: ForwardedRequest) {
        let Some(&port) = self.bindings.get(&request.service) else {
            warn!(id = %request.id, service = %request.service, "Request for unbound service");
            let _ = self
                .outbound
                .send(Message::request_error(
                    request.id,
                    format!("unknown service: {}", request.service),
                ))
                .await;
            return;
        };

        let id = request.id.clone();
        let http = self.http.clone();
        let outbound = self.outbound.clone();
        let limiter = Arc::clone(&self.limiter);
        let pending = Arc::clone(&self.pending);
        let timeout = self.dispatch_timeout;

        // Reserve the pending slot before spawning so abort_all can never
        // miss a task that has been spawned but not yet registered.
        pending.lock().await.insert(id.clone(), None);

        let task_pending = Arc::clone(&pending);
        let handle = tokio::spawn(async move {
            // Closed semaphore means the forwarder is shutting down.
            let _permit = match limiter.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let reply = match tokio::time::timeout(timeout, forward(&http, port, &request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(reason)) => {
                    warn!(id = %request.id, %reason, "Local dispatch failed");
                    Message::request_error(request.id.clone(), reason)
                }
                Err(_) => {
                    warn!(id = %request.id, ?timeout, "Local dispatch timed out");
                    Message::request_error(request.id.clone(), "local request timed out")
                }
            };
            task_pending.lock().await.remove(&request.id);
            let _ = outbound.send(reply).await;
        });

        // The task may already have finished and removed its own entry;
        // in that case there is nothing left to track.
        if let Some(slot) = pending.lock().await.get_mut(&id) {
            *slot = Some(handle.abort_handle());
        }
    }

    /// Abort every in-flight dispatch. Called when the connection drops:
    /// the relay has already failed those requests upstream.
    pub async fn abort_all(&self) {
        self.limiter.close();
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        for (_, handle) in pending.drain() {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
        if count > 0 {
            debug!(count, "Aborted in-flight dispatches");
        }
    }

    /// Number of requests currently in flight.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Perform the local HTTP round trip for one request.
async fn forward(
    http: &reqwest::Client,
    port: u16,
    request: &ForwardedRequest,
) -> Result<Message, String> {
    let method: reqwest::Method = request
        .method
        .parse()
        .map_err(|_| format!("invalid method: {}", request.method))?;

    let path = if request.path.starts_with('/') {
        request.path.clone()
    } else {
        format!("/{}", request.path)
    };
    let mut url = format!("http://127.0.0.1:{port}{path}");
    if let Some(query) = &request.query {
        url.push('?');
        url.push_str(query);
    }

    let mut builder = http.request(method, &url);
    for (name, value) in &request.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
        let bytes = codec::decode_body(body).map_err(|e| format!("invalid request body: {e}"))?;
        builder = builder.body(bytes);
    }

    let response = builder.send().await.map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let mut headers = BTreeMap::new();
    for (name, value) in response.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    let body = if bytes.is_empty() {
        None
    } else {
        Some(codec::encode_body(&bytes))
    };

    Ok(Message::Response {
        id: request.id.clone(),
        status,
        headers,
        body,
    })
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| name.eq_ignore_ascii_case(hop))
}
