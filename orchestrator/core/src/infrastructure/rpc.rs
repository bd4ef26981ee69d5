// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! JSON-RPC Split-Pipe Session Manager
//!
//! Outbound tool calls ride a bidirectional channel split across two pipes:
//! the orchestrator pushes JSON-RPC 2.0 requests on a per-client server-push
//! stream, and the client answers through an inbound call that lands in
//! [`RpcSessionManager::handle_response`]. Correlation is strictly by request
//! id; responses for unknown ids are logged and dropped.
//!
//! One manager instance is shared process-wide (injected, not a module
//! singleton, so several orchestrators can coexist in one binary for tests).
//! `emitters` and `pending` are concurrent maps; the downstream queue per
//! client is bounded with drop-oldest overflow — a slow client lags, it never
//! blocks the engine.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::error::EngineError;
use crate::infrastructure::config::McpConfig;

// ============================================================================
// Wire Types
// ============================================================================

/// Outbound JSON-RPC 2.0 message. Requests carry an id; notifications do not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub params: Value,
}

impl JsonRpcMessage {
    pub fn request(id: Uuid, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id.to_string()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub connected_at: DateTime<Utc>,
}

struct PendingRequest {
    client_id: String,
    method: String,
    tx: oneshot::Sender<Result<Value, EngineError>>,
}

// ============================================================================
// Session Manager
// ============================================================================

#[derive(Clone)]
pub struct RpcSessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    /// clientId → (session generation, push channel).
    emitters: DashMap<String, (u64, broadcast::Sender<JsonRpcMessage>)>,
    /// requestId → one-shot completion.
    pending: DashMap<Uuid, PendingRequest>,
    clients: DashMap<String, ClientInfo>,
    config: McpConfig,
    session_seq: AtomicU64,
}

impl RpcSessionManager {
    pub fn new(config: McpConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                emitters: DashMap::new(),
                pending: DashMap::new(),
                clients: DashMap::new(),
                config,
                session_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Register a client and return its server-push stream. Reconnecting
    /// under the same id replaces the previous session; the stale stream's
    /// teardown then no-ops because its generation no longer matches.
    pub fn create_session(&self, client_id: impl Into<String>) -> RpcSession {
        let client_id = client_id.into();
        let generation = self.inner.session_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(self.inner.config.emitter_queue_capacity);

        self.inner
            .emitters
            .insert(client_id.clone(), (generation, tx.clone()));
        self.inner.clients.insert(
            client_id.clone(),
            ClientInfo {
                client_id: client_id.clone(),
                connected_at: Utc::now(),
            },
        );

        debug!(client_id = %client_id, "rpc session created");
        metrics::counter!("conductor_rpc_sessions_total").increment(1);

        // Initial ping so the client sees traffic immediately.
        let _ = tx.send(JsonRpcMessage::notification("ping", Value::Null));

        RpcSession {
            client_id,
            generation,
            stream: BroadcastStream::new(rx),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Push a request to a connected client and await its response.
    ///
    /// Every terminal path — response, timeout, disconnect, push failure —
    /// removes the pending entry.
    pub async fn send_request(
        &self,
        client_id: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, EngineError> {
        let emitter = match self.inner.emitters.get(client_id) {
            Some(entry) => entry.value().1.clone(),
            None => return Err(EngineError::NotConnected(client_id.to_string())),
        };

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            request_id,
            PendingRequest {
                client_id: client_id.to_string(),
                method: method.to_string(),
                tx,
            },
        );

        let message = JsonRpcMessage::request(request_id, method, params);
        if emitter.send(message).is_err() {
            // Receiver gone: the client dropped its stream without a clean
            // disconnect. Tear the session down now.
            self.inner.pending.remove(&request_id);
            self.inner.teardown(client_id, None);
            return Err(EngineError::NotConnected(client_id.to_string()));
        }

        let timeout = timeout.unwrap_or(self.inner.config.read_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Completion dropped: the session disconnected mid-flight and
                // teardown already purged the entry.
                Err(EngineError::NotConnected(client_id.to_string()))
            }
            Err(_) => {
                self.inner.pending.remove(&request_id);
                metrics::counter!("conductor_rpc_timeouts_total").increment(1);
                Err(EngineError::Timeout(method.to_string()))
            }
        }
    }

    /// Fire-and-forget notification. Errors are logged and dropped.
    pub fn send_notification(&self, client_id: &str, method: &str, params: Value) {
        match self.inner.emitters.get(client_id) {
            Some(entry) => {
                if entry.value().1.send(JsonRpcMessage::notification(method, params)).is_err() {
                    warn!(client_id = %client_id, method = %method, "notification dropped: no live receiver");
                }
            }
            None => {
                warn!(client_id = %client_id, method = %method, "notification dropped: client not connected");
            }
        }
    }

    /// Correlate an inbound JSON-RPC response with its pending request.
    ///
    /// A response with an `error` object completes the request with
    /// [`EngineError::JsonRpc`]; otherwise the `result` field completes it.
    pub fn handle_response(&self, response: Value) {
        let id = response
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());

        let Some(id) = id else {
            warn!("rpc response without a parseable id; dropping");
            return;
        };

        let Some((_, entry)) = self.inner.pending.remove(&id) else {
            warn!(request_id = %id, "rpc response for unknown request id; dropping");
            return;
        };

        let outcome = match response.get("error") {
            Some(err) if !err.is_null() => {
                let code = err.get("code").and_then(Value::as_i64).unwrap_or(-32603);
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                Err(EngineError::JsonRpc { code, message })
            }
            _ => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
        };

        // The requester may have timed out already; nothing to do then.
        let _ = entry.tx.send(outcome);
        debug!(request_id = %id, method = %entry.method, "rpc response correlated");
    }

    /// Explicitly tear a client session down.
    pub fn close_session(&self, client_id: &str) {
        self.inner.teardown(client_id, None);
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner.emitters.contains_key(client_id)
    }

    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        self.inner.clients.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of requests currently awaiting a response (test observability).
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

impl Inner {
    /// Remove the emitter, purge the client info, and abandon every pending
    /// request for the client. When `generation` is given, only a session of
    /// that generation is torn down (guards stale-drop after reconnect).
    fn teardown(&self, client_id: &str, generation: Option<u64>) {
        let removed = self
            .emitters
            .remove_if(client_id, |_, (current, _)| {
                generation.map(|g| g == *current).unwrap_or(true)
            })
            .is_some();
        if !removed {
            return;
        }

        self.clients.remove(client_id);

        let abandoned: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|e| e.value().client_id == client_id)
            .map(|e| *e.key())
            .collect();
        for id in abandoned {
            // Dropping the sender cancels the in-flight await.
            self.pending.remove(&id);
        }

        debug!(client_id = %client_id, "rpc session removed");
    }
}

// ============================================================================
// Session Stream
// ============================================================================

/// Server-push pipe handed to the transport layer. Dropping the session runs
/// the termination path: emitter removed, client purged, pending abandoned.
pub struct RpcSession {
    pub client_id: String,
    generation: u64,
    stream: BroadcastStream<JsonRpcMessage>,
    inner: Arc<Inner>,
}

impl Stream for RpcSession {
    type Item = JsonRpcMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => return Poll::Ready(Some(message)),
                Poll::Ready(Some(Err(
                    tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n),
                ))) => {
                    // Drop-oldest overflow policy: the slow client just lost
                    // the n oldest messages.
                    warn!(client_id = %self.client_id, lagged = n, "rpc push queue overflowed");
                    metrics::counter!("conductor_rpc_drops_total").increment(n);
                    continue;
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.inner.teardown(&self.client_id, Some(self.generation));
    }
}
