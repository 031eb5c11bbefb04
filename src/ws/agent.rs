//! Agent registry and agent-facing WebSocket endpoint.
//!
//! Remote agents dial in, register with their server id, and keep one
//! persistent socket per server. The registry owns the connection map, the
//! request/response correlation table for controller-issued RPCs, and a
//! multi-cast handler table for asynchronous agent events (progress,
//! completion, failure). Frames from a single agent are dispatched inline in
//! its read loop, so handlers observe them in arrival order.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::{AgentStatus, Server};
use crate::ws::EventType;

/// Default timeout for controller-issued agent RPCs.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Keep-alive interval; a single missed pong terminates the socket.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Callback invoked for asynchronous agent events.
pub type AgentHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Opaque handle returned by [`AgentRegistry::on`]; pass it to `off`.
#[derive(Debug, Clone)]
pub struct HandlerId {
    event_type: String,
    id: u64,
}

/// One live agent connection. At most one exists per server id; a reconnect
/// force-closes the older socket.
pub struct AgentConnection {
    pub server_id: String,
    pub hostname: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    conn_id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

struct PendingRequest {
    server_id: String,
    tx: oneshot::Sender<Value>,
}

/// In-memory registry of connected agents.
pub struct AgentRegistry {
    agents: DashMap<String, AgentConnection>,
    pending: DashMap<String, PendingRequest>,
    handlers: DashMap<String, Vec<(u64, AgentHandler)>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            pending: DashMap::new(),
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        }
    }

    /// Install a connection, force-closing any prior one for the same server
    /// (the agent reconnecting). Returns the connection nonce used to scope
    /// cleanup to this particular socket.
    pub fn register(
        &self,
        server_id: &str,
        hostname: &str,
        version: &str,
        tx: mpsc::UnboundedSender<Message>,
    ) -> u64 {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some((_, old)) = self.agents.remove(server_id) {
            tracing::info!(server_id, "Replacing existing agent connection");
            drop(old); // dropping the sender closes the old socket's writer
        }
        self.agents.insert(
            server_id.to_string(),
            AgentConnection {
                server_id: server_id.to_string(),
                hostname: hostname.to_string(),
                version: version.to_string(),
                connected_at: Utc::now(),
                conn_id,
                tx,
            },
        );
        conn_id
    }

    /// Remove the connection if it is still the one identified by `conn_id`.
    /// Returns true when the map entry was actually removed — a stale socket
    /// finishing after a reconnect must not evict its replacement.
    pub fn unregister(&self, server_id: &str, conn_id: u64) -> bool {
        let removed = self
            .agents
            .remove_if(server_id, |_, conn| conn.conn_id == conn_id)
            .is_some();
        if removed {
            self.fail_pending_for(server_id);
        }
        removed
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.agents.contains_key(server_id)
    }

    /// `(server_id, hostname, version)` of every connected agent.
    pub fn connected_agents(&self) -> Vec<(String, String, String)> {
        self.agents
            .iter()
            .map(|entry| {
                let conn = entry.value();
                (
                    conn.server_id.clone(),
                    conn.hostname.clone(),
                    conn.version.clone(),
                )
            })
            .collect()
    }

    /// Enqueue a frame for an agent; false when it is not connected.
    pub fn send(&self, server_id: &str, msg_type: &str, payload: Value) -> bool {
        let frame = json!({ "type": msg_type, "payload": payload }).to_string();
        match self.agents.get(server_id) {
            Some(conn) => conn.tx.send(Message::Text(frame.into())).is_ok(),
            None => false,
        }
    }

    /// Controller-issued RPC: assigns a fresh `request_id`, sends the frame,
    /// and resolves with the matching response payload. Rejects on timeout
    /// or when the socket closes mid-request.
    pub async fn request(
        &self,
        server_id: &str,
        msg_type: &str,
        mut payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("request_id".into(), Value::String(request_id.clone()));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                server_id: server_id.to_string(),
                tx,
            },
        );

        if !self.send(server_id, msg_type, payload) {
            self.pending.remove(&request_id);
            return Err(AppError::AgentUnavailable("Agent is not connected".into()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.remove(&request_id);
                Err(AppError::AgentRequest(
                    "Agent disconnected before responding".into(),
                ))
            }
            Err(_) => {
                self.pending.remove(&request_id);
                Err(AppError::AgentRequest("Agent request timed out".into()))
            }
        }
    }

    /// Register a multi-cast handler for an asynchronous agent event type.
    pub fn on(&self, event_type: &str, handler: AgentHandler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(event_type.to_string())
            .or_default()
            .push((id, handler));
        HandlerId {
            event_type: event_type.to_string(),
            id,
        }
    }

    /// Remove a previously registered handler. Idempotent.
    pub fn off(&self, handle: &HandlerId) {
        if let Some(mut handlers) = self.handlers.get_mut(&handle.event_type) {
            handlers.retain(|(id, _)| *id != handle.id);
        }
    }

    /// Route one inbound frame: a matching `request_id` resolves the pending
    /// RPC and stops there; anything else goes to every registered handler.
    pub fn dispatch(&self, event_type: &str, payload: &Value) {
        if let Some(request_id) = payload.get("request_id").and_then(|v| v.as_str()) {
            if let Some((_, pending)) = self.pending.remove(request_id) {
                let _ = pending.tx.send(payload.clone());
                return;
            }
        }

        // Clone the handler list out so callbacks never run under the shard lock.
        let handlers: Vec<AgentHandler> = self
            .handlers
            .get(event_type)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(payload);
        }
    }

    fn fail_pending_for(&self, server_id: &str) {
        // Dropping the oneshot sender rejects the waiting request.
        self.pending
            .retain(|_, pending| pending.server_id != server_id);
    }

    /// Drop every connection and reject every pending request (shutdown).
    pub fn close_all(&self) {
        self.closed.cancel();
        self.agents.clear();
        self.pending.clear();
    }

    fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// `GET /ws/agent`: agent WebSocket endpoint.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let pong_seen = Arc::new(AtomicBool::new(true));
    let pong_flag = pong_seen.clone();
    let closed = state.agents.closed_token();

    // Writer task: queued frames plus keep-alive pings.
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if !pong_flag.swap(false, Ordering::Relaxed) {
                        tracing::debug!("Agent socket missed pong, terminating");
                        break;
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut registration: Option<(String, u64)> = None;

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Pong(_) => {
                pong_seen.store(true, Ordering::Relaxed);
                continue;
            }
            Message::Ping(_) => continue,
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let msg_type = parsed
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        let payload = parsed.get("payload").cloned().unwrap_or(json!({}));

        match msg_type.as_str() {
            "agent:register" => {
                if registration.is_some() {
                    tracing::debug!("Duplicate agent:register ignored");
                    continue;
                }
                match handle_registration(&state, &payload, &tx).await {
                    Ok((server_id, conn_id)) => {
                        registration = Some((server_id, conn_id));
                    }
                    Err(reason) => {
                        let _ = tx.send(Message::Text(
                            json!({
                                "type": "agent:register:error",
                                "payload": { "error": reason }
                            })
                            .to_string()
                            .into(),
                        ));
                        break;
                    }
                }
            }
            _ if registration.is_none() => {
                // The handshake must come first.
                let _ = tx.send(Message::Text(
                    json!({
                        "type": "agent:register:error",
                        "payload": { "error": "Expected agent:register as first message" }
                    })
                    .to_string()
                    .into(),
                ));
                break;
            }
            _ => {
                state.agents.dispatch(&msg_type, &payload);
            }
        }
    }

    if let Some((server_id, conn_id)) = registration {
        finish_disconnect(&state, &server_id, conn_id).await;
    }

    send_task.abort();
}

/// Validate the handshake, install the connection, and persist the state
/// change. Returns the registered server id plus connection nonce.
async fn handle_registration(
    state: &SharedState,
    payload: &Value,
    tx: &mpsc::UnboundedSender<Message>,
) -> std::result::Result<(String, u64), String> {
    let server_id = payload
        .get("server_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let hostname = payload
        .get("hostname")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let version = payload
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    if server_id.is_empty() {
        return Err("server_id is required".into());
    }

    let exists = Server::find_by_id(&state.db, &server_id)
        .await
        .map(|s| s.is_some())
        .unwrap_or(false);
    if !exists {
        return Err("Server not found".into());
    }

    let conn_id = state
        .agents
        .register(&server_id, &hostname, &version, tx.clone());
    tracing::info!(server_id = %server_id, hostname = %hostname, version = %version, "Agent registered");

    if let Err(e) = Server::mark_agent_connected(&state.db, &server_id, &version).await {
        tracing::warn!(server_id, error = %e, "Failed to persist agent registration");
    }

    let _ = tx.send(Message::Text(
        json!({
            "type": "agent:register:ok",
            "payload": { "server_id": server_id }
        })
        .to_string()
        .into(),
    ));

    state.ui.broadcast(
        EventType::ServerUpdated,
        json!({ "serverId": server_id, "agentStatus": "connected" }),
    );
    state.ui.broadcast(
        EventType::AgentConnected,
        json!({ "serverId": server_id, "version": version }),
    );

    Ok((server_id, conn_id))
}

/// Socket teardown: drop the registration (scoped to this socket) and flip
/// the server to disconnected — unless a self-update is in flight, in which
/// case the `updating` state rides out the reconnect gap.
async fn finish_disconnect(state: &SharedState, server_id: &str, conn_id: u64) {
    if !state.agents.unregister(server_id, conn_id) {
        return; // a newer connection took over
    }
    tracing::info!(server_id, "Agent disconnected");

    match Server::find_by_id(&state.db, server_id).await {
        Ok(Some(server)) if server.agent_status != AgentStatus::Updating => {
            if let Err(e) =
                Server::set_agent_status(&state.db, server_id, AgentStatus::Disconnected).await
            {
                tracing::warn!(server_id, error = %e, "Failed to persist agent disconnect");
            }
        }
        _ => {}
    }

    state.ui.broadcast(
        EventType::AgentDisconnected,
        json!({ "serverId": server_id }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn register_replaces_older_connection() {
        let registry = AgentRegistry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, _rx2) = channel();

        let first = registry.register("srv-1", "host-a", "1.0.0", tx1);
        let second = registry.register("srv-1", "host-a", "1.0.1", tx2);
        assert_ne!(first, second);

        // Old sender is dropped, so its receiver drains to None.
        assert!(rx1.recv().await.is_none());

        // The stale socket's cleanup must not evict the new connection.
        assert!(!registry.unregister("srv-1", first));
        assert!(registry.is_connected("srv-1"));
        assert!(registry.unregister("srv-1", second));
        assert!(!registry.is_connected("srv-1"));
    }

    #[tokio::test]
    async fn send_returns_false_when_not_connected() {
        let registry = AgentRegistry::new();
        assert!(!registry.send("nope", "backup:cancel", json!({})));
    }

    #[tokio::test]
    async fn request_resolves_on_matching_response() {
        let registry = Arc::new(AgentRegistry::new());
        let (tx, mut rx) = channel();
        registry.register("srv-1", "host", "1.0.0", tx);

        let reg = registry.clone();
        let responder = tokio::spawn(async move {
            let Some(Message::Text(frame)) = rx.recv().await else {
                panic!("expected outbound frame");
            };
            let parsed: Value = serde_json::from_str(&frame).unwrap();
            let request_id = parsed["payload"]["request_id"].as_str().unwrap().to_string();
            reg.dispatch(
                "fs:browse",
                &json!({ "request_id": request_id, "entries": [] }),
            );
        });

        let response = registry
            .request("srv-1", "fs:browse", json!({ "path": "/" }), REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert!(response.get("entries").is_some());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn request_times_out_without_response() {
        let registry = AgentRegistry::new();
        let (tx, _rx) = channel();
        registry.register("srv-1", "host", "1.0.0", tx);

        let err = registry
            .request(
                "srv-1",
                "fs:browse",
                json!({ "path": "/" }),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AgentRequest(_)));
    }

    #[tokio::test]
    async fn request_rejected_on_disconnect() {
        let registry = Arc::new(AgentRegistry::new());
        let (tx, _rx) = channel();
        let conn_id = registry.register("srv-1", "host", "1.0.0", tx);

        let reg = registry.clone();
        let disconnector = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reg.unregister("srv-1", conn_id);
        });

        let err = registry
            .request(
                "srv-1",
                "fs:browse",
                json!({ "path": "/" }),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AgentRequest(_)));
        disconnector.await.unwrap();
    }

    #[tokio::test]
    async fn handlers_are_multicast_and_removable() {
        let registry = AgentRegistry::new();
        let counter = Arc::new(AtomicU64::new(0));

        let c1 = counter.clone();
        let h1 = registry.on("backup:progress", Arc::new(move |_: &Value| {
            c1.fetch_add(1, Ordering::Relaxed);
        }));
        let c2 = counter.clone();
        let _h2 = registry.on("backup:progress", Arc::new(move |_: &Value| {
            c2.fetch_add(10, Ordering::Relaxed);
        }));

        registry.dispatch("backup:progress", &json!({ "job_id": "j1" }));
        assert_eq!(counter.load(Ordering::Relaxed), 11);

        registry.off(&h1);
        registry.dispatch("backup:progress", &json!({ "job_id": "j1" }));
        assert_eq!(counter.load(Ordering::Relaxed), 21);
    }

    #[tokio::test]
    async fn response_with_request_id_skips_handlers() {
        let registry = Arc::new(AgentRegistry::new());
        let (tx, mut rx) = channel();
        registry.register("srv-1", "host", "1.0.0", tx);

        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();
        registry.on("fs:browse", Arc::new(move |_: &Value| {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        let reg = registry.clone();
        tokio::spawn(async move {
            let Some(Message::Text(frame)) = rx.recv().await else {
                return;
            };
            let parsed: Value = serde_json::from_str(&frame).unwrap();
            let request_id = parsed["payload"]["request_id"].as_str().unwrap().to_string();
            reg.dispatch("fs:browse", &json!({ "request_id": request_id }));
        });

        registry
            .request("srv-1", "fs:browse", json!({}), REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
