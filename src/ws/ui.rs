//! UI broadcast layer.
//!
//! Fan-out of typed events to every connected browser socket, with a bounded
//! per-job replay buffer so a UI that reconnects mid-backup can catch up on
//! the progress frames it missed.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::api::SharedState;

const BROADCAST_CAPACITY: usize = 256;
/// Replay buffer capacity per job.
const REPLAY_CAPACITY: usize = 100;
/// How long a job's replay buffer outlives its terminal event.
const REPLAY_RETENTION: Duration = Duration::from_secs(5 * 60);
/// Socket liveness: one missed pong within this interval terminates.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Closed set of event types pushed to UI sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "backup:started")]
    BackupStarted,
    #[serde(rename = "backup:progress")]
    BackupProgress,
    #[serde(rename = "backup:completed")]
    BackupCompleted,
    #[serde(rename = "backup:failed")]
    BackupFailed,
    #[serde(rename = "backup:cancelled")]
    BackupCancelled,
    #[serde(rename = "job:created")]
    JobCreated,
    #[serde(rename = "job:updated")]
    JobUpdated,
    #[serde(rename = "job:deleted")]
    JobDeleted,
    #[serde(rename = "server:created")]
    ServerCreated,
    #[serde(rename = "server:updated")]
    ServerUpdated,
    #[serde(rename = "server:deleted")]
    ServerDeleted,
    #[serde(rename = "version:created")]
    VersionCreated,
    #[serde(rename = "version:deleted")]
    VersionDeleted,
    #[serde(rename = "server:ping")]
    ServerPing,
    #[serde(rename = "agent:connected")]
    AgentConnected,
    #[serde(rename = "agent:disconnected")]
    AgentDisconnected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackupStarted => "backup:started",
            Self::BackupProgress => "backup:progress",
            Self::BackupCompleted => "backup:completed",
            Self::BackupFailed => "backup:failed",
            Self::BackupCancelled => "backup:cancelled",
            Self::JobCreated => "job:created",
            Self::JobUpdated => "job:updated",
            Self::JobDeleted => "job:deleted",
            Self::ServerCreated => "server:created",
            Self::ServerUpdated => "server:updated",
            Self::ServerDeleted => "server:deleted",
            Self::VersionCreated => "version:created",
            Self::VersionDeleted => "version:deleted",
            Self::ServerPing => "server:ping",
            Self::AgentConnected => "agent:connected",
            Self::AgentDisconnected => "agent:disconnected",
        }
    }

    /// Backup lifecycle events are the ones recorded for replay.
    fn is_backup(&self) -> bool {
        matches!(
            self,
            Self::BackupStarted
                | Self::BackupProgress
                | Self::BackupCompleted
                | Self::BackupFailed
                | Self::BackupCancelled
        )
    }

    /// A terminal event starts the replay-buffer retention clock.
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::BackupCompleted | Self::BackupFailed | Self::BackupCancelled
        )
    }
}

#[derive(Debug, Clone)]
struct BufferedEvent {
    event_type: EventType,
    payload: Value,
    emitted_at: i64,
}

/// Fan-out hub for UI sockets.
#[derive(Clone)]
pub struct UiBroadcaster {
    tx: broadcast::Sender<String>,
    replay: Arc<DashMap<String, VecDeque<BufferedEvent>>>,
    closed: CancellationToken,
}

impl Default for UiBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl UiBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            replay: Arc::new(DashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Fire-and-forget fan-out to all currently open sockets.
    pub fn broadcast(&self, event_type: EventType, payload: Value) {
        if event_type.is_backup() {
            if let Some(job_id) = payload.get("jobId").and_then(|v| v.as_str()) {
                let mut buffer = self.replay.entry(job_id.to_string()).or_default();
                buffer.push_back(BufferedEvent {
                    event_type,
                    payload: payload.clone(),
                    emitted_at: chrono::Utc::now().timestamp_millis(),
                });
                if buffer.len() > REPLAY_CAPACITY {
                    buffer.pop_front();
                }

                if event_type.is_terminal() {
                    self.schedule_replay_release(job_id.to_string());
                }
            }
        }

        let frame = json!({ "type": event_type, "payload": payload }).to_string();
        let _ = self.tx.send(frame);
    }

    /// Serialized frames buffered for a job with `emitted_at > since`.
    pub fn replay_frames(&self, job_id: &str, since: i64) -> Vec<String> {
        self.replay
            .get(job_id)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|e| e.emitted_at > since)
                    .map(|e| json!({ "type": e.event_type, "payload": e.payload }).to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn schedule_replay_release(&self, job_id: String) {
        let replay = self.replay.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REPLAY_RETENTION).await;
            replay.remove(&job_id);
        });
    }

    /// Number of currently subscribed sockets.
    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Terminate every connected UI socket (shutdown path).
    pub fn close_all(&self) {
        self.closed.cancel();
    }

    fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// `GET /ws`: UI WebSocket endpoint.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state))
}

#[derive(Debug, Deserialize)]
struct ReplayRequest {
    #[serde(rename = "jobId")]
    job_id: String,
    #[serde(default)]
    since: i64,
}

async fn handle_ui_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.ui.subscribe();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<String>();

    let pong_seen = Arc::new(AtomicBool::new(true));
    let pong_flag = pong_seen.clone();
    let closed = state.ui.closed_token();

    // Single writer task: broadcasts, direct replies, liveness pings.
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(missed = n, "UI socket lagged behind broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(text) = direct_rx.recv() => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if !pong_flag.swap(false, Ordering::Relaxed) {
                        tracing::debug!("UI socket missed pong, terminating");
                        break;
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: pongs and replay requests only.
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Pong(_) => {
                pong_seen.store(true, Ordering::Relaxed);
            }
            Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if parsed.get("type").and_then(|t| t.as_str()) != Some("replay:request") {
                    continue;
                }
                let Some(payload) = parsed.get("payload") else {
                    continue;
                };
                let Ok(req) = serde_json::from_value::<ReplayRequest>(payload.clone()) else {
                    continue;
                };
                for frame in state.ui.replay_frames(&req.job_id, req.since) {
                    if direct_tx.send(frame).is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let ui = UiBroadcaster::new();
        let mut rx = ui.subscribe();
        ui.broadcast(EventType::JobCreated, json!({ "jobId": "j1" }));
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains(r#""type":"job:created""#));
    }

    #[tokio::test]
    async fn backup_events_are_buffered_per_job() {
        let ui = UiBroadcaster::new();
        ui.broadcast(EventType::BackupStarted, json!({ "jobId": "j1" }));
        ui.broadcast(EventType::BackupProgress, json!({ "jobId": "j1", "percent": 10 }));
        ui.broadcast(EventType::BackupProgress, json!({ "jobId": "j2", "percent": 50 }));

        let frames = ui.replay_frames("j1", 0);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("backup:started"));
        assert!(frames[1].contains("backup:progress"));
    }

    #[tokio::test]
    async fn replay_respects_since_and_is_idempotent() {
        let ui = UiBroadcaster::new();
        ui.broadcast(EventType::BackupProgress, json!({ "jobId": "j1", "percent": 1 }));
        let first = ui.replay_frames("j1", 0);
        let second = ui.replay_frames("j1", 0);
        assert_eq!(first, second);

        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        assert!(ui.replay_frames("j1", future).is_empty());
    }

    #[tokio::test]
    async fn non_backup_events_are_not_buffered() {
        let ui = UiBroadcaster::new();
        ui.broadcast(EventType::ServerPing, json!({ "jobId": "j1" }));
        assert!(ui.replay_frames("j1", 0).is_empty());
    }

    #[tokio::test]
    async fn ring_buffer_is_bounded() {
        let ui = UiBroadcaster::new();
        for i in 0..250 {
            ui.broadcast(
                EventType::BackupProgress,
                json!({ "jobId": "j1", "percent": i }),
            );
        }
        assert_eq!(ui.replay_frames("j1", 0).len(), REPLAY_CAPACITY);
    }
}
