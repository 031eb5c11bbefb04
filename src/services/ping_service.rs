//! Per-server reachability derived from the agent registry.
//!
//! The agent link is the source of truth: a server is reachable exactly when
//! its agent holds a registered socket. Every tick reconciles the persisted
//! `agent_status` (without clobbering `updating`), refreshes the in-memory
//! snapshot served by `GET /api/servers/ping-status`, and broadcasts one
//! `server:ping` event per server.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::models::{AgentStatus, Server};
use crate::ws::{AgentRegistry, EventType, UiBroadcaster};

const PING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PingStatus {
    pub server_id: String,
    pub reachable: bool,
    pub latency_ms: Option<i64>,
    pub last_checked_at: DateTime<Utc>,
}

pub struct PingService {
    statuses: DashMap<String, PingStatus>,
    stopped: CancellationToken,
}

impl Default for PingService {
    fn default() -> Self {
        Self::new()
    }
}

impl PingService {
    pub fn new() -> Self {
        Self {
            statuses: DashMap::new(),
            stopped: CancellationToken::new(),
        }
    }

    /// Current in-memory snapshot.
    pub fn snapshot(&self) -> Vec<PingStatus> {
        self.statuses.iter().map(|e| e.value().clone()).collect()
    }

    pub fn spawn(
        self: &Arc<Self>,
        db: SqlitePool,
        agents: Arc<AgentRegistry>,
        ui: UiBroadcaster,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = service.stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = service.tick(&db, &agents, &ui).await {
                            tracing::warn!(error = %e, "Ping cycle failed");
                        }
                    }
                }
            }
            tracing::info!("Ping service stopped");
        });
    }

    pub fn shutdown(&self) {
        self.stopped.cancel();
    }

    async fn tick(
        &self,
        db: &SqlitePool,
        agents: &AgentRegistry,
        ui: &UiBroadcaster,
    ) -> crate::error::Result<()> {
        let servers = Server::find_all(db).await?;
        for server in servers {
            let reachable = agents.is_connected(&server.id);

            // Reconcile drift between registry and row; a self-updating
            // agent keeps its `updating` status across the reconnect gap.
            let derived = if reachable {
                AgentStatus::Connected
            } else {
                AgentStatus::Disconnected
            };
            if server.agent_status != derived && server.agent_status != AgentStatus::Updating {
                Server::set_agent_status(db, &server.id, derived).await?;
            }

            let status = PingStatus {
                server_id: server.id.clone(),
                reachable,
                latency_ms: None,
                last_checked_at: Utc::now(),
            };
            ui.broadcast(
                EventType::ServerPing,
                json!({
                    "serverId": status.server_id,
                    "reachable": status.reachable,
                    "latencyMs": status.latency_ms,
                    "lastCheckedAt": status.last_checked_at,
                }),
            );
            self.statuses.insert(server.id.clone(), status);
        }
        Ok(())
    }
}
