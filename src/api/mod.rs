//! API module - HTTP handlers, shared state, route table.

pub mod handlers;
pub mod openapi;
pub mod routes;

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::services::{Orchestrator, PingService, SchedulerService};
use crate::ws::{AgentRegistry, UiBroadcaster};

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub db: SqlitePool,
    pub ui: UiBroadcaster,
    pub agents: Arc<AgentRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<SchedulerService>,
    pub ping: Arc<PingService>,
}

impl AppState {
    pub fn new(config: Config, db: SqlitePool) -> Self {
        let ui = UiBroadcaster::new();
        let agents = Arc::new(AgentRegistry::new());
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            &config,
            ui.clone(),
            agents.clone(),
        ));
        let scheduler = Arc::new(SchedulerService::new(db.clone(), orchestrator.clone()));
        Self {
            config,
            db,
            ui,
            agents,
            orchestrator,
            scheduler,
            ping: Arc::new(PingService::new()),
        }
    }
}

pub type SharedState = Arc<AppState>;
