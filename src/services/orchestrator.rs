//! Backup orchestrator: per-job run lifecycle.
//!
//! A run is one pass of the state machine: reserve the job slot, create the
//! log and version rows, create the snapshot directory, command the agent,
//! relay throttled progress, and wait for a terminal signal: agent
//! completion, agent failure, cancellation, socket loss, or the wall-clock
//! cap. The orchestrator is the only component that converts transient
//! errors into job-terminal states.
//!
//! Concurrency is bounded by three fair semaphores acquired in order:
//! a single-permit job semaphore (at most one job runs controller-wide),
//! then per remote path a global upload slot and a per-server upload slot.
//! Release happens in exact reverse order.

use dashmap::DashMap;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{Job, JobLog, JobStatus, LogStatus, Server, Version};
use crate::services::progress::{ProgressFrame, ProgressTracker};
use crate::storage;
use crate::ws::{AgentRegistry, EventType, UiBroadcaster};

/// Wall-clock cap on a single run, measured from job-slot acquisition.
const RUN_TIMEOUT: Duration = Duration::from_secs(3600);
/// Cadence of the cancellation / connection poll.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Result of a `start` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The job id was already in the running set; absorbed as a no-op.
    AlreadyRunning,
}

/// Terminal signal delivered by the registry handlers.
enum Terminal {
    Completed(CompletionStats),
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default)]
struct CompletionStats {
    total_bytes: i64,
    total_files: i64,
    transferred_bytes: i64,
    transferred_files: i64,
}

/// How a run ended, before finalization.
enum Outcome {
    Completed(CompletionStats),
    Failed(String),
    Cancelled,
}

pub struct Orchestrator {
    db: SqlitePool,
    ui: UiBroadcaster,
    agents: Arc<AgentRegistry>,
    running: DashMap<String, CancellationToken>,
    job_slot: Arc<Semaphore>,
    global_slots: Arc<Semaphore>,
    server_slots: DashMap<String, Arc<Semaphore>>,
    global_limit: usize,
    per_server_limit: usize,
}

impl Orchestrator {
    pub fn new(
        db: SqlitePool,
        config: &Config,
        ui: UiBroadcaster,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            db,
            ui,
            agents,
            running: DashMap::new(),
            job_slot: Arc::new(Semaphore::new(1)),
            global_slots: Arc::new(Semaphore::new(config.max_concurrent_global)),
            server_slots: DashMap::new(),
            global_limit: config.max_concurrent_global,
            per_server_limit: config.max_concurrent_per_server,
        }
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.contains_key(job_id)
    }

    pub fn running_job_ids(&self) -> Vec<String> {
        self.running.iter().map(|e| e.key().clone()).collect()
    }

    fn server_slots(&self, server_id: &str) -> Arc<Semaphore> {
        self.server_slots
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_server_limit)))
            .clone()
    }

    /// Validate preconditions and launch a run in the background. Returns
    /// `AlreadyRunning` without side effects when the job is in flight
    /// (absorbs scheduler races).
    pub async fn start(self: &Arc<Self>, job_id: &str, full: bool) -> Result<StartOutcome> {
        let job = Job::find_by_id(&self.db, job_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Job not found".into()))?;
        let server = Server::find_by_id(&self.db, &job.server_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Server not found".into()))?;

        let remote_paths = job.remote_path_list();
        if remote_paths.is_empty() {
            return Err(AppError::Unprocessable(
                "Job has no remote paths configured".into(),
            ));
        }
        if !self.agents.is_connected(&server.id) {
            return Err(AppError::AgentUnavailable("Agent is not connected".into()));
        }

        let token = CancellationToken::new();
        match self.running.entry(job_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Ok(StartOutcome::AlreadyRunning)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(token.clone());
            }
        }

        let orchestrator = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let result = orchestrator
                .run(job, server, remote_paths, full, token)
                .await;
            orchestrator.running.remove(&job_id);
            if let Err(e) = result {
                tracing::error!(job_id = %job_id, error = %e, "Backup run errored");
            }
        });

        Ok(StartOutcome::Started)
    }

    /// Cancel a running job: command the agent to stop and signal the run
    /// task, which seals the version and emits the terminal events. The
    /// agent's acknowledgement is not awaited; a late `backup:completed`
    /// is discarded because the run is already terminal.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let token = self
            .running
            .get(job_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound("Job is not running".into()))?;

        if let Some(job) = Job::find_by_id(&self.db, job_id).await? {
            self.agents
                .send(&job.server_id, "backup:cancel", json!({ "job_id": job_id }));
        }
        tracing::info!(job_id, "Cancelling backup job");
        token.cancel();
        Ok(())
    }

    /// Abort every in-flight run (shutdown path). Each run task seals its
    /// version as failed on the way out.
    pub fn cancel_all(&self) {
        for entry in self.running.iter() {
            self.agents_send_cancel(entry.key());
            entry.value().cancel();
        }
    }

    fn agents_send_cancel(&self, job_id: &str) {
        // The server id lookup is best-effort here; the token cancel is what
        // actually tears the run down.
        let db = self.db.clone();
        let agents = self.agents.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if let Ok(Some(job)) = Job::find_by_id(&db, &job_id).await {
                agents.send(&job.server_id, "backup:cancel", json!({ "job_id": job_id }));
            }
        });
    }

    async fn run(
        &self,
        job: Job,
        server: Server,
        remote_paths: Vec<String>,
        full: bool,
        token: CancellationToken,
    ) -> Result<()> {
        // Job slot first: at most one job runs at any time. A cancel that
        // lands while we are still queued aborts before any side effects.
        let job_permit = tokio::select! {
            _ = token.cancelled() => {
                Job::update_status(&self.db, &job.id, JobStatus::Cancelled).await?;
                self.ui
                    .broadcast(EventType::BackupCancelled, json!({ "jobId": job.id }));
                self.emit_job_updated(&job.id, JobStatus::Cancelled);
                return Ok(());
            }
            permit = self.job_slot.clone().acquire_owned() => {
                permit.map_err(|_| AppError::Internal("Job semaphore closed".into()))?
            }
        };
        let acquired_at = Instant::now();

        let started_at = chrono::Utc::now();
        Job::update_status(&self.db, &job.id, JobStatus::Running).await?;
        Job::set_last_run(&self.db, &job.id, started_at).await?;
        let log = JobLog::create(&self.db, &job.id).await?;

        self.ui.broadcast(
            EventType::BackupStarted,
            json!({
                "jobId": job.id,
                "serverId": server.id,
                "remotePaths": remote_paths,
            }),
        );
        self.emit_job_updated(&job.id, JobStatus::Running);
        self.ui.broadcast(
            EventType::BackupProgress,
            serde_json::to_value(ProgressFrame::initial(&job.id))?,
        );

        // Snapshot directory is created eagerly so uploads can target it.
        let timestamp = storage::version_timestamp(started_at);
        let version_path = storage::create_version_dir(&job.local_path, &timestamp).await?;
        storage::write_job_meta(&job, &server).await?;

        let version = Version::create(
            &self.db,
            &job.id,
            &log.id,
            &timestamp,
            &version_path.to_string_lossy(),
        )
        .await?;
        self.ui.broadcast(
            EventType::VersionCreated,
            json!({ "jobId": job.id, "versionId": version.id, "timestamp": timestamp }),
        );

        // Upload slots, one (global, per-server) pair per remote path,
        // clamped to the semaphore capacities so a wide job cannot wedge
        // itself waiting for more permits than exist.
        let server_slots = self.server_slots(&server.id);
        let slot_count = remote_paths
            .len()
            .min(self.per_server_limit)
            .min(self.global_limit)
            .max(1);
        let mut slot_permits: Vec<(OwnedSemaphorePermit, OwnedSemaphorePermit)> = Vec::new();
        for _ in 0..slot_count {
            let global = tokio::select! {
                _ = token.cancelled() => {
                    drop(slot_permits);
                    drop(job_permit);
                    return self.finalize(&job, &log.id, &version, Outcome::Cancelled).await;
                }
                permit = self.global_slots.clone().acquire_owned() => {
                    permit.map_err(|_| AppError::Internal("Global semaphore closed".into()))?
                }
            };
            let per_server = tokio::select! {
                _ = token.cancelled() => {
                    drop(global);
                    drop(slot_permits);
                    drop(job_permit);
                    return self.finalize(&job, &log.id, &version, Outcome::Cancelled).await;
                }
                permit = server_slots.clone().acquire_owned() => {
                    permit.map_err(|_| AppError::Internal("Server semaphore closed".into()))?
                }
            };
            // Tuple order matters: the per-server permit drops before the
            // global one, keeping release the exact reverse of acquisition.
            slot_permits.push((per_server, global));
        }

        // Link-dest hint: the previous completed snapshot, unless this is a
        // forced full backup.
        let link_dest = if full {
            None
        } else {
            Version::find_latest_completed(&self.db, &job.id)
                .await?
                .map(|v| v.local_path)
        };

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Terminal>();
        let handler_guards = self.install_handlers(&job.id, done_tx);

        let mut payload = json!({
            "job_id": job.id,
            "paths": remote_paths,
            "full": full,
        });
        if let Some(ref dest) = link_dest {
            payload["link_dest"] = json!(dest);
        }

        let outcome = if !self.agents.send(&server.id, "backup:start", payload) {
            Outcome::Failed("Failed to send backup command to agent".into())
        } else {
            tracing::info!(
                job_id = %job.id,
                server_id = %server.id,
                paths = remote_paths.len(),
                full,
                link_dest = link_dest.is_some(),
                "Backup run dispatched to agent"
            );
            self.await_terminal(&server.id, &token, &mut done_rx, acquired_at)
                .await
        };

        for guard in &handler_guards {
            self.agents.off(guard);
        }
        // Release order: per-server, then global (tuple field order), then
        // the job slot.
        drop(slot_permits);
        drop(job_permit);

        self.finalize(&job, &log.id, &version, outcome).await
    }

    /// Wait for a terminal signal: agent completion or failure, cancellation,
    /// socket loss (polled once per second), or the 1-hour cap.
    async fn await_terminal(
        &self,
        server_id: &str,
        token: &CancellationToken,
        done_rx: &mut mpsc::UnboundedReceiver<Terminal>,
        acquired_at: Instant,
    ) -> Outcome {
        let deadline = tokio::time::sleep_until((acquired_at + RUN_TIMEOUT).into());
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Outcome::Failed("Backup timed out after 1 hour".into());
                }
                _ = token.cancelled() => {
                    return Outcome::Cancelled;
                }
                msg = done_rx.recv() => {
                    return match msg {
                        Some(Terminal::Completed(stats)) => Outcome::Completed(stats),
                        Some(Terminal::Failed(error)) => Outcome::Failed(error),
                        None => Outcome::Failed("Terminal event channel closed".into()),
                    };
                }
                _ = poll.tick() => {
                    if !self.agents.is_connected(server_id) {
                        return Outcome::Failed("agent disconnected during backup".into());
                    }
                }
            }
        }
    }

    /// Subscribe to the agent's asynchronous events for this run. Progress
    /// frames are throttled and forwarded to the UI; terminal frames feed
    /// the completion channel.
    fn install_handlers(
        &self,
        job_id: &str,
        done_tx: mpsc::UnboundedSender<Terminal>,
    ) -> Vec<crate::ws::agent::HandlerId> {
        let tracker = Arc::new(Mutex::new(ProgressTracker::new(job_id)));

        let ui = self.ui.clone();
        let jid = job_id.to_string();
        let progress = self.agents.on(
            "backup:progress",
            Arc::new(move |payload: &Value| {
                if payload.get("job_id").and_then(|v| v.as_str()) != Some(jid.as_str()) {
                    return;
                }
                let Ok(mut tracker) = tracker.try_lock() else {
                    return;
                };
                if let Some(frame) = tracker.accept(payload, Instant::now()) {
                    if let Ok(value) = serde_json::to_value(&frame) {
                        ui.broadcast(EventType::BackupProgress, value);
                    }
                }
            }),
        );

        let jid = job_id.to_string();
        let tx = done_tx.clone();
        let completed = self.agents.on(
            "backup:completed",
            Arc::new(move |payload: &Value| {
                if payload.get("job_id").and_then(|v| v.as_str()) != Some(jid.as_str()) {
                    return;
                }
                let total_bytes = int_or(payload, "total_bytes", 0);
                let total_files = int_or(payload, "total_files", 0);
                let stats = CompletionStats {
                    total_bytes,
                    total_files,
                    transferred_bytes: int_or(payload, "transferred_bytes", total_bytes),
                    transferred_files: int_or(payload, "transferred_files", total_files),
                };
                let _ = tx.send(Terminal::Completed(stats));
            }),
        );

        let jid = job_id.to_string();
        let failed = self.agents.on(
            "backup:failed",
            Arc::new(move |payload: &Value| {
                if payload.get("job_id").and_then(|v| v.as_str()) != Some(jid.as_str()) {
                    return;
                }
                let error = payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Backup failed on agent")
                    .to_string();
                let _ = done_tx.send(Terminal::Failed(error));
            }),
        );

        vec![progress, completed, failed]
    }

    /// Seal the version, log, and job; promote the snapshot and prune on
    /// success; emit the terminal UI events.
    async fn finalize(
        &self,
        job: &Job,
        log_id: &str,
        version: &Version,
        outcome: Outcome,
    ) -> Result<()> {
        match outcome {
            Outcome::Completed(stats) => {
                Version::mark_completed(
                    &self.db,
                    &version.id,
                    stats.transferred_bytes,
                    stats.transferred_files,
                    stats.total_bytes,
                    stats.total_files,
                )
                .await?;
                JobLog::finish(
                    &self.db,
                    log_id,
                    LogStatus::Completed,
                    stats.transferred_bytes,
                    stats.transferred_files,
                    None,
                )
                .await?;
                Job::update_status(&self.db, &job.id, JobStatus::Completed).await?;

                if let Some(sealed) = Version::find_by_id(&self.db, &version.id).await? {
                    if let Err(e) = storage::write_version_meta(&sealed).await {
                        tracing::warn!(version_id = %version.id, error = %e, "Failed to write version manifest");
                    }
                }
                if let Err(e) =
                    storage::update_current_link(&job.local_path, &version.version_timestamp)
                        .await
                {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to update current link");
                }
                if let Err(e) =
                    storage::prune_versions(&self.db, &job.id, job.retention_count).await
                {
                    tracing::warn!(job_id = %job.id, error = %e, "Retention pruning failed");
                }

                self.ui.broadcast(
                    EventType::BackupCompleted,
                    json!({
                        "jobId": job.id,
                        "totalBytes": stats.total_bytes,
                        "totalFiles": stats.total_files,
                        "transferredBytes": stats.transferred_bytes,
                        "transferredFiles": stats.transferred_files,
                    }),
                );
                self.emit_job_updated(&job.id, JobStatus::Completed);
                self.ui.broadcast(
                    EventType::BackupProgress,
                    serde_json::to_value(ProgressFrame::terminal(
                        &job.id,
                        stats.total_bytes,
                        stats.total_files,
                    ))?,
                );
                tracing::info!(
                    job_id = %job.id,
                    total_bytes = stats.total_bytes,
                    total_files = stats.total_files,
                    "Backup job completed"
                );
                Ok(())
            }
            Outcome::Failed(error) => {
                Version::mark_failed(&self.db, &version.id).await?;
                JobLog::finish(&self.db, log_id, LogStatus::Failed, 0, 0, Some(&error)).await?;
                Job::update_status(&self.db, &job.id, JobStatus::Failed).await?;

                self.ui.broadcast(
                    EventType::BackupFailed,
                    json!({ "jobId": job.id, "error": error }),
                );
                self.emit_job_updated(&job.id, JobStatus::Failed);
                tracing::error!(job_id = %job.id, error = %error, "Backup job failed");
                Ok(())
            }
            Outcome::Cancelled => {
                Version::mark_failed(&self.db, &version.id).await?;
                JobLog::finish(
                    &self.db,
                    log_id,
                    LogStatus::Cancelled,
                    0,
                    0,
                    Some("Job cancelled by user"),
                )
                .await?;
                Job::update_status(&self.db, &job.id, JobStatus::Cancelled).await?;

                self.ui
                    .broadcast(EventType::BackupCancelled, json!({ "jobId": job.id }));
                self.emit_job_updated(&job.id, JobStatus::Cancelled);
                tracing::info!(job_id = %job.id, "Backup job cancelled");
                Ok(())
            }
        }
    }

    fn emit_job_updated(&self, job_id: &str, status: JobStatus) {
        self.ui.broadcast(
            EventType::JobUpdated,
            json!({ "jobId": job_id, "status": status }),
        );
    }
}

fn int_or(payload: &Value, key: &str, default: i64) -> i64 {
    payload.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
}
