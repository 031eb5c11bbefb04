//! Cron scheduler for backup jobs.
//!
//! Each enabled job with a cron expression gets a schedule entry holding its
//! next fire time; a background ticker fires due entries. The orchestrator's
//! running set is consulted on every fire, so a slow backup never stacks a
//! second run of the same job.

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::Job;
use crate::services::orchestrator::{Orchestrator, StartOutcome};

/// Cadence of the due-schedule check.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

struct ScheduleEntry {
    schedule: Schedule,
    next_run: DateTime<Utc>,
}

pub struct SchedulerService {
    db: SqlitePool,
    orchestrator: Arc<Orchestrator>,
    entries: DashMap<String, ScheduleEntry>,
    stopped: CancellationToken,
}

impl SchedulerService {
    pub fn new(db: SqlitePool, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            db,
            orchestrator,
            entries: DashMap::new(),
            stopped: CancellationToken::new(),
        }
    }

    /// Parse a cron expression. The cron crate expects 7-field expressions
    /// (sec min hour dom month dow year) but users typically write 5-field
    /// (min hour dom month dow); prepend "0 " for seconds in that case.
    pub fn parse_expression(expression: &str) -> Result<Schedule> {
        let normalized = if expression.split_whitespace().count() == 5 {
            format!("0 {}", expression)
        } else {
            expression.to_string()
        };
        Schedule::from_str(&normalized)
            .map_err(|e| AppError::Validation(format!("Invalid cron expression: {}", e)))
    }

    /// Register (or replace) the schedule for a job.
    pub fn schedule(&self, job_id: &str, expression: &str) -> Result<()> {
        let schedule = Self::parse_expression(expression)?;
        let next_run = schedule
            .upcoming(Utc)
            .next()
            .ok_or_else(|| AppError::Validation("Cron expression never fires".into()))?;

        tracing::info!(job_id, cron = expression, next_run = %next_run, "Job scheduled");
        self.entries
            .insert(job_id.to_string(), ScheduleEntry { schedule, next_run });
        Ok(())
    }

    /// Drop the schedule for a job. Idempotent.
    pub fn unschedule(&self, job_id: &str) {
        self.entries.remove(job_id);
    }

    pub fn scheduled_count(&self) -> usize {
        self.entries.len()
    }

    /// Register every enabled job with a cron expression. Invalid
    /// expressions are logged and skipped; startup proceeds.
    pub async fn init_from_db(&self) -> Result<()> {
        let jobs = Job::find_all(&self.db).await?;
        let mut count = 0;
        for job in jobs {
            let Some(expression) = job.cron_schedule.as_deref().filter(|c| !c.is_empty()) else {
                continue;
            };
            if !job.enabled {
                continue;
            }
            match self.schedule(&job.id, expression) {
                Ok(()) => count += 1,
                Err(e) => {
                    tracing::error!(job_id = %job.id, cron = expression, error = %e, "Failed to schedule job");
                }
            }
        }
        tracing::info!(count, "Cron schedules initialized");
        Ok(())
    }

    /// Spawn the ticker task.
    pub fn spawn(self: &Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = scheduler.stopped.cancelled() => break,
                    _ = ticker.tick() => scheduler.fire_due().await,
                }
            }
            tracing::info!("Scheduler stopped");
        });
    }

    /// Unregister all subscriptions and stop the ticker.
    pub fn shutdown(&self) {
        self.stopped.cancel();
        self.entries.clear();
    }

    async fn fire_due(&self) {
        let now = Utc::now();
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().next_run <= now)
            .map(|entry| entry.key().clone())
            .collect();

        for job_id in due {
            if let Some(mut entry) = self.entries.get_mut(&job_id) {
                if let Some(next) = entry.schedule.upcoming(Utc).next() {
                    entry.next_run = next;
                }
            }
            self.fire(&job_id).await;
        }
    }

    async fn fire(&self, job_id: &str) {
        let job = match Job::find_by_id(&self.db, job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                // Job vanished; drop the orphaned schedule.
                self.unschedule(job_id);
                return;
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Scheduled run: job lookup failed");
                return;
            }
        };

        if !job.enabled {
            return;
        }
        if self.orchestrator.is_running(job_id) {
            tracing::warn!(job_id, "Skipping scheduled run: job already running");
            return;
        }

        tracing::info!(job_id, name = %job.name, "Starting scheduled backup");
        match self.orchestrator.start(job_id, false).await {
            Ok(StartOutcome::Started) => {}
            Ok(StartOutcome::AlreadyRunning) => {
                tracing::warn!(job_id, "Scheduled run raced a manual start; skipped");
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Scheduled backup failed to start");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_are_normalized() {
        assert!(SchedulerService::parse_expression("0 3 * * *").is_ok());
        assert!(SchedulerService::parse_expression("0 0 3 * * * *").is_ok());
        assert!(SchedulerService::parse_expression("not a cron").is_err());
    }

    #[tokio::test]
    async fn schedule_replaces_prior_subscription() {
        let db = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let ui = crate::ws::UiBroadcaster::new();
        let agents = Arc::new(crate::ws::AgentRegistry::new());
        let config = crate::config::Config::from_env();
        let orchestrator = Arc::new(Orchestrator::new(db.clone(), &config, ui, agents));
        let scheduler = SchedulerService::new(db, orchestrator);

        scheduler.schedule("j1", "0 3 * * *").unwrap();
        scheduler.schedule("j1", "0 4 * * *").unwrap();
        assert_eq!(scheduler.scheduled_count(), 1);

        scheduler.unschedule("j1");
        scheduler.unschedule("j1"); // idempotent
        assert_eq!(scheduler.scheduled_count(), 0);
    }
}
