//! Graceful-shutdown controller.
//!
//! Teardown is ordered so nothing schedules new work into a layer that is
//! already gone: scheduler, ping timer, running jobs and agent sockets, UI
//! sockets, then the database. A watchdog forces exit if any stage hangs.

use std::time::Duration;
use tokio::signal;

use crate::api::SharedState;

/// Hard cap on the whole teardown sequence.
const WATCHDOG: Duration = Duration::from_secs(8);
/// How long to wait for in-flight runs to seal their versions.
const RUN_DRAIN: Duration = Duration::from_secs(3);

/// Resolves on SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// Run the ordered teardown, bounded by the watchdog.
pub async fn teardown(state: &SharedState) {
    match tokio::time::timeout(WATCHDOG, ordered_teardown(state)).await {
        Ok(()) => tracing::info!("Teardown complete"),
        Err(_) => {
            tracing::error!("Teardown watchdog expired, forcing exit");
            std::process::exit(1);
        }
    }
}

async fn ordered_teardown(state: &SharedState) {
    // 1. No new scheduled runs.
    state.scheduler.shutdown();

    // 2. Stop the ping timer.
    state.ping.shutdown();

    // 3. Abort running jobs (each run seals its version as failed) and
    //    close agent sockets once they have had a moment to finalize.
    state.orchestrator.cancel_all();
    let drain_deadline = tokio::time::Instant::now() + RUN_DRAIN;
    while !state.orchestrator.running_job_ids().is_empty()
        && tokio::time::Instant::now() < drain_deadline
    {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    state.agents.close_all();

    // 4. Close UI sockets.
    state.ui.close_all();

    // 5. Flush and close the database.
    state.db.close().await;
}
