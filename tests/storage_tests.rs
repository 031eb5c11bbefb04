//! Storage layout behavior: retention pruning and version manifests.

mod common;

use std::time::Duration;

use backup_controller::models::{Version, VersionStatus};
use backup_controller::storage;

#[tokio::test]
async fn retention_prunes_oldest_completed_versions() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;

    for day in 1..=5 {
        ctx.insert_version(&job, &format!("2026-01-0{}_00-00-00", day), true)
            .await;
    }
    // A failed attempt in the middle is not retention's business.
    let failed = ctx
        .insert_version(&job, "2026-01-06_00-00-00", false)
        .await;
    Version::mark_failed(&ctx.pool, &failed.id).await.unwrap();

    let pruned = storage::prune_versions(&ctx.pool, &job.id, 3).await.unwrap();
    assert_eq!(pruned, 2);

    let versions = Version::find_by_job(&ctx.pool, &job.id).await.unwrap();
    let completed: Vec<_> = versions
        .iter()
        .filter(|v| v.status == VersionStatus::Completed)
        .collect();
    assert_eq!(completed.len(), 3);
    // Newest three survive.
    assert_eq!(completed[0].version_timestamp, "2026-01-05_00-00-00");
    assert_eq!(completed[2].version_timestamp, "2026-01-03_00-00-00");
    // The failed row is untouched.
    assert!(versions.iter().any(|v| v.status == VersionStatus::Failed));

    // Filesystem cleanup is async and best-effort.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let on_disk = std::fs::read_dir(
        std::path::Path::new(&job.local_path).join("versions"),
    )
    .unwrap()
    .count();
    assert_eq!(on_disk, 4); // 3 completed + 1 failed
}

#[tokio::test]
async fn retention_is_satisfied_below_the_limit() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;
    ctx.insert_version(&job, "2026-01-01_00-00-00", true).await;

    let pruned = storage::prune_versions(&ctx.pool, &job.id, 7).await.unwrap();
    assert_eq!(pruned, 0);
    assert_eq!(
        Version::find_by_job(&ctx.pool, &job.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn version_meta_mirrors_the_row() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;
    let version = ctx.insert_version(&job, "2026-01-01_00-00-00", true).await;

    storage::write_version_meta(&version).await.unwrap();

    let meta: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(
            std::path::Path::new(&version.local_path).join(storage::VERSION_META_FILE),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(meta["version_id"], version.id.as_str());
    assert_eq!(meta["timestamp"], "2026-01-01_00-00-00");
    assert_eq!(meta["bytes_transferred"], version.bytes_transferred);
    assert_eq!(meta["files_transferred"], version.files_transferred);
    assert_eq!(meta["status"], "completed");
}

#[tokio::test]
async fn local_path_allocation_is_collision_free_across_jobs() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("Web 01", "10.0.0.5").await;
    let first = ctx.insert_job(&server, "Daily Sync", &["/etc"]).await;
    let second = ctx.insert_job(&server, "Daily sync", &["/var"]).await;

    let root = ctx.storage_root.path().to_string_lossy();
    assert_eq!(first.local_path, format!("{}/web-01/daily-sync", root));
    assert_eq!(second.local_path, format!("{}/web-01/daily-sync-2", root));
}
