//! Daily file-level snapshot of the SQLite database.
//!
//! Runs once at startup: copies the database file into a rotating directory,
//! one snapshot per calendar day, keeping the seven most recent. A restored
//! snapshot is the recovery path when the live file is corrupt.

use std::path::Path;

use crate::error::Result;

const MAX_SNAPSHOTS: usize = 7;
const SNAPSHOT_PREFIX: &str = "backup-server-";

pub fn snapshot_database(db_path: &Path, data_dir: &Path) -> Result<()> {
    let snapshot_dir = data_dir.join("backups");
    std::fs::create_dir_all(&snapshot_dir)?;

    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    let snapshot_name = format!("{}{}.db", SNAPSHOT_PREFIX, today);
    let snapshot_path = snapshot_dir.join(&snapshot_name);

    if snapshot_path.exists() {
        tracing::info!("Today's database snapshot already exists, skipping");
        return Ok(());
    }

    std::fs::copy(db_path, &snapshot_path)?;
    tracing::info!(snapshot = %snapshot_name, "Created database snapshot");

    rotate_snapshots(&snapshot_dir)?;
    Ok(())
}

fn rotate_snapshots(snapshot_dir: &Path) -> Result<()> {
    let mut snapshots: Vec<_> = std::fs::read_dir(snapshot_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with(SNAPSHOT_PREFIX)
        })
        .collect();

    // Newest first; the date is embedded in the name so the names sort.
    snapshots.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    for old in snapshots.into_iter().skip(MAX_SNAPSHOTS) {
        let _ = std::fs::remove_file(old.path());
        tracing::info!(
            snapshot = %old.file_name().to_string_lossy(),
            "Removed old database snapshot"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_idempotent_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("backup-server.db");
        std::fs::write(&db_path, b"db-bytes").unwrap();

        snapshot_database(&db_path, dir.path()).unwrap();
        snapshot_database(&db_path, dir.path()).unwrap();

        let count = std::fs::read_dir(dir.path().join("backups")).unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn rotation_keeps_seven_newest() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_dir = dir.path().join("backups");
        std::fs::create_dir_all(&snapshot_dir).unwrap();
        for day in 1..=9 {
            std::fs::write(
                snapshot_dir.join(format!("{}2026-01-{:02}.db", SNAPSHOT_PREFIX, day)),
                b"x",
            )
            .unwrap();
        }

        rotate_snapshots(&snapshot_dir).unwrap();

        let mut names: Vec<_> = std::fs::read_dir(&snapshot_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names.len(), 7);
        assert_eq!(names[0], format!("{}2026-01-03.db", SNAPSHOT_PREFIX));
    }
}
