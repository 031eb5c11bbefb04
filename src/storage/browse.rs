//! Confined directory listing and disk usage for the storage UI.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use super::{confine, JOB_META_FILE, VERSION_META_FILE};
use crate::error::{AppError, Result};

/// One entry of a directory listing under the backup tree.
#[derive(Debug, Serialize, ToSchema)]
pub struct DirEntry {
    pub name: String,
    /// Path relative to the browse root, usable as the next `path` query
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub size: u64,
    #[serde(rename = "modifiedAt")]
    pub modified_at: String,
    /// Parsed `.backup-meta.json` when the entry is a job directory
    #[serde(rename = "backupMeta", skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub backup_meta: Option<serde_json::Value>,
}

/// List a directory confined to `root`. Directories sort before files,
/// case-insensitively; the manifest files themselves are hidden.
pub fn list_directory(root: &str, sub_path: &str) -> Result<Vec<DirEntry>> {
    let resolved = confine(root, sub_path)?;

    let mut entries = Vec::new();
    let read_dir = std::fs::read_dir(&resolved)
        .map_err(|e| AppError::Storage(format!("Failed to read directory: {}", e)))?;

    for entry in read_dir.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == JOB_META_FILE || name == VERSION_META_FILE {
            continue;
        }

        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };
        let entry_type = if file_type.is_dir() {
            "directory"
        } else if file_type.is_symlink() {
            "symlink"
        } else {
            "file"
        };

        let (size, modified_at) = match entry.metadata() {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .ok()
                    .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                    .unwrap_or_default();
                (meta.len(), modified)
            }
            Err(_) => (0, String::new()),
        };

        let backup_meta = if entry_type == "directory" {
            std::fs::read_to_string(entry.path().join(JOB_META_FILE))
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
        } else {
            None
        };

        entries.push(DirEntry {
            name,
            path: format!("{}/{}", sub_path.trim_end_matches('/'), entry.file_name().to_string_lossy()),
            entry_type: entry_type.into(),
            size,
            modified_at,
            backup_meta,
        });
    }

    entries.sort_by(|a, b| {
        let a_dir = a.entry_type == "directory";
        let b_dir = b.entry_type == "directory";
        match (a_dir, b_dir) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        }
    });

    Ok(entries)
}

/// Disk usage of the filesystem holding the backup root, in bytes.
#[derive(Debug, Serialize, ToSchema)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    #[serde(rename = "usedPercent")]
    pub used_percent: u64,
}

/// Query disk usage via `df -B1`; the backup root may sit on any mount.
pub fn disk_usage(backup_root: &str) -> Result<DiskUsage> {
    let output = std::process::Command::new("df")
        .args(["-B1", backup_root])
        .output()
        .map_err(|e| AppError::Storage(format!("df failed to run: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_df_output(&stdout)
        .ok_or_else(|| AppError::Storage("Unexpected df output".into()))
}

fn parse_df_output(stdout: &str) -> Option<DiskUsage> {
    let line = stdout.trim().lines().nth(1)?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    let total: u64 = parts.get(1)?.parse().ok()?;
    let used: u64 = parts.get(2)?.parse().ok()?;
    let available: u64 = parts.get(3)?.parse().ok()?;
    let used_percent = if total > 0 { used * 100 / total } else { 0 };
    Some(DiskUsage {
        total,
        used,
        available,
        used_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_df_extracts_fields() {
        let out = "Filesystem 1B-blocks Used Available Use% Mounted on\n\
                   /dev/sda1 1000 250 750 25% /srv\n";
        let usage = parse_df_output(out).unwrap();
        assert_eq!(usage.total, 1000);
        assert_eq!(usage.used, 250);
        assert_eq!(usage.available, 750);
        assert_eq!(usage.used_percent, 25);
    }

    #[test]
    fn parse_df_rejects_garbage() {
        assert!(parse_df_output("nope").is_none());
    }

    #[test]
    fn listing_sorts_directories_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zzz.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("aaa")).unwrap();
        std::fs::create_dir(dir.path().join("bbb")).unwrap();
        std::fs::write(dir.path().join(JOB_META_FILE), b"{}").unwrap();

        let entries = list_directory(&dir.path().to_string_lossy(), "/").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["aaa", "bbb", "zzz.txt"]);
    }
}
