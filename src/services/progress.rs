//! Progress aggregation rules for the orchestrator.
//!
//! Raw agent progress frames are noisy: they can arrive far faster than the
//! UI needs, report percentages that jitter backwards while totals are still
//! being discovered, and omit the current file. This module normalizes them:
//! at most one emission per 250 ms per job, percent clamped into [0, 100]
//! and monotonic, speed rendered human-readable.

use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use utoipa::ToSchema;

/// Minimum spacing between emitted progress frames for one job.
pub const THROTTLE: Duration = Duration::from_millis(250);

const FALLBACK_CURRENT_FILE: &str = "Processing...";

/// Normalized progress payload pushed to UI sockets.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressFrame {
    pub job_id: String,
    pub percent: f64,
    pub checked_files: i64,
    pub total_files: i64,
    pub transferred_bytes: i64,
    pub total_bytes: i64,
    pub speed: String,
    pub current_file: String,
}

impl ProgressFrame {
    /// The seed frame emitted when a run starts.
    pub fn initial(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            percent: 0.0,
            checked_files: 0,
            total_files: 0,
            transferred_bytes: 0,
            total_bytes: 0,
            speed: String::new(),
            current_file: "Initializing agent backup...".into(),
        }
    }

    /// The terminal frame emitted after completion.
    pub fn terminal(job_id: &str, total_bytes: i64, total_files: i64) -> Self {
        Self {
            job_id: job_id.to_string(),
            percent: 100.0,
            checked_files: total_files,
            total_files,
            transferred_bytes: total_bytes,
            total_bytes,
            speed: String::new(),
            current_file: "Completed".into(),
        }
    }
}

/// Per-run throttling and monotonicity state.
pub struct ProgressTracker {
    job_id: String,
    last_emit: Option<Instant>,
    percent_floor: f64,
}

impl ProgressTracker {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            last_emit: None,
            percent_floor: 0.0,
        }
    }

    /// Fold one raw agent frame into a UI frame, or `None` while throttled.
    pub fn accept(&mut self, raw: &Value, now: Instant) -> Option<ProgressFrame> {
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < THROTTLE {
                return None;
            }
        }

        let transferred_bytes = int_field(raw, "transferred_bytes");
        let total_bytes = int_field(raw, "total_bytes");
        let checked_files = int_field(raw, "files_processed");
        let total_files = int_field(raw, "total_files");

        let reported = raw.get("percent").and_then(|v| v.as_f64()).unwrap_or_else(|| {
            if total_bytes > 0 {
                transferred_bytes as f64 / total_bytes as f64 * 100.0
            } else {
                0.0
            }
        });
        let percent = reported.clamp(0.0, 100.0).max(self.percent_floor);
        self.percent_floor = percent;
        self.last_emit = Some(now);

        let speed = raw
            .get("bytes_per_second")
            .and_then(|v| v.as_u64())
            .map(format_speed)
            .unwrap_or_default();

        let current_file = raw
            .get("current_file")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(FALLBACK_CURRENT_FILE)
            .to_string();

        Some(ProgressFrame {
            job_id: self.job_id.clone(),
            percent,
            checked_files,
            total_files,
            transferred_bytes,
            total_bytes,
            speed,
            current_file,
        })
    }
}

fn int_field(raw: &Value, key: &str) -> i64 {
    raw.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
}

/// Render a throughput as `N.NN UNIT/s` with binary units, B through TiB.
pub fn format_speed(bytes_per_second: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes_per_second as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}/s", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn speed_uses_binary_units() {
        assert_eq!(format_speed(0), "0.00 B/s");
        assert_eq!(format_speed(512), "512.00 B/s");
        assert_eq!(format_speed(1024), "1.00 KiB/s");
        assert_eq!(format_speed(1536), "1.50 KiB/s");
        assert_eq!(format_speed(5 * 1024 * 1024), "5.00 MiB/s");
        assert_eq!(format_speed(3 * 1024 * 1024 * 1024), "3.00 GiB/s");
        assert_eq!(format_speed(2 * 1024 * 1024 * 1024 * 1024), "2.00 TiB/s");
    }

    #[test]
    fn throttles_to_one_emission_per_window() {
        let mut tracker = ProgressTracker::new("j1");
        let t0 = Instant::now();
        let frame = json!({ "percent": 10.0 });

        assert!(tracker.accept(&frame, t0).is_some());
        assert!(tracker.accept(&frame, t0 + Duration::from_millis(100)).is_none());
        assert!(tracker.accept(&frame, t0 + Duration::from_millis(251)).is_some());
    }

    #[test]
    fn percent_is_clamped_and_monotonic() {
        let mut tracker = ProgressTracker::new("j1");
        let t0 = Instant::now();

        let f = tracker.accept(&json!({ "percent": 150.0 }), t0).unwrap();
        assert_eq!(f.percent, 100.0);

        let f = tracker
            .accept(&json!({ "percent": 40.0 }), t0 + Duration::from_secs(1))
            .unwrap();
        assert_eq!(f.percent, 100.0); // never decreases

        let mut tracker = ProgressTracker::new("j2");
        let f = tracker.accept(&json!({ "percent": -5.0 }), t0).unwrap();
        assert_eq!(f.percent, 0.0);
        let f = tracker
            .accept(&json!({ "percent": 30.0 }), t0 + Duration::from_secs(1))
            .unwrap();
        assert_eq!(f.percent, 30.0);
        let f = tracker
            .accept(&json!({ "percent": 20.0 }), t0 + Duration::from_secs(2))
            .unwrap();
        assert_eq!(f.percent, 30.0);
    }

    #[test]
    fn percent_derived_from_bytes_when_missing() {
        let mut tracker = ProgressTracker::new("j1");
        let f = tracker
            .accept(
                &json!({ "transferred_bytes": 25, "total_bytes": 100 }),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(f.percent, 25.0);
    }

    #[test]
    fn current_file_falls_back() {
        let mut tracker = ProgressTracker::new("j1");
        let f = tracker.accept(&json!({ "percent": 1.0 }), Instant::now()).unwrap();
        assert_eq!(f.current_file, "Processing...");

        let mut tracker = ProgressTracker::new("j1");
        let f = tracker
            .accept(
                &json!({ "percent": 1.0, "current_file": "/etc/hosts" }),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(f.current_file, "/etc/hosts");
    }

    #[test]
    fn frames_serialize_camel_case() {
        let frame = ProgressFrame::initial("j1");
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("jobId").is_some());
        assert!(json.get("currentFile").is_some());
        assert!(json.get("job_id").is_none());
    }
}
