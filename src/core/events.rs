//! Append-only JSONL deployment event log.
//!
//! One log per scope (target name, or `deploy` for run-level events) under
//! the configured log directory. Logging failures never fail a deployment.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Deployment event for the JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeployEvent {
    DeployStarted {
        topology: String,
        run_id: String,
        replicar_version: String,
        fingerprint: String,
    },
    TargetStarted {
        target: String,
        instance: String,
        run_id: String,
    },
    ActionSucceeded {
        target: String,
        action: String,
        seq: usize,
        duration_seconds: f64,
    },
    TargetCompleted {
        target: String,
        actions_executed: usize,
        duration_seconds: f64,
    },
    TargetFailed {
        target: String,
        error: String,
    },
    DeployCompleted {
        topology: String,
        run_id: String,
        targets_succeeded: u32,
        targets_failed: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: DeployEvent,
}

/// Event sink; a missing directory disables logging entirely.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    dir: Option<PathBuf>,
}

impl EventLog {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Append one event to the scope's log.
    pub fn append(&self, scope: &str, event: DeployEvent) -> std::io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = event_log_path(dir, scope);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entry = TimestampedEvent {
            ts: now_iso8601(),
            event,
        };
        let json = serde_json::to_string(&entry).map_err(std::io::Error::other)?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }
}

/// Derive the event log path for a scope.
pub fn event_log_path(dir: &Path, scope: &str) -> PathBuf {
    dir.join(scope).join("events.jsonl")
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("d-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Generate an ISO 8601 timestamp without pulling in a calendar crate.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = dur.as_secs();
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let (hours, minutes, seconds) = (time_secs / 3600, (time_secs % 3600) / 60, time_secs % 60);

    let mut year = 1970i64;
    let mut remaining = days as i64;
    loop {
        let year_days = if is_leap(year) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        year += 1;
    }
    let leap = is_leap(year);
    let month_days = [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 0;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md as i64 {
            month = i + 1;
            break;
        }
        remaining -= md as i64;
    }
    let day = remaining + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year, month, day, hours, minutes, seconds
    )
}

fn is_leap(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}
