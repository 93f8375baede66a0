//! Console data model: runs, log entries, and the persisted console layout.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Per-layer progress, merged (never replaced) on each update.
pub type LayerStatus = BTreeMap<String, String>;

// ============================================================================
// RunStatus
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Pending,
    Running,
    #[serde(alias = "completed")]
    Success,
    #[serde(alias = "failed")]
    Error,
    Unknown,
}

impl RunStatus {
    /// Map a backend status string onto the console state machine.
    pub fn from_backend(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "queued" => RunStatus::Queued,
            "pending" => RunStatus::Pending,
            "running" | "started" | "in_progress" | "processing" => RunStatus::Running,
            "completed" | "complete" | "success" | "succeeded" | "done" => RunStatus::Success,
            "failed" | "error" | "cancelled" | "canceled" => RunStatus::Error,
            _ => RunStatus::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Error)
    }

    /// Statuses that need a poller attached.
    pub fn is_live(self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Pending | RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// LogEntry
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Success,
    Debug,
}

/// One normalized log line. Index is positional within its run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub level: LogLevel,
    pub text: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub cost: f64,
    /// Server-assigned position in the run's log stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub metadata: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            text: text.into(),
            backend: None,
            tier: None,
            cost: 0.0,
            index: None,
            metadata: None,
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>, cost: f64) -> Self {
        self.backend = Some(backend.into());
        self.cost = cost;
        self
    }
}

// ============================================================================
// Runs
// ============================================================================

/// Caller-supplied description of a run at start time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub action: String,
}

impl RunMeta {
    pub fn new(title: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            job_id: None,
            title: title.into(),
            action: action.into(),
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Serializable run record. Never holds a live poller reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub action: String,
    pub status: RunStatus,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub layer_status: LayerStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    /// Next server index to request when the stream is resumed after a reload.
    #[serde(default)]
    pub log_cursor: u64,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, meta: RunMeta, status: RunStatus, title_max: usize) -> Self {
        let run_id = run_id.into();
        let title = if meta.title.trim().is_empty() {
            run_id.clone()
        } else {
            truncate_title(&meta.title, title_max)
        };
        Self {
            run_id,
            job_id: meta.job_id,
            title,
            action: meta.action,
            status,
            logs: Vec::new(),
            layer_status: LayerStatus::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            log_cursor: 0,
        }
    }

    /// Append a log, trimming the oldest entries beyond `max_logs`.
    /// Returns the number of entries evicted.
    pub fn push_log(&mut self, entry: LogEntry, max_logs: usize) -> usize {
        if let Some(index) = entry.index {
            self.log_cursor = self.log_cursor.max(index.saturating_add(1));
        }
        self.logs.push(entry);
        self.trim_logs(max_logs)
    }

    pub fn trim_logs(&mut self, max_logs: usize) -> usize {
        if self.logs.len() > max_logs {
            let trim = self.logs.len() - max_logs;
            self.logs.drain(0..trim);
            trim
        } else {
            0
        }
    }

    /// Reset the record for a fresh attempt that reuses the same id.
    pub fn restart(&mut self) {
        self.status = RunStatus::Running;
        self.logs.clear();
        self.layer_status.clear();
        self.started_at = Utc::now();
        self.completed_at = None;
        self.error = None;
        self.log_cursor = 0;
    }
}

/// Truncate a title to at most `max` characters, marking the cut with `...`.
pub fn truncate_title(title: &str, max: usize) -> String {
    let title = title.trim();
    if title.chars().count() <= max {
        return title.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = title.chars().take(keep).collect();
    out.push_str("...");
    out
}

// ============================================================================
// Persisted console layout
// ============================================================================

/// Everything the console persists to session storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleState {
    #[serde(default)]
    pub expanded: bool,
    #[serde(default)]
    pub active_run_id: Option<String>,
    #[serde(default)]
    pub runs: HashMap<String, RunRecord>,
    #[serde(default)]
    pub run_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<u32>,
}

impl ConsoleState {
    /// Runs in display order.
    pub fn ordered_runs(&self) -> Vec<&RunRecord> {
        self.run_order.iter().filter_map(|id| self.runs.get(id)).collect()
    }

    /// Remove a run from the map, the order and the active selection together.
    pub fn remove_run(&mut self, run_id: &str) -> Option<RunRecord> {
        let removed = self.runs.remove(run_id);
        self.run_order.retain(|id| id != run_id);
        if self.active_run_id.as_deref() == Some(run_id) {
            self.active_run_id = self.run_order.last().cloned();
        }
        removed
    }
}
