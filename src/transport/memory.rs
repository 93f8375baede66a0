//! In-process implementation of the log/status protocol.
//!
//! Holds runs and their logs in memory and answers `fetch_logs` exactly like
//! the pipeline backend: entries at or after `since`, the new cursor, the
//! total count, status and layer status. Scripted responses and injected
//! failures take precedence over the natural answer, in FIFO order per run.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppError;

use super::types::{LogsPage, OperationSnapshot, RawLog, WireLog};
use super::LogTransport;

/// Failure shapes the backend can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    ServiceUnavailable,
    NetworkOffline,
    NotFound,
    Http(u16),
}

impl InjectedFailure {
    fn into_error(self, run_id: &str) -> AppError {
        match self {
            InjectedFailure::ServiceUnavailable => AppError::ServiceUnavailable("HTTP 503".into()),
            InjectedFailure::NetworkOffline => AppError::NetworkOffline("connection refused".into()),
            InjectedFailure::NotFound => AppError::NotFound(format!("logs for run {run_id}")),
            InjectedFailure::Http(status) => AppError::Http {
                status,
                message: format!("logs for run {run_id}"),
            },
        }
    }
}

enum Scripted {
    Page(LogsPage),
    Fail(InjectedFailure),
}

struct BackendRun {
    logs: Vec<WireLog>,
    status: String,
    layer_status: BTreeMap<String, serde_json::Value>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    job_title: Option<String>,
    operation: Option<String>,
}

/// One recorded `fetch_logs` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRequest {
    pub run_id: String,
    pub since: u64,
    pub limit: u32,
}

#[derive(Default)]
pub struct InMemoryBackend {
    runs: Mutex<HashMap<String, BackendRun>>,
    scripted: Mutex<HashMap<String, VecDeque<Scripted>>>,
    status_failures: Mutex<HashMap<String, InjectedFailure>>,
    requests: Mutex<Vec<LogRequest>>,
    status_requests: Mutex<Vec<String>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // --------------------------------------------------------------------
    // Backend-side mutation
    // --------------------------------------------------------------------

    pub fn create_run(&self, run_id: &str, job_title: Option<&str>, operation: Option<&str>) {
        lock(&self.runs).insert(
            run_id.to_string(),
            BackendRun {
                logs: Vec::new(),
                status: "running".into(),
                layer_status: BTreeMap::new(),
                error: None,
                started_at: Utc::now(),
                completed_at: None,
                job_title: job_title.map(str::to_string),
                operation: operation.map(str::to_string),
            },
        );
    }

    /// Append a log line. The run is created on demand. Returns its index.
    pub fn push_log(&self, run_id: &str, mut log: WireLog) -> u64 {
        let mut runs = lock(&self.runs);
        let run = runs.entry(run_id.to_string()).or_insert_with(|| BackendRun {
            logs: Vec::new(),
            status: "running".into(),
            layer_status: BTreeMap::new(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            job_title: None,
            operation: None,
        });
        let index = run.logs.len() as u64;
        log.index = Some(index);
        if log.timestamp.is_none() {
            log.timestamp = Some(serde_json::Value::String(Utc::now().to_rfc3339()));
        }
        run.logs.push(log);
        index
    }

    pub fn push_line(&self, run_id: &str, message: impl Into<String>) -> u64 {
        self.push_log(
            run_id,
            WireLog {
                message: message.into(),
                ..Default::default()
            },
        )
    }

    pub fn set_layer(&self, run_id: &str, layer: &str, state: &str) {
        if let Some(run) = lock(&self.runs).get_mut(run_id) {
            run.layer_status
                .insert(layer.to_string(), serde_json::Value::String(state.to_string()));
        }
    }

    pub fn set_status(&self, run_id: &str, status: &str) {
        if let Some(run) = lock(&self.runs).get_mut(run_id) {
            run.status = status.to_string();
        }
    }

    pub fn finish(&self, run_id: &str, status: &str, error: Option<&str>) {
        if let Some(run) = lock(&self.runs).get_mut(run_id) {
            run.status = status.to_string();
            run.error = error.map(str::to_string);
            run.completed_at = Some(Utc::now());
        }
    }

    pub fn remove_run(&self, run_id: &str) {
        lock(&self.runs).remove(run_id);
    }

    // --------------------------------------------------------------------
    // Scripting
    // --------------------------------------------------------------------

    /// Queue an exact page to be returned by the next `fetch_logs` for `run_id`.
    pub fn script_page(&self, run_id: &str, page: LogsPage) {
        lock(&self.scripted)
            .entry(run_id.to_string())
            .or_default()
            .push_back(Scripted::Page(page));
    }

    /// Queue `times` consecutive failures for `run_id`.
    pub fn script_failures(&self, run_id: &str, failure: InjectedFailure, times: usize) {
        let mut scripted = lock(&self.scripted);
        let queue = scripted.entry(run_id.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(Scripted::Fail(failure));
        }
    }

    /// Make every `fetch_status` for `run_id` fail until cleared.
    pub fn fail_status(&self, run_id: &str, failure: Option<InjectedFailure>) {
        let mut failures = lock(&self.status_failures);
        match failure {
            Some(f) => {
                failures.insert(run_id.to_string(), f);
            }
            None => {
                failures.remove(run_id);
            }
        }
    }

    // --------------------------------------------------------------------
    // Inspection
    // --------------------------------------------------------------------

    pub fn requests(&self) -> Vec<LogRequest> {
        lock(&self.requests).clone()
    }

    /// The `since` values requested for one run, in order.
    pub fn sinces(&self, run_id: &str) -> Vec<u64> {
        lock(&self.requests)
            .iter()
            .filter(|r| r.run_id == run_id)
            .map(|r| r.since)
            .collect()
    }

    pub fn status_requests(&self) -> Vec<String> {
        lock(&self.status_requests).clone()
    }

    fn natural_page(&self, run_id: &str, since: u64, limit: u32) -> Result<LogsPage, AppError> {
        let runs = lock(&self.runs);
        let run = runs
            .get(run_id)
            .ok_or_else(|| AppError::NotFound(format!("logs for run {run_id}")))?;

        let total = run.logs.len() as u64;
        let start = since.min(total) as usize;
        let end = (start + limit as usize).min(run.logs.len());
        let logs: Vec<RawLog> = run.logs[start..end]
            .iter()
            .cloned()
            .map(RawLog::Entry)
            .collect();

        Ok(LogsPage {
            next_index: end as u64,
            total_count: total,
            status: run.status.clone(),
            layer_status: if run.layer_status.is_empty() {
                None
            } else {
                Some(run.layer_status.clone())
            },
            error: run.error.clone(),
            logs,
        })
    }
}

#[async_trait]
impl LogTransport for InMemoryBackend {
    async fn fetch_logs(&self, run_id: &str, since: u64, limit: u32) -> Result<LogsPage, AppError> {
        lock(&self.requests).push(LogRequest {
            run_id: run_id.to_string(),
            since,
            limit,
        });

        let scripted = lock(&self.scripted)
            .get_mut(run_id)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(Scripted::Page(page)) => Ok(page),
            Some(Scripted::Fail(failure)) => Err(failure.into_error(run_id)),
            None => self.natural_page(run_id, since, limit),
        }
    }

    async fn fetch_status(&self, run_id: &str) -> Result<OperationSnapshot, AppError> {
        lock(&self.status_requests).push(run_id.to_string());
        if let Some(failure) = lock(&self.status_failures).get(run_id).copied() {
            return Err(failure.into_error(run_id));
        }

        let runs = lock(&self.runs);
        let run = runs
            .get(run_id)
            .ok_or_else(|| AppError::NotFound(format!("status for run {run_id}")))?;
        Ok(OperationSnapshot {
            status: run.status.clone(),
            logs: run.logs.iter().cloned().map(RawLog::Entry).collect(),
            layer_status: Some(run.layer_status.clone()),
            started_at: Some(serde_json::Value::String(run.started_at.to_rfc3339())),
            completed_at: run
                .completed_at
                .map(|t| serde_json::Value::String(t.to_rfc3339())),
            error: run.error.clone(),
            job_id: None,
            job_title: run.job_title.clone(),
            operation: run.operation.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_natural_paging() {
        let backend = InMemoryBackend::new();
        backend.create_run("r1", Some("Acme"), Some("tailor"));
        for i in 0..5 {
            backend.push_line("r1", format!("line {i}"));
        }

        let page = backend.fetch_logs("r1", 0, 3).await.unwrap();
        assert_eq!(page.logs.len(), 3);
        assert_eq!(page.next_index, 3);
        assert_eq!(page.total_count, 5);

        let page = backend.fetch_logs("r1", 3, 3).await.unwrap();
        assert_eq!(page.logs.len(), 2);
        assert_eq!(page.next_index, 5);

        let page = backend.fetch_logs("r1", 9, 3).await.unwrap();
        assert!(page.logs.is_empty());
        assert_eq!(page.next_index, 5);

        assert_eq!(backend.sinces("r1"), vec![0, 3, 9]);
    }

    #[tokio::test]
    async fn test_scripted_responses_take_precedence() {
        let backend = InMemoryBackend::new();
        backend.create_run("r1", None, None);
        backend.script_failures("r1", InjectedFailure::ServiceUnavailable, 2);

        assert!(backend.fetch_logs("r1", 0, 10).await.unwrap_err().is_service_unavailable());
        assert!(backend.fetch_logs("r1", 0, 10).await.unwrap_err().is_service_unavailable());
        assert!(backend.fetch_logs("r1", 0, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_run_is_not_found() {
        let backend = InMemoryBackend::new();
        assert!(backend.fetch_logs("ghost", 0, 10).await.unwrap_err().is_not_found());
        assert!(backend.fetch_status("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let backend = InMemoryBackend::new();
        backend.create_run("r1", Some("Acme CV"), Some("generate"));
        backend.push_line("r1", "one");
        backend.set_layer("r1", "layer2", "done");
        backend.finish("r1", "completed", None);

        let snap = backend.fetch_status("r1").await.unwrap();
        assert_eq!(snap.status, "completed");
        assert_eq!(snap.logs.len(), 1);
        assert_eq!(snap.job_title.as_deref(), Some("Acme CV"));
        assert!(snap.completed_at.is_some());
    }
}
