//! Unified execution store: a lightweight, separately persisted mirror of
//! run activity keyed as operations, for consumers that only need
//! status, counts and backend cost attribution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ts_rs::TS;

use crate::config::ConsoleConfig;
use crate::error::AppError;
use crate::models::{LayerStatus, RunStatus};

use super::attribution::{backend_key, merge_summaries, BackendSummary};
use super::bus::{ConsoleEvent, EventBus, EventFilter, EventKind};
use super::persistence::{self, Persister, SaveMode, SessionStorage, Snapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub operation_id: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub action: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub layer_status: LayerStatus,
    #[serde(default)]
    pub log_count: u64,
    #[serde(default)]
    pub backend_stats: BackendSummary,
}

impl OperationRecord {
    fn new(operation_id: &str, job_id: Option<String>, title: String, action: String) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            job_id,
            title,
            action,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            layer_status: LayerStatus::new(),
            log_count: 0,
            backend_stats: BackendSummary::new(),
        }
    }

    pub fn total_cost(&self) -> f64 {
        self.backend_stats.values().map(|s| s.cost).sum()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionState {
    #[serde(default)]
    operations: HashMap<String, OperationRecord>,
    /// Insertion order, oldest first.
    #[serde(default)]
    order: Vec<String>,
}

pub struct ExecutionStore {
    state: Mutex<ExecutionState>,
    persister: Persister,
    max_operations: usize,
    shutdown: CancellationToken,
}

impl ExecutionStore {
    pub fn new(config: &ConsoleConfig, storage: Arc<dyn SessionStorage>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ExecutionState::default()),
            persister: Persister::new(
                storage,
                config.executions.storage_key.clone(),
                config.registry.persist_debounce(),
            ),
            max_operations: config.executions.max_operations,
            shutdown: CancellationToken::new(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load persisted operations. Corrupt data is discarded, never fatal.
    pub fn restore(&self) -> Result<usize, AppError> {
        let Some(raw) = self.persister.load()? else {
            return Ok(0);
        };
        let mut restored: ExecutionState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(key = %self.persister.key(), error = %e, "Discarding corrupt execution store");
                self.persister.clear()?;
                return Ok(0);
            }
        };

        let ExecutionState { operations, order } = &mut restored;
        let mut seen = std::collections::HashSet::new();
        order.retain(|id| operations.contains_key(id) && seen.insert(id.clone()));
        for id in operations.keys() {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }

        let count = restored.operations.len();
        *self.lock_state() = restored;
        Ok(count)
    }

    /// Fold one lifecycle event into the mirror. Events for operations that
    /// were neither started nor recovered are ignored.
    pub fn apply(self: &Arc<Self>, event: &ConsoleEvent) {
        let mode = {
            let mut state = self.lock_state();
            match event {
                ConsoleEvent::RunStart(p) => {
                    match state.operations.get_mut(&p.run_id) {
                        Some(op) if op.status.is_live() => {
                            if !p.title.is_empty() {
                                op.title = p.title.clone();
                            }
                        }
                        Some(op) => {
                            *op = OperationRecord::new(&p.run_id, p.job_id.clone(), p.title.clone(), p.action.clone());
                        }
                        None => {
                            state.operations.insert(
                                p.run_id.clone(),
                                OperationRecord::new(&p.run_id, p.job_id.clone(), p.title.clone(), p.action.clone()),
                            );
                            state.order.push(p.run_id.clone());
                        }
                    }
                    self.evict(&mut state);
                    SaveMode::Immediate
                }
                ConsoleEvent::RunLog(p) => {
                    let Some(op) = state.operations.get_mut(&p.run_id) else {
                        tracing::warn!(operation_id = %p.run_id, "Log for unknown operation ignored");
                        return;
                    };
                    op.log_count += 1;
                    op.backend_stats
                        .entry(backend_key(&p.log).to_string())
                        .or_default()
                        .record(p.log.cost);
                    SaveMode::Debounced
                }
                ConsoleEvent::LayerStatus(p) => {
                    let Some(op) = state.operations.get_mut(&p.run_id) else {
                        tracing::warn!(operation_id = %p.run_id, "Layer status for unknown operation ignored");
                        return;
                    };
                    op.layer_status
                        .extend(p.layer_status.iter().map(|(k, v)| (k.clone(), v.clone())));
                    SaveMode::Debounced
                }
                ConsoleEvent::RunComplete(p) => {
                    let Some(op) = state.operations.get_mut(&p.run_id) else {
                        tracing::warn!(operation_id = %p.run_id, "Completion for unknown operation ignored");
                        return;
                    };
                    if op.status.is_terminal() {
                        return;
                    }
                    op.status = p.status;
                    op.completed_at = Some(Utc::now());
                    if p.error.is_some() {
                        op.error = p.error.clone();
                    }
                    SaveMode::Immediate
                }
                ConsoleEvent::RunRecovered(p) => {
                    let op = OperationRecord {
                        operation_id: p.run_id.clone(),
                        job_id: p.job_id.clone(),
                        title: p.title.clone(),
                        action: p.action.clone(),
                        status: p.status,
                        started_at: p.started_at,
                        completed_at: p.completed_at,
                        error: p.error.clone(),
                        layer_status: p.layer_status.clone(),
                        log_count: p.log_count,
                        backend_stats: p.backend_stats.clone(),
                    };
                    if state.operations.insert(p.run_id.clone(), op).is_none() {
                        state.order.push(p.run_id.clone());
                    }
                    self.evict(&mut state);
                    SaveMode::Immediate
                }
                ConsoleEvent::PollStart(_) | ConsoleEvent::PollEnd(_) => return,
            }
        };
        persistence::save(self, mode);
    }

    /// Keep at most `max_operations`. Live operations are never evicted.
    fn evict(&self, state: &mut ExecutionState) {
        while state.operations.len() > self.max_operations {
            let victim = state
                .order
                .iter()
                .find(|id| state.operations.get(id.as_str()).is_some_and(|op| !op.status.is_live()))
                .cloned();
            let Some(victim) = victim else {
                tracing::debug!(
                    live = state.operations.len(),
                    cap = self.max_operations,
                    "Operation cap exceeded by live operations"
                );
                break;
            };
            state.operations.remove(&victim);
            state.order.retain(|id| id != &victim);
        }
    }

    pub fn operation(&self, operation_id: &str) -> Option<OperationRecord> {
        self.lock_state().operations.get(operation_id).cloned()
    }

    /// Oldest first.
    pub fn operations(&self) -> Vec<OperationRecord> {
        let state = self.lock_state();
        state
            .order
            .iter()
            .filter_map(|id| state.operations.get(id).cloned())
            .collect()
    }

    /// Cross-operation backend totals, summed on demand.
    pub fn aggregate(&self) -> BackendSummary {
        let state = self.lock_state();
        merge_summaries(state.operations.values().map(|op| &op.backend_stats))
    }

    pub fn spawn_listener(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let mut kinds = EventKind::LIFECYCLE.to_vec();
        kinds.push(EventKind::RunRecovered);
        let mut events = bus.subscribe_filtered(EventFilter::all().with_kinds(&kinds));
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(store) = weak.upgrade() else { break };
                        store.apply(&event);
                    }
                }
            }
        })
    }

    pub fn shutdown(self: &Arc<Self>) {
        self.shutdown.cancel();
        persistence::save(self, SaveMode::Immediate);
    }
}

impl Snapshot for ExecutionStore {
    fn persister(&self) -> &Persister {
        &self.persister
    }

    fn snapshot_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(&*self.lock_state())?)
    }

    fn shrink_for_quota(&self) -> bool {
        let mut state = self.lock_state();
        let victim = state
            .order
            .iter()
            .find(|id| state.operations.get(id.as_str()).is_some_and(|op| !op.status.is_live()))
            .cloned();
        match victim {
            Some(id) => {
                state.operations.remove(&id);
                state.order.retain(|o| o != &id);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::{RunCompletePayload, RunLogPayload, RunRecoveredPayload, RunStartPayload};
    use crate::engine::persistence::MemoryStorage;
    use crate::models::{LogEntry, LogLevel};

    fn start(id: &str) -> ConsoleEvent {
        ConsoleEvent::RunStart(RunStartPayload {
            run_id: id.into(),
            job_id: Some("job-1".into()),
            title: format!("Run {id}"),
            action: "tailor".into(),
        })
    }

    fn log(id: &str, backend: Option<&str>, cost: f64) -> ConsoleEvent {
        let mut entry = LogEntry::new(LogLevel::Info, "line");
        if let Some(b) = backend {
            entry = entry.with_backend(b, cost);
        }
        ConsoleEvent::RunLog(RunLogPayload {
            run_id: id.into(),
            log: entry,
        })
    }

    fn complete(id: &str, status: RunStatus) -> ConsoleEvent {
        ConsoleEvent::RunComplete(RunCompletePayload {
            run_id: id.into(),
            status,
            error: None,
        })
    }

    fn store(max: usize) -> (Arc<ExecutionStore>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let mut config = ConsoleConfig::default();
        config.executions.max_operations = max;
        (ExecutionStore::new(&config, storage.clone()), storage)
    }

    #[test]
    fn test_backend_stats_per_operation_and_aggregate() {
        let (store, _) = store(10);
        store.apply(&start("a"));
        store.apply(&start("b"));
        store.apply(&log("a", Some("claude"), 0.25));
        store.apply(&log("a", Some("claude"), 0.25));
        store.apply(&log("a", None, 0.0));
        store.apply(&log("b", Some("gemini"), 0.1));

        let a = store.operation("a").unwrap();
        assert_eq!(a.log_count, 3);
        assert_eq!(a.backend_stats["claude"].count, 2);
        assert_eq!(a.total_cost(), 0.5);

        let total = store.aggregate();
        assert_eq!(total["claude"].count, 2);
        assert_eq!(total["gemini"].count, 1);
        assert_eq!(total["unattributed"].count, 1);
    }

    #[test]
    fn test_unknown_operation_events_ignored() {
        let (store, _) = store(10);
        store.apply(&log("ghost", Some("claude"), 1.0));
        store.apply(&complete("ghost", RunStatus::Success));
        assert!(store.operations().is_empty());
    }

    #[test]
    fn test_recovered_run_is_seeded_and_then_followed() {
        let (store, _) = store(10);
        let mut backend_stats = BackendSummary::new();
        backend_stats.entry("claude".into()).or_default().record(0.2);
        store.apply(&ConsoleEvent::RunRecovered(RunRecoveredPayload {
            run_id: "r9".into(),
            job_id: None,
            title: "Recovered".into(),
            action: "tailor".into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            layer_status: LayerStatus::new(),
            log_count: 1,
            backend_stats,
        }));
        store.apply(&log("r9", Some("claude"), 0.1));
        store.apply(&complete("r9", RunStatus::Success));

        let op = store.operation("r9").unwrap();
        assert_eq!(op.status, RunStatus::Success);
        assert_eq!(op.log_count, 2);
        assert_eq!(op.backend_stats["claude"].count, 2);
        assert_eq!(store.operations().len(), 1);
    }

    #[test]
    fn test_eviction_never_removes_running() {
        let (store, _) = store(2);
        store.apply(&start("a"));
        store.apply(&start("b"));
        store.apply(&complete("b", RunStatus::Success));
        store.apply(&start("c"));
        let ids: Vec<String> = store.operations().into_iter().map(|o| o.operation_id).collect();
        assert_eq!(ids, vec!["a", "c"]);

        // Everything live: over the cap rather than dropping running work.
        store.apply(&start("d"));
        assert_eq!(store.operations().len(), 3);
    }

    #[test]
    fn test_persisted_and_restored() {
        let (store, storage) = store(10);
        store.apply(&start("a"));
        store.apply(&log("a", Some("claude"), 0.3));
        store.apply(&complete("a", RunStatus::Success));

        let config = ConsoleConfig::default();
        let restored = ExecutionStore::new(&config, storage.clone());
        assert_eq!(restored.restore().unwrap(), 1);
        let op = restored.operation("a").unwrap();
        assert_eq!(op.status, RunStatus::Success);
        assert_eq!(op.backend_stats["claude"].cost, 0.3);
    }

    #[test]
    fn test_corrupt_store_is_discarded() {
        let storage = Arc::new(MemoryStorage::new());
        let config = ConsoleConfig::default();
        storage.set_item(&config.executions.storage_key, "{not json").unwrap();
        let store = ExecutionStore::new(&config, storage.clone());
        assert_eq!(store.restore().unwrap(), 0);
        assert_eq!(storage.get_item(&config.executions.storage_key).unwrap(), None);
    }
}
