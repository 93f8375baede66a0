//! Run registry: the authoritative view of every run the console tracks.
//!
//! Owns the run records, one log-stream poller per live run, the pending-log
//! buffers for runs that have not started yet, and the session persistence
//! of the console layout.

pub mod sanitize;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConsoleConfig, RegistryConfig};
use crate::error::AppError;
use crate::models::{ConsoleState, LayerStatus, LogEntry, RunMeta, RunRecord, RunStatus};
use crate::notifications::{notify_run_completed, Notifier};
use crate::transport::types::{normalize_layer_status, parse_timestamp, OperationSnapshot};
use crate::transport::LogTransport;
use crate::validation::require_valid_id;

use super::attribution::{merge_summaries, normalize_log, summarize_backends, BackendSummary};
use super::bus::{ConsoleEvent, EventBus, EventFilter, EventKind, RunRecoveredPayload};
use super::log_stream::{LogStreamPoller, LogStreamSource, StreamSettings};
use super::outage::OutageMonitor;
use super::persistence::{self, Persister, SaveMode, SessionStorage, Snapshot};
use super::poller::PollerConfig;

use self::sanitize::sanitize;

/// Logs received for a run that does not exist yet.
struct PendingLogs {
    entries: VecDeque<LogEntry>,
    timer: CancellationToken,
}

pub struct RunRegistry {
    state: Mutex<ConsoleState>,
    pollers: Mutex<HashMap<String, LogStreamPoller>>,
    pending: Mutex<HashMap<String, PendingLogs>>,
    /// Runs closed or evicted this session. Late events for them are dropped
    /// instead of resurrecting the run through the pending-log path.
    dismissed: Mutex<HashSet<String>>,
    bus: EventBus,
    transport: Arc<dyn LogTransport>,
    outage: Arc<OutageMonitor>,
    notifier: Arc<dyn Notifier>,
    persister: Persister,
    config: RegistryConfig,
    poller_config: PollerConfig,
    stream_settings: StreamSettings,
    shutdown: CancellationToken,
}

impl RunRegistry {
    pub fn new(
        config: &ConsoleConfig,
        bus: EventBus,
        transport: Arc<dyn LogTransport>,
        outage: Arc<OutageMonitor>,
        notifier: Arc<dyn Notifier>,
        storage: Arc<dyn SessionStorage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConsoleState::default()),
            pollers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            dismissed: Mutex::new(HashSet::new()),
            bus,
            transport,
            outage,
            notifier,
            persister: Persister::new(
                storage,
                config.registry.storage_key.clone(),
                config.registry.persist_debounce(),
            ),
            config: config.registry.clone(),
            poller_config: PollerConfig::from_config(&config.polling),
            stream_settings: StreamSettings::from_config(&config.polling),
            shutdown: CancellationToken::new(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ConsoleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pollers(&self) -> MutexGuard<'_, HashMap<String, LogStreamPoller>> {
        self.pollers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingLogs>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_dismissed(&self) -> MutexGuard<'_, HashSet<String>> {
        self.dismissed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_dismissed(&self, run_id: &str) -> bool {
        self.lock_dismissed().contains(run_id)
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    /// Load persisted state, repairing anything malformed. Re-persists at once
    /// when a repair was needed. Returns the number of restored runs.
    pub fn restore(self: &Arc<Self>) -> Result<usize, AppError> {
        let Some(raw) = self.persister.load()? else {
            return Ok(0);
        };

        let sanitized = sanitize(&raw);
        for repair in &sanitized.repairs {
            tracing::warn!(key = %self.persister.key(), "Restored console state: {}", repair);
        }
        let changed = sanitized.changed();

        let count = {
            let mut state = self.lock_state();
            *state = sanitized.state;
            for run in state.runs.values_mut() {
                run.trim_logs(self.config.max_logs_per_run);
            }
            state.runs.len()
        };

        if changed {
            persistence::save(self, SaveMode::Immediate);
        }
        tracing::info!(runs = count, repaired = changed, "Console state restored");
        Ok(count)
    }

    /// Re-attach pollers to restored runs that were still in flight. Streams
    /// resume from each run's `log_cursor`.
    pub fn resume_live_runs(self: &Arc<Self>) -> usize {
        let targets: Vec<(String, u64)> = {
            let mut state = self.lock_state();
            state
                .runs
                .values_mut()
                .filter(|run| run.status.is_live())
                .map(|run| {
                    if run.log_cursor == 0 {
                        run.logs.clear();
                    }
                    (run.run_id.clone(), run.log_cursor)
                })
                .collect()
        };

        let mut resumed = 0;
        for (run_id, cursor) in targets {
            if self.ensure_poller(&run_id, cursor) {
                tracing::info!(run_id = %run_id, cursor, "Resumed log stream");
                resumed += 1;
            }
        }
        resumed
    }

    // ------------------------------------------------------------------
    // Pollers
    // ------------------------------------------------------------------

    /// Start a poller for `run_id` unless a live one exists.
    fn ensure_poller(&self, run_id: &str, since: u64) -> bool {
        let mut pollers = self.lock_pollers();
        if pollers.get(run_id).is_some_and(|p| p.is_running()) {
            return false;
        }

        let poller = LogStreamSource::new(
            run_id,
            self.transport.clone(),
            self.bus.clone(),
            self.outage.clone(),
            self.stream_settings.clone(),
        )
        .starting_at(since)
        .into_poller(self.poller_config.clone());

        if !poller.start() {
            return false;
        }
        pollers.insert(run_id.to_string(), poller);
        true
    }

    fn stop_poller(&self, run_id: &str) {
        if let Some(poller) = self.lock_pollers().remove(run_id) {
            poller.stop();
        }
    }

    pub fn has_poller(&self, run_id: &str) -> bool {
        self.lock_pollers().get(run_id).is_some_and(|p| p.is_running())
    }

    pub fn live_poller_count(&self) -> usize {
        self.lock_pollers().values().filter(|p| p.is_running()).count()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin tracking `run_id`, or refresh it if already tracked. A terminal
    /// run is restarted as a new attempt. Never creates a second poller.
    pub fn start_run(self: &Arc<Self>, run_id: &str, meta: RunMeta) -> Result<(), AppError> {
        require_valid_id("run_id", run_id)?;
        self.lock_dismissed().remove(run_id);

        let (since, restarted, evicted) = {
            let mut state = self.lock_state();
            let title_max = self.config.title_max_chars;

            let (since, restarted) = match state.runs.get_mut(run_id) {
                Some(run) if !run.status.is_live() => {
                    run.restart();
                    apply_meta(run, &meta, title_max);
                    (0, true)
                }
                Some(run) => {
                    run.status = RunStatus::Running;
                    apply_meta(run, &meta, title_max);
                    (run.log_cursor, false)
                }
                None => {
                    state.runs.insert(
                        run_id.to_string(),
                        RunRecord::new(run_id, meta, RunStatus::Running, title_max),
                    );
                    state.run_order.push(run_id.to_string());
                    (0, false)
                }
            };

            if restarted {
                state.run_order.retain(|id| id != run_id);
                state.run_order.push(run_id.to_string());
            }
            self.drain_pending(&mut state, run_id);
            state.active_run_id = Some(run_id.to_string());
            (since, restarted, self.evict(&mut state))
        };

        for id in &evicted {
            self.stop_poller(id);
        }
        if restarted {
            self.stop_poller(run_id);
        }
        self.ensure_poller(run_id, since);

        tracing::info!(run_id = %run_id, restarted, "Run started");
        persistence::save(self, SaveMode::Immediate);
        Ok(())
    }

    /// Record a client-side placeholder in `queued` state. No poller is
    /// attached until [`promote_run`](Self::promote_run).
    pub fn queue_run(self: &Arc<Self>, placeholder_id: &str, meta: RunMeta) -> Result<(), AppError> {
        require_valid_id("placeholder_id", placeholder_id)?;
        let evicted = {
            let mut state = self.lock_state();
            if !state.runs.contains_key(placeholder_id) {
                state.runs.insert(
                    placeholder_id.to_string(),
                    RunRecord::new(placeholder_id, meta, RunStatus::Queued, self.config.title_max_chars),
                );
                state.run_order.push(placeholder_id.to_string());
            }
            state.active_run_id = Some(placeholder_id.to_string());
            self.evict(&mut state)
        };
        for id in &evicted {
            self.stop_poller(id);
        }
        persistence::save(self, SaveMode::Immediate);
        Ok(())
    }

    /// Replace a placeholder with the server-issued run id and start polling.
    pub fn promote_run(self: &Arc<Self>, placeholder_id: &str, run_id: &str) -> Result<(), AppError> {
        require_valid_id("run_id", run_id)?;
        let since = {
            let mut state = self.lock_state();
            let Some(mut record) = state.runs.remove(placeholder_id) else {
                return Err(AppError::NotFound(format!("queued run {placeholder_id}")));
            };

            let existing_cursor = state.runs.get(run_id).map(|run| run.log_cursor);
            let since = match existing_cursor {
                Some(cursor) => {
                    state.run_order.retain(|id| id != placeholder_id);
                    cursor
                }
                None => {
                    record.run_id = run_id.to_string();
                    record.status = RunStatus::Running;
                    record.started_at = Utc::now();
                    for id in state.run_order.iter_mut().filter(|id| *id == placeholder_id) {
                        *id = run_id.to_string();
                    }
                    state.runs.insert(run_id.to_string(), record);
                    0
                }
            };

            self.drain_pending(&mut state, run_id);
            state.active_run_id = Some(run_id.to_string());
            since
        };

        self.ensure_poller(run_id, since);
        tracing::info!(placeholder = %placeholder_id, run_id = %run_id, "Queued run promoted");
        persistence::save(self, SaveMode::Immediate);
        Ok(())
    }

    /// Append one log entry. Logs for an unknown run are buffered until the
    /// run starts or the pending timeout fires. Entries already covered by the
    /// run's cursor are dropped as replays.
    pub fn append_log(self: &Arc<Self>, run_id: &str, entry: LogEntry) {
        if self.is_dismissed(run_id) {
            tracing::trace!(run_id = %run_id, "Dropping log for dismissed run");
            return;
        }

        let mut state = self.lock_state();
        if let Some(run) = state.runs.get_mut(run_id) {
            if entry.index.is_some_and(|i| i < run.log_cursor) {
                tracing::trace!(run_id = %run_id, index = ?entry.index, "Skipping replayed log");
                return;
            }
            run.push_log(entry, self.config.max_logs_per_run);
            drop(state);
            persistence::save(self, SaveMode::Debounced);
            return;
        }

        let mut pending = self.lock_pending();
        match pending.get_mut(run_id) {
            Some(buffer) => {
                buffer.entries.push_back(entry);
                if buffer.entries.len() > self.config.max_logs_per_run {
                    buffer.entries.pop_front();
                }
            }
            None => {
                tracing::debug!(run_id = %run_id, "Buffering logs for run that has not started");
                let timer = CancellationToken::new();
                self.spawn_pending_timer(run_id, timer.clone());
                pending.insert(
                    run_id.to_string(),
                    PendingLogs {
                        entries: VecDeque::from([entry]),
                        timer,
                    },
                );
            }
        }
    }

    /// Replay buffered logs onto a run that now exists. Caller holds the state lock.
    fn drain_pending(&self, state: &mut ConsoleState, run_id: &str) {
        let Some(buffer) = self.lock_pending().remove(run_id) else {
            return;
        };
        buffer.timer.cancel();
        let Some(run) = state.runs.get_mut(run_id) else {
            return;
        };
        let count = buffer.entries.len();
        for entry in buffer.entries {
            if entry.index.is_some_and(|i| i < run.log_cursor) {
                continue;
            }
            run.push_log(entry, self.config.max_logs_per_run);
        }
        tracing::debug!(run_id = %run_id, count, "Replayed buffered logs");
    }

    fn spawn_pending_timer(self: &Arc<Self>, run_id: &str, timer: CancellationToken) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(run_id = %run_id, "No runtime for pending-log timeout; logs wait for run start");
            return;
        };
        let weak = Arc::downgrade(self);
        let run_id = run_id.to_string();
        let timeout = self.config.pending_log_timeout();
        handle.spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(registry) = weak.upgrade() {
                        registry.recover_pending(&run_id).await;
                    }
                }
            }
        });
    }

    /// Pending-log timeout: the start signal never arrived. Rebuild the run
    /// from the status endpoint, or keep the buffered logs under `unknown`
    /// when the backend cannot be reached.
    pub async fn recover_pending(self: &Arc<Self>, run_id: &str) {
        let Some(buffer) = self.lock_pending().remove(run_id) else {
            return;
        };

        let created_meanwhile = self.lock_state().runs.contains_key(run_id);
        if created_meanwhile {
            for entry in buffer.entries {
                self.append_log(run_id, entry);
            }
            return;
        }

        tracing::warn!(run_id = %run_id, buffered = buffer.entries.len(), "Run never started; recovering from status endpoint");
        let record = match self.transport.fetch_status(run_id).await {
            Ok(snapshot) => self.record_from_snapshot(run_id, snapshot, buffer.entries),
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Status recovery failed");
                let mut run = RunRecord::new(run_id, RunMeta::default(), RunStatus::Unknown, self.config.title_max_chars);
                run.error = Some(format!("status unavailable: {e}"));
                for entry in buffer.entries {
                    run.push_log(entry, self.config.max_logs_per_run);
                }
                run
            }
        };

        if self.is_dismissed(run_id) {
            return;
        }

        let live = record.status.is_live();
        let since = record.log_cursor;
        let recovered = RunRecoveredPayload {
            run_id: record.run_id.clone(),
            job_id: record.job_id.clone(),
            title: record.title.clone(),
            action: record.action.clone(),
            status: record.status,
            started_at: record.started_at,
            completed_at: record.completed_at,
            error: record.error.clone(),
            layer_status: record.layer_status.clone(),
            log_count: record.logs.len() as u64,
            backend_stats: summarize_backends(&record.logs),
        };
        let evicted = {
            let mut state = self.lock_state();
            if state.runs.contains_key(run_id) {
                // start_run won the race and replays from 0.
                return;
            }
            state.runs.insert(run_id.to_string(), record);
            state.run_order.push(run_id.to_string());
            if state.active_run_id.is_none() {
                state.active_run_id = Some(run_id.to_string());
            }
            self.evict(&mut state)
        };

        for id in &evicted {
            self.stop_poller(id);
        }
        // Mirrors must see the recovered run before its first streamed log.
        self.bus.publish(ConsoleEvent::RunRecovered(recovered));
        if live {
            self.ensure_poller(run_id, since);
        }
        persistence::save(self, SaveMode::Immediate);
    }

    fn record_from_snapshot(
        &self,
        run_id: &str,
        snapshot: OperationSnapshot,
        buffered: impl IntoIterator<Item = LogEntry>,
    ) -> RunRecord {
        let status = RunStatus::from_backend(&snapshot.status);
        let meta = RunMeta {
            job_id: snapshot.job_id,
            title: snapshot.job_title.unwrap_or_default(),
            action: snapshot.operation.unwrap_or_default(),
        };
        let mut run = RunRecord::new(run_id, meta, status, self.config.title_max_chars);
        if let Some(started) = snapshot.started_at.as_ref().and_then(parse_timestamp) {
            run.started_at = started;
        }
        run.completed_at = snapshot.completed_at.as_ref().and_then(parse_timestamp);
        if status.is_terminal() && run.completed_at.is_none() {
            run.completed_at = Some(Utc::now());
        }
        run.error = snapshot.error;
        if let Some(layers) = snapshot.layer_status.as_ref() {
            run.layer_status = normalize_layer_status(layers);
        }

        let now = Utc::now();
        for (i, raw) in snapshot.logs.into_iter().enumerate() {
            run.push_log(normalize_log(raw.into_wire(), i as u64, now), self.config.max_logs_per_run);
        }
        for entry in buffered {
            if entry.index.is_some_and(|i| i < run.log_cursor) {
                continue;
            }
            run.push_log(entry, self.config.max_logs_per_run);
        }
        run
    }

    /// Shallow-merge layer states into the run. Returns false for unknown runs.
    pub fn update_layer_status(self: &Arc<Self>, run_id: &str, partial: LayerStatus) -> bool {
        {
            let mut state = self.lock_state();
            let Some(run) = state.runs.get_mut(run_id) else {
                tracing::warn!(run_id = %run_id, "Layer status for unknown run ignored");
                return false;
            };
            run.layer_status.extend(partial);
        }
        persistence::save(self, SaveMode::Debounced);
        true
    }

    /// Mark a run terminal. A second completion is a no-op. Returns whether
    /// the record changed.
    pub fn complete_run(self: &Arc<Self>, run_id: &str, status: RunStatus, error: Option<String>) -> bool {
        if status.is_live() {
            tracing::warn!(run_id = %run_id, status = %status, "Ignoring completion with non-terminal status");
            return false;
        }

        let (title, duration_ms) = {
            let mut state = self.lock_state();
            let Some(run) = state.runs.get_mut(run_id) else {
                tracing::warn!(run_id = %run_id, "Completion for unknown run ignored");
                return false;
            };
            if run.status.is_terminal() || (run.status == RunStatus::Unknown && status == RunStatus::Unknown) {
                tracing::debug!(run_id = %run_id, status = %run.status, "Run already complete");
                return false;
            }

            let now = Utc::now();
            run.status = status;
            run.completed_at = Some(now);
            if error.is_some() {
                run.error = error;
            }
            let duration_ms = (now - run.started_at).num_milliseconds().max(0) as u64;
            (run.title.clone(), duration_ms)
        };

        self.stop_poller(run_id);
        tracing::info!(run_id = %run_id, status = %status, duration_ms, "Run completed");
        if self.config.notify_on_completion {
            notify_run_completed(self.notifier.as_ref(), &title, status, duration_ms);
        }
        persistence::save(self, SaveMode::Immediate);
        true
    }

    // ------------------------------------------------------------------
    // UI-facing selection and layout
    // ------------------------------------------------------------------

    pub fn switch_active(self: &Arc<Self>, run_id: &str) -> Result<(), AppError> {
        {
            let mut state = self.lock_state();
            if !state.runs.contains_key(run_id) {
                return Err(AppError::NotFound(format!("run {run_id}")));
            }
            state.active_run_id = Some(run_id.to_string());
        }
        persistence::save(self, SaveMode::Debounced);
        Ok(())
    }

    /// Stop the run's poller, then drop the record, its order entry and any
    /// buffered logs together.
    pub fn close_run(self: &Arc<Self>, run_id: &str) -> bool {
        self.stop_poller(run_id);
        self.lock_dismissed().insert(run_id.to_string());
        if let Some(buffer) = self.lock_pending().remove(run_id) {
            buffer.timer.cancel();
        }

        let removed = self.lock_state().remove_run(run_id).is_some();
        if removed {
            tracing::info!(run_id = %run_id, "Run closed");
            persistence::save(self, SaveMode::Immediate);
        }
        removed
    }

    pub fn set_expanded(self: &Arc<Self>, expanded: bool) {
        self.lock_state().expanded = expanded;
        persistence::save(self, SaveMode::Debounced);
    }

    pub fn set_panel_size(self: &Arc<Self>, size: u32) {
        self.lock_state().panel_size = Some(size);
        persistence::save(self, SaveMode::Debounced);
    }

    pub fn set_font_size(self: &Arc<Self>, size: u32) {
        self.lock_state().font_size = Some(size);
        persistence::save(self, SaveMode::Debounced);
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Enforce the run cap. Oldest non-active runs that are not live go
    /// first; live runs only when nothing else is left. Caller holds the
    /// state lock and stops pollers for the returned ids.
    fn evict(&self, state: &mut ConsoleState) -> Vec<String> {
        let mut evicted = Vec::new();
        while state.runs.len() > self.config.max_runs {
            let active = state.active_run_id.clone();
            let candidates = || {
                state
                    .run_order
                    .iter()
                    .filter(|id| Some(id.as_str()) != active.as_deref())
            };
            let victim = candidates()
                .find(|id| state.runs.get(id.as_str()).is_some_and(|r| !r.status.is_live()))
                .or_else(|| candidates().next())
                .cloned();
            let Some(victim) = victim else { break };
            state.remove_run(&victim);
            evicted.push(victim);
        }

        if !evicted.is_empty() {
            let mut dismissed = self.lock_dismissed();
            for id in &evicted {
                tracing::info!(run_id = %id, "Run evicted (cap {})", self.config.max_runs);
                dismissed.insert(id.clone());
            }
        }
        evicted
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn run(&self, run_id: &str) -> Option<RunRecord> {
        self.lock_state().runs.get(run_id).cloned()
    }

    /// Runs in display order.
    pub fn runs(&self) -> Vec<RunRecord> {
        self.lock_state().ordered_runs().into_iter().cloned().collect()
    }

    pub fn active_run_id(&self) -> Option<String> {
        self.lock_state().active_run_id.clone()
    }

    pub fn snapshot(&self) -> ConsoleState {
        self.lock_state().clone()
    }

    pub fn pending_count(&self, run_id: &str) -> usize {
        self.lock_pending().get(run_id).map_or(0, |b| b.entries.len())
    }

    /// Per-backend counts and costs for one run, recomputed from its logs.
    pub fn backend_stats(&self, run_id: &str) -> Option<BackendSummary> {
        self.lock_state().runs.get(run_id).map(|run| summarize_backends(&run.logs))
    }

    pub fn aggregate_backend_stats(&self) -> BackendSummary {
        let state = self.lock_state();
        let per_run: Vec<BackendSummary> = state.runs.values().map(|run| summarize_backends(&run.logs)).collect();
        merge_summaries(&per_run)
    }

    // ------------------------------------------------------------------
    // Bus wiring
    // ------------------------------------------------------------------

    pub fn apply(self: &Arc<Self>, event: ConsoleEvent) {
        match event {
            ConsoleEvent::RunStart(p) => {
                let meta = RunMeta {
                    job_id: p.job_id,
                    title: p.title,
                    action: p.action,
                };
                if let Err(e) = self.start_run(&p.run_id, meta) {
                    tracing::warn!(run_id = %p.run_id, error = %e, "run:start rejected");
                }
            }
            ConsoleEvent::RunLog(p) => self.append_log(&p.run_id, p.log),
            ConsoleEvent::LayerStatus(p) => {
                self.update_layer_status(&p.run_id, p.layer_status);
            }
            ConsoleEvent::RunComplete(p) => {
                self.complete_run(&p.run_id, p.status, p.error);
            }
            ConsoleEvent::RunRecovered(_) | ConsoleEvent::PollStart(_) | ConsoleEvent::PollEnd(_) => {}
        }
    }

    /// Apply run lifecycle events from the bus until shutdown.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self
            .bus
            .subscribe_filtered(EventFilter::all().with_kinds(&EventKind::LIFECYCLE));
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(registry) = weak.upgrade() else { break };
                        registry.apply(event);
                    }
                }
            }
            tracing::debug!("Registry listener stopped");
        })
    }

    /// Stop every poller and pending timer, then write state immediately.
    pub fn shutdown(self: &Arc<Self>) {
        self.shutdown.cancel();
        let pollers: Vec<LogStreamPoller> = self.lock_pollers().drain().map(|(_, p)| p).collect();
        for poller in &pollers {
            poller.stop();
        }
        for (_, buffer) in self.lock_pending().drain() {
            buffer.timer.cancel();
        }
        persistence::save(self, SaveMode::Immediate);
        tracing::info!(pollers = pollers.len(), "Run registry shut down");
    }
}

fn apply_meta(run: &mut RunRecord, meta: &RunMeta, title_max: usize) {
    if meta.job_id.is_some() {
        run.job_id = meta.job_id.clone();
    }
    if !meta.title.trim().is_empty() {
        run.title = crate::models::truncate_title(&meta.title, title_max);
    }
    if !meta.action.is_empty() {
        run.action = meta.action.clone();
    }
}

impl Snapshot for RunRegistry {
    fn persister(&self) -> &Persister {
        &self.persister
    }

    fn snapshot_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(&*self.lock_state())?)
    }

    /// First trim every run to the aggressive log cap; when that frees
    /// nothing, drop the oldest finished run.
    fn shrink_for_quota(&self) -> bool {
        let mut state = self.lock_state();
        let limit = self.config.aggressive_log_trim;
        let trimmed: usize = state.runs.values_mut().map(|run| run.trim_logs(limit)).sum();
        if trimmed > 0 {
            tracing::warn!(trimmed, limit, "Trimmed run logs to fit storage quota");
            return true;
        }

        let active = state.active_run_id.clone();
        let victim = state
            .run_order
            .iter()
            .find(|id| {
                Some(id.as_str()) != active.as_deref()
                    && state.runs.get(id.as_str()).is_some_and(|r| !r.status.is_live())
            })
            .cloned();
        match victim {
            Some(id) => {
                state.remove_run(&id);
                tracing::warn!(run_id = %id, "Dropped finished run to fit storage quota");
                self.lock_dismissed().insert(id);
                true
            }
            None => false,
        }
    }
}
