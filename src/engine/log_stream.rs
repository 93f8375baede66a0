//! Replay + live tail of one run's log stream.
//!
//! Polls `since=<next_index>` from 0, publishes one `run:log` per entry in
//! server order, diffs layer status, and only reports completion once the
//! backend's status is terminal and every produced entry has been fetched.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::PollingConfig;
use crate::error::AppError;
use crate::models::RunStatus;
use crate::transport::types::{normalize_layer_status, LogsPage};
use crate::transport::LogTransport;

use super::attribution::normalize_log;
use super::bus::{
    ConsoleEvent, EventBus, LayerStatusPayload, PollEndPayload, PollStartPayload,
    RunCompletePayload, RunLogPayload,
};
use super::outage::OutageMonitor;
use super::poller::{PollSource, PollVerdict, Poller, PollerConfig, RetryPlan};

pub type LogStreamPoller = Poller<LogStreamSource>;

pub const LOGS_UNAVAILABLE: &str = "logs unavailable";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub page_size: u32,
    pub outage_backoff_initial: Duration,
    pub outage_backoff_max: Duration,
    /// Retry delay for 404s, which stay on the normal cadence.
    pub not_found_retry: Duration,
    /// Consecutive 404s before the run is declared `unknown`. 0 disables.
    pub max_not_found: u32,
    pub debug: bool,
}

impl StreamSettings {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            page_size: config.page_size,
            outage_backoff_initial: Duration::from_millis(config.outage_backoff_initial_ms),
            outage_backoff_max: Duration::from_millis(config.outage_backoff_max_ms),
            not_found_retry: Duration::from_millis(config.error_retry_ms),
            max_not_found: config.max_not_found,
            debug: config.debug,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&PollingConfig::default())
    }
}

/// Per-run session state. Never persisted; a reload rebuilds it from the
/// run's `log_cursor`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSession {
    pub next_index: u64,
    pub total_count: u64,
    pub status: RunStatus,
    last_layer_json: Option<String>,
    pub service_unavailable: bool,
    pub outage_backoff: Option<Duration>,
    pub not_found_streak: u32,
    pub completed: bool,
}

pub struct LogStreamSource {
    run_id: String,
    transport: Arc<dyn LogTransport>,
    bus: EventBus,
    outage: Arc<OutageMonitor>,
    settings: StreamSettings,
    session: Mutex<StreamSession>,
}

impl LogStreamSource {
    pub fn new(
        run_id: impl Into<String>,
        transport: Arc<dyn LogTransport>,
        bus: EventBus,
        outage: Arc<OutageMonitor>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            transport,
            bus,
            outage,
            settings,
            session: Mutex::new(StreamSession {
                next_index: 0,
                total_count: 0,
                status: RunStatus::Running,
                last_layer_json: None,
                service_unavailable: false,
                outage_backoff: None,
                not_found_streak: 0,
                completed: false,
            }),
        }
    }

    /// Resume from a known cursor instead of replaying from 0.
    pub fn starting_at(self, next_index: u64) -> Self {
        {
            let mut session = self.lock_session();
            session.next_index = next_index;
            session.total_count = next_index;
        }
        self
    }

    pub fn into_poller(self, config: PollerConfig) -> LogStreamPoller {
        Poller::new(self, config)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session(&self) -> StreamSession {
        self.lock_session().clone()
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, StreamSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_complete(&self, status: RunStatus, error: Option<String>) {
        self.bus.publish(ConsoleEvent::RunComplete(RunCompletePayload {
            run_id: self.run_id.clone(),
            status,
            error,
        }));
    }
}

#[async_trait]
impl PollSource for LogStreamSource {
    type Response = LogsPage;

    fn label(&self) -> &str {
        &self.run_id
    }

    async fn fetch(&self) -> Result<LogsPage, AppError> {
        let since = self.lock_session().next_index;
        if self.settings.debug {
            tracing::debug!(run_id = %self.run_id, since, "Fetching logs");
        }
        self.transport
            .fetch_logs(&self.run_id, since, self.settings.page_size)
            .await
    }

    fn handle(&self, page: LogsPage) -> PollVerdict {
        let now = Utc::now();
        let status = RunStatus::from_backend(&page.status);
        let received = page.logs.len();

        // Session mutations happen under the lock; publishing happens after.
        let (since, entries, layer_update, was_unavailable, done) = {
            let mut session = self.lock_session();
            let since = session.next_index;

            let entries: Vec<_> = page
                .logs
                .into_iter()
                .enumerate()
                .map(|(i, raw)| normalize_log(raw.into_wire(), since.saturating_add(i as u64), now))
                .collect();

            if page.next_index < session.next_index {
                tracing::warn!(
                    run_id = %self.run_id,
                    since,
                    next_index = page.next_index,
                    "Server cursor moved backwards; keeping current cursor"
                );
            } else {
                session.next_index = page.next_index;
            }
            session.total_count = page.total_count;
            session.status = status;
            session.not_found_streak = 0;

            let layer_update = page
                .layer_status
                .as_ref()
                .map(normalize_layer_status)
                .filter(|layers| !layers.is_empty())
                .and_then(|layers| {
                    let json = serde_json::to_string(&layers).ok()?;
                    if session.last_layer_json.as_deref() == Some(json.as_str()) {
                        return None;
                    }
                    session.last_layer_json = Some(json);
                    Some(layers)
                });

            let was_unavailable = std::mem::replace(&mut session.service_unavailable, false);
            session.outage_backoff = None;

            let done = status.is_terminal() && session.next_index >= session.total_count;
            if done {
                session.completed = true;
            } else if status.is_terminal() {
                tracing::debug!(
                    run_id = %self.run_id,
                    next_index = session.next_index,
                    total_count = session.total_count,
                    "Terminal status, draining remaining logs"
                );
            }

            (since, entries, layer_update, was_unavailable, done)
        };

        if was_unavailable {
            self.outage.report_restored(&self.run_id);
        }

        if self.settings.debug {
            tracing::debug!(run_id = %self.run_id, since, received, status = %status, "Logs page");
        }

        for log in entries {
            self.bus.publish(ConsoleEvent::RunLog(RunLogPayload {
                run_id: self.run_id.clone(),
                log,
            }));
        }

        if let Some(layer_status) = layer_update {
            self.bus.publish(ConsoleEvent::LayerStatus(LayerStatusPayload {
                run_id: self.run_id.clone(),
                layer_status,
            }));
        }

        if done {
            tracing::info!(run_id = %self.run_id, status = %status, "Run stream complete");
            let error = if status == RunStatus::Error { page.error } else { None };
            self.publish_complete(status, error);
            return PollVerdict::Finished;
        }

        if received == 0 && matches!(status, RunStatus::Queued | RunStatus::Pending | RunStatus::Unknown) {
            PollVerdict::Idle
        } else {
            PollVerdict::Active
        }
    }

    fn on_failure(&self, error: &AppError, consecutive_errors: u32) -> RetryPlan {
        if error.is_service_unavailable() {
            let backoff = {
                let mut session = self.lock_session();
                let next = match session.outage_backoff {
                    Some(current) => current.saturating_mul(2).min(self.settings.outage_backoff_max),
                    None => self.settings.outage_backoff_initial,
                };
                session.outage_backoff = Some(next);
                session.service_unavailable = true;
                next
            };
            self.outage.report_unavailable(&self.run_id);
            tracing::debug!(
                run_id = %self.run_id,
                backoff_ms = backoff.as_millis() as u64,
                consecutive_errors,
                "Service unavailable, backing off"
            );
            return RetryPlan::After(backoff);
        }

        if error.is_not_found() {
            let streak = {
                let mut session = self.lock_session();
                session.not_found_streak += 1;
                session.not_found_streak
            };
            if self.settings.max_not_found > 0 && streak >= self.settings.max_not_found {
                tracing::warn!(run_id = %self.run_id, streak, "Run logs not found, giving up");
                self.lock_session().completed = true;
                self.publish_complete(RunStatus::Unknown, Some(LOGS_UNAVAILABLE.to_string()));
                return RetryPlan::GiveUp;
            }
            return RetryPlan::After(self.settings.not_found_retry);
        }

        tracing::warn!(run_id = %self.run_id, consecutive_errors, error = %error, "Log fetch failed");
        RetryPlan::Default
    }

    fn on_poll_start(&self) {
        self.bus.publish(ConsoleEvent::PollStart(PollStartPayload {
            run_id: self.run_id.clone(),
        }));
    }

    fn on_poll_end(&self, outcome: Result<(), &AppError>) {
        self.bus.publish(ConsoleEvent::PollEnd(PollEndPayload {
            run_id: self.run_id.clone(),
            success: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
        }));
    }

    fn on_connection_change(&self, connected: bool) {
        tracing::debug!(run_id = %self.run_id, connected, "Log stream connection changed");
    }
}
