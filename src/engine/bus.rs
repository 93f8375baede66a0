//! Typed in-process event bus.
//!
//! Every subscriber owns an unbounded queue so a slow consumer never causes a
//! log event to be dropped. Events for one run are delivered in publish order.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use ts_rs::TS;

use chrono::{DateTime, Utc};

use crate::models::{LayerStatus, LogEntry, RunStatus};

use super::attribution::BackendSummary;

// ============================================================================
// Event vocabulary
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct RunStartPayload {
    pub run_id: String,
    pub job_id: Option<String>,
    pub title: String,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct RunLogPayload {
    pub run_id: String,
    pub log: LogEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct LayerStatusPayload {
    pub run_id: String,
    pub layer_status: LayerStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct RunCompletePayload {
    pub run_id: String,
    pub status: RunStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PollStartPayload {
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PollEndPayload {
    pub run_id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// A run the registry rebuilt from the status endpoint after its logs
/// arrived without a start signal. Carries what was recovered so mirrors
/// can seed themselves without treating it as a new attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct RunRecoveredPayload {
    pub run_id: String,
    pub job_id: Option<String>,
    pub title: String,
    pub action: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub layer_status: LayerStatus,
    pub log_count: u64,
    pub backend_stats: BackendSummary,
}

/// Everything the console core publishes. Serialized as
/// `{ "event": "run:log", "payload": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "event", content = "payload")]
pub enum ConsoleEvent {
    #[serde(rename = "run:start")]
    RunStart(RunStartPayload),
    #[serde(rename = "run:log")]
    RunLog(RunLogPayload),
    #[serde(rename = "run:layer-status")]
    LayerStatus(LayerStatusPayload),
    #[serde(rename = "run:complete")]
    RunComplete(RunCompletePayload),
    #[serde(rename = "run:recovered")]
    RunRecovered(RunRecoveredPayload),
    #[serde(rename = "poller:poll-start")]
    PollStart(PollStartPayload),
    #[serde(rename = "poller:poll-end")]
    PollEnd(PollEndPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RunStart,
    RunLog,
    LayerStatus,
    RunComplete,
    RunRecovered,
    PollStart,
    PollEnd,
}

impl EventKind {
    /// The four run lifecycle kinds that mutate stores.
    pub const LIFECYCLE: [EventKind; 4] = [
        EventKind::RunStart,
        EventKind::RunLog,
        EventKind::LayerStatus,
        EventKind::RunComplete,
    ];
}

impl ConsoleEvent {
    pub fn run_id(&self) -> &str {
        match self {
            ConsoleEvent::RunStart(p) => &p.run_id,
            ConsoleEvent::RunLog(p) => &p.run_id,
            ConsoleEvent::LayerStatus(p) => &p.run_id,
            ConsoleEvent::RunComplete(p) => &p.run_id,
            ConsoleEvent::RunRecovered(p) => &p.run_id,
            ConsoleEvent::PollStart(p) => &p.run_id,
            ConsoleEvent::PollEnd(p) => &p.run_id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ConsoleEvent::RunStart(_) => EventKind::RunStart,
            ConsoleEvent::RunLog(_) => EventKind::RunLog,
            ConsoleEvent::LayerStatus(_) => EventKind::LayerStatus,
            ConsoleEvent::RunComplete(_) => EventKind::RunComplete,
            ConsoleEvent::RunRecovered(_) => EventKind::RunRecovered,
            ConsoleEvent::PollStart(_) => EventKind::PollStart,
            ConsoleEvent::PollEnd(_) => EventKind::PollEnd,
        }
    }

    /// Wire name, e.g. `run:layer-status`.
    pub fn name(&self) -> &'static str {
        match self.kind() {
            EventKind::RunStart => "run:start",
            EventKind::RunLog => "run:log",
            EventKind::LayerStatus => "run:layer-status",
            EventKind::RunComplete => "run:complete",
            EventKind::RunRecovered => "run:recovered",
            EventKind::PollStart => "poller:poll-start",
            EventKind::PollEnd => "poller:poll-end",
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Subscriber-side filter. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Exact run id, or a prefix ending in `*`.
    pub run_pattern: Option<String>,
    pub kinds: Option<Vec<EventKind>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_run(pattern: impl Into<String>) -> Self {
        Self {
            run_pattern: Some(pattern.into()),
            kinds: None,
        }
    }

    pub fn with_kinds(mut self, kinds: &[EventKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    pub fn matches(&self, event: &ConsoleEvent) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        match self.run_pattern {
            Some(ref pattern) => run_pattern_matches(pattern, event.run_id()),
            None => true,
        }
    }
}

/// Exact match or prefix wildcard (trailing `*`).
fn run_pattern_matches(pattern: &str, run_id: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        run_id.starts_with(prefix)
    } else {
        run_id == pattern
    }
}

// ============================================================================
// Bus
// ============================================================================

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<ConsoleEvent>,
}

/// Cheap to clone; all clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ConsoleEvent>,
}

impl Subscription {
    /// Next event, or `None` once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<ConsoleEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ConsoleEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything currently queued, without waiting.
    pub fn drain(&mut self) -> Vec<ConsoleEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_filtered(EventFilter::all())
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { filter, tx });
        Subscription { rx }
    }

    /// Deliver to every matching subscriber. Dropped subscriptions are pruned.
    /// Returns the number of subscribers the event reached.
    pub fn publish(&self, event: ConsoleEvent) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for sub in subscribers.iter().filter(|s| s.filter.matches(&event)) {
            if sub.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        tracing::trace!(event = event.name(), run_id = %event.run_id(), delivered, "published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogLevel;

    fn log_event(run_id: &str, text: &str) -> ConsoleEvent {
        ConsoleEvent::RunLog(RunLogPayload {
            run_id: run_id.into(),
            log: LogEntry::new(LogLevel::Info, text),
        })
    }

    fn poll_start(run_id: &str) -> ConsoleEvent {
        ConsoleEvent::PollStart(PollStartPayload {
            run_id: run_id.into(),
        })
    }

    #[test]
    fn test_run_pattern_exact_and_wildcard() {
        assert!(run_pattern_matches("run-1", "run-1"));
        assert!(!run_pattern_matches("run-1", "run-12"));
        assert!(run_pattern_matches("run-*", "run-12"));
        assert!(!run_pattern_matches("run-*", "job-1"));
        assert!(run_pattern_matches("*", "anything"));
    }

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(log_event("r1", &format!("line {i}")));
        }
        for i in 0..5 {
            match sub.recv().await {
                Some(ConsoleEvent::RunLog(p)) => assert_eq!(p.log.text, format!("line {i}")),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_filters_by_run_and_kind() {
        let bus = EventBus::new();
        let mut r1_logs = bus.subscribe_filtered(
            EventFilter::for_run("r1").with_kinds(&[EventKind::RunLog]),
        );
        let mut lifecycle = bus.subscribe_filtered(EventFilter::all().with_kinds(&EventKind::LIFECYCLE));

        assert_eq!(bus.publish(log_event("r1", "a")), 2);
        assert_eq!(bus.publish(log_event("r2", "b")), 1);
        assert_eq!(bus.publish(poll_start("r1")), 0);

        assert_eq!(r1_logs.drain().len(), 1);
        assert_eq!(lifecycle.drain().len(), 2);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        let _keep = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(sub);
        assert_eq!(bus.publish(poll_start("r1")), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ConsoleEvent::RunComplete(RunCompletePayload {
            run_id: "r1".into(),
            status: RunStatus::Success,
            error: None,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "run:complete");
        assert_eq!(json["payload"]["runId"], "r1");
        assert_eq!(json["payload"]["status"], "success");
        assert_eq!(event.name(), "run:complete");
    }
}
