use std::sync::Mutex;

use serde::Serialize;
use ts_rs::TS;

use crate::models::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing notice (toast) produced by the console core.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub body: String,
}

/// Injected capability for surfacing notices to the user. The core never
/// checks whether a toast system exists; hosts without one pass [`NoopNotifier`].
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, level: NoticeLevel, title: &str, body: &str);
}

pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _level: NoticeLevel, _title: &str, _body: &str) {}
}

/// Routes notices into the tracing pipeline. Used by the CLI.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NoticeLevel, title: &str, body: &str) {
        match level {
            NoticeLevel::Error => tracing::error!(notice = %title, "{}", body),
            NoticeLevel::Warning => tracing::warn!(notice = %title, "{}", body),
            NoticeLevel::Info | NoticeLevel::Success => tracing::info!(notice = %title, "{}", body),
        }
    }
}

/// Collects notices so a host UI can drain and render them.
#[derive(Default)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Notice> {
        let mut notices = self.notices.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *notices)
    }

    pub fn snapshot(&self) -> Vec<Notice> {
        self.notices.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, level: NoticeLevel, title: &str, body: &str) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Notice {
                level,
                title: title.to_string(),
                body: body.to_string(),
            });
    }
}

// ---------------------------------------------------------------------------
// Console notice helpers
// ---------------------------------------------------------------------------

pub fn notify_service_unavailable(notifier: &dyn Notifier) {
    notifier.notify(
        NoticeLevel::Warning,
        "Service unavailable",
        "The log service is restarting. Retrying with backoff...",
    );
}

pub fn notify_service_restored(notifier: &dyn Notifier) {
    notifier.notify(NoticeLevel::Success, "Reconnected", "Log streaming resumed.");
}

pub fn notify_run_completed(notifier: &dyn Notifier, title: &str, status: RunStatus, duration_ms: u64) {
    let duration_str = format!("{:.1}s", duration_ms as f64 / 1000.0);
    let (level, label) = match status {
        RunStatus::Success => (NoticeLevel::Success, "completed"),
        RunStatus::Error => (NoticeLevel::Error, "failed"),
        _ => (NoticeLevel::Info, "ended"),
    };
    notifier.notify(
        level,
        &format!("Run {}", label),
        &format!("{} finished in {}", title, duration_str),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_notifier_drains() {
        let notifier = MemoryNotifier::new();
        notify_service_unavailable(&notifier);
        notify_service_restored(&notifier);
        let notices = notifier.drain();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].level, NoticeLevel::Warning);
        assert_eq!(notices[1].title, "Reconnected");
        assert!(notifier.drain().is_empty());
    }

    #[test]
    fn test_run_completed_formatting() {
        let notifier = MemoryNotifier::new();
        notify_run_completed(&notifier, "Tailor CV", RunStatus::Error, 12_340);
        let notices = notifier.snapshot();
        assert_eq!(notices[0].title, "Run failed");
        assert_eq!(notices[0].body, "Tailor CV finished in 12.3s");
        assert_eq!(notices[0].level, NoticeLevel::Error);
    }
}
