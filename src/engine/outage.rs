//! Shared outage coordination across independently running log streams.
//!
//! One instance is handed to every poller. It only deduplicates the
//! user-facing "service unavailable" / "reconnected" notices; pollers never
//! coordinate their retry timing through it.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::notifications::{notify_service_restored, notify_service_unavailable, Notifier};

#[derive(Default)]
struct OutageState {
    unavailable: bool,
    /// An "unavailable" notice is showing and still owes a "reconnected".
    noticed: bool,
    last_notice: Option<Instant>,
    affected: BTreeSet<String>,
}

pub struct OutageMonitor {
    notifier: Arc<dyn Notifier>,
    cooldown: Duration,
    state: Mutex<OutageState>,
}

impl OutageMonitor {
    pub fn new(notifier: Arc<dyn Notifier>, cooldown: Duration) -> Self {
        Self {
            notifier,
            cooldown,
            state: Mutex::new(OutageState::default()),
        }
    }

    /// Record that `run_id` saw the service down. Returns true when this call
    /// produced the user notice.
    pub fn report_unavailable(&self, run_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.affected.insert(run_id.to_string());
        if state.unavailable {
            return false;
        }
        state.unavailable = true;

        let now = Instant::now();
        let cooling = state
            .last_notice
            .is_some_and(|at| now.duration_since(at) < self.cooldown);
        if cooling {
            tracing::debug!(run_id = %run_id, "Outage notice suppressed (cooldown)");
            return false;
        }

        state.last_notice = Some(now);
        state.noticed = true;
        drop(state);

        tracing::warn!(run_id = %run_id, "Log service unavailable, backing off");
        notify_service_unavailable(self.notifier.as_ref());
        true
    }

    /// Record a successful fetch by `run_id` after it saw an outage. The first
    /// success while the outage flag is set clears it for everyone.
    pub fn report_restored(&self, run_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.affected.remove(run_id);
        if !state.unavailable {
            return false;
        }
        state.unavailable = false;
        state.affected.clear();
        let owed = std::mem::take(&mut state.noticed);
        drop(state);

        tracing::info!(run_id = %run_id, "Log service restored");
        if owed {
            notify_service_restored(self.notifier.as_ref());
        }
        owed
    }

    pub fn is_unavailable(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).unavailable
    }

    /// Runs that reported the current outage.
    pub fn affected_runs(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .affected
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::MemoryNotifier;

    fn monitor(cooldown_ms: u64) -> (OutageMonitor, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        (
            OutageMonitor::new(notifier.clone(), Duration::from_millis(cooldown_ms)),
            notifier,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_notice_per_outage_across_runs() {
        let (outage, notifier) = monitor(10_000);
        assert!(outage.report_unavailable("r1"));
        assert!(!outage.report_unavailable("r2"));
        assert!(!outage.report_unavailable("r1"));
        assert_eq!(outage.affected_runs(), vec!["r1", "r2"]);

        assert!(outage.report_restored("r2"));
        assert!(!outage.report_restored("r1"));

        let titles: Vec<String> = notifier.drain().into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["Service unavailable", "Reconnected"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_within_cooldown_is_silent() {
        let (outage, notifier) = monitor(10_000);
        outage.report_unavailable("r1");
        outage.report_restored("r1");
        notifier.drain();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!outage.report_unavailable("r1"));
        assert!(outage.is_unavailable());
        assert!(!outage.report_restored("r1"));
        assert!(notifier.drain().is_empty());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(outage.report_unavailable("r1"));
    }
}
