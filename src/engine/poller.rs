//! Backoff-aware polling loop, independent of what is being fetched.
//!
//! A [`PollSource`] supplies the fetch and the response handling; [`Poller`]
//! owns the schedule, the consecutive-error counter, connection transitions
//! and cancellation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::PollingConfig;
use crate::error::AppError;

// ============================================================================
// Timing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    pub active_interval: Duration,
    pub idle_interval: Duration,
    pub error_interval: Duration,
    /// Consecutive errors retried at `error_interval` before doubling starts.
    pub backoff_after: u32,
    pub max_backoff: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::from_config(&PollingConfig::default())
    }
}

impl PollerConfig {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            active_interval: Duration::from_millis(config.active_interval_ms),
            idle_interval: Duration::from_millis(config.idle_interval_ms),
            error_interval: Duration::from_millis(config.error_retry_ms),
            backoff_after: config.backoff_after_errors,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before the next attempt after `consecutive_errors` failures in a row.
    pub fn backoff_delay(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors <= self.backoff_after {
            return self.error_interval.min(self.max_backoff);
        }
        let exponent = (consecutive_errors - self.backoff_after).min(16);
        self.error_interval
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

// ============================================================================
// Source contract
// ============================================================================

/// What a successful response means for the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollVerdict {
    /// Work in progress: poll again at the active interval.
    Active,
    /// Nothing happening: poll again at the idle interval.
    Idle,
    /// Done: the loop stops.
    Finished,
}

/// A source's override of the default error schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    /// Fixed retry, then exponential backoff.
    Default,
    After(Duration),
    /// Stop polling.
    GiveUp,
}

#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    type Response: Send;

    fn label(&self) -> &str;

    async fn fetch(&self) -> Result<Self::Response, AppError>;

    fn handle(&self, response: Self::Response) -> PollVerdict;

    fn on_failure(&self, _error: &AppError, _consecutive_errors: u32) -> RetryPlan {
        RetryPlan::Default
    }

    fn on_poll_start(&self) {}

    fn on_poll_end(&self, _outcome: Result<(), &AppError>) {}

    /// Called once per transition, never on every cycle.
    fn on_connection_change(&self, _connected: bool) {}
}

// ============================================================================
// Poller
// ============================================================================

struct PollerState {
    token: Option<CancellationToken>,
    consecutive_errors: u32,
    connected: bool,
    finished: bool,
}

struct PollerInner<S: PollSource> {
    source: S,
    config: PollerConfig,
    state: Mutex<PollerState>,
    /// Serializes scheduled cycles with `refresh()`.
    cycle_lock: tokio::sync::Mutex<()>,
}

pub struct Poller<S: PollSource> {
    inner: Arc<PollerInner<S>>,
}

impl<S: PollSource> Poller<S> {
    pub fn new(source: S, config: PollerConfig) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                source,
                config,
                state: Mutex::new(PollerState {
                    token: None,
                    consecutive_errors: 0,
                    connected: true,
                    finished: false,
                }),
                cycle_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    /// Spawn the loop. The first fetch happens immediately. Returns false if
    /// already running, already finished, or called outside a tokio runtime.
    pub fn start(&self) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!(source = %self.inner.source.label(), "Poller start ignored: no tokio runtime");
                return false;
            }
        };

        let token = {
            let mut state = self.inner.lock_state();
            if state.finished {
                return false;
            }
            if state.token.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return false;
            }
            let token = CancellationToken::new();
            state.token = Some(token.clone());
            token
        };

        tracing::debug!(source = %self.inner.source.label(), "Poller started");
        handle.spawn(run_loop(self.inner.clone(), token));
        true
    }

    /// Cancel the schedule. An in-flight fetch completes but its result is
    /// discarded. Safe to call repeatedly.
    pub fn stop(&self) {
        let token = self.inner.lock_state().token.take();
        if let Some(token) = token {
            if !token.is_cancelled() {
                tracing::debug!(source = %self.inner.source.label(), "Poller stopped");
            }
            token.cancel();
        }
    }

    /// One out-of-band cycle. Does not disturb the schedule; waits for any
    /// in-flight cycle first. A finished poller is left alone.
    pub async fn refresh(&self) {
        let token = {
            let state = self.inner.lock_state();
            if state.finished {
                return;
            }
            state.token.clone().filter(|t| !t.is_cancelled()).unwrap_or_default()
        };
        self.inner.cycle(&token).await;
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .lock_state()
            .token
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// The source reported completion (or gave up).
    pub fn is_finished(&self) -> bool {
        self.inner.lock_state().finished
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.lock_state().consecutive_errors
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock_state().connected
    }
}

impl<S: PollSource> Drop for Poller<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop<S: PollSource>(inner: Arc<PollerInner<S>>, token: CancellationToken) {
    while let Some(delay) = inner.cycle(&token).await {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::trace!(source = %inner.source.label(), "Poll loop exited");
}

impl<S: PollSource> PollerInner<S> {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one fetch/handle cycle. Returns the delay before the next one, or
    /// `None` when the loop should end.
    async fn cycle(&self, token: &CancellationToken) -> Option<Duration> {
        let _guard = self.cycle_lock.lock().await;
        if token.is_cancelled() {
            return None;
        }

        self.source.on_poll_start();
        let result = self.source.fetch().await;

        if token.is_cancelled() {
            tracing::debug!(source = %self.source.label(), "Discarding result fetched after stop");
            self.source.on_poll_end(result.as_ref().map(|_| ()));
            return None;
        }

        match result {
            Ok(response) => {
                let reconnected = {
                    let mut state = self.lock_state();
                    state.consecutive_errors = 0;
                    !std::mem::replace(&mut state.connected, true)
                };
                if reconnected {
                    self.source.on_connection_change(true);
                }

                let verdict = self.source.handle(response);
                self.source.on_poll_end(Ok(()));

                match verdict {
                    PollVerdict::Active => Some(self.config.active_interval),
                    PollVerdict::Idle => Some(self.config.idle_interval),
                    PollVerdict::Finished => {
                        self.finish(token);
                        None
                    }
                }
            }
            Err(e) => {
                let (consecutive, disconnected) = {
                    let mut state = self.lock_state();
                    state.consecutive_errors += 1;
                    (
                        state.consecutive_errors,
                        std::mem::replace(&mut state.connected, false),
                    )
                };
                if disconnected {
                    self.source.on_connection_change(false);
                }
                self.source.on_poll_end(Err(&e));

                match self.source.on_failure(&e, consecutive) {
                    RetryPlan::Default => {
                        let delay = self.config.backoff_delay(consecutive);
                        tracing::debug!(
                            source = %self.source.label(),
                            consecutive,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Poll failed"
                        );
                        Some(delay)
                    }
                    RetryPlan::After(delay) => Some(delay),
                    RetryPlan::GiveUp => {
                        tracing::info!(source = %self.source.label(), error = %e, "Poller giving up");
                        self.finish(token);
                        None
                    }
                }
            }
        }
    }

    fn finish(&self, token: &CancellationToken) {
        self.lock_state().finished = true;
        token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    /// Scripted source: pops one outcome per fetch; `Ok(true)` means finished.
    struct Script {
        outcomes: Mutex<VecDeque<Result<bool, AppError>>>,
        fetches: AtomicUsize,
        starts: AtomicUsize,
        transitions: Mutex<Vec<bool>>,
        ends: Mutex<Vec<bool>>,
        latency: Duration,
    }

    impl Script {
        fn new(outcomes: Vec<Result<bool, AppError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                fetches: AtomicUsize::new(0),
                starts: AtomicUsize::new(0),
                transitions: Mutex::new(Vec::new()),
                ends: Mutex::new(Vec::new()),
                latency: Duration::ZERO,
            }
        }

        fn slow(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }
    }

    #[async_trait]
    impl PollSource for Script {
        type Response = bool;

        fn label(&self) -> &str {
            "script"
        }

        async fn fetch(&self) -> Result<bool, AppError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(false))
        }

        fn handle(&self, done: bool) -> PollVerdict {
            if done {
                PollVerdict::Finished
            } else {
                PollVerdict::Active
            }
        }

        fn on_poll_start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_poll_end(&self, outcome: Result<(), &AppError>) {
            self.ends.lock().unwrap().push(outcome.is_ok());
        }

        fn on_connection_change(&self, connected: bool) {
            self.transitions.lock().unwrap().push(connected);
        }
    }

    fn offline() -> AppError {
        AppError::NetworkOffline("refused".into())
    }

    fn config() -> PollerConfig {
        PollerConfig {
            active_interval: Duration::from_millis(250),
            idle_interval: Duration::from_secs(2),
            error_interval: Duration::from_secs(2),
            backoff_after: 3,
            max_backoff: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_backoff_fixed_then_exponential() {
        let c = config();
        assert_eq!(c.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(c.backoff_delay(3), Duration::from_secs(2));
        assert_eq!(c.backoff_delay(4), Duration::from_secs(4));
        assert_eq!(c.backoff_delay(5), Duration::from_secs(8));
        assert_eq!(c.backoff_delay(7), Duration::from_secs(30));
        assert_eq!(c.backoff_delay(u32::MAX), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn prop_backoff_monotonic_and_capped(n in 0u32..200, base_ms in 1u64..5_000, max_ms in 1u64..120_000) {
            let c = PollerConfig {
                error_interval: Duration::from_millis(base_ms),
                max_backoff: Duration::from_millis(max_ms),
                ..config()
            };
            let a = c.backoff_delay(n);
            let b = c.backoff_delay(n + 1);
            prop_assert!(b >= a);
            prop_assert!(b <= c.max_backoff);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_finished() {
        let poller = Poller::new(Script::new(vec![Ok(false), Ok(false), Ok(true)]), config());
        assert!(poller.start());
        assert!(!poller.start(), "second start is a no-op");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(poller.source().fetches.load(Ordering::SeqCst), 3);
        assert!(poller.is_finished());
        assert!(!poller.is_running());
        assert!(!poller.start(), "finished pollers do not restart");
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_never_end_the_loop() {
        let outcomes = (0..6).map(|_| Err(offline())).chain([Ok(false)]).collect();
        let poller = Poller::new(Script::new(outcomes), config());
        poller.start();

        // 2+2+2+4+8+16 seconds of retries, then one success.
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(poller.is_running());
        assert_eq!(poller.consecutive_errors(), 0);
        assert!(poller.is_connected());
        assert_eq!(*poller.source().transitions.lock().unwrap(), vec![false, true]);
        let ends = poller.source().ends.lock().unwrap().clone();
        assert_eq!(&ends[..7], &[false, false, false, false, false, false, true]);
        poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_further_cycles() {
        let poller = Poller::new(Script::new(vec![]), config());
        poller.start();
        tokio::time::sleep(Duration::from_millis(600)).await;
        poller.stop();
        poller.stop();
        let fetched = poller.source().fetches.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(poller.source().fetches.load(Ordering::SeqCst), fetched);
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_fetches_out_of_band() {
        let poller = Poller::new(Script::new(vec![]), config());
        poller.refresh().await;
        assert_eq!(poller.source().fetches.load(Ordering::SeqCst), 1);
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_after_finish_is_noop() {
        let poller = Poller::new(Script::new(vec![Ok(true)]), config());
        poller.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(poller.is_finished());

        poller.refresh().await;
        assert_eq!(poller.source().fetches.load(Ordering::SeqCst), 1);
        assert_eq!(poller.source().starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_fetch_still_ends_poll() {
        let poller = Poller::new(Script::new(vec![]).slow(Duration::from_secs(1)), config());
        poller.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(poller.source().starts.load(Ordering::SeqCst), 1);
        assert!(poller.source().ends.lock().unwrap().is_empty());

        poller.stop();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(poller.source().fetches.load(Ordering::SeqCst), 1);
        assert_eq!(*poller.source().ends.lock().unwrap(), vec![true]);
    }
}
