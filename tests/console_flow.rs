//! Whole-console behavior against the in-memory backend: bus, registry,
//! execution store and pollers together.

use std::sync::Arc;
use std::time::Duration;

use console_lib::engine::bus::{ConsoleEvent, EventFilter, EventKind, RunLogPayload};
use console_lib::engine::persistence::MemoryStorage;
use console_lib::notifications::{MemoryNotifier, NoticeLevel};
use console_lib::transport::memory::{InjectedFailure, InMemoryBackend};
use console_lib::transport::types::{LogsPage, RawLog, WireLog};
use console_lib::models::{LogEntry, LogLevel};
use console_lib::{Console, ConsoleConfig, RunMeta, RunStatus};

struct Harness {
    backend: Arc<InMemoryBackend>,
    storage: Arc<MemoryStorage>,
    notifier: Arc<MemoryNotifier>,
}

impl Harness {
    fn new() -> Self {
        Self {
            backend: Arc::new(InMemoryBackend::new()),
            storage: Arc::new(MemoryStorage::new()),
            notifier: Arc::new(MemoryNotifier::new()),
        }
    }

    fn console(&self) -> Console {
        Console::builder(ConsoleConfig::default())
            .transport(self.backend.clone())
            .storage(self.storage.clone())
            .notifier(self.notifier.clone())
            .build()
            .unwrap()
    }

    fn notices(&self, title: &str) -> usize {
        self.notifier.snapshot().iter().filter(|n| n.title == title).count()
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_replay_then_tail_until_complete() {
    let h = Harness::new();
    h.backend.create_run("r1", Some("Tailor CV"), Some("tailor"));
    h.backend.push_line("r1", "[claude] parsing tier=premium cost=0.01");
    h.backend.push_line("r1", "[gemini] scoring cost=0.002");

    let console = h.console();
    let mut events = console.subscribe(EventFilter::for_run("r1").with_kinds(&[EventKind::RunLog]));
    console.start_run("r1", RunMeta::new("Tailor CV", "tailor").with_job("job-1")).unwrap();

    wait_until(|| console.registry().run("r1").is_some_and(|r| r.logs.len() == 2)).await;
    h.backend.set_layer("r1", "tailor", "running");
    h.backend.push_line("r1", "Completed successfully");
    h.backend.finish("r1", "completed", None);

    wait_until(|| console.registry().run("r1").is_some_and(|r| r.status == RunStatus::Success)).await;
    let run = console.registry().run("r1").unwrap();
    assert_eq!(run.logs.len(), 3);
    assert_eq!(run.log_cursor, 3);
    assert_eq!(run.layer_status["tailor"], "running");
    assert_eq!(run.job_id.as_deref(), Some("job-1"));
    assert!(run.completed_at.is_some());
    assert!(!console.registry().has_poller("r1"));

    let texts: Vec<String> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ConsoleEvent::RunLog(p) => Some(p.log.text),
            _ => None,
        })
        .collect();
    assert_eq!(texts.len(), 3);
    assert!(texts[0].contains("parsing"));

    wait_until(|| console.executions().operation("r1").is_some_and(|op| op.status == RunStatus::Success)).await;
    let op = console.executions().operation("r1").unwrap();
    assert_eq!(op.log_count, 3);
    assert_eq!(op.backend_stats["claude"].count, 1);
    assert_eq!(op.backend_stats["gemini"].count, 1);

    assert_eq!(h.notices("Run completed"), 1);
    console.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_shared_outage_notifies_once() {
    let h = Harness::new();
    for id in ["a", "b"] {
        h.backend.create_run(id, None, None);
        h.backend.push_line(id, "working");
        h.backend.script_failures(id, InjectedFailure::ServiceUnavailable, 4);
    }

    let console = h.console();
    console.start_run("a", RunMeta::new("A", "tailor")).unwrap();
    console.start_run("b", RunMeta::new("B", "tailor")).unwrap();

    wait_until(|| {
        ["a", "b"]
            .iter()
            .all(|id| console.registry().run(id).is_some_and(|r| r.logs.len() == 1))
    })
    .await;

    assert_eq!(h.notices("Service unavailable"), 1);
    assert_eq!(h.notices("Reconnected"), 1);
    let levels: Vec<NoticeLevel> = h.notifier.snapshot().iter().map(|n| n.level).collect();
    assert_eq!(levels, vec![NoticeLevel::Warning, NoticeLevel::Success]);
    console.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_keeps_error() {
    let h = Harness::new();
    h.backend.create_run("r1", None, None);
    h.backend.push_line("r1", "ERROR: model refused");
    h.backend.finish("r1", "failed", Some("pipeline crashed"));

    let console = h.console();
    console.start_run("r1", RunMeta::new("Doomed", "tailor")).unwrap();

    wait_until(|| console.registry().run("r1").is_some_and(|r| r.status == RunStatus::Error)).await;
    let run = console.registry().run("r1").unwrap();
    assert_eq!(run.error.as_deref(), Some("pipeline crashed"));
    assert_eq!(run.logs.len(), 1);
    assert_eq!(h.notices("Run failed"), 1);
    console.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_reload_resumes_from_cursor() {
    let h = Harness::new();
    h.backend.create_run("r1", Some("Long job"), Some("tailor"));
    for i in 0..3 {
        h.backend.push_line("r1", format!("step {i}"));
    }

    let first = h.console();
    first.start_run("r1", RunMeta::new("Long job", "tailor")).unwrap();
    wait_until(|| first.registry().run("r1").is_some_and(|r| r.logs.len() == 3)).await;
    wait_until(|| first.executions().operation("r1").is_some_and(|op| op.log_count == 3)).await;
    first.shutdown();
    drop(first);

    h.backend.push_line("r1", "step 3");
    h.backend.push_line("r1", "step 4");
    h.backend.finish("r1", "completed", None);
    let before = h.backend.sinces("r1").len();

    let second = h.console();
    assert_eq!(second.registry().active_run_id().as_deref(), Some("r1"));
    wait_until(|| second.registry().run("r1").is_some_and(|r| r.status == RunStatus::Success)).await;

    assert_eq!(h.backend.sinces("r1")[before], 3);
    let run = second.registry().run("r1").unwrap();
    let texts: Vec<&str> = run.logs.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["step 0", "step 1", "step 2", "step 3", "step 4"]);

    wait_until(|| second.executions().operation("r1").is_some_and(|op| op.status == RunStatus::Success)).await;
    assert_eq!(second.executions().operation("r1").unwrap().log_count, 5);
    second.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_closed_run_stays_closed() {
    let h = Harness::new();
    h.backend.create_run("r1", None, None);
    h.backend.push_line("r1", "first");

    let console = h.console();
    console.start_run("r1", RunMeta::new("R1", "tailor")).unwrap();
    wait_until(|| console.registry().run("r1").is_some_and(|r| r.logs.len() == 1)).await;

    assert!(console.close_run("r1"));
    h.backend.push_line("r1", "late");
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(console.registry().run("r1").is_none());
    assert!(!console.registry().has_poller("r1"));
    assert_eq!(console.registry().pending_count("r1"), 0);
    console.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_max_log_index_does_not_wedge_console() {
    let h = Harness::new();
    h.backend.create_run("r1", None, None);
    h.backend.create_run("r2", None, None);
    h.backend.push_line("r2", "hello");
    h.backend.script_page(
        "r1",
        LogsPage {
            logs: vec![RawLog::Entry(WireLog {
                index: Some(u64::MAX),
                message: "edge".into(),
                ..WireLog::default()
            })],
            next_index: u64::MAX,
            total_count: u64::MAX,
            status: "running".into(),
            ..LogsPage::default()
        },
    );

    let console = h.console();
    console.start_run("r1", RunMeta::new("R1", "tailor")).unwrap();
    wait_until(|| console.registry().run("r1").is_some_and(|r| r.logs.len() == 1)).await;
    assert_eq!(console.registry().run("r1").unwrap().log_cursor, u64::MAX);

    console.start_run("r2", RunMeta::new("R2", "tailor")).unwrap();
    wait_until(|| console.registry().run("r2").is_some_and(|r| r.logs.len() == 1)).await;
    assert!(console.registry().has_poller("r2"));
    console.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_run_recovered_from_orphan_logs_is_mirrored() {
    let h = Harness::new();
    h.backend.create_run("r9", Some("Orphan"), Some("tailor"));
    h.backend.push_line("r9", "first");

    let console = h.console();
    console.bus().publish(ConsoleEvent::RunLog(RunLogPayload {
        run_id: "r9".into(),
        log: LogEntry::new(LogLevel::Info, "first").with_index(0),
    }));

    wait_until(|| console.registry().run("r9").is_some()).await;
    wait_until(|| console.executions().operation("r9").is_some()).await;
    assert_eq!(console.executions().operation("r9").unwrap().log_count, 1);

    h.backend.push_line("r9", "second");
    h.backend.finish("r9", "completed", None);

    wait_until(|| console.registry().run("r9").is_some_and(|r| r.status == RunStatus::Success)).await;
    wait_until(|| console.executions().operation("r9").is_some_and(|op| op.status == RunStatus::Success)).await;
    assert_eq!(console.registry().run("r9").unwrap().logs.len(), 2);
    let op = console.executions().operation("r9").unwrap();
    assert_eq!(op.log_count, 2);
    assert_eq!(op.title, "Orphan");
    console.shutdown();
}
