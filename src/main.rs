use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use console_lib::config::ConsoleConfig;
use console_lib::engine::attribution::BackendSummary;
use console_lib::engine::bus::{ConsoleEvent, EventFilter, EventKind};
use console_lib::engine::execution_store::ExecutionStore;
use console_lib::engine::persistence::{FileStorage, MemoryStorage, SessionStorage};
use console_lib::engine::registry::sanitize::sanitize;
use console_lib::notifications::TracingNotifier;
use console_lib::transport::memory::InMemoryBackend;
use console_lib::{logging, AppError, Console, RunMeta};

#[derive(Parser, Debug)]
#[command(name = "pipeline-console", version, about = "Replay and tail pipeline run logs")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session to attach to. Defaults to the configured session, or a new one.
    #[arg(long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay and follow one or more runs until every one completes.
    Tail {
        #[arg(required = true)]
        run_ids: Vec<String>,
    },
    /// List the runs persisted for the session.
    Runs,
    /// Print per-backend log counts and cost for the session.
    Stats,
    /// Stream a simulated pipeline run from an in-process backend.
    Demo {
        /// Number of log lines the simulated run produces.
        #[arg(long, default_value_t = 12)]
        lines: u32,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match ConsoleConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pipeline-console: {e}");
            std::process::exit(2);
        }
    };
    if args.session.is_some() {
        config.storage.session_id = args.session.clone();
    }

    let _log_guard = logging::init(&config.logging);
    logging::install_crash_hook(&config.storage.resolved_dir());
    tracing::info!("Starting pipeline-console v{}", env!("CARGO_PKG_VERSION"));

    let result = match args.command {
        Command::Tail { run_ids } => tail(config, run_ids).await,
        Command::Runs => list_runs(&config),
        Command::Stats => stats(&config),
        Command::Demo { lines } => demo(config, lines).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Command failed");
        eprintln!("pipeline-console: {e}");
        std::process::exit(1);
    }
}

async fn tail(config: ConsoleConfig, run_ids: Vec<String>) -> Result<(), AppError> {
    let console = Console::builder(config)
        .notifier(Arc::new(TracingNotifier))
        .build()?;
    follow(&console, &run_ids).await
}

/// Start every run, print its events, and return once all have completed
/// or the user interrupts.
async fn follow(console: &Console, run_ids: &[String]) -> Result<(), AppError> {
    let mut events = console.subscribe(EventFilter::all().with_kinds(&EventKind::LIFECYCLE));
    for run_id in run_ids {
        console.start_run(run_id, RunMeta::new(run_id.as_str(), "tail"))?;
    }

    let mut remaining: HashSet<&str> = run_ids.iter().map(String::as_str).collect();
    let multi = run_ids.len() > 1;
    while !remaining.is_empty() {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        let prefix = if multi { format!("[{}] ", event.run_id()) } else { String::new() };
        match &event {
            ConsoleEvent::RunLog(p) => {
                let log = &p.log;
                let backend = log.backend.as_deref().map(|b| format!(" ({b})")).unwrap_or_default();
                println!(
                    "{prefix}{} {:<7} {}{backend}",
                    log.timestamp.format("%H:%M:%S"),
                    format!("{:?}", log.level).to_lowercase(),
                    log.text
                );
            }
            ConsoleEvent::LayerStatus(p) => {
                let layers: Vec<String> = p.layer_status.iter().map(|(k, v)| format!("{k}={v}")).collect();
                println!("{prefix}layers: {}", layers.join(" "));
            }
            ConsoleEvent::RunComplete(p) => {
                match &p.error {
                    Some(error) => println!("{prefix}run {} {}: {error}", p.run_id, p.status),
                    None => println!("{prefix}run {} {}", p.run_id, p.status),
                }
                remaining.remove(p.run_id.as_str());
            }
            ConsoleEvent::RunStart(_)
            | ConsoleEvent::RunRecovered(_)
            | ConsoleEvent::PollStart(_)
            | ConsoleEvent::PollEnd(_) => {}
        }
    }

    settle(console, run_ids).await;
    console.shutdown();
    Ok(())
}

/// Give the bus listeners a moment to record completions before shutdown.
async fn settle(console: &Console, run_ids: &[String]) {
    for _ in 0..50 {
        let recorded = run_ids.iter().all(|id| {
            let run_done = console.registry().run(id).map_or(true, |run| !run.status.is_live());
            let op_done = console.executions().operation(id).map_or(true, |op| !op.status.is_live());
            run_done && op_done
        });
        if recorded {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn session_storage(config: &ConsoleConfig) -> Result<Arc<dyn SessionStorage>, AppError> {
    let session_id = config.storage.session_id.as_deref().ok_or_else(|| {
        AppError::Config("no session selected: pass --session or set CONSOLE_SESSION_ID".into())
    })?;
    Ok(Arc::new(FileStorage::new(
        &config.storage.resolved_dir(),
        session_id,
        config.storage.quota_bytes,
    )?))
}

fn list_runs(config: &ConsoleConfig) -> Result<(), AppError> {
    let storage = session_storage(config)?;
    let Some(raw) = storage.get_item(&config.registry.storage_key)? else {
        println!("no runs recorded");
        return Ok(());
    };
    let restored = sanitize(&raw);
    for repair in &restored.repairs {
        tracing::warn!(repair = %repair, "Repaired persisted state");
    }

    let state = restored.state;
    for run in state.ordered_runs() {
        let marker = if state.active_run_id.as_deref() == Some(run.run_id.as_str()) { "*" } else { " " };
        println!(
            "{marker} {:<24} {:<8} {:>5} logs  {}",
            run.run_id,
            run.status.as_str(),
            run.logs.len(),
            run.title
        );
    }
    Ok(())
}

fn stats(config: &ConsoleConfig) -> Result<(), AppError> {
    let storage = session_storage(config)?;
    let store = ExecutionStore::new(config, storage);
    store.restore()?;
    for op in store.operations() {
        println!("{} ({}, {} logs)", op.operation_id, op.status, op.log_count);
        print_summary(&op.backend_stats);
    }
    println!("total");
    print_summary(&store.aggregate());
    Ok(())
}

fn print_summary(summary: &BackendSummary) {
    for (backend, stats) in summary {
        println!("  {backend:<14} {:>6}  ${:.4}", stats.count, stats.cost);
    }
}

async fn demo(mut config: ConsoleConfig, lines: u32) -> Result<(), AppError> {
    const RUN_ID: &str = "demo-run";
    const BACKENDS: [(&str, &str); 3] = [("claude", "0.0040"), ("gemini", "0.0012"), ("openai", "0.0025")];

    config.storage.session_id = Some("demo".into());
    let backend = Arc::new(InMemoryBackend::new());
    backend.create_run(RUN_ID, Some("Demo job"), Some("tailor"));

    let console = Console::builder(config)
        .transport(backend.clone())
        .storage(Arc::new(MemoryStorage::new()))
        .notifier(Arc::new(TracingNotifier))
        .build()?;

    let producer = backend.clone();
    tokio::spawn(async move {
        producer.set_layer(RUN_ID, "extract", "running");
        for i in 0..lines {
            let (name, cost) = BACKENDS[i as usize % BACKENDS.len()];
            producer.push_line(RUN_ID, format!("[{name}] step {i} done tier=standard cost={cost}"));
            if i == lines / 2 {
                producer.set_layer(RUN_ID, "extract", "done");
                producer.set_layer(RUN_ID, "tailor", "running");
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        producer.set_layer(RUN_ID, "tailor", "done");
        producer.finish(RUN_ID, "completed", None);
    });

    follow(&console, &[RUN_ID.to_string()]).await?;
    print_summary(&console.executions().aggregate());
    Ok(())
}
