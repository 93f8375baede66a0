use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Global crash log directory, set when the hook is installed.
static CRASH_LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize tracing.
///
/// - Filter: `RUST_LOG` when set, otherwise `config.filter`
/// - Stdout: compact and human-readable, or JSON when `config.json`
/// - File: daily-rolling `console.log` under `config.log_dir`, if set
///
/// Keep the returned guard alive for the life of the process; dropping it
/// stops the file writer. Safe to call twice: the second call is a no-op.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let stdout_layer = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .compact()
            .boxed()
    };

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "console.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(json = config.json, log_dir = ?config.log_dir, "Tracing initialized");
    }
    guard
}

/// Install a panic hook that writes crash details to `<state_dir>/crash_logs`
/// before the previous hook runs.
pub fn install_crash_hook(state_dir: &Path) {
    let crash_dir = state_dir.join("crash_logs");
    if let Err(e) = std::fs::create_dir_all(&crash_dir) {
        tracing::warn!(dir = %crash_dir.display(), error = %e, "Crash log directory unavailable");
        return;
    }
    if CRASH_LOG_DIR.set(crash_dir).is_err() {
        return;
    }

    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(dir) = CRASH_LOG_DIR.get() {
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let path = dir.join(format!("crash_{timestamp}.log"));

            let message = if let Some(msg) = info.payload().downcast_ref::<&str>() {
                (*msg).to_string()
            } else if let Some(msg) = info.payload().downcast_ref::<String>() {
                msg.clone()
            } else {
                "<unknown payload>".to_string()
            };
            let location = info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_else(|| "<unknown>".into());
            let thread = std::thread::current();

            let report = format!(
                "=== PIPELINE CONSOLE CRASH REPORT ===\n\
                 Time: {}\n\
                 Version: {}\n\n\
                 Panic: {message}\n\
                 Location: {location}\n\
                 Thread: {:?}\n\n\
                 Backtrace:\n{}\n",
                chrono::Local::now().to_rfc3339(),
                env!("CARGO_PKG_VERSION"),
                thread.name(),
                std::backtrace::Backtrace::force_capture(),
            );

            if std::fs::write(&path, report).is_ok() {
                eprintln!("[CRASH] Report written to: {}", path.display());
            }
        }
        prev_hook(info);
    }));

    tracing::debug!("Crash hook installed");
}

/// Crash report file names under `state_dir`, newest first.
pub fn list_crash_logs(state_dir: &Path) -> Vec<PathBuf> {
    let Ok(dir) = std::fs::read_dir(state_dir.join("crash_logs")) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = dir
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|e| e == "log"))
        .collect();
    paths.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    paths
}
