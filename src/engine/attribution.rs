//! Backend attribution and log normalization.
//!
//! Pure functions, no async or shared state, for testability.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::models::{LogEntry, LogLevel};
use crate::transport::types::{parse_timestamp, WireLog};

/// Bracketed tags recognized as backend markers, e.g. `[claude] drafting`.
pub const KNOWN_BACKENDS: &[&str] = &[
    "claude",
    "claude_cli",
    "claude_api",
    "anthropic",
    "openai",
    "gpt",
    "codex",
    "gemini",
    "langchain",
    "ollama",
    "local",
    "cache",
];

/// Stats key for log lines with no attribution.
pub const UNATTRIBUTED: &str = "unattributed";

fn backend_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bbackend=([A-Za-z0-9_.:-]+)").expect("valid regex"))
}

fn bracket_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([A-Za-z0-9_ -]{1,32})\]").expect("valid regex"))
}

fn tier_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\btier=([A-Za-z0-9_.-]+)").expect("valid regex"))
}

fn cost_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bcost(?:_usd)?=\$?([0-9]+(?:\.[0-9]+)?)").expect("valid regex")
    })
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

/// Explicit field wins; otherwise a `backend=<name>` token, then a recognized
/// bracketed tag.
pub fn infer_backend(explicit: Option<&str>, text: &str) -> Option<String> {
    if let Some(b) = explicit.map(str::trim).filter(|b| !b.is_empty()) {
        return Some(b.to_lowercase());
    }

    if let Some(cap) = backend_token_re().captures(text) {
        return Some(cap[1].to_lowercase());
    }

    bracket_tag_re().captures_iter(text).find_map(|cap| {
        let tag = cap[1].trim().to_lowercase().replace([' ', '-'], "_");
        KNOWN_BACKENDS.contains(&tag.as_str()).then_some(tag)
    })
}

pub fn infer_tier(explicit: Option<&str>, text: &str) -> Option<String> {
    if let Some(t) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(t.to_string());
    }
    tier_token_re().captures(text).map(|cap| cap[1].to_string())
}

pub fn infer_cost(explicit: Option<f64>, text: &str) -> f64 {
    if let Some(c) = explicit.filter(|c| c.is_finite() && *c >= 0.0) {
        return c;
    }
    cost_token_re()
        .captures(text)
        .and_then(|cap| cap[1].parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Explicit level if recognized, otherwise inferred from the message text.
pub fn classify_level(explicit: Option<&str>, text: &str) -> LogLevel {
    if let Some(level) = explicit.and_then(parse_level) {
        return level;
    }

    let lower = text.to_lowercase();

    if lower.contains("error")
        || lower.contains("failed")
        || lower.contains("exception")
        || lower.contains("traceback")
        || text.contains('❌')
    {
        return LogLevel::Error;
    }

    if lower.contains("warning") || lower.contains("warn:") || text.contains('⚠') {
        return LogLevel::Warning;
    }

    if lower.contains("completed")
        || lower.contains("success")
        || lower.contains("done")
        || text.contains('✅')
    {
        return LogLevel::Success;
    }

    if lower.starts_with("debug") || lower.contains("[debug]") {
        return LogLevel::Debug;
    }

    LogLevel::Info
}

fn parse_level(raw: &str) -> Option<LogLevel> {
    match raw.trim().to_lowercase().as_str() {
        "info" => Some(LogLevel::Info),
        "warn" | "warning" => Some(LogLevel::Warning),
        "error" | "err" | "critical" => Some(LogLevel::Error),
        "success" | "ok" => Some(LogLevel::Success),
        "debug" | "trace" => Some(LogLevel::Debug),
        _ => None,
    }
}

/// Turn a wire log into a [`LogEntry`].
///
/// `fallback_index` is used when the server omitted the entry's index (its
/// position in the page is then authoritative).
pub fn normalize_log(wire: WireLog, fallback_index: u64, now: DateTime<Utc>) -> LogEntry {
    let backend = infer_backend(wire.backend.as_deref(), &wire.message);
    let tier = infer_tier(wire.tier.as_deref(), &wire.message);
    let cost = infer_cost(wire.cost_usd, &wire.message);
    let level = classify_level(wire.level.as_deref(), &wire.message);
    let timestamp = wire.timestamp.as_ref().and_then(parse_timestamp).unwrap_or(now);

    LogEntry {
        timestamp,
        level,
        text: wire.message,
        backend,
        tier,
        cost,
        index: Some(wire.index.unwrap_or(fallback_index)),
        metadata: wire.metadata,
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct BackendStats {
    pub count: u64,
    pub cost: f64,
}

impl BackendStats {
    pub fn record(&mut self, cost: f64) {
        self.count += 1;
        self.cost += cost;
    }

    pub fn merge(&mut self, other: &BackendStats) {
        self.count += other.count;
        self.cost += other.cost;
    }
}

pub type BackendSummary = BTreeMap<String, BackendStats>;

pub fn backend_key(entry: &LogEntry) -> &str {
    entry.backend.as_deref().unwrap_or(UNATTRIBUTED)
}

/// Per-backend counts and costs for a set of log lines.
pub fn summarize_backends<'a>(logs: impl IntoIterator<Item = &'a LogEntry>) -> BackendSummary {
    let mut summary = BackendSummary::new();
    for entry in logs {
        summary
            .entry(backend_key(entry).to_string())
            .or_default()
            .record(entry.cost);
    }
    summary
}

pub fn merge_summaries<'a>(summaries: impl IntoIterator<Item = &'a BackendSummary>) -> BackendSummary {
    let mut total = BackendSummary::new();
    for summary in summaries {
        for (backend, stats) in summary {
            total.entry(backend.clone()).or_default().merge(stats);
        }
    }
    total
}
