//! Console configuration: TOML file, then environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::validation::{require_non_empty, require_positive};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub transport: TransportConfig,
    pub polling: PollingConfig,
    pub registry: RegistryConfig,
    pub executions: ExecutionsConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `GET {logs_base_url}/{run_id}?since=..&limit=..`
    pub logs_base_url: String,
    /// `GET {status_base_url}/{run_id}/status`
    pub status_base_url: String,
    pub api_token: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            logs_base_url: "http://localhost:8000/api/logs".into(),
            status_base_url: "http://localhost:8000/api/runner/operations".into(),
            api_token: None,
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub active_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub error_retry_ms: u64,
    /// Consecutive ordinary errors tolerated at the fixed retry interval
    /// before exponential backoff starts.
    pub backoff_after_errors: u32,
    pub max_backoff_ms: u64,
    pub outage_backoff_initial_ms: u64,
    pub outage_backoff_max_ms: u64,
    pub outage_notice_cooldown_ms: u64,
    pub page_size: u32,
    /// Consecutive 404s after which a run is declared `unknown`.
    pub max_not_found: u32,
    pub debug: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: 250,
            idle_interval_ms: 2_000,
            error_retry_ms: 2_000,
            backoff_after_errors: 3,
            max_backoff_ms: 30_000,
            outage_backoff_initial_ms: 1_000,
            outage_backoff_max_ms: 30_000,
            outage_notice_cooldown_ms: 10_000,
            page_size: 500,
            max_not_found: 40,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_runs: usize,
    pub max_logs_per_run: usize,
    /// Logs kept per run after a storage quota failure.
    pub aggressive_log_trim: usize,
    pub title_max_chars: usize,
    pub pending_log_timeout_ms: u64,
    pub persist_debounce_ms: u64,
    pub storage_key: String,
    pub notify_on_completion: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_runs: 10,
            max_logs_per_run: 500,
            aggressive_log_trim: 50,
            title_max_chars: 80,
            pending_log_timeout_ms: 5_000,
            persist_debounce_ms: 500,
            storage_key: "pipeline-console.state".into(),
            notify_on_completion: true,
        }
    }
}

impl RegistryConfig {
    pub fn pending_log_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_log_timeout_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionsConfig {
    pub max_operations: usize,
    pub storage_key: String,
}

impl Default for ExecutionsConfig {
    fn default() -> Self {
        Self {
            max_operations: 50,
            storage_key: "pipeline-console.executions".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for session state. Defaults to the user cache dir.
    pub dir: Option<PathBuf>,
    /// Session scope. A fresh id is generated per process when absent.
    pub session_id: Option<String>,
    pub quota_bytes: Option<usize>,
}

impl StorageConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("pipeline-console")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,console_lib=debug".into(),
            json: false,
            log_dir: None,
        }
    }
}

impl ConsoleConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    /// A `.env` file in the working directory is honoured.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    AppError::Config(format!("failed to read {}: {}", path.display(), e))
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, AppError> {
        toml::from_str(raw).map_err(|e| AppError::Config(e.to_string()))
    }

    /// Apply `CONSOLE_*` overrides from the given lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("CONSOLE_LOGS_BASE_URL") {
            self.transport.logs_base_url = url;
        }
        if let Some(url) = lookup("CONSOLE_STATUS_BASE_URL") {
            self.transport.status_base_url = url;
        }
        if let Some(token) = lookup("CONSOLE_API_TOKEN").filter(|t| !t.is_empty()) {
            self.transport.api_token = Some(token);
        }
        if let Some(dir) = lookup("CONSOLE_STATE_DIR") {
            self.storage.dir = Some(PathBuf::from(dir));
        }
        if let Some(session) = lookup("CONSOLE_SESSION_ID").filter(|s| !s.is_empty()) {
            self.storage.session_id = Some(session);
        }
        if let Some(flag) = lookup("CONSOLE_LOG_JSON") {
            self.logging.json = parse_flag(&flag);
        }
        if let Some(flag) = lookup("CONSOLE_DEBUG_POLLING") {
            self.polling.debug = parse_flag(&flag);
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        require_non_empty("transport.logs_base_url", &self.transport.logs_base_url)?;
        require_non_empty("transport.status_base_url", &self.transport.status_base_url)?;
        require_positive("polling.active_interval_ms", self.polling.active_interval_ms)?;
        require_positive("polling.page_size", self.polling.page_size as u64)?;
        require_positive("registry.max_runs", self.registry.max_runs as u64)?;
        require_positive("registry.max_logs_per_run", self.registry.max_logs_per_run as u64)?;
        require_positive("executions.max_operations", self.executions.max_operations as u64)?;
        if self.polling.outage_backoff_initial_ms > self.polling.outage_backoff_max_ms {
            return Err(AppError::Validation(
                "polling.outage_backoff_initial_ms exceeds outage_backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
