pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod notifications;
pub mod transport;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use engine::bus::{ConsoleEvent, EventBus, EventFilter, RunStartPayload, Subscription};
use engine::execution_store::ExecutionStore;
use engine::outage::OutageMonitor;
use engine::persistence::{FileStorage, SessionStorage};
use engine::registry::RunRegistry;
use notifications::{NoopNotifier, Notifier};
use transport::client::HttpTransport;
use transport::LogTransport;

pub use config::ConsoleConfig;
pub use error::AppError;
pub use models::{RunMeta, RunStatus};

/// Assembles a [`Console`]. Anything not supplied falls back to the
/// production default: HTTP transport, file-backed session storage and a
/// silent notifier.
pub struct ConsoleBuilder {
    config: ConsoleConfig,
    transport: Option<Arc<dyn LogTransport>>,
    storage: Option<Arc<dyn SessionStorage>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl ConsoleBuilder {
    pub fn new(config: ConsoleConfig) -> Self {
        Self {
            config,
            transport: None,
            storage: None,
            notifier: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn LogTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Restore both stores, start listening on the bus and resume polling
    /// for every restored live run. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Console, AppError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(AppError::Internal("console requires a tokio runtime".into()));
        }
        self.config.validate()?;
        let config = self.config;

        let transport: Arc<dyn LogTransport> = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new(&config.transport)?),
        };
        let storage: Arc<dyn SessionStorage> = match self.storage {
            Some(s) => s,
            None => {
                let session_id = config
                    .storage
                    .session_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                Arc::new(FileStorage::new(
                    &config.storage.resolved_dir(),
                    &session_id,
                    config.storage.quota_bytes,
                )?)
            }
        };
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier));

        let bus = EventBus::new();
        let outage = Arc::new(OutageMonitor::new(
            notifier.clone(),
            Duration::from_millis(config.polling.outage_notice_cooldown_ms),
        ));
        let registry = RunRegistry::new(&config, bus.clone(), transport, outage, notifier, storage.clone());
        let executions = ExecutionStore::new(&config, storage);

        match registry.restore() {
            Ok(n) if n > 0 => tracing::info!(runs = n, "Restored console session"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Console state restore failed"),
        }
        if let Err(e) = executions.restore() {
            tracing::warn!(error = %e, "Execution store restore failed");
        }

        registry.spawn_listener();
        executions.spawn_listener(&bus);
        let resumed = registry.resume_live_runs();
        if resumed > 0 {
            tracing::info!(resumed, "Resumed polling for live runs");
        }

        Ok(Console {
            config,
            bus,
            registry,
            executions,
        })
    }
}

/// Handle to a running console: the event bus, the run registry and the
/// execution store, wired together.
pub struct Console {
    config: ConsoleConfig,
    bus: EventBus,
    registry: Arc<RunRegistry>,
    executions: Arc<ExecutionStore>,
}

impl Console {
    pub fn builder(config: ConsoleConfig) -> ConsoleBuilder {
        ConsoleBuilder::new(config)
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    /// Announce a new run. The registry and the execution store both pick it
    /// up from the bus.
    pub fn start_run(&self, run_id: &str, meta: RunMeta) -> Result<(), AppError> {
        validation::require_valid_id("run_id", run_id)?;
        self.bus.publish(ConsoleEvent::RunStart(RunStartPayload {
            run_id: run_id.to_string(),
            job_id: meta.job_id,
            title: meta.title,
            action: meta.action,
        }));
        Ok(())
    }

    pub fn queue_run(&self, placeholder_id: &str, meta: RunMeta) -> Result<(), AppError> {
        self.registry.queue_run(placeholder_id, meta)
    }

    /// Swap a queued placeholder for the server-issued run id and begin
    /// tailing it.
    pub fn promote_run(&self, placeholder_id: &str, run_id: &str) -> Result<(), AppError> {
        self.registry.promote_run(placeholder_id, run_id)?;
        if let Some(run) = self.registry.run(run_id) {
            self.executions.apply(&ConsoleEvent::RunStart(RunStartPayload {
                run_id: run.run_id,
                job_id: run.job_id,
                title: run.title,
                action: run.action,
            }));
        }
        Ok(())
    }

    pub fn close_run(&self, run_id: &str) -> bool {
        self.registry.close_run(run_id)
    }

    pub fn switch_active(&self, run_id: &str) -> Result<(), AppError> {
        self.registry.switch_active(run_id)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn executions(&self) -> &Arc<ExecutionStore> {
        &self.executions
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.bus.subscribe_filtered(filter)
    }

    /// Stop every poller and write both stores immediately.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        self.executions.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::persistence::MemoryStorage;
    use transport::memory::InMemoryBackend;

    #[test]
    fn test_build_requires_runtime() {
        let result = Console::builder(ConsoleConfig::default())
            .transport(Arc::new(InMemoryBackend::new()))
            .storage(Arc::new(MemoryStorage::new()))
            .build();
        assert!(matches!(result, Err(AppError::Internal(_))));
    }

    #[tokio::test]
    async fn test_start_run_rejects_invalid_id() {
        let console = Console::builder(ConsoleConfig::default())
            .transport(Arc::new(InMemoryBackend::new()))
            .storage(Arc::new(MemoryStorage::new()))
            .build()
            .unwrap();
        assert!(matches!(
            console.start_run("a/b", RunMeta::default()),
            Err(AppError::Validation(_))
        ));
        console.shutdown();
    }
}
