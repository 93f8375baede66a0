//! Log-delivery transport: the per-run log endpoint and the status endpoint.

pub mod client;
pub mod memory;
pub mod types;

use async_trait::async_trait;

use crate::error::AppError;

use self::types::{LogsPage, OperationSnapshot};

/// Everything the console needs from the backend.
///
/// Implementations classify failures into typed [`AppError`] variants
/// (`ServiceUnavailable`, `NetworkOffline`, `NotFound`, `Http`, `Transport`)
/// so pollers never inspect error text.
#[async_trait]
pub trait LogTransport: Send + Sync + 'static {
    /// `GET {logs}/{run_id}?since={since}&limit={limit}`
    async fn fetch_logs(&self, run_id: &str, since: u64, limit: u32) -> Result<LogsPage, AppError>;

    /// `GET {status}/{run_id}/status`
    async fn fetch_status(&self, run_id: &str) -> Result<OperationSnapshot, AppError>;
}
