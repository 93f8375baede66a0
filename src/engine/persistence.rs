//! Session-scoped storage and the dirty + flush persistence pattern.
//!
//! Stores mark themselves dirty on every mutation and call [`save`] with a
//! [`SaveMode`]. Debounced saves coalesce into one write after a quiet
//! period; immediate saves cancel any pending timer and write now.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::validation::require_valid_id;

// ============================================================================
// Storage backends
// ============================================================================

/// Key/value storage scoped to one console session.
pub trait SessionStorage: Send + Sync + 'static {
    fn get_item(&self, key: &str) -> Result<Option<String>, AppError>;
    /// Fails with [`AppError::QuotaExceeded`] when the value does not fit.
    fn set_item(&self, key: &str, value: &str) -> Result<(), AppError>;
    fn remove_item(&self, key: &str) -> Result<(), AppError>;
}

#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
    writes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push the total stored size past `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            quota_bytes: Some(bytes),
            ..Self::default()
        }
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SessionStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.items.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), AppError> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(quota) = self.quota_bytes {
            let others: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let total = others + key.len() + value.len();
            if total > quota {
                return Err(AppError::QuotaExceeded(format!(
                    "{key}: {total} bytes exceeds quota of {quota}"
                )));
            }
        }
        items.insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), AppError> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }
}

/// One JSON file per key under `<root>/<session_id>/`.
pub struct FileStorage {
    dir: PathBuf,
    quota_bytes: Option<usize>,
}

impl FileStorage {
    pub fn new(root: &Path, session_id: &str, quota_bytes: Option<usize>) -> Result<Self, AppError> {
        require_valid_id("session_id", session_id)?;
        let dir = root.join(session_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| AppError::Storage(format!("failed to create {}: {}", dir.display(), e)))?;
        Ok(Self { dir, quota_bytes })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf, AppError> {
        require_valid_id("storage key", key)?;
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl SessionStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, AppError> {
        match std::fs::read_to_string(self.path(key)?) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), AppError> {
        if let Some(quota) = self.quota_bytes {
            if value.len() > quota {
                return Err(AppError::QuotaExceeded(format!(
                    "{key}: {} bytes exceeds quota of {quota}",
                    value.len()
                )));
            }
        }
        let path = self.path(key)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), AppError> {
        match std::fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Persister
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Coalesce with other saves in the debounce window.
    Debounced,
    /// Write now; used for changes that must survive an abrupt exit.
    Immediate,
}

/// A store that can be persisted by a [`Persister`].
pub trait Snapshot: Send + Sync + 'static {
    fn persister(&self) -> &Persister;

    /// Serialize the current state. Must not be called with the store's own
    /// state lock held.
    fn snapshot_json(&self) -> Result<String, AppError>;

    /// Drop data to fit a storage quota. Returns false when nothing is left
    /// to drop.
    fn shrink_for_quota(&self) -> bool;
}

pub struct Persister {
    storage: Arc<dyn SessionStorage>,
    key: String,
    debounce: Duration,
    dirty: AtomicBool,
    timer: Mutex<Option<CancellationToken>>,
}

/// Upper bound on shrink-and-retry rounds for one flush.
const MAX_SHRINK_ROUNDS: usize = 64;

impl Persister {
    pub fn new(storage: Arc<dyn SessionStorage>, key: impl Into<String>, debounce: Duration) -> Self {
        Self {
            storage,
            key: key.into(),
            debounce,
            dirty: AtomicBool::new(false),
            timer: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn load(&self) -> Result<Option<String>, AppError> {
        self.storage.get_item(&self.key)
    }

    pub fn clear(&self) -> Result<(), AppError> {
        self.storage.remove_item(&self.key)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn cancel_timer(&self) {
        if let Some(token) = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }
}

/// Mark `owner` dirty and schedule (or perform) a write.
pub fn save<S: Snapshot>(owner: &Arc<S>, mode: SaveMode) {
    let persister = owner.persister();
    persister.dirty.store(true, Ordering::SeqCst);

    let handle = match (mode, tokio::runtime::Handle::try_current()) {
        (SaveMode::Debounced, Ok(handle)) => handle,
        _ => {
            persister.cancel_timer();
            if let Err(e) = flush(owner.as_ref()) {
                tracing::error!(key = %persister.key, error = %e, "Failed to persist state");
            }
            return;
        }
    };

    let token = {
        let mut timer = persister.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }
        let token = CancellationToken::new();
        *timer = Some(token.clone());
        token
    };

    let weak = Arc::downgrade(owner);
    let debounce = persister.debounce;
    handle.spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(debounce) => {
                let Some(owner) = weak.upgrade() else { return };
                let persister = owner.persister();
                {
                    // Only `cancel_timer` replaces a live token, and it cancels under this lock.
                    let mut timer = persister.timer.lock().unwrap_or_else(|e| e.into_inner());
                    if token.is_cancelled() {
                        return;
                    }
                    *timer = None;
                }
                if let Err(e) = flush(owner.as_ref()) {
                    tracing::error!(key = %persister.key, error = %e, "Failed to persist state");
                }
            }
        }
    });
}

/// Write the snapshot if dirty. On quota failure, shrink and retry until the
/// write fits or the store has nothing left to drop.
pub fn flush<S: Snapshot + ?Sized>(owner: &S) -> Result<(), AppError> {
    let persister = owner.persister();
    if !persister.dirty.swap(false, Ordering::SeqCst) {
        return Ok(());
    }

    let mut rounds = 0;
    loop {
        let json = owner.snapshot_json()?;
        match persister.storage.set_item(&persister.key, &json) {
            Ok(()) => {
                tracing::trace!(key = %persister.key, bytes = json.len(), "State persisted");
                return Ok(());
            }
            Err(AppError::QuotaExceeded(msg)) if rounds < MAX_SHRINK_ROUNDS && owner.shrink_for_quota() => {
                rounds += 1;
                tracing::warn!(key = %persister.key, round = rounds, "Storage quota exceeded ({msg}), trimming");
            }
            Err(e) => {
                persister.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Blob {
        persister: Persister,
        items: Mutex<Vec<String>>,
    }

    impl Snapshot for Blob {
        fn persister(&self) -> &Persister {
            &self.persister
        }

        fn snapshot_json(&self) -> Result<String, AppError> {
            Ok(serde_json::to_string(&*self.items.lock().unwrap())?)
        }

        fn shrink_for_quota(&self) -> bool {
            let mut items = self.items.lock().unwrap();
            if items.is_empty() {
                return false;
            }
            items.remove(0);
            true
        }
    }

    fn blob(storage: Arc<dyn SessionStorage>, items: &[&str]) -> Arc<Blob> {
        Arc::new(Blob {
            persister: Persister::new(storage, "blob", Duration::from_millis(500)),
            items: Mutex::new(items.iter().map(|s| s.to_string()).collect()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_saves_coalesce() {
        let storage = Arc::new(MemoryStorage::new());
        let owner = blob(storage.clone(), &["a"]);
        for _ in 0..5 {
            save(&owner, SaveMode::Debounced);
        }
        assert_eq!(storage.writes(), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(storage.writes(), 1);
        assert!(!owner.persister().is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_save_cancels_pending_timer() {
        let storage = Arc::new(MemoryStorage::new());
        let owner = blob(storage.clone(), &["a"]);
        save(&owner, SaveMode::Debounced);
        save(&owner, SaveMode::Immediate);
        assert_eq!(storage.writes(), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(storage.writes(), 1);
        assert_eq!(storage.get_item("blob").unwrap().as_deref(), Some(r#"["a"]"#));
    }

    #[test]
    fn test_debounced_without_runtime_writes_now() {
        let storage = Arc::new(MemoryStorage::new());
        let owner = blob(storage.clone(), &["a"]);
        save(&owner, SaveMode::Debounced);
        assert_eq!(storage.writes(), 1);
    }

    #[test]
    fn test_quota_triggers_shrink_and_retry() {
        let storage = Arc::new(MemoryStorage::with_quota(20));
        let owner = blob(storage.clone(), &["aaaa", "bbbb", "cccc"]);
        save(&owner, SaveMode::Immediate);
        assert_eq!(storage.get_item("blob").unwrap().as_deref(), Some(r#"["bbbb","cccc"]"#));
    }

    #[test]
    fn test_quota_failure_keeps_dirty() {
        let storage = Arc::new(MemoryStorage::with_quota(2));
        let owner = blob(storage.clone(), &["aaaa"]);
        owner.persister().dirty.store(true, Ordering::SeqCst);
        assert!(matches!(flush(owner.as_ref()), Err(AppError::QuotaExceeded(_))));
        assert!(owner.persister().is_dirty());
    }

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), "tab-1", None).unwrap();
        assert_eq!(storage.get_item("state").unwrap(), None);
        storage.set_item("state", "{\"a\":1}").unwrap();
        assert_eq!(storage.get_item("state").unwrap().as_deref(), Some("{\"a\":1}"));
        assert!(dir.path().join("tab-1").join("state.json").exists());
        storage.remove_item("state").unwrap();
        storage.remove_item("state").unwrap();
        assert_eq!(storage.get_item("state").unwrap(), None);
    }

    #[test]
    fn test_file_storage_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileStorage::new(dir.path(), "../escape", None).is_err());
        let storage = FileStorage::new(dir.path(), "tab-1", Some(4)).unwrap();
        assert!(storage.get_item("a/b").is_err());
        assert!(matches!(storage.set_item("k", "12345"), Err(AppError::QuotaExceeded(_))));
    }
}
