//! State persistence.
//!
//! Governance state is captured as one versioned [`StateSnapshot`] and
//! handed to a [`StateStore`]. Two stores ship with the crate: an in-memory
//! store for tests and embedding, and a JSON file store that writes through
//! a temporary file and renames it into place.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use spendguard_core::{AlertBookSnapshot, LedgerSnapshot, Tier};

use crate::cache::CacheEntry;
use crate::resilience::{CircuitBreakerState, DegradationSnapshot};

/// Current snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Errors from a state store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Unavailable(_))
    }
}

/// Everything needed to resume governance after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub ledger: LedgerSnapshot,
    pub alerts: AlertBookSnapshot,
    #[serde(default)]
    pub circuits: Vec<CircuitBreakerState>,
    #[serde(default)]
    pub cache: Vec<CacheEntry>,
    pub degradation: Option<DegradationSnapshot>,
    #[serde(default)]
    pub tier_assignments: BTreeMap<String, Tier>,
}

impl StateSnapshot {
    pub fn check_version(&self) -> Result<(), StoreError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(StoreError::Version {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(())
    }
}

/// Where snapshots are kept.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the latest snapshot, if any was saved.
    async fn load(&self) -> Result<Option<StateSnapshot>, StoreError>;

    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), StoreError>;
}

/// Keeps the snapshot in memory.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<StateSnapshot>>,
    saves: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Option<StateSnapshot>, StoreError> {
        Ok(self.snapshot.lock().clone())
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        *self.snapshot.lock() = Some(snapshot.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

/// Pretty-printed JSON file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<Option<StateSnapshot>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let snapshot: StateSnapshot = serde_json::from_slice(&bytes)?;
        snapshot.check_version()?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

/// Save with exponential backoff on transient errors.
pub async fn save_with_retry(
    store: &dyn StateStore,
    snapshot: &StateSnapshot,
    max_attempts: usize,
) -> Result<(), StoreError> {
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(max_attempts.saturating_sub(1));

    (|| async { store.save(snapshot).await })
        .retry(backoff)
        .when(StoreError::is_transient)
        .notify(|err: &StoreError, delay: Duration| {
            tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "Snapshot save failed, retrying");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spendguard_core::{AlertBook, Calendar, Clock, CostLedger, ManualClock, OperationType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn snapshot() -> StateSnapshot {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap());
        let ledger = CostLedger::new(clock.clone(), Calendar::utc());
        ledger
            .record_spend("alice", 0.25, 300, OperationType::ContentGeneration)
            .unwrap();
        let alerts = AlertBook::new(clock.clone(), Calendar::utc());

        StateSnapshot {
            version: SNAPSHOT_VERSION,
            taken_at: clock.now(),
            ledger: ledger.snapshot(),
            alerts: alerts.snapshot(),
            circuits: Vec::new(),
            cache: Vec::new(),
            degradation: None,
            tier_assignments: BTreeMap::from([("alice".to_string(), Tier::Premium)]),
        }
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().is_none());

        let snap = snapshot();
        store.save(&snap).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(snap));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_json_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("state.json"));
        assert!(store.load().await.unwrap().is_none());

        let snap = snapshot();
        store.save(&snap).await.unwrap();
        assert!(!store.temp_path().exists());
        assert_eq!(store.load().await.unwrap(), Some(snap));
    }

    #[tokio::test]
    async fn test_json_file_store_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        let mut snap = snapshot();
        snap.version = 99;
        store.save(&snap).await.unwrap();

        assert!(matches!(
            store.load().await,
            Err(StoreError::Version { found: 99, .. })
        ));
    }

    struct Flaky {
        failures_left: AtomicUsize,
        inner: MemoryStore,
    }

    #[async_trait]
    impl StateStore for Flaky {
        async fn load(&self) -> Result<Option<StateSnapshot>, StoreError> {
            self.inner.load().await
        }

        async fn save(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Unavailable("disk busy".to_string()));
            }
            self.inner.save(snapshot).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_with_retry_recovers_from_transient_errors() {
        let store = Arc::new(Flaky {
            failures_left: AtomicUsize::new(2),
            inner: MemoryStore::new(),
        });
        save_with_retry(store.as_ref(), &snapshot(), 3).await.unwrap();
        assert_eq!(store.inner.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_with_retry_gives_up() {
        let store = Flaky {
            failures_left: AtomicUsize::new(10),
            inner: MemoryStore::new(),
        };
        let err = save_with_retry(&store, &snapshot(), 2).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.inner.save_count(), 0);
    }
}
