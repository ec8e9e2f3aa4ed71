//! Completed-results table.
//!
//! Terminal work items move here from the scheduler. The table is bounded
//! and least-recently-used records are trimmed first.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use std::time::Duration;
use uuid::Uuid;

use spendguard_core::{GovernanceError, WorkItem, WorkResult, WorkStatus};

/// A terminal work item with its outcome.
#[derive(Debug, Clone)]
pub struct CompletedWork {
    pub item: WorkItem,
    pub result: Option<WorkResult>,
    pub error: Option<GovernanceError>,
    pub finished_at: DateTime<Utc>,
}

impl CompletedWork {
    pub fn status(&self) -> WorkStatus {
        self.item.status
    }
}

/// Bounded LRU of terminal work.
#[derive(Clone)]
pub struct ResultsTable {
    cache: Cache<Uuid, CompletedWork>,
}

impl ResultsTable {
    pub fn new(max_entries: u64, retention: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(retention)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self { cache }
    }

    pub async fn insert(&self, work: CompletedWork) {
        self.cache.insert(work.item.id, work).await;
    }

    pub async fn get(&self, id: &Uuid) -> Option<CompletedWork> {
        self.cache.get(id).await
    }

    /// Approximate number of records held.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply pending evictions, mainly useful before reading `len`.
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl Default for ResultsTable {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(24 * 3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spendguard_core::{OperationType, Tier};

    fn finished(status: WorkStatus) -> CompletedWork {
        let mut item = WorkItem::new(
            "alice",
            Tier::Free,
            OperationType::Analytics,
            0.1,
            json!({}),
            Utc::now(),
            Duration::from_secs(5),
        );
        item.status = status;
        CompletedWork {
            item,
            result: None,
            error: None,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let table = ResultsTable::default();
        let work = finished(WorkStatus::Expired);
        let id = work.item.id;

        table.insert(work).await;
        let found = table.get(&id).await.unwrap();
        assert_eq!(found.status(), WorkStatus::Expired);
        assert!(table.get(&Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_table_is_bounded() {
        let table = ResultsTable::new(10, Duration::from_secs(60));
        for _ in 0..50 {
            table.insert(finished(WorkStatus::Completed)).await;
        }
        table.sync().await;
        assert!(table.len() <= 10);
    }
}
