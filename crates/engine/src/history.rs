//! History recording and storage.
//!
//! [`HistoryStore`] is the repository seam; [`MemoryHistoryStore`] keeps
//! records in process. [`HistoryRecorder`] turns terminal jobs and
//! campaigns into [`HistoryRecord`]s and appends them.

use std::sync::Arc;

use async_trait::async_trait;
use testbench_core::campaign::CampaignExecution;
use testbench_core::error::CoreError;
use testbench_core::history::{HistoryFilter, HistoryRecord};
use testbench_core::job::{JobResult, JobSpec};
use testbench_core::types::Timestamp;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Append-only record storage.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Store a record. Appending an id that already exists keeps the
    /// stored record and returns it.
    async fn append(&self, record: HistoryRecord) -> Result<HistoryRecord, CoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<HistoryRecord>, CoreError>;

    /// Matching records, most recently completed first, at most
    /// `filter.effective_limit()` of them.
    async fn list(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>, CoreError>;
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    records: RwLock<Vec<HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, record: HistoryRecord) -> Result<HistoryRecord, CoreError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.iter().find(|r| r.id == record.id) {
            tracing::debug!(record_id = %record.id, "History record already stored");
            return Ok(existing.clone());
        }
        records.push(record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<HistoryRecord>, CoreError> {
        Ok(self.records.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>, CoreError> {
        let records = self.records.read().await;
        let mut matching: Vec<HistoryRecord> =
            records.iter().filter(|r| filter.matches(r)).cloned().collect();
        // Stable sort keeps insertion order among equal timestamps; reverse
        // afterwards so later inserts come first.
        matching.sort_by_key(|r| r.completed_at);
        matching.reverse();
        matching.truncate(filter.effective_limit());
        Ok(matching)
    }
}

pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Record a terminal campaign. Fails with [`CoreError::Conflict`] if
    /// the execution is still running.
    pub async fn record_campaign(
        &self,
        execution: &CampaignExecution,
    ) -> Result<HistoryRecord, CoreError> {
        let record = HistoryRecord::from_campaign(execution)?;
        let stored = self.store.append(record).await?;
        tracing::info!(
            record_id = %stored.id,
            campaign = %stored.name,
            success = stored.success,
            "Campaign recorded in history",
        );
        Ok(stored)
    }

    pub async fn record_job(
        &self,
        spec: &JobSpec,
        result: &JobResult,
        started_at: Timestamp,
    ) -> Result<HistoryRecord, CoreError> {
        let stored = self
            .store
            .append(HistoryRecord::from_job(spec, result, started_at))
            .await?;
        tracing::debug!(record_id = %stored.id, job_id = %spec.id, "Job recorded in history");
        Ok(stored)
    }

    pub async fn get(&self, id: Uuid) -> Result<HistoryRecord, CoreError> {
        self.store.get(id).await?.ok_or(CoreError::NotFound {
            entity: "HistoryRecord",
            id: id.to_string(),
        })
    }

    pub async fn list(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>, CoreError> {
        self.store.list(filter).await
    }
}
