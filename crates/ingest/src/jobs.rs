//! Ingestion job tracking for stream and file intakes.

use crate::error::{IngestError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Stream,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Progress record for one ingestion job; updated as each batch flushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub state: JobState,
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl IngestionJob {
    fn new(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: JobState::Running,
            total: 0,
            processed: 0,
            failed: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Failed)
    }
}

/// In-memory job registry; single writer, many readers.
#[derive(Clone, Default)]
pub struct IngestionJobStore {
    jobs: Arc<RwLock<HashMap<Uuid, IngestionJob>>>,
}

impl IngestionJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, kind: JobKind) -> IngestionJob {
        let job = IngestionJob::new(kind);
        self.jobs.write().await.insert(job.id, job.clone());
        job
    }

    pub async fn get(&self, id: Uuid) -> Result<IngestionJob> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(IngestError::JobNotFound { id })
    }

    /// Add per-batch progress counters.
    pub async fn record_progress(&self, id: Uuid, processed: u64, failed: u64) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(IngestError::JobNotFound { id })?;
        job.total += processed + failed;
        job.processed += processed;
        job.failed += failed;
        Ok(())
    }

    pub async fn complete(&self, id: Uuid) -> Result<IngestionJob> {
        self.finish(id, JobState::Completed, None).await
    }

    pub async fn fail(&self, id: Uuid, error: impl Into<String>) -> Result<IngestionJob> {
        self.finish(id, JobState::Failed, Some(error.into())).await
    }

    async fn finish(
        &self,
        id: Uuid,
        state: JobState,
        error: Option<String>,
    ) -> Result<IngestionJob> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(IngestError::JobNotFound { id })?;
        job.state = state;
        job.error = error;
        job.completed_at = Some(Utc::now());
        Ok(job.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_lifecycle() {
        let store = IngestionJobStore::new();
        let job = store.create(JobKind::Stream).await;
        assert_eq!(job.state, JobState::Running);

        store.record_progress(job.id, 8, 2).await.unwrap();
        store.record_progress(job.id, 4, 0).await.unwrap();
        let done = store.complete(job.id).await.unwrap();

        assert_eq!(done.total, 14);
        assert_eq!(done.processed, 12);
        assert_eq!(done.failed, 2);
        assert!(done.is_terminal());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = IngestionJobStore::new();
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, IngestError::JobNotFound { .. }));
    }
}
