use super::record::{AuditCategory, AuditRecord, AuditResult};
use crate::error::Result;
use crate::types::{Pagination, TimeRange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Query filters for audit retrieval. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub category: Option<AuditCategory>,
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub entity_id: Option<String>,
    pub result: Option<AuditResult>,
    pub range: Option<TimeRange>,
}

/// Aggregate counts over a time range.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AuditStatistics {
    pub total: u64,
    pub by_category: HashMap<String, u64>,
    pub by_result: HashMap<String, u64>,
}

/// Durable storage for audit records.
#[async_trait]
pub trait AuditBackend: Send + Sync {
    /// Append a batch. Records are immutable once stored.
    async fn store_batch(&self, records: &[AuditRecord]) -> Result<()>;

    /// Retrieve records matching `filter`, newest first.
    async fn query(&self, filter: &AuditFilter, page: Pagination) -> Result<Vec<AuditRecord>>;

    /// Aggregate counts over `range`.
    async fn statistics(&self, range: TimeRange) -> Result<AuditStatistics>;

    /// Delete whole records of `category` older than `cutoff`; returns the
    /// number deleted. Retention never removes individual fields.
    async fn purge_older_than(&self, category: AuditCategory, cutoff: DateTime<Utc>) -> Result<u64>;
}
