use super::record::{AuditCategory, AuditRecord};
use super::traits::{AuditBackend, AuditFilter, AuditStatistics};
use crate::error::{Error, Result};
use crate::types::{Pagination, TimeRange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder, Row};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// In-memory audit backend: single writer behind an exclusive lock, many
/// readers behind the shared lock. Backs tests and embedded deployments.
#[derive(Clone, Default)]
pub struct MemoryAuditRepository {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl MemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn matches(filter: &AuditFilter, record: &AuditRecord) -> bool {
    if let Some(category) = filter.category {
        if record.category != category {
            return false;
        }
    }
    if let Some(event_type) = &filter.event_type {
        if &record.event_type != event_type {
            return false;
        }
    }
    if let Some(user_id) = &filter.user_id {
        if record.user_id.as_ref() != Some(user_id) {
            return false;
        }
    }
    if let Some(entity_id) = &filter.entity_id {
        if record.entity_id.as_ref() != Some(entity_id) {
            return false;
        }
    }
    if let Some(result) = filter.result {
        if record.result != result {
            return false;
        }
    }
    if let Some(range) = &filter.range {
        if !range.contains(record.timestamp) {
            return false;
        }
    }
    true
}

#[async_trait]
impl AuditBackend for MemoryAuditRepository {
    async fn store_batch(&self, records: &[AuditRecord]) -> Result<()> {
        let mut store = self.records.write().await;
        store.extend_from_slice(records);
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter, page: Pagination) -> Result<Vec<AuditRecord>> {
        let store = self.records.read().await;
        let mut matched: Vec<AuditRecord> = store
            .iter()
            .filter(|r| matches(filter, r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn statistics(&self, range: TimeRange) -> Result<AuditStatistics> {
        let store = self.records.read().await;
        let mut stats = AuditStatistics::default();
        for record in store.iter().filter(|r| range.contains(r.timestamp)) {
            stats.total += 1;
            *stats
                .by_category
                .entry(record.category.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_result
                .entry(record.result.to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }

    async fn purge_older_than(&self, category: AuditCategory, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut store = self.records.write().await;
        let before = store.len();
        store.retain(|r| r.category != category || r.timestamp >= cutoff);
        Ok((before - store.len()) as u64)
    }
}

/// PostgreSQL-backed audit repository.
pub struct PostgresAuditRepository {
    pool: Arc<PgPool>,
    table_name: String,
}

impl PostgresAuditRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            table_name: "audit_records".to_string(),
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Create the audit table and its indexes if they do not exist.
    pub async fn initialize(&self) -> Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id UUID PRIMARY KEY,
                category VARCHAR(32) NOT NULL,
                event_type VARCHAR(100) NOT NULL,
                user_id VARCHAR(255),
                entity_id VARCHAR(255),
                entity_type VARCHAR(100),
                action VARCHAR(100) NOT NULL,
                result VARCHAR(16) NOT NULL,
                details JSONB,
                timestamp TIMESTAMPTZ NOT NULL,
                ip_address VARCHAR(64),
                user_agent TEXT,
                encryption VARCHAR(16) NOT NULL DEFAULT 'none',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_{t}_timestamp ON {t} (timestamp);
            CREATE INDEX IF NOT EXISTS idx_{t}_category ON {t} (category, timestamp);
            CREATE INDEX IF NOT EXISTS idx_{t}_entity ON {t} (entity_id);
            CREATE INDEX IF NOT EXISTS idx_{t}_user ON {t} (user_id);
            "#,
            t = self.table_name
        );

        sqlx::raw_sql(&sql).execute(self.pool.as_ref()).await?;
        info!("audit table '{}' initialized", self.table_name);
        Ok(())
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<AuditRecord> {
        let category: String = row.try_get("category")?;
        let result: String = row.try_get("result")?;
        let encryption: String = row.try_get("encryption")?;
        Ok(AuditRecord {
            id: row.try_get("id")?,
            category: AuditCategory::parse(&category)
                .ok_or_else(|| Error::permanent(format!("unknown audit category {}", category)))?,
            event_type: row.try_get("event_type")?,
            user_id: row.try_get("user_id")?,
            entity_id: row.try_get("entity_id")?,
            entity_type: row.try_get("entity_type")?,
            action: row.try_get("action")?,
            result: match result.as_str() {
                "success" => super::record::AuditResult::Success,
                "failure" => super::record::AuditResult::Failure,
                "denied" => super::record::AuditResult::Denied,
                other => {
                    return Err(Error::permanent(format!("unknown audit result {}", other)))
                }
            },
            details: row.try_get("details")?,
            timestamp: row.try_get("timestamp")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            encryption: super::record::EncryptionLevel::parse(&encryption)
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl AuditBackend for PostgresAuditRepository {
    async fn store_batch(&self, records: &[AuditRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            let sql = format!(
                r#"
                INSERT INTO {} (
                    id, category, event_type, user_id, entity_id, entity_type,
                    action, result, details, timestamp, ip_address, user_agent, encryption
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
                self.table_name
            );
            sqlx::query(&sql)
                .bind(record.id)
                .bind(record.category.as_str())
                .bind(&record.event_type)
                .bind(&record.user_id)
                .bind(&record.entity_id)
                .bind(&record.entity_type)
                .bind(&record.action)
                .bind(record.result.to_string())
                .bind(&record.details)
                .bind(record.timestamp)
                .bind(&record.ip_address)
                .bind(&record.user_agent)
                .bind(match record.encryption {
                    super::record::EncryptionLevel::None => "none",
                    super::record::EncryptionLevel::Standard => "standard",
                    super::record::EncryptionLevel::High => "high",
                })
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(count = records.len(), "stored audit batch");
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter, page: Pagination) -> Result<Vec<AuditRecord>> {
        let mut builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new(format!("SELECT * FROM {} WHERE 1=1", self.table_name));

        if let Some(category) = filter.category {
            builder.push(" AND category = ").push_bind(category.as_str());
        }
        if let Some(event_type) = &filter.event_type {
            builder.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(user_id) = &filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if let Some(entity_id) = &filter.entity_id {
            builder.push(" AND entity_id = ").push_bind(entity_id.clone());
        }
        if let Some(result) = filter.result {
            builder.push(" AND result = ").push_bind(result.to_string());
        }
        if let Some(range) = &filter.range {
            builder.push(" AND timestamp >= ").push_bind(range.start);
            builder.push(" AND timestamp < ").push_bind(range.end);
        }
        builder
            .push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset as i64);

        let rows = builder.build().fetch_all(self.pool.as_ref()).await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn statistics(&self, range: TimeRange) -> Result<AuditStatistics> {
        let sql = format!(
            r#"
            SELECT category, result, COUNT(*) AS count
            FROM {}
            WHERE timestamp >= $1 AND timestamp < $2
            GROUP BY category, result
            "#,
            self.table_name
        );
        let rows = sqlx::query(&sql)
            .bind(range.start)
            .bind(range.end)
            .fetch_all(self.pool.as_ref())
            .await?;

        let mut stats = AuditStatistics::default();
        for row in rows {
            let category: String = row.try_get("category")?;
            let result: String = row.try_get("result")?;
            let count: i64 = row.try_get("count")?;
            stats.total += count as u64;
            *stats.by_category.entry(category).or_default() += count as u64;
            *stats.by_result.entry(result).or_default() += count as u64;
        }
        Ok(stats)
    }

    async fn purge_older_than(&self, category: AuditCategory, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE category = $1 AND timestamp < $2",
            self.table_name
        );
        let result = sqlx::query(&sql)
            .bind(category.as_str())
            .bind(cutoff)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::record::AuditResult;
    use chrono::Duration;

    fn record(category: AuditCategory, entity: &str, age_minutes: i64) -> AuditRecord {
        AuditRecord::builder(category, "state_transition", "update")
            .entity("alert", entity)
            .at(Utc::now() - Duration::minutes(age_minutes))
            .build()
    }

    #[tokio::test]
    async fn query_filters_and_orders_newest_first() {
        let repo = MemoryAuditRepository::new();
        repo.store_batch(&[
            record(AuditCategory::Compliance, "a-1", 10),
            record(AuditCategory::Compliance, "a-1", 5),
            record(AuditCategory::System, "a-2", 1),
        ])
        .await
        .unwrap();

        let filter = AuditFilter {
            entity_id: Some("a-1".to_string()),
            ..Default::default()
        };
        let found = repo.query(&filter, Pagination::default()).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].timestamp > found[1].timestamp);
    }

    #[tokio::test]
    async fn purge_deletes_whole_records_per_category() {
        let repo = MemoryAuditRepository::new();
        repo.store_batch(&[
            record(AuditCategory::Authentication, "u-1", 60),
            record(AuditCategory::Compliance, "t-1", 60),
        ])
        .await
        .unwrap();

        let purged = repo
            .purge_older_than(AuditCategory::Authentication, Utc::now())
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn statistics_counts_by_category_and_result() {
        let repo = MemoryAuditRepository::new();
        let mut failed = record(AuditCategory::System, "b-1", 2);
        failed.result = AuditResult::Failure;
        repo.store_batch(&[record(AuditCategory::System, "b-0", 3), failed])
            .await
            .unwrap();

        let range = TimeRange::new(Utc::now() - Duration::hours(1), Utc::now());
        let stats = repo.statistics(range).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_category.get("system"), Some(&2));
        assert_eq!(stats.by_result.get("failure"), Some(&1));
    }
}
