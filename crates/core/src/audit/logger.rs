use super::encryption::RecordCipher;
use super::record::{AuditCategory, AuditRecord, AuditResult, EncryptionLevel};
use super::traits::{AuditBackend, AuditFilter, AuditStatistics};
use crate::bus::EventBus;
use crate::config::AuditConfig;
use crate::error::{Error, Result};
use crate::events::{AegisEvent, AuditForwarded, EventEnvelope};
use crate::metrics::CoreMetrics;
use crate::types::{Pagination, TimeRange};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Front end of the audit pipeline.
///
/// `log_event` encrypts per category policy and enqueues into the bounded
/// buffer; the durable write happens in [`AuditFlusher`]. The enqueue is
/// the synchronization point for business transitions: a full buffer is a
/// hard `Overloaded` failure and the transition must not commit.
#[derive(Clone)]
pub struct AuditLog {
    sender: mpsc::Sender<AuditRecord>,
    backend: Arc<dyn AuditBackend>,
    cipher: Option<Arc<RecordCipher>>,
    levels: HashMap<AuditCategory, EncryptionLevel>,
    retention: HashMap<AuditCategory, u32>,
    metrics: Arc<CoreMetrics>,
}

impl AuditLog {
    /// Build the logger and its flusher. The flusher must be spawned by
    /// the caller (`tokio::spawn(flusher.run(cancel))`).
    pub fn new(
        backend: Arc<dyn AuditBackend>,
        config: &AuditConfig,
        forward_bus: Option<(Arc<dyn EventBus>, String)>,
        metrics: Arc<CoreMetrics>,
    ) -> Result<(Self, AuditFlusher)> {
        let (sender, receiver) = mpsc::channel(config.buffer_size);

        let cipher = if config.encryption_key.is_empty() {
            None
        } else {
            Some(Arc::new(RecordCipher::new(&config.encryption_key)?))
        };

        let mut levels = HashMap::new();
        let mut retention = HashMap::new();
        for category in AuditCategory::ALL {
            let level = config
                .encryption_levels
                .get(category.as_str())
                .and_then(|s| EncryptionLevel::parse(s))
                .unwrap_or(EncryptionLevel::None);
            levels.insert(category, level);
            let days = config
                .retention_days
                .get(category.as_str())
                .copied()
                .unwrap_or_else(|| category.default_retention_days());
            retention.insert(category, days);
        }

        let forward_categories: Vec<AuditCategory> = config
            .forward_external
            .iter()
            .filter_map(|s| AuditCategory::parse(s))
            .collect();

        let flusher = AuditFlusher {
            receiver,
            backend: backend.clone(),
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            forward_bus,
            forward_categories,
            metrics: metrics.clone(),
        };

        Ok((
            Self {
                sender,
                backend,
                cipher,
                levels,
                retention,
                metrics,
            },
            flusher,
        ))
    }

    /// Categorized audit write. Returns the record id on successful
    /// enqueue; fails fast with `Overloaded` when the buffer is full.
    #[allow(clippy::too_many_arguments)]
    pub fn log_event(
        &self,
        category: AuditCategory,
        event_type: impl Into<String>,
        actor: Option<&str>,
        entity_ref: Option<(&str, &str)>,
        action: impl Into<String>,
        details: serde_json::Value,
        result: AuditResult,
    ) -> Result<Uuid> {
        let mut builder = AuditRecord::builder(category, event_type, action)
            .details(details)
            .result(result);
        if let Some(actor) = actor {
            builder = builder.user(actor);
        }
        if let Some((entity_type, entity_id)) = entity_ref {
            builder = builder.entity(entity_type, entity_id);
        }
        self.log_record(builder.build())
    }

    /// Enqueue a fully-built record.
    pub fn log_record(&self, mut record: AuditRecord) -> Result<Uuid> {
        let id = record.id;
        self.apply_encryption(&mut record)?;

        match self.sender.try_send(record) {
            Ok(()) => Ok(id),
            Err(TrySendError::Full(_)) => {
                self.metrics.audit_overflow_total.inc();
                warn!("audit buffer saturated; rejecting log_event");
                Err(Error::overloaded("audit buffer full").in_operation("audit.log_event"))
            }
            Err(TrySendError::Closed(_)) => {
                Err(Error::permanent("audit flusher stopped").in_operation("audit.log_event"))
            }
        }
    }

    fn apply_encryption(&self, record: &mut AuditRecord) -> Result<()> {
        let level = self
            .levels
            .get(&record.category)
            .copied()
            .unwrap_or_default();
        if level == EncryptionLevel::None {
            return Ok(());
        }
        let Some(cipher) = &self.cipher else {
            // Policy asks for encryption but no key is configured; refuse
            // rather than store plaintext under an encrypted label.
            return Err(Error::invalid(format!(
                "category {} requires encryption but no key is configured",
                record.category
            )));
        };

        let details = serde_json::to_string(&record.details)?;
        record.details = serde_json::Value::String(cipher.encrypt_string(&details)?);
        if level == EncryptionLevel::High {
            if let Some(ip) = record.ip_address.take() {
                record.ip_address = Some(cipher.encrypt_string(&ip)?);
            }
            if let Some(agent) = record.user_agent.take() {
                record.user_agent = Some(cipher.encrypt_string(&agent)?);
            }
        }
        record.encryption = level;
        Ok(())
    }

    /// Retrieve matching records, decrypting where the key is available.
    pub async fn query(&self, filter: &AuditFilter, page: Pagination) -> Result<Vec<AuditRecord>> {
        let mut records = self.backend.query(filter, page).await?;
        if let Some(cipher) = &self.cipher {
            for record in &mut records {
                if record.encryption != EncryptionLevel::None {
                    if let serde_json::Value::String(encoded) = &record.details {
                        let plain = cipher.decrypt_string(encoded)?;
                        record.details = serde_json::from_str(&plain)?;
                    }
                }
            }
        }
        Ok(records)
    }

    pub async fn statistics(&self, range: TimeRange) -> Result<AuditStatistics> {
        self.backend.statistics(range).await
    }

    /// Delete whole records older than `cutoff` in every category.
    pub async fn archive_older_than(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64> {
        let mut total = 0;
        for category in AuditCategory::ALL {
            total += self.backend.purge_older_than(category, cutoff).await?;
        }
        Ok(total)
    }

    /// Background retention sweep applying per-category retention windows.
    pub async fn run_retention(&self, interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("audit retention task stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            for (category, days) in &self.retention {
                let cutoff = Utc::now() - ChronoDuration::days(*days as i64);
                match self.backend.purge_older_than(*category, cutoff).await {
                    Ok(0) => {}
                    Ok(n) => info!(category = %category, purged = n, "audit retention purge"),
                    Err(e) => error!(category = %category, error = %e, "audit retention failed"),
                }
            }
        }
    }
}

/// Background task draining the audit buffer into durable storage at
/// `batch_size` records or `flush_interval`, whichever first.
pub struct AuditFlusher {
    receiver: mpsc::Receiver<AuditRecord>,
    backend: Arc<dyn AuditBackend>,
    batch_size: usize,
    flush_interval: std::time::Duration,
    forward_bus: Option<(Arc<dyn EventBus>, String)>,
    forward_categories: Vec<AuditCategory>,
    metrics: Arc<CoreMetrics>,
}

impl AuditFlusher {
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut buffer: Vec<AuditRecord> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain whatever is still queued before stopping.
                    while let Ok(record) = self.receiver.try_recv() {
                        buffer.push(record);
                    }
                    self.flush(&mut buffer).await;
                    info!("audit flusher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.flush(&mut buffer).await;
                }
                received = self.receiver.recv() => {
                    match received {
                        Some(record) => {
                            buffer.push(record);
                            if buffer.len() >= self.batch_size {
                                self.flush(&mut buffer).await;
                            }
                        }
                        None => {
                            self.flush(&mut buffer).await;
                            info!("audit channel closed; flusher stopped");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn flush(&self, buffer: &mut Vec<AuditRecord>) {
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(buffer);
        match self.backend.store_batch(&batch).await {
            Ok(()) => {
                debug!(count = batch.len(), "audit batch flushed");
                self.forward(&batch).await;
            }
            Err(e) => {
                // Records are immutable and must not be lost silently; put
                // the batch back and retry on the next tick.
                error!(error = %e, count = batch.len(), "audit flush failed; will retry");
                self.metrics.audit_flush_failures_total.inc();
                *buffer = batch;
            }
        }
    }

    async fn forward(&self, batch: &[AuditRecord]) {
        let Some((bus, topic)) = &self.forward_bus else {
            return;
        };
        for record in batch {
            if !self.forward_categories.contains(&record.category) {
                continue;
            }
            let envelope = EventEnvelope::new(AegisEvent::AuditForwarded(AuditForwarded {
                audit_id: record.id,
                category: record.category.as_str().to_string(),
                event_type: record.event_type.clone(),
                result: record.result.to_string(),
            }));
            if let Err(e) = bus.publish(topic, &record.id.to_string(), &envelope).await {
                self.metrics.bus_publish_failures_total.inc();
                warn!(error = %e, audit_id = %record.id, "audit forward failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::repository::MemoryAuditRepository;

    fn test_config(buffer_size: usize) -> AuditConfig {
        AuditConfig {
            buffer_size,
            batch_size: 4,
            flush_interval_ms: 20,
            encryption_key: String::new(),
            encryption_levels: HashMap::new(),
            ..AuditConfig::default()
        }
    }

    fn sample(category: AuditCategory) -> AuditRecord {
        AuditRecord::builder(category, "status_changed", "update")
            .entity("alert", "a-1")
            .details(serde_json::json!({"from": "OPEN", "to": "INVESTIGATING"}))
            .build()
    }

    #[tokio::test]
    async fn flusher_writes_at_batch_size() {
        let backend = Arc::new(MemoryAuditRepository::new());
        let metrics = CoreMetrics::new_unregistered();
        let (log, flusher) =
            AuditLog::new(backend.clone(), &test_config(64), None, metrics).unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(flusher.run(cancel.clone()));

        for _ in 0..4 {
            log.log_record(sample(AuditCategory::Compliance)).unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(backend.len().await, 4);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn full_buffer_is_overloaded() {
        let backend = Arc::new(MemoryAuditRepository::new());
        let metrics = CoreMetrics::new_unregistered();
        // Flusher intentionally not spawned: nothing drains the buffer.
        let (log, _flusher) =
            AuditLog::new(backend, &test_config(2), None, metrics).unwrap();

        log.log_record(sample(AuditCategory::System)).unwrap();
        log.log_record(sample(AuditCategory::System)).unwrap();
        let err = log.log_record(sample(AuditCategory::System)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Overloaded);
    }

    #[tokio::test]
    async fn encryption_policy_applies_per_category() {
        let backend = Arc::new(MemoryAuditRepository::new());
        let metrics = CoreMetrics::new_unregistered();
        let mut config = test_config(16);
        config.encryption_key = "0123456789abcdef0123456789abcdef".to_string();
        config
            .encryption_levels
            .insert("violation".to_string(), "high".to_string());

        let (log, flusher) = AuditLog::new(backend.clone(), &config, None, metrics).unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(flusher.run(cancel.clone()));

        log.log_record(
            AuditRecord::builder(AuditCategory::Violation, "tampering", "verify")
                .details(serde_json::json!({"evidence": "e-1"}))
                .source("10.0.0.9", "analyst-console")
                .build(),
        )
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // Stored form is ciphertext.
        let stored = backend
            .query(&AuditFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(stored[0].encryption, EncryptionLevel::High);
        assert!(stored[0].details.is_string());

        // Query through the logger decrypts.
        let read = log
            .query(&AuditFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(read[0].details["evidence"], "e-1");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn archive_deletes_across_categories() {
        let backend = Arc::new(MemoryAuditRepository::new());
        let metrics = CoreMetrics::new_unregistered();
        let (log, _flusher) =
            AuditLog::new(backend.clone(), &test_config(16), None, metrics).unwrap();

        let old = AuditRecord::builder(AuditCategory::System, "startup", "boot")
            .at(Utc::now() - ChronoDuration::days(400))
            .build();
        backend.store_batch(&[old, sample(AuditCategory::System)]).await.unwrap();

        let purged = log
            .archive_older_than(Utc::now() - ChronoDuration::days(365))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(backend.len().await, 1);
    }
}
