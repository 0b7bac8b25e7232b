//! # Batched Persistence
//!
//! Accepted records buffer per `batch_id` and flush when the batch
//! reaches `B` records or age `T`, whichever first. A flush is one atomic
//! bulk write through the graph store, followed by one
//! `transaction_ingested` event per record in `(batch_id, index)` order.
//! No event claims success before the write commits. Transient write
//! failures retry the whole batch with exponential backoff and capped
//! attempts; permanent failures emit per-record failure events and an
//! operational audit record.

use crate::error::{IngestError, Result};
use crate::model::{Transaction, TransactionStatus};
use crate::resolver::EntityResolver;
use aegis_core::audit::{AuditCategory, AuditLog, AuditResult};
use aegis_core::bus::EventBus;
use aegis_core::config::IngestionConfig;
use aegis_core::events::{
    AegisEvent, EventEnvelope, TransactionFailed, TransactionIngested,
};
use aegis_core::metrics::CoreMetrics;
use aegis_graph::{GraphCommand, GraphStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct PendingBatch {
    records: Vec<Transaction>,
    opened_at: Instant,
}

/// Outcome of one batch flush.
#[derive(Debug, Clone)]
pub struct FlushOutcome {
    pub batch_id: Uuid,
    /// Transactions persisted, enriched with resolved entity ids, in
    /// batch-index order.
    pub persisted: Vec<Transaction>,
}

pub struct TransactionBatcher {
    graph: Arc<dyn GraphStore>,
    resolver: Arc<EntityResolver>,
    bus: Arc<dyn EventBus>,
    flow_topic: String,
    config: IngestionConfig,
    audit: AuditLog,
    metrics: Arc<CoreMetrics>,
    buffers: Mutex<HashMap<Uuid, PendingBatch>>,
}

impl TransactionBatcher {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        resolver: Arc<EntityResolver>,
        bus: Arc<dyn EventBus>,
        flow_topic: impl Into<String>,
        config: IngestionConfig,
        audit: AuditLog,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            graph,
            resolver,
            bus,
            flow_topic: flow_topic.into(),
            config,
            audit,
            metrics,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer one accepted record. Flushes and returns the outcome when
    /// the batch reaches the size threshold.
    pub async fn submit(&self, txn: Transaction) -> Result<Option<FlushOutcome>> {
        let batch_id = txn.batch_id.unwrap_or_else(Uuid::new_v4);
        let ready = {
            let mut buffers = self.buffers.lock().await;
            let batch = buffers.entry(batch_id).or_insert_with(|| PendingBatch {
                records: Vec::new(),
                opened_at: Instant::now(),
            });
            let mut txn = txn;
            txn.batch_id = Some(batch_id);
            batch.records.push(txn);
            batch.records.len() >= self.config.max_batch_size
        };

        if ready {
            Ok(Some(self.flush(batch_id).await?))
        } else {
            Ok(None)
        }
    }

    /// Flush one batch now, regardless of size.
    pub async fn flush(&self, batch_id: Uuid) -> Result<FlushOutcome> {
        let pending = {
            let mut buffers = self.buffers.lock().await;
            buffers.remove(&batch_id)
        };
        let Some(pending) = pending else {
            return Ok(FlushOutcome {
                batch_id,
                persisted: Vec::new(),
            });
        };
        self.flush_records(batch_id, pending.records).await
    }

    /// Flush every batch older than the configured age. Driven by the
    /// background timer task.
    pub async fn flush_expired(&self) -> Result<Vec<FlushOutcome>> {
        let expired: Vec<Uuid> = {
            let buffers = self.buffers.lock().await;
            buffers
                .iter()
                .filter(|(_, batch)| batch.opened_at.elapsed() >= self.config.batch_timeout())
                .map(|(id, _)| *id)
                .collect()
        };
        let mut outcomes = Vec::new();
        for batch_id in expired {
            outcomes.push(self.flush(batch_id).await?);
        }
        Ok(outcomes)
    }

    /// Age-based flush loop; runs until cancelled.
    pub async fn run_timeouts(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.batch_timeout() / 2;
        let mut ticker = tokio::time::interval(period.max(std::time::Duration::from_millis(50)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Final drain so shutdown does not strand buffered records.
                    let remaining: Vec<Uuid> = {
                        let buffers = self.buffers.lock().await;
                        buffers.keys().copied().collect()
                    };
                    for batch_id in remaining {
                        if let Err(e) = self.flush(batch_id).await {
                            error!(batch = %batch_id, error = %e, "shutdown flush failed");
                        }
                    }
                    info!("batcher timeout task stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_expired().await {
                        error!(error = %e, "age-based flush failed");
                    }
                }
            }
        }
    }

    async fn flush_records(
        &self,
        batch_id: Uuid,
        records: Vec<Transaction>,
    ) -> Result<FlushOutcome> {
        if records.is_empty() {
            return Ok(FlushOutcome {
                batch_id,
                persisted: Vec::new(),
            });
        }

        // Enrichment: resolve both accounts of every record to canonical
        // entities; the entity upserts ride in the same atomic write.
        let mut commands: Vec<GraphCommand> = Vec::new();
        let mut enriched: Vec<Transaction> = Vec::with_capacity(records.len());
        let mut seen_entities: HashMap<Uuid, ()> = HashMap::new();
        for mut txn in records {
            let from = match &txn.from_account {
                Some(account) => self.resolver.reconcile_account(account).await?,
                None => {
                    return Err(IngestError::EntityConflict {
                        key: txn.id.to_string(),
                        message: "accepted record without source account".to_string(),
                    })
                }
            };
            let to = match &txn.to_account {
                Some(account) => self.resolver.reconcile_account(account).await?,
                // Cash legs settle against the institution's own entity,
                // keyed by the source account's counter-side.
                None => self
                    .resolver
                    .reconcile_account(&format!("{}-SETTLEMENT", txn.from_account.as_deref().unwrap_or("HOUSE")))
                    .await?,
            };

            txn.from_entity = Some(from.id);
            txn.to_entity = Some(to.id);
            txn.status = TransactionStatus::Persisted;

            for entity in [from, to] {
                if seen_entities.insert(entity.id, ()).is_none() {
                    commands.push(GraphCommand::UpsertEntity(entity));
                }
            }
            commands.push(GraphCommand::UpsertRelationship(
                EntityResolver::transfer_edge(
                    txn.from_entity.expect("set above"),
                    txn.to_entity.expect("set above"),
                    txn.id,
                    &txn.amount,
                    txn.timestamp,
                ),
            ));
            enriched.push(txn);
        }

        // One atomic bulk write, retried as a whole on transient failure.
        if let Err(err) = self.write_with_retry(batch_id, commands).await {
            self.report_batch_failure(batch_id, &enriched, &err).await;
            return Err(err);
        }

        // Events strictly after commit, in (batch_id, index) order.
        for (index, txn) in enriched.iter().enumerate() {
            let envelope = EventEnvelope::new(AegisEvent::TransactionIngested(TransactionIngested {
                transaction_id: txn.id,
                batch_id,
                index: index as u32,
                from_entity: txn.from_entity.expect("enriched"),
                to_entity: txn.to_entity.expect("enriched"),
                amount: txn.amount,
                currency: txn.currency.as_str().to_string(),
                occurred_at: txn.timestamp,
                risk_score: txn.risk_score,
            }));
            let key = format!("{}:{}", batch_id, index);
            if let Err(e) = self.bus.publish(&self.flow_topic, &key, &envelope).await {
                // The write committed; the event is retried by the caller
                // layer that owns publish idempotency (keyed above).
                self.metrics.bus_publish_failures_total.inc();
                warn!(batch = %batch_id, index, error = %e, "flow event publish failed");
                return Err(IngestError::Downstream(
                    aegis_core::Error::wrapping(e, "batcher.emit_flow_events")
                        .with_committed(format!("batch {} flushed", batch_id)),
                ));
            }
        }

        // One compliance audit record per persisted transaction.
        for txn in &enriched {
            if let Err(e) = self.audit.log_event(
                AuditCategory::Compliance,
                "transaction_ingested",
                None,
                Some(("transaction", &txn.id.to_string())),
                "persist",
                serde_json::json!({
                    "batch_id": batch_id,
                    "amount": txn.amount.to_string(),
                    "currency": txn.currency.as_str(),
                }),
                AuditResult::Success,
            ) {
                warn!(transaction = %txn.id, error = %e, "compliance audit enqueue failed");
            }
        }

        debug!(batch = %batch_id, records = enriched.len(), "batch flushed");
        Ok(FlushOutcome {
            batch_id,
            persisted: enriched,
        })
    }

    async fn write_with_retry(&self, batch_id: Uuid, commands: Vec<GraphCommand>) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.graph.execute(commands.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.config.max_write_attempts => {
                    self.metrics.batch_write_retries_total.inc();
                    let backoff = self.config.retry_backoff_ms * 2u64.pow(attempt - 1);
                    warn!(
                        batch = %batch_id,
                        attempt,
                        backoff_ms = backoff,
                        error = %err,
                        "transient batch write failure; retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                }
                Err(err) => {
                    return Err(IngestError::BatchFailed {
                        batch_id,
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// Permanent failure path: per-record failure events plus an
    /// operational audit record; the audit write is best-effort here
    /// because the failure itself must surface regardless.
    async fn report_batch_failure(
        &self,
        batch_id: Uuid,
        records: &[Transaction],
        err: &IngestError,
    ) {
        self.metrics.batch_write_failures_total.inc();
        error!(batch = %batch_id, records = records.len(), error = %err, "batch failed permanently");

        for (index, txn) in records.iter().enumerate() {
            let envelope = EventEnvelope::new(AegisEvent::TransactionFailed(TransactionFailed {
                transaction_id: txn.id,
                batch_id,
                index: index as u32,
                reason: err.to_string(),
            }));
            let key = format!("{}:{}:failed", batch_id, index);
            if let Err(e) = self.bus.publish(&self.flow_topic, &key, &envelope).await {
                self.metrics.bus_publish_failures_total.inc();
                warn!(batch = %batch_id, index, error = %e, "failure event publish failed");
            }
        }

        if let Err(e) = self.audit.log_event(
            AuditCategory::System,
            "batch_write_failed",
            None,
            Some(("batch", &batch_id.to_string())),
            "persist",
            serde_json::json!({
                "records": records.len(),
                "error": err.to_string(),
            }),
            AuditResult::Failure,
        ) {
            warn!(error = %e, "could not audit batch failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransactionType;
    use aegis_core::audit::MemoryAuditRepository;
    use aegis_core::bus::MemoryEventBus;
    use aegis_core::config::{AuditConfig, ResolverConfig};
    use aegis_core::types::Currency;
    use aegis_graph::MemoryGraphStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn audit_log() -> AuditLog {
        let backend = Arc::new(MemoryAuditRepository::new());
        let (log, _flusher) = AuditLog::new(
            backend,
            &AuditConfig::default(),
            None,
            CoreMetrics::new_unregistered(),
        )
        .unwrap();
        log
    }

    fn batcher(
        graph: Arc<MemoryGraphStore>,
        bus: Arc<MemoryEventBus>,
        batch_size: usize,
    ) -> TransactionBatcher {
        let resolver = Arc::new(EntityResolver::new(graph.clone(), ResolverConfig::default()));
        let config = IngestionConfig {
            max_batch_size: batch_size,
            batch_timeout_ms: 50,
            ..IngestionConfig::default()
        };
        TransactionBatcher::new(
            graph,
            resolver,
            bus,
            "aegis.data.transaction-flow",
            config,
            audit_log(),
            CoreMetrics::new_unregistered(),
        )
    }

    fn txn(batch_id: Uuid, n: u32) -> Transaction {
        Transaction::new(
            TransactionType::WireTransfer,
            dec!(150.00),
            Currency::new("USD"),
            Utc::now(),
        )
        .with_accounts(format!("SRCACCT{:04}", n), "DSTACCT0001")
        .with_description("settlement for test fixture")
        .with_batch(batch_id)
    }

    #[tokio::test]
    async fn batch_flushes_at_exactly_b_records() {
        let graph = Arc::new(MemoryGraphStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let batcher = batcher(graph.clone(), bus.clone(), 4);
        let batch_id = Uuid::new_v4();

        for n in 0..3 {
            assert!(batcher.submit(txn(batch_id, n)).await.unwrap().is_none());
        }
        assert_eq!(bus.topic_len("aegis.data.transaction-flow").await, 0);

        // Fourth record triggers the single write + single emit phase.
        let outcome = batcher.submit(txn(batch_id, 3)).await.unwrap().unwrap();
        assert_eq!(outcome.persisted.len(), 4);
        assert_eq!(bus.topic_len("aegis.data.transaction-flow").await, 4);
    }

    #[tokio::test]
    async fn flow_events_are_contiguous_per_batch() {
        let graph = Arc::new(MemoryGraphStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let batcher = batcher(graph, bus.clone(), 5);
        let batch_id = Uuid::new_v4();

        for n in 0..5 {
            batcher.submit(txn(batch_id, n)).await.unwrap();
        }

        let log = bus.topic_log("aegis.data.transaction-flow").await;
        let mut indexes: Vec<u32> = log
            .iter()
            .filter_map(|envelope| match &envelope.event {
                AegisEvent::TransactionIngested(e) => {
                    assert_eq!(e.batch_id, batch_id);
                    Some(e.index)
                }
                _ => None,
            })
            .collect();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn persisted_records_materialize_graph_state() {
        let graph = Arc::new(MemoryGraphStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let batcher = batcher(graph.clone(), bus, 1);

        let outcome = batcher
            .submit(txn(Uuid::new_v4(), 7))
            .await
            .unwrap()
            .unwrap();
        let persisted = &outcome.persisted[0];

        let from = graph.get_entity(persisted.from_entity.unwrap()).await.unwrap();
        let to = graph.get_entity(persisted.to_entity.unwrap()).await.unwrap();
        assert_eq!(from.property_str("account_id"), Some("SRCACCT0007"));
        assert_eq!(to.property_str("account_id"), Some("DSTACCT0001"));

        // The TRANSFERRED_TO edge carries the transaction timestamp.
        let neighborhood = graph
            .get_neighborhood(from.id, 1, &[aegis_graph::RelationshipType::TransferredTo])
            .await
            .unwrap();
        let edge = neighborhood
            .relationships
            .iter()
            .find(|r| r.source_id == from.id && r.target_id == to.id)
            .expect("transfer edge");
        assert_eq!(edge.occurred_at(), persisted.timestamp);
    }

    #[tokio::test]
    async fn age_based_flush_drains_stale_batches() {
        let graph = Arc::new(MemoryGraphStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let batcher = batcher(graph, bus.clone(), 100);
        let batch_id = Uuid::new_v4();

        batcher.submit(txn(batch_id, 0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let outcomes = batcher.flush_expired().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].persisted.len(), 1);
        assert_eq!(bus.topic_len("aegis.data.transaction-flow").await, 1);
    }
}
