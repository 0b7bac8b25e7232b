//! # Ingestion Pipeline
//!
//! Front door for the three intake paths: unary (`ingest_one`), stream
//! (`ingest_stream`), and file upload (`ingest_file`). Every record runs
//! the validation pipeline; accepted records persist through the batcher;
//! validation outcomes are published regardless of acceptance.

use crate::batch::TransactionBatcher;
use crate::error::{IngestError, Result};
use crate::jobs::{IngestionJobStore, JobKind};
use crate::model::{Transaction, TransactionStatus, ValidationIssue, ValidationResult};
use crate::resolver::EntityResolver;
use crate::validation::ValidationPipeline;
use aegis_core::bus::EventBus;
use aegis_core::config::{IngestionConfig, TopicConfig};
use aegis_core::events::{
    AegisEvent, EventEnvelope, FileUploaded, IngestionCompleted, ValidationCompleted,
};
use aegis_core::object_store::{collect_bytes, ObjectMetadata, ObjectStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Response of `ingest_one`.
#[derive(Debug, Clone)]
pub struct IngestResponse {
    pub accepted: bool,
    pub transaction_id: Uuid,
    pub errors: Vec<ValidationIssue>,
}

/// Per-record acknowledgement on the stream path.
#[derive(Debug, Clone)]
pub struct RecordAck {
    pub transaction_id: Uuid,
    pub accepted: bool,
    pub errors: Vec<String>,
}

/// Metadata supplied with a file upload.
#[derive(Debug, Clone)]
pub struct FileUploadRequest {
    pub file_name: String,
    pub content_type: String,
    pub uploaded_by: Option<String>,
}

pub struct IngestionPipeline {
    validator: ValidationPipeline,
    batcher: Arc<TransactionBatcher>,
    resolver: Arc<EntityResolver>,
    bus: Arc<dyn EventBus>,
    object_store: Arc<dyn ObjectStore>,
    jobs: IngestionJobStore,
    topics: TopicConfig,
    config: IngestionConfig,
    /// Validation outcomes per transaction; one per validator pass.
    validations: RwLock<HashMap<Uuid, ValidationResult>>,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        validator: ValidationPipeline,
        batcher: Arc<TransactionBatcher>,
        resolver: Arc<EntityResolver>,
        bus: Arc<dyn EventBus>,
        object_store: Arc<dyn ObjectStore>,
        jobs: IngestionJobStore,
        topics: TopicConfig,
        config: IngestionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            validator,
            batcher,
            resolver,
            bus,
            object_store,
            jobs,
            topics,
            config,
            validations: RwLock::new(HashMap::new()),
        })
    }

    pub fn jobs(&self) -> &IngestionJobStore {
        &self.jobs
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    /// Stored validation outcome for a transaction.
    pub async fn validation_of(&self, transaction_id: Uuid) -> Option<ValidationResult> {
        self.validations.read().await.get(&transaction_id).cloned()
    }

    /// Synchronous validation + persistence of one record. On success the
    /// record and its graph effects are durable and its flow event is
    /// emitted.
    pub async fn ingest_one(&self, mut txn: Transaction) -> Result<IngestResponse> {
        let result = self.validate_and_publish(&txn).await?;
        if !result.valid {
            txn.status = TransactionStatus::Rejected;
            return Ok(IngestResponse {
                accepted: false,
                transaction_id: txn.id,
                errors: result.errors,
            });
        }

        txn.status = TransactionStatus::Validated;
        // Unary intake persists synchronously under its own batch, so the
        // `(batch_id, index)` sequence of a batch always comes from one
        // flush. Caller grouping belongs to the stream path.
        let batch_id = Uuid::new_v4();
        txn.batch_id = Some(batch_id);

        let flushed = self.batcher.submit(txn.clone()).await?;
        if flushed.is_none() {
            self.batcher.flush(batch_id).await?;
        }

        Ok(IngestResponse {
            accepted: true,
            transaction_id: txn.id,
            errors: Vec::new(),
        })
    }

    /// Bidirectional stream intake: per-record acks, internal batching,
    /// batch finalization when the stream ends, and a job record tracking
    /// totals.
    pub async fn ingest_stream(
        self: Arc<Self>,
        mut records: mpsc::Receiver<Transaction>,
        cancel: CancellationToken,
    ) -> Result<(Uuid, mpsc::Receiver<RecordAck>)> {
        let job = self.jobs.create(JobKind::Stream).await;
        let (ack_tx, ack_rx) = mpsc::channel(self.config.max_batch_size.max(16));
        let pipeline = Arc::clone(&self);
        let job_id = job.id;

        tokio::spawn(async move {
            let mut current_batch = Uuid::new_v4();
            let mut in_batch = 0usize;
            let mut rejected_in_flight = 0u64;

            loop {
                let txn = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = records.recv() => match received {
                        Some(txn) => txn,
                        None => break,
                    },
                };

                let ack = match pipeline.stream_record(txn, current_batch).await {
                    Ok((ack, flushed)) => {
                        if ack.accepted {
                            in_batch += 1;
                        } else {
                            rejected_in_flight += 1;
                        }
                        if flushed {
                            // Progress per flushed batch.
                            let _ = pipeline
                                .jobs
                                .record_progress(job_id, in_batch as u64, rejected_in_flight)
                                .await;
                            in_batch = 0;
                            rejected_in_flight = 0;
                            current_batch = Uuid::new_v4();
                        }
                        ack
                    }
                    Err(e) => {
                        warn!(error = %e, "stream record failed");
                        rejected_in_flight += 1;
                        RecordAck {
                            transaction_id: Uuid::nil(),
                            accepted: false,
                            errors: vec![e.to_string()],
                        }
                    }
                };
                if ack_tx.send(ack).await.is_err() {
                    // Caller went away; finalize what we have.
                    break;
                }
            }

            // Stream ended: finalize the open batch.
            match pipeline.batcher.flush(current_batch).await {
                Ok(outcome) => {
                    let _ = pipeline
                        .jobs
                        .record_progress(job_id, outcome.persisted.len() as u64, rejected_in_flight)
                        .await;
                }
                Err(e) => {
                    error!(job = %job_id, error = %e, "final batch flush failed");
                    let _ = pipeline
                        .jobs
                        .record_progress(job_id, 0, in_batch as u64 + rejected_in_flight)
                        .await;
                }
            }

            let completed = match pipeline.jobs.complete(job_id).await {
                Ok(job) => job,
                Err(e) => {
                    error!(job = %job_id, error = %e, "job completion failed");
                    return;
                }
            };
            let envelope = EventEnvelope::new(AegisEvent::IngestionCompleted(IngestionCompleted {
                job_id,
                total: completed.total,
                processed: completed.processed,
                failed: completed.failed,
            }));
            if let Err(e) = pipeline
                .bus
                .publish(&pipeline.topics.data_processed, &job_id.to_string(), &envelope)
                .await
            {
                warn!(job = %job_id, error = %e, "job completion event failed");
            }
            info!(job = %job_id, total = completed.total, failed = completed.failed, "stream ingestion completed");
        });

        Ok((job_id, ack_rx))
    }

    async fn stream_record(
        &self,
        mut txn: Transaction,
        batch_id: Uuid,
    ) -> Result<(RecordAck, bool)> {
        let result = self.validate_and_publish(&txn).await?;
        if !result.valid {
            return Ok((
                RecordAck {
                    transaction_id: txn.id,
                    accepted: false,
                    errors: result.errors.iter().map(|i| i.code.clone()).collect(),
                },
                false,
            ));
        }

        txn.status = TransactionStatus::Validated;
        txn.batch_id = Some(batch_id);
        let flushed = self.batcher.submit(txn.clone()).await?.is_some();
        Ok((
            RecordAck {
                transaction_id: txn.id,
                accepted: true,
                errors: Vec::new(),
            },
            flushed,
        ))
    }

    /// Store raw bytes, emit the upload event, and dispatch parsing
    /// asynchronously. Returns the file id immediately.
    pub async fn ingest_file(
        self: Arc<Self>,
        request: FileUploadRequest,
        bytes: Vec<u8>,
    ) -> Result<Uuid> {
        if bytes.len() as u64 > self.config.max_file_size {
            return Err(IngestError::FileTooLarge {
                size: bytes.len() as u64,
                limit: self.config.max_file_size,
            });
        }

        let file_id = Uuid::new_v4();
        let storage_key = format!("uploads/{}/{}", file_id, request.file_name);
        let metadata = ObjectMetadata {
            content_type: request.content_type.clone(),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
            attributes: HashMap::from([(
                "uploaded_by".to_string(),
                request.uploaded_by.clone().unwrap_or_default(),
            )]),
        };
        self.object_store
            .put(&storage_key, bytes, metadata)
            .await
            .map_err(|e| IngestError::Downstream(e.in_operation("pipeline.ingest_file")))?;

        let envelope = EventEnvelope::new(AegisEvent::FileUploaded(FileUploaded {
            file_id,
            file_name: request.file_name.clone(),
            content_type: request.content_type.clone(),
            size_bytes: self
                .object_store
                .metadata(&storage_key)
                .await
                .map(|m| m.size_bytes)
                .unwrap_or(0),
            storage_key: storage_key.clone(),
            uploaded_by: request.uploaded_by.clone(),
        }));
        self.bus
            .publish(&self.topics.file_upload, &file_id.to_string(), &envelope)
            .await
            .map_err(|e| IngestError::Downstream(e.in_operation("pipeline.ingest_file")))?;

        // Parsing happens off the request path.
        let pipeline = Arc::clone(&self);
        let job = self.jobs.create(JobKind::File).await;
        tokio::spawn(async move {
            pipeline.parse_uploaded_file(job.id, &storage_key).await;
        });

        info!(file = %file_id, "file upload stored; parse dispatched");
        Ok(file_id)
    }

    /// Parse an uploaded file of JSON-lines transactions and run each
    /// record through the standard intake.
    async fn parse_uploaded_file(&self, job_id: Uuid, storage_key: &str) {
        let bytes = match self.object_store.get(storage_key).await {
            Ok(stream) => match collect_bytes(stream).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = self.jobs.fail(job_id, e.to_string()).await;
                    return;
                }
            },
            Err(e) => {
                let _ = self.jobs.fail(job_id, e.to_string()).await;
                return;
            }
        };

        let text = String::from_utf8_lossy(&bytes);
        let mut accepted = 0u64;
        let mut rejected = 0u64;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<Transaction>(line) {
                Ok(txn) => match self.ingest_one(txn).await {
                    Ok(response) if response.accepted => accepted += 1,
                    Ok(_) => rejected += 1,
                    Err(e) => {
                        debug!(error = %e, "file record ingestion failed");
                        rejected += 1;
                    }
                },
                Err(e) => {
                    debug!(error = %e, "undecodable file record");
                    rejected += 1;
                }
            }
        }

        let _ = self.jobs.record_progress(job_id, accepted, rejected).await;
        let _ = self.jobs.complete(job_id).await;
        info!(job = %job_id, accepted, rejected, "file parse completed");
    }

    /// Run the validator, store the result, and publish the validation
    /// outcome event.
    async fn validate_and_publish(&self, txn: &Transaction) -> Result<ValidationResult> {
        let result = self.validator.validate(txn, Utc::now());
        self.validations
            .write()
            .await
            .insert(txn.id, result.clone());

        let envelope = EventEnvelope::new(AegisEvent::ValidationCompleted(ValidationCompleted {
            transaction_id: txn.id,
            valid: result.valid,
            errors: result.errors.iter().map(|i| i.code.clone()).collect(),
            warnings: result.warnings.iter().map(|i| i.code.clone()).collect(),
            quality_score: result.quality_score,
        }));
        self.bus
            .publish(&self.topics.validation, &txn.id.to_string(), &envelope)
            .await
            .map_err(|e| IngestError::Downstream(e.in_operation("pipeline.validate")))?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransactionType;
    use aegis_core::audit::{AuditLog, MemoryAuditRepository};
    use aegis_core::bus::MemoryEventBus;
    use aegis_core::config::{AuditConfig, ResolverConfig, ValidationConfig};
    use aegis_core::metrics::CoreMetrics;
    use aegis_core::object_store::MemoryObjectStore;
    use aegis_core::types::Currency;
    use aegis_graph::MemoryGraphStore;
    use rust_decimal_macros::dec;

    struct Fixture {
        pipeline: Arc<IngestionPipeline>,
        graph: Arc<MemoryGraphStore>,
        bus: Arc<MemoryEventBus>,
        topics: TopicConfig,
    }

    fn fixture(batch_size: usize) -> Fixture {
        fixture_with(IngestionConfig {
            max_batch_size: batch_size,
            ..IngestionConfig::default()
        })
    }

    fn fixture_with(config: IngestionConfig) -> Fixture {
        let graph = Arc::new(MemoryGraphStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let topics = TopicConfig::default();
        let resolver = Arc::new(EntityResolver::new(graph.clone(), ResolverConfig::default()));
        let (audit, _flusher) = AuditLog::new(
            Arc::new(MemoryAuditRepository::new()),
            &AuditConfig::default(),
            None,
            CoreMetrics::new_unregistered(),
        )
        .unwrap();
        let batcher = Arc::new(TransactionBatcher::new(
            graph.clone(),
            resolver.clone(),
            bus.clone(),
            topics.transaction_flow.clone(),
            config.clone(),
            audit,
            CoreMetrics::new_unregistered(),
        ));
        let validator =
            ValidationPipeline::new(&ValidationConfig::default(), &config).unwrap();
        let pipeline = IngestionPipeline::new(
            validator,
            batcher,
            resolver,
            bus.clone(),
            Arc::new(MemoryObjectStore::new()),
            IngestionJobStore::new(),
            topics.clone(),
            config,
        );
        Fixture {
            pipeline,
            graph,
            bus,
            topics,
        }
    }

    fn valid_txn(n: u32) -> Transaction {
        Transaction::new(
            TransactionType::WireTransfer,
            dec!(420.00),
            Currency::new("USD"),
            Utc::now(),
        )
        .with_accounts(format!("SRCACCT{:04}", n), "DSTACCT0009")
        .with_description("supplier settlement 9921")
    }

    #[tokio::test]
    async fn accepted_record_materializes_entities_and_edge() {
        let f = fixture(10);
        let response = f.pipeline.ingest_one(valid_txn(1)).await.unwrap();
        assert!(response.accepted);

        // Validation result exists and matches the persistence decision.
        let validation = f.pipeline.validation_of(response.transaction_id).await.unwrap();
        assert!(validation.valid);

        // Both entities resolvable; one flow event emitted.
        assert_eq!(f.graph.entity_count().await, 2);
        assert_eq!(f.graph.relationship_count().await, 1);
        assert_eq!(f.bus.topic_len(&f.topics.transaction_flow).await, 1);
        assert_eq!(f.bus.topic_len(&f.topics.validation).await, 1);
    }

    #[tokio::test]
    async fn rejected_record_touches_nothing() {
        let f = fixture(10);
        let mut txn = valid_txn(2);
        txn.amount = dec!(1_500_000);

        let response = f.pipeline.ingest_one(txn).await.unwrap();
        assert!(!response.accepted);
        assert!(response
            .errors
            .iter()
            .any(|i| i.code == crate::validation::AMOUNT_LIMIT_EXCEEDED));

        // No graph mutation, no flow event; one validation event with
        // valid=false.
        assert_eq!(f.graph.entity_count().await, 0);
        assert_eq!(f.bus.topic_len(&f.topics.transaction_flow).await, 0);
        let validation_log = f.bus.topic_log(&f.topics.validation).await;
        assert_eq!(validation_log.len(), 1);
        match &validation_log[0].event {
            AegisEvent::ValidationCompleted(v) => assert!(!v.valid),
            other => panic!("expected validation event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_ingestion_batches_and_tracks_job() {
        let f = fixture(4);
        let (tx, rx) = mpsc::channel(16);
        let (job_id, mut acks) = f
            .pipeline
            .clone()
            .ingest_stream(rx, CancellationToken::new())
            .await
            .unwrap();

        for n in 0..6 {
            tx.send(valid_txn(n)).await.unwrap();
        }
        // One invalid record mid-stream.
        let mut bad = valid_txn(99);
        bad.amount = dec!(-1);
        tx.send(bad).await.unwrap();
        drop(tx);

        let mut accepted = 0;
        let mut rejected = 0;
        while let Some(ack) = acks.recv().await {
            if ack.accepted {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }
        assert_eq!(accepted, 6);
        assert_eq!(rejected, 1);

        // Job record captures the totals after finalization.
        let job = f.pipeline.jobs().get(job_id).await.unwrap();
        assert!(job.is_terminal());
        assert_eq!(job.processed, 6);
        assert_eq!(job.failed, 1);
        assert_eq!(f.bus.topic_len(&f.topics.transaction_flow).await, 6);
        assert_eq!(f.bus.topic_len(&f.topics.data_processed).await, 1);
    }

    #[tokio::test]
    async fn file_upload_stores_bytes_and_emits_event() {
        let f = fixture(10);
        let lines: String = (0..3)
            .map(|n| serde_json::to_string(&valid_txn(n)).unwrap())
            .collect::<Vec<_>>()
            .join("\n");

        let file_id = f
            .pipeline
            .clone()
            .ingest_file(
                FileUploadRequest {
                    file_name: "batch.jsonl".to_string(),
                    content_type: "application/x-ndjson".to_string(),
                    uploaded_by: Some("ops".to_string()),
                },
                lines.into_bytes(),
            )
            .await
            .unwrap();
        assert!(!file_id.is_nil());
        assert_eq!(f.bus.topic_len(&f.topics.file_upload).await, 1);

        // Async parse lands the records.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(f.bus.topic_len(&f.topics.transaction_flow).await, 3);
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let f = fixture_with(IngestionConfig {
            max_file_size: 1_024,
            ..IngestionConfig::default()
        });
        let err = f
            .pipeline
            .clone()
            .ingest_file(
                FileUploadRequest {
                    file_name: "big.bin".to_string(),
                    content_type: "application/octet-stream".to_string(),
                    uploaded_by: None,
                },
                vec![0u8; 2_048],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::FileTooLarge { .. }));
    }
}
