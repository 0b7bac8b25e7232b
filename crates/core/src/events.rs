//! # Event Envelope & Topics
//!
//! Every message on the bus is a canonical JSON envelope
//! `{event_type, timestamp, payload}`. Payloads are tagged variants with
//! the `event_type` discriminator rather than dynamic maps, so consumers
//! match on an enum instead of probing JSON fields.

use crate::types::{Priority, Severity};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typed event payloads, adjacently tagged so the wire form carries the
/// `event_type` discriminator next to the payload body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum AegisEvent {
    TransactionSubmitted(TransactionSubmitted),
    FileUploaded(FileUploaded),
    TransactionIngested(TransactionIngested),
    TransactionFailed(TransactionFailed),
    ValidationCompleted(ValidationCompleted),
    EntityResolved(EntityResolved),
    EntityLinked(EntityLinked),
    IngestionCompleted(IngestionCompleted),
    AnalysisRequested(AnalysisRequested),
    AnalysisCompleted(AnalysisCompleted),
    PatternDetected(PatternDetected),
    AlertCreated(AlertCreated),
    AlertUpdated(AlertUpdated),
    InvestigationCreated(InvestigationCreated),
    InvestigationUpdated(InvestigationUpdated),
    AuditForwarded(AuditForwarded),
}

impl AegisEvent {
    /// Stable discriminator string, as it appears on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            AegisEvent::TransactionSubmitted(_) => "transaction_submitted",
            AegisEvent::FileUploaded(_) => "file_uploaded",
            AegisEvent::TransactionIngested(_) => "transaction_ingested",
            AegisEvent::TransactionFailed(_) => "transaction_failed",
            AegisEvent::ValidationCompleted(_) => "validation_completed",
            AegisEvent::EntityResolved(_) => "entity_resolved",
            AegisEvent::EntityLinked(_) => "entity_linked",
            AegisEvent::IngestionCompleted(_) => "ingestion_completed",
            AegisEvent::AnalysisRequested(_) => "analysis_requested",
            AegisEvent::AnalysisCompleted(_) => "analysis_completed",
            AegisEvent::PatternDetected(_) => "pattern_detected",
            AegisEvent::AlertCreated(_) => "alert_created",
            AegisEvent::AlertUpdated(_) => "alert_updated",
            AegisEvent::InvestigationCreated(_) => "investigation_created",
            AegisEvent::InvestigationUpdated(_) => "investigation_updated",
            AegisEvent::AuditForwarded(_) => "audit_forwarded",
        }
    }

    /// Partition key for ordering on the bus. Per-transaction events order
    /// by `(batch_id, index)`; entity-scoped events by entity id.
    pub fn partition_key(&self) -> String {
        match self {
            AegisEvent::TransactionSubmitted(e) => e.submission_id.to_string(),
            AegisEvent::FileUploaded(e) => e.file_id.to_string(),
            AegisEvent::TransactionIngested(e) => format!("{}:{}", e.batch_id, e.index),
            AegisEvent::TransactionFailed(e) => format!("{}:{}", e.batch_id, e.index),
            AegisEvent::ValidationCompleted(e) => e.transaction_id.to_string(),
            AegisEvent::EntityResolved(e) => e.entity_id.to_string(),
            AegisEvent::EntityLinked(e) => e.relationship_id.to_string(),
            AegisEvent::IngestionCompleted(e) => e.job_id.to_string(),
            AegisEvent::AnalysisRequested(e) => e.request_id.to_string(),
            AegisEvent::AnalysisCompleted(e) => e.request_id.to_string(),
            AegisEvent::PatternDetected(e) => e.pattern_id.to_string(),
            AegisEvent::AlertCreated(e) => e.alert_id.to_string(),
            AegisEvent::AlertUpdated(e) => e.alert_id.to_string(),
            AegisEvent::InvestigationCreated(e) => e.investigation_id.to_string(),
            AegisEvent::InvestigationUpdated(e) => e.investigation_id.to_string(),
            AegisEvent::AuditForwarded(e) => e.audit_id.to_string(),
        }
    }
}

/// Canonical wire envelope: `{event_type, timestamp, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AegisEvent,
}

impl EventEnvelope {
    pub fn new(event: AegisEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn at(timestamp: DateTime<Utc>, event: AegisEvent) -> Self {
        Self { timestamp, event }
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A raw transaction record submitted for ingestion. The record is an
/// opaque document here; the ingestion service decodes and validates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSubmitted {
    pub submission_id: Uuid,
    pub record: serde_json::Value,
    pub submitted_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUploaded {
    pub file_id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub storage_key: String,
    pub uploaded_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionIngested {
    pub transaction_id: Uuid,
    pub batch_id: Uuid,
    /// Position within the batch; `(batch_id, index)` is a total order for
    /// the batch's events.
    pub index: u32,
    pub from_entity: Uuid,
    pub to_entity: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
    pub risk_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionFailed {
    pub transaction_id: Uuid,
    pub batch_id: Uuid,
    pub index: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCompleted {
    pub transaction_id: Uuid,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub quality_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResolved {
    pub entity_id: Uuid,
    pub entity_type: String,
    pub matched: bool,
    pub confidence: f64,
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLinked {
    pub relationship_id: Uuid,
    pub relationship_type: String,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionCompleted {
    pub job_id: Uuid,
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequested {
    pub request_id: Uuid,
    pub analysis_type: String,
    pub entity_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCompleted {
    pub request_id: Uuid,
    pub analysis_type: String,
    pub processing_time_ms: u64,
    pub summary: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDetected {
    pub pattern_id: Uuid,
    pub pattern_type: String,
    pub entity_ids: Vec<Uuid>,
    pub relationship_ids: Vec<Uuid>,
    pub confidence: f64,
    pub severity: Severity,
    pub evidence: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCreated {
    pub alert_id: Uuid,
    pub rule_id: String,
    pub priority: Priority,
    pub entity_ids: Vec<Uuid>,
    pub pattern_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertUpdated {
    pub alert_id: Uuid,
    pub status: String,
    pub priority: Priority,
    pub assigned_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationCreated {
    pub investigation_id: Uuid,
    pub name: String,
    pub priority: Priority,
    pub alert_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationUpdated {
    pub investigation_id: Uuid,
    pub status: String,
    pub assigned_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditForwarded {
    pub audit_id: Uuid,
    pub category: String,
    pub event_type: String,
    pub result: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ingested() -> AegisEvent {
        AegisEvent::TransactionIngested(TransactionIngested {
            transaction_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            index: 3,
            from_entity: Uuid::new_v4(),
            to_entity: Uuid::new_v4(),
            amount: Decimal::new(9_500, 0),
            currency: "USD".to_string(),
            occurred_at: Utc::now(),
            risk_score: 0.4,
        })
    }

    #[test]
    fn envelope_wire_form_has_discriminator() {
        let envelope = EventEnvelope::new(sample_ingested());
        let json: serde_json::Value =
            serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(json["event_type"], "transaction_ingested");
        assert!(json["timestamp"].is_string());
        assert!(json["payload"]["batch_id"].is_string());
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = EventEnvelope::new(sample_ingested());
        let json = envelope.to_json().unwrap();
        let back = EventEnvelope::from_json(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn transaction_events_key_by_batch_and_index() {
        let event = sample_ingested();
        let key = event.partition_key();
        assert!(key.ends_with(":3"));
    }
}
