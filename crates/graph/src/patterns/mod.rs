//! # Pattern Detector
//!
//! Templated pattern matching over the graph: smurfing, layering, star,
//! triangle, chain. Detections below the confidence floor are discarded;
//! survivors are deduplicated against recent detections of the same
//! `(type, entity-set)` and emitted as `pattern_detected` events.

pub mod dedupe;
pub mod templates;

pub use dedupe::{DedupeKey, DedupeWindow};

use crate::error::{GraphError, Result};
use crate::store::{scratch_projection_name, GraphStore, NodeFilter, RelationshipFilter};
use aegis_core::bus::EventBus;
use aegis_core::config::DetectorConfig;
use aegis_core::events::{AegisEvent, EventEnvelope, PatternDetected};
use aegis_core::metrics::CoreMetrics;
use aegis_core::types::Severity;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The template catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Smurfing,
    Layering,
    Star,
    Triangle,
    Chain,
}

impl PatternType {
    pub const ALL: [PatternType; 5] = [
        PatternType::Smurfing,
        PatternType::Layering,
        PatternType::Star,
        PatternType::Triangle,
        PatternType::Chain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Smurfing => "smurfing",
            PatternType::Layering => "layering",
            PatternType::Star => "star",
            PatternType::Triangle => "triangle",
            PatternType::Chain => "chain",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detection produced by a template. Never mutated; a newer detection of
/// the same `(type, entity-set)` supersedes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatch {
    pub id: Uuid,
    pub pattern_type: PatternType,
    /// Sorted; the dedupe identity together with `pattern_type`.
    pub entity_ids: Vec<Uuid>,
    pub relationship_ids: Vec<Uuid>,
    pub confidence: f64,
    pub severity: Severity,
    pub evidence: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

impl PatternMatch {
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            pattern_type: self.pattern_type.as_str().to_string(),
            entity_set: self
                .entity_ids
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Detection request.
#[derive(Debug, Clone, Default)]
pub struct DetectionRequest {
    /// Templates to run; empty means all.
    pub types: Vec<PatternType>,
    /// Restrict to the induced subgraph of these entities. Empty means
    /// scan recent activity.
    pub entity_ids: Vec<Uuid>,
    pub min_confidence: Option<f64>,
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReport {
    pub matches: Vec<PatternMatch>,
    pub processing_time_ms: u64,
}

/// Templated pattern matching service.
pub struct PatternDetector {
    store: Arc<dyn GraphStore>,
    bus: Arc<dyn EventBus>,
    topic: String,
    config: DetectorConfig,
    dedupe: Mutex<DedupeWindow>,
    metrics: Arc<CoreMetrics>,
}

impl PatternDetector {
    pub fn new(
        store: Arc<dyn GraphStore>,
        bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
        config: DetectorConfig,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        let dedupe = DedupeWindow::new(
            Duration::seconds(config.dedupe_window_secs),
            config.dedupe_history,
        );
        Self {
            store,
            bus,
            topic: topic.into(),
            config,
            dedupe: Mutex::new(dedupe),
            metrics,
        }
    }

    /// Run the requested templates and emit one `pattern_detected` event
    /// per novel match.
    pub async fn detect(
        &self,
        request: &DetectionRequest,
        cancel: &CancellationToken,
    ) -> Result<DetectionReport> {
        let started = Instant::now();
        let subgraph = self.load_scope(request, cancel).await?;

        let types: &[PatternType] = if request.types.is_empty() {
            &PatternType::ALL
        } else {
            &request.types
        };
        let min_confidence = request
            .min_confidence
            .unwrap_or(self.config.min_confidence_default);

        let mut candidates: Vec<PatternMatch> = Vec::new();
        for pattern_type in types {
            if cancel.is_cancelled() {
                return Err(GraphError::Cancelled {
                    operation: "patterns.detect".to_string(),
                });
            }
            let found = match pattern_type {
                PatternType::Smurfing => {
                    templates::detect_smurfing(&subgraph, &self.config.smurfing)
                }
                PatternType::Layering => {
                    templates::detect_layering(&subgraph, &self.config.layering)
                }
                PatternType::Star => templates::detect_star(&subgraph, &self.config.star),
                PatternType::Triangle => templates::detect_triangle(&subgraph),
                PatternType::Chain => {
                    templates::detect_chain(&subgraph, &self.config.chain, &request.entity_ids)
                }
            };
            debug!(pattern = %pattern_type, candidates = found.len(), "template scanned");
            candidates.extend(found);
        }

        candidates.retain(|m| m.confidence >= min_confidence);

        // Deterministic suppression of repeats within the dedupe window.
        let mut novel = Vec::new();
        {
            let mut window = self.dedupe.lock().await;
            for candidate in candidates {
                if window.observe(candidate.dedupe_key(), candidate.detected_at) {
                    novel.push(candidate);
                }
            }
        }

        for matched in &novel {
            self.emit(matched).await;
        }
        if !novel.is_empty() {
            info!(matches = novel.len(), "pattern detection completed");
        }

        Ok(DetectionReport {
            matches: novel,
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn load_scope(
        &self,
        request: &DetectionRequest,
        cancel: &CancellationToken,
    ) -> Result<crate::model::Subgraph> {
        if request.entity_ids.is_empty() {
            // Recent-activity scan through a scratch projection, released
            // in every exit path.
            let name = scratch_projection_name("detector-scan");
            let since = Utc::now() - Duration::seconds(self.config.scan_window_secs);
            let rel_filter = RelationshipFilter {
                since: Some(since),
                ..Default::default()
            };
            self.store
                .project(&name, &NodeFilter::default(), &rel_filter)
                .await?;
            let result = if cancel.is_cancelled() {
                Err(GraphError::Cancelled {
                    operation: "patterns.detect".to_string(),
                })
            } else {
                self.store.projection(&name).await
            };
            self.store.drop_projection(&name).await?;
            result
        } else {
            let depth = request.max_depth.unwrap_or(self.config.max_depth_default);
            self.store.subgraph(&request.entity_ids, depth).await
        }
    }

    async fn emit(&self, matched: &PatternMatch) {
        let envelope = EventEnvelope::new(AegisEvent::PatternDetected(PatternDetected {
            pattern_id: matched.id,
            pattern_type: matched.pattern_type.as_str().to_string(),
            entity_ids: matched.entity_ids.clone(),
            relationship_ids: matched.relationship_ids.clone(),
            confidence: matched.confidence,
            severity: matched.severity,
            evidence: matched.evidence.clone(),
            detected_at: matched.detected_at,
        }));
        match self
            .bus
            .publish(&self.topic, &matched.id.to_string(), &envelope)
            .await
        {
            Ok(_) => self.metrics.patterns_detected_total.inc(),
            Err(e) => {
                self.metrics.bus_publish_failures_total.inc();
                warn!(error = %e, pattern = %matched.pattern_type, "pattern event publish failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, GraphEntity, Relationship, RelationshipType};
    use crate::store::MemoryGraphStore;
    use aegis_core::bus::MemoryEventBus;
    use rust_decimal::Decimal;

    async fn structuring_fixture() -> (Arc<MemoryGraphStore>, Vec<Uuid>, Uuid) {
        let store = Arc::new(MemoryGraphStore::new());
        let sink = Uuid::from_u128(1000);
        store
            .upsert_entity(GraphEntity::new(sink, EntityType::Account))
            .await
            .unwrap();

        let base = Utc::now() - Duration::minutes(29);
        let mut sources = Vec::new();
        for n in 1..=12u128 {
            let source = Uuid::from_u128(n);
            sources.push(source);
            store
                .upsert_entity(GraphEntity::new(source, EntityType::Account))
                .await
                .unwrap();
            let occurred = base + Duration::minutes((n as i64) * 2);
            store
                .upsert_relationship(
                    Relationship::new(RelationshipType::TransferredTo, source, sink)
                        .with_property("amount", serde_json::json!(Decimal::new(9_500, 0).to_string()))
                        .with_property("timestamp", serde_json::json!(occurred.to_rfc3339())),
                )
                .await
                .unwrap();
        }
        (store, sources, sink)
    }

    fn detector(store: Arc<MemoryGraphStore>, bus: Arc<MemoryEventBus>) -> PatternDetector {
        PatternDetector::new(
            store,
            bus,
            "aegis.pattern.detected",
            DetectorConfig::default(),
            CoreMetrics::new_unregistered(),
        )
    }

    #[tokio::test]
    async fn smurfing_scan_finds_structuring_ring() {
        let (store, sources, sink) = structuring_fixture().await;
        let bus = Arc::new(MemoryEventBus::new());
        let detector = detector(store, bus.clone());

        let report = detector
            .detect(
                &DetectionRequest {
                    types: vec![PatternType::Smurfing],
                    min_confidence: Some(0.8),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.matches.len(), 1);
        let matched = &report.matches[0];
        assert!(matched.confidence >= 0.8);
        assert!(matched.entity_ids.contains(&sink));
        for source in &sources {
            assert!(matched.entity_ids.contains(source));
        }
        assert_eq!(bus.topic_len("aegis.pattern.detected").await, 1);
    }

    #[tokio::test]
    async fn repeat_detection_is_deduplicated() {
        let (store, _, _) = structuring_fixture().await;
        let bus = Arc::new(MemoryEventBus::new());
        let detector = detector(store, bus.clone());
        let request = DetectionRequest {
            types: vec![PatternType::Smurfing],
            ..Default::default()
        };

        let first = detector.detect(&request, &CancellationToken::new()).await.unwrap();
        let second = detector.detect(&request, &CancellationToken::new()).await.unwrap();

        assert_eq!(first.matches.len(), 1);
        assert!(second.matches.is_empty());
        assert_eq!(bus.topic_len("aegis.pattern.detected").await, 1);
    }

    #[tokio::test]
    async fn low_confidence_matches_are_discarded() {
        let (store, _, _) = structuring_fixture().await;
        let bus = Arc::new(MemoryEventBus::new());
        let detector = detector(store, bus);

        let report = detector
            .detect(
                &DetectionRequest {
                    types: vec![PatternType::Smurfing],
                    min_confidence: Some(1.0),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(report.matches.is_empty());
    }

    #[tokio::test]
    async fn triangle_detection_on_cycle() {
        let store = Arc::new(MemoryGraphStore::new());
        for n in 1..=3u128 {
            store
                .upsert_entity(GraphEntity::new(Uuid::from_u128(n), EntityType::Account))
                .await
                .unwrap();
        }
        for (from, to) in [(1u128, 2u128), (2, 3), (3, 1)] {
            store
                .upsert_relationship(
                    Relationship::new(
                        RelationshipType::TransferredTo,
                        Uuid::from_u128(from),
                        Uuid::from_u128(to),
                    )
                    .with_property("amount", serde_json::json!("5000")),
                )
                .await
                .unwrap();
        }
        let bus = Arc::new(MemoryEventBus::new());
        let detector = detector(store, bus);

        let report = detector
            .detect(
                &DetectionRequest {
                    types: vec![PatternType::Triangle],
                    entity_ids: vec![Uuid::from_u128(1)],
                    max_depth: Some(3),
                    min_confidence: Some(0.5),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].entity_ids.len(), 3);
    }

    #[tokio::test]
    async fn cancellation_returns_promptly_and_releases_projection() {
        let (store, _, _) = structuring_fixture().await;
        let bus = Arc::new(MemoryEventBus::new());
        let detector = detector(store.clone(), bus);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = detector
            .detect(&DetectionRequest::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Cancelled { .. }));
    }
}
