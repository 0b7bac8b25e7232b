//! # Entity Resolver
//!
//! Matches raw records to canonical graph entities and infers candidate
//! relationships. Three strategies: `exact` (normalized-key lookup),
//! `fuzzy` (Jaro-Winkler similarity over known names), `hybrid` (exact
//! first, fuzzy accepted only when no exact match exists). The resolver
//! never silently merges below threshold; equally-strong candidates are
//! returned to the caller as an `Ambiguous` failure.
//!
//! The resolver owns an in-memory key index: single writer behind the
//! exclusive lock, many readers behind the shared lock.

use crate::error::{IngestError, Result};
use aegis_core::config::ResolverConfig;
use aegis_graph::{
    EntityType, GraphEntity, GraphStore, Relationship, RelationshipType,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    Exact,
    Fuzzy,
    Hybrid,
}

/// A raw record to resolve.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CandidateRecord {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub entity_type: EntityType,
    #[validate(length(max = 255))]
    pub external_id: Option<String>,
    pub attributes: HashMap<String, String>,
}

impl CandidateRecord {
    pub fn account(account_id: impl Into<String>) -> Self {
        Self {
            name: account_id.into(),
            entity_type: EntityType::Account,
            external_id: None,
            attributes: HashMap::new(),
        }
    }
}

/// Why a record matched (or did not).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum MatchReason {
    ExactKey,
    Similarity { score: f64 },
    BelowThreshold { best_score: f64 },
    NoCandidates,
}

/// Per-input resolution outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub matched_id: Option<Uuid>,
    pub confidence: f64,
    pub reason: MatchReason,
}

/// Resolution request; threshold, cap, and strategy are per request.
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub records: Vec<CandidateRecord>,
    pub strategy: MatchStrategy,
    pub similarity_threshold: Option<f64>,
    pub candidate_cap: Option<usize>,
}

/// A relationship proposed by graph inference, not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedRelationship {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relationship_type: RelationshipType,
    pub confidence: f64,
    /// Entity path that justified the proposal.
    pub via: Vec<Uuid>,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    entity_id: Uuid,
    entity_type: EntityType,
    name: String,
}

pub struct EntityResolver {
    graph: Arc<dyn GraphStore>,
    config: ResolverConfig,
    /// normalized key -> entries sharing it; names are scanned for fuzzy
    /// matching. A key bucket with more than one entry is an ambiguity.
    index: RwLock<HashMap<String, Vec<IndexEntry>>>,
}

impl EntityResolver {
    pub fn new(graph: Arc<dyn GraphStore>, config: ResolverConfig) -> Self {
        Self {
            graph,
            config,
            index: RwLock::new(HashMap::new()),
        }
    }

    fn normalized_key(entity_type: &EntityType, name: &str) -> String {
        format!(
            "{}|{}",
            entity_type.as_str(),
            name.trim().to_ascii_lowercase()
        )
    }

    /// Resolve each input record to `{matched_id | none, confidence,
    /// reason}`. Fails with `Ambiguous` when a record has multiple
    /// equally-strong fuzzy candidates at the top score.
    pub async fn resolve(&self, request: &ResolutionRequest) -> Result<Vec<MatchOutcome>> {
        let threshold = request
            .similarity_threshold
            .unwrap_or(self.config.similarity_threshold);
        let cap = request.candidate_cap.unwrap_or(self.config.candidate_cap);

        let index = self.index.read().await;
        let mut outcomes = Vec::with_capacity(request.records.len());
        for record in &request.records {
            record.validate().map_err(|e| {
                IngestError::Core(aegis_core::Error::invalid(format!(
                    "invalid candidate record: {}",
                    e
                )))
            })?;
            let outcome = match request.strategy {
                MatchStrategy::Exact => Self::exact_match(&index, record)?,
                MatchStrategy::Fuzzy => Self::fuzzy_match(&index, record, threshold, cap)?,
                MatchStrategy::Hybrid => {
                    let exact = Self::exact_match(&index, record)?;
                    if exact.matched_id.is_some() {
                        exact
                    } else {
                        Self::fuzzy_match(&index, record, threshold, cap)?
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn exact_match(
        index: &HashMap<String, Vec<IndexEntry>>,
        record: &CandidateRecord,
    ) -> Result<MatchOutcome> {
        let key = Self::normalized_key(&record.entity_type, &record.name);
        match index.get(&key).map(Vec::as_slice) {
            Some([entry]) => Ok(MatchOutcome {
                matched_id: Some(entry.entity_id),
                confidence: 1.0,
                reason: MatchReason::ExactKey,
            }),
            Some(bucket) if bucket.len() > 1 => Err(IngestError::Ambiguous {
                name: record.name.clone(),
                candidates: bucket.len(),
            }),
            _ => Ok(MatchOutcome {
                matched_id: None,
                confidence: 0.0,
                reason: MatchReason::NoCandidates,
            }),
        }
    }

    fn fuzzy_match(
        index: &HashMap<String, Vec<IndexEntry>>,
        record: &CandidateRecord,
        threshold: f64,
        cap: usize,
    ) -> Result<MatchOutcome> {
        let needle = record.name.trim().to_ascii_lowercase();
        let mut scored: Vec<(f64, &IndexEntry)> = index
            .values()
            .flatten()
            .filter(|entry| entry.entity_type == record.entity_type)
            .map(|entry| {
                (
                    strsim::jaro_winkler(&needle, &entry.name.to_ascii_lowercase()),
                    entry,
                )
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.entity_id.to_string().cmp(&b.1.entity_id.to_string()))
        });
        scored.truncate(cap);

        let Some(&(best_score, best)) = scored.first() else {
            return Ok(MatchOutcome {
                matched_id: None,
                confidence: 0.0,
                reason: MatchReason::NoCandidates,
            });
        };

        if best_score < threshold {
            return Ok(MatchOutcome {
                matched_id: None,
                confidence: best_score,
                reason: MatchReason::BelowThreshold {
                    best_score,
                },
            });
        }

        // Equally-strong top candidates are an ambiguity, never a silent
        // merge.
        let tied = scored
            .iter()
            .filter(|(score, entry)| {
                (best_score - score).abs() < 1e-9 && entry.entity_id != best.entity_id
            })
            .count();
        if tied > 0 {
            return Err(IngestError::Ambiguous {
                name: record.name.clone(),
                candidates: tied + 1,
            });
        }

        Ok(MatchOutcome {
            matched_id: Some(best.entity_id),
            confidence: best_score,
            reason: MatchReason::Similarity { score: best_score },
        })
    }

    /// Match-or-mint for an account id. The returned entity is NOT
    /// persisted; the caller includes it in its atomic batch write. The
    /// minted id is stable across retries of the same account.
    pub async fn reconcile_account(&self, account_id: &str) -> Result<GraphEntity> {
        let key = Self::normalized_key(&EntityType::Account, account_id);
        {
            let index = self.index.read().await;
            if let Some(entry) = index.get(&key).and_then(|bucket| bucket.first()) {
                if entry.entity_type != EntityType::Account {
                    return Err(IngestError::EntityConflict {
                        key,
                        message: format!(
                            "key already resolves to a {} entity",
                            entry.entity_type
                        ),
                    });
                }
                // Prefer graph state when the entity already persisted.
                if let Ok(existing) = self.graph.get_entity(entry.entity_id).await {
                    return Ok(existing);
                }
                return Ok(GraphEntity::new(entry.entity_id, EntityType::Account)
                    .with_property("account_id", serde_json::json!(account_id)));
            }
        }

        let entity = GraphEntity::new(Uuid::new_v4(), EntityType::Account)
            .with_property("account_id", serde_json::json!(account_id));
        let mut index = self.index.write().await;
        // Double-checked under the write lock: another writer may have
        // minted the id first.
        let bucket = index.entry(key).or_default();
        match bucket.first() {
            None => {
                bucket.push(IndexEntry {
                    entity_id: entity.id,
                    entity_type: EntityType::Account,
                    name: account_id.to_string(),
                });
                debug!(account = account_id, entity = %entity.id, "minted account entity");
                Ok(entity)
            }
            Some(entry) => Ok(GraphEntity::new(entry.entity_id, EntityType::Account)
                .with_property("account_id", serde_json::json!(account_id))),
        }
    }

    /// Seed the key index with an already-canonical entity. Two distinct
    /// entities under the same key coexist and surface as `Ambiguous` to
    /// probes.
    pub async fn register(&self, entity: &GraphEntity, name: &str) {
        let key = Self::normalized_key(&entity.entity_type, name);
        let mut index = self.index.write().await;
        let bucket = index.entry(key).or_default();
        if !bucket.iter().any(|e| e.entity_id == entity.id) {
            bucket.push(IndexEntry {
                entity_id: entity.id,
                entity_type: entity.entity_type.clone(),
                name: name.to_string(),
            });
        }
    }

    pub async fn index_len(&self) -> usize {
        self.index.read().await.values().map(Vec::len).sum()
    }

    /// Walk the graph around `entity_id` and propose indirect
    /// relationships. Confidence decays with path length and is weighted
    /// by edge-type priors.
    pub async fn infer_relationships(
        &self,
        entity_id: Uuid,
        max_depth: Option<usize>,
    ) -> Result<Vec<ProposedRelationship>> {
        let depth = max_depth.unwrap_or(self.config.max_inference_depth);
        let neighborhood = self.graph.get_neighborhood(entity_id, depth, &[]).await?;

        let subgraph = aegis_graph::Subgraph {
            entities: neighborhood.entities,
            relationships: neighborhood.relationships,
        };
        let targets: Vec<Uuid> = subgraph
            .entities
            .iter()
            .map(|e| e.id)
            .filter(|id| *id != entity_id)
            .collect();

        let paths = aegis_graph::store::search::find_paths(
            &subgraph,
            &[entity_id],
            &targets,
            depth,
            self.config.candidate_cap * 4,
        );

        let mut proposals: HashMap<Uuid, ProposedRelationship> = HashMap::new();
        for path in paths {
            // Direct edges already exist; only indirect connections are
            // proposals.
            if path.len() < 2 {
                continue;
            }
            let target = *path.entities.last().expect("non-empty path");
            let prior: f64 = path
                .relationships
                .iter()
                .filter_map(|rel_id| subgraph.relationships.iter().find(|r| r.id == *rel_id))
                .map(|r| edge_type_prior(&r.relationship_type))
                .product();
            let decay = 0.7_f64.powi(path.len() as i32 - 1);
            let confidence = prior * decay;

            let candidate = ProposedRelationship {
                source_id: entity_id,
                target_id: target,
                relationship_type: RelationshipType::AssociatedWith,
                confidence,
                via: path.entities.clone(),
            };
            proposals
                .entry(target)
                .and_modify(|existing| {
                    if candidate.confidence > existing.confidence {
                        *existing = candidate.clone();
                    }
                })
                .or_insert(candidate);
        }

        let mut out: Vec<ProposedRelationship> = proposals.into_values().collect();
        out.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.target_id.to_string().cmp(&b.target_id.to_string()))
        });
        Ok(out)
    }

    /// Build the `TRANSFERRED_TO` edge for a persisted transfer.
    pub fn transfer_edge(
        from_entity: Uuid,
        to_entity: Uuid,
        transaction_id: Uuid,
        amount: &rust_decimal::Decimal,
        occurred_at: chrono::DateTime<chrono::Utc>,
    ) -> Relationship {
        Relationship::new(RelationshipType::TransferredTo, from_entity, to_entity)
            .with_property("transaction_id", serde_json::json!(transaction_id))
            .with_property("amount", serde_json::json!(amount.to_string()))
            .with_property("timestamp", serde_json::json!(occurred_at.to_rfc3339()))
    }
}

fn edge_type_prior(relationship_type: &RelationshipType) -> f64 {
    match relationship_type {
        RelationshipType::SameAs => 0.95,
        RelationshipType::Owns => 0.9,
        RelationshipType::Controls => 0.85,
        RelationshipType::TransferredTo => 0.6,
        RelationshipType::AssociatedWith => 0.5,
        RelationshipType::Other(_) => 0.4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_graph::MemoryGraphStore;

    fn resolver() -> EntityResolver {
        EntityResolver::new(Arc::new(MemoryGraphStore::new()), ResolverConfig::default())
    }

    async fn seed(resolver: &EntityResolver, name: &str, entity_type: EntityType) -> Uuid {
        let entity = GraphEntity::new(Uuid::new_v4(), entity_type);
        resolver.register(&entity, name).await;
        entity.id
    }

    #[tokio::test]
    async fn exact_match_hits_normalized_key() {
        let resolver = resolver();
        let id = seed(&resolver, "Acme Holdings Ltd", EntityType::Organization).await;

        let outcomes = resolver
            .resolve(&ResolutionRequest {
                records: vec![CandidateRecord {
                    name: "  ACME HOLDINGS LTD ".to_string(),
                    entity_type: EntityType::Organization,
                    external_id: None,
                    attributes: HashMap::new(),
                }],
                strategy: MatchStrategy::Exact,
                similarity_threshold: None,
                candidate_cap: None,
            })
            .await
            .unwrap();

        assert_eq!(outcomes[0].matched_id, Some(id));
        assert_eq!(outcomes[0].confidence, 1.0);
        assert_eq!(outcomes[0].reason, MatchReason::ExactKey);
    }

    #[tokio::test]
    async fn fuzzy_match_tolerates_typos() {
        let resolver = resolver();
        let id = seed(&resolver, "Meridian Trading GmbH", EntityType::Organization).await;
        seed(&resolver, "Completely Different Co", EntityType::Organization).await;

        let outcomes = resolver
            .resolve(&ResolutionRequest {
                records: vec![CandidateRecord {
                    name: "Meridian Tradng GmbH".to_string(),
                    entity_type: EntityType::Organization,
                    external_id: None,
                    attributes: HashMap::new(),
                }],
                strategy: MatchStrategy::Fuzzy,
                similarity_threshold: Some(0.9),
                candidate_cap: None,
            })
            .await
            .unwrap();

        assert_eq!(outcomes[0].matched_id, Some(id));
        assert!(outcomes[0].confidence > 0.9);
    }

    #[tokio::test]
    async fn below_threshold_is_returned_not_merged() {
        let resolver = resolver();
        seed(&resolver, "Meridian Trading GmbH", EntityType::Organization).await;

        let outcomes = resolver
            .resolve(&ResolutionRequest {
                records: vec![CandidateRecord {
                    name: "Atlantic Shipping".to_string(),
                    entity_type: EntityType::Organization,
                    external_id: None,
                    attributes: HashMap::new(),
                }],
                strategy: MatchStrategy::Fuzzy,
                similarity_threshold: Some(0.9),
                candidate_cap: None,
            })
            .await
            .unwrap();

        assert_eq!(outcomes[0].matched_id, None);
        assert!(matches!(
            outcomes[0].reason,
            MatchReason::BelowThreshold { .. }
        ));
    }

    #[tokio::test]
    async fn equal_candidates_are_ambiguous() {
        let resolver = resolver();
        // Two distinct entities with the same name: any fuzzy probe of
        // that name ties at the top.
        let a = GraphEntity::new(Uuid::new_v4(), EntityType::Person);
        let b = GraphEntity::new(Uuid::new_v4(), EntityType::Person);
        resolver.register(&a, "Jan Novak").await;
        resolver.register(&b, "Jan Novak").await;

        let err = resolver
            .resolve(&ResolutionRequest {
                records: vec![CandidateRecord {
                    name: "Jan Novak".to_string(),
                    entity_type: EntityType::Person,
                    external_id: None,
                    attributes: HashMap::new(),
                }],
                strategy: MatchStrategy::Fuzzy,
                similarity_threshold: Some(0.8),
                candidate_cap: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Ambiguous { .. }));
    }

    #[tokio::test]
    async fn hybrid_prefers_exact() {
        let resolver = resolver();
        let exact_id = seed(&resolver, "Acme Ltd", EntityType::Organization).await;
        seed(&resolver, "Acme Ltd.", EntityType::Organization).await;

        let outcomes = resolver
            .resolve(&ResolutionRequest {
                records: vec![CandidateRecord {
                    name: "Acme Ltd".to_string(),
                    entity_type: EntityType::Organization,
                    external_id: None,
                    attributes: HashMap::new(),
                }],
                strategy: MatchStrategy::Hybrid,
                similarity_threshold: Some(0.8),
                candidate_cap: None,
            })
            .await
            .unwrap();

        assert_eq!(outcomes[0].matched_id, Some(exact_id));
        assert_eq!(outcomes[0].reason, MatchReason::ExactKey);
    }

    #[tokio::test]
    async fn reconcile_account_is_stable() {
        let resolver = resolver();
        let first = resolver.reconcile_account("ACCT0001AA").await.unwrap();
        let second = resolver.reconcile_account("ACCT0001AA").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(resolver.index_len().await, 1);
    }

    #[tokio::test]
    async fn inference_proposes_indirect_links() {
        let graph = Arc::new(MemoryGraphStore::new());
        let resolver = EntityResolver::new(graph.clone(), ResolverConfig::default());

        let a = GraphEntity::new(Uuid::from_u128(1), EntityType::Account);
        let b = GraphEntity::new(Uuid::from_u128(2), EntityType::Account);
        let c = GraphEntity::new(Uuid::from_u128(3), EntityType::Account);
        for entity in [&a, &b, &c] {
            graph.upsert_entity(entity.clone()).await.unwrap();
        }
        graph
            .upsert_relationship(Relationship::new(RelationshipType::Owns, a.id, b.id))
            .await
            .unwrap();
        graph
            .upsert_relationship(Relationship::new(RelationshipType::Owns, b.id, c.id))
            .await
            .unwrap();

        let proposals = resolver.infer_relationships(a.id, Some(3)).await.unwrap();
        let to_c = proposals
            .iter()
            .find(|p| p.target_id == c.id)
            .expect("indirect proposal to c");
        assert_eq!(to_c.relationship_type, RelationshipType::AssociatedWith);
        // Two OWNS hops: 0.9 * 0.9 * 0.7 decay.
        assert!((to_c.confidence - 0.567).abs() < 1e-6);
        // Direct neighbor b is not proposed.
        assert!(!proposals.iter().any(|p| p.target_id == b.id));
    }
}
