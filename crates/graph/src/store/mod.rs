//! # Graph Store Adapter
//!
//! Typed property-graph persistence behind a capability trait, so the
//! analytics and detector layers can run against an in-memory fake with
//! exactly the same surface as the PostgreSQL adapter.
//!
//! Contracts: mutations are serializable at the granularity of the
//! affected subgraph; reads during a mutation observe pre- or post-state,
//! never a mix. `shortest_paths` is bounded by `max_len` and orders
//! results by length ascending, total weight ascending, then lexicographic
//! endpoint order, so repeated calls are byte-for-byte reproducible.

pub mod memory;
pub mod postgres;
pub mod search;

pub use memory::MemoryGraphStore;
pub use postgres::PostgresGraphStore;

use crate::error::Result;
use crate::model::{
    EntityType, GraphEntity, GraphPath, Neighborhood, Relationship, RelationshipType, Subgraph,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node predicate for projections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFilter {
    pub entity_types: Option<Vec<EntityType>>,
    pub min_risk_score: Option<f64>,
}

impl NodeFilter {
    pub fn matches(&self, entity: &GraphEntity) -> bool {
        if let Some(types) = &self.entity_types {
            if !types.contains(&entity.entity_type) {
                return false;
            }
        }
        if let Some(min) = self.min_risk_score {
            if entity.risk_score < min {
                return false;
            }
        }
        true
    }
}

/// Edge predicate for projections. `since` filters on the edge's event
/// time, which is how recent-activity scans are expressed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipFilter {
    pub relationship_types: Option<Vec<RelationshipType>>,
    pub min_confidence: Option<f64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl RelationshipFilter {
    pub fn matches(&self, relationship: &Relationship) -> bool {
        if let Some(types) = &self.relationship_types {
            if !types.contains(&relationship.relationship_type) {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if relationship.confidence < min {
                return false;
            }
        }
        if let Some(since) = self.since {
            if relationship.occurred_at() < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if relationship.occurred_at() >= until {
                return false;
            }
        }
        true
    }
}

/// Summary of a stored projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionInfo {
    pub name: String,
    pub entity_count: usize,
    pub relationship_count: usize,
    pub created_at: DateTime<Utc>,
}

/// One mutation inside a transactional [`GraphStore::execute`] batch.
#[derive(Debug, Clone)]
pub enum GraphCommand {
    UpsertEntity(GraphEntity),
    UpsertRelationship(Relationship),
    DeleteEntity(Uuid),
    DeleteRelationship(Uuid),
}

/// Capability set of the graph store.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert or update one entity, idempotent on `id`.
    async fn upsert_entity(&self, entity: GraphEntity) -> Result<GraphEntity>;

    /// Insert or update one relationship. Both endpoints must exist.
    async fn upsert_relationship(&self, relationship: Relationship) -> Result<Relationship>;

    async fn get_entity(&self, id: Uuid) -> Result<GraphEntity>;

    async fn get_relationship(&self, id: Uuid) -> Result<Relationship>;

    /// Delete an entity and invalidate its edges.
    async fn delete_entity(&self, id: Uuid) -> Result<()>;

    /// Entities and edges within `depth` hops of `id`, restricted to
    /// `rel_types` when non-empty. Traversal ignores edge direction.
    async fn get_neighborhood(
        &self,
        id: Uuid,
        depth: usize,
        rel_types: &[RelationshipType],
    ) -> Result<Neighborhood>;

    /// Paths from any source to any target, at most `max_len` edges and
    /// `max_results` paths, deterministically ordered (see module docs).
    async fn shortest_paths(
        &self,
        sources: &[Uuid],
        targets: &[Uuid],
        max_len: usize,
        max_results: usize,
    ) -> Result<Vec<GraphPath>>;

    /// Induced subgraph of `ids` expanded by `depth` hops.
    async fn subgraph(&self, ids: &[Uuid], depth: usize) -> Result<Subgraph>;

    /// Create a named, filtered view for analytics passes. Fails with
    /// `Conflict` when the name is taken.
    async fn project(
        &self,
        name: &str,
        node_filter: &NodeFilter,
        rel_filter: &RelationshipFilter,
    ) -> Result<ProjectionInfo>;

    /// Materialize a stored projection.
    async fn projection(&self, name: &str) -> Result<Subgraph>;

    /// Release a projection. Dropping an unknown name is not an error.
    async fn drop_projection(&self, name: &str) -> Result<()>;

    /// Apply a batch of mutations atomically: either every command takes
    /// effect or none does. Bulk ingestion writes go through here.
    async fn execute(&self, commands: Vec<GraphCommand>) -> Result<()>;
}

/// Generate a collision-free projection name for a transient pass.
pub fn scratch_projection_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}
