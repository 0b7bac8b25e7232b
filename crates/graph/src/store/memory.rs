//! In-memory graph store.
//!
//! Single writer behind an exclusive lock, many readers behind the shared
//! lock; every mutation takes the write lock for its whole extent, which
//! gives serializable semantics over the affected subgraph. Backs tests
//! and the detector's projection passes.

use super::search::find_paths;
use super::{
    GraphCommand, GraphStore, NodeFilter, ProjectionInfo, RelationshipFilter,
};
use crate::error::{GraphError, Result};
use crate::model::{
    GraphEntity, GraphPath, Neighborhood, Relationship, RelationshipType, Subgraph,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct GraphData {
    entities: HashMap<Uuid, GraphEntity>,
    relationships: HashMap<Uuid, Relationship>,
    /// entity id -> ids of touching relationships (either direction)
    adjacency: HashMap<Uuid, HashSet<Uuid>>,
}

impl GraphData {
    fn attach(&mut self, rel: &Relationship) {
        self.adjacency.entry(rel.source_id).or_default().insert(rel.id);
        self.adjacency.entry(rel.target_id).or_default().insert(rel.id);
    }

    fn detach(&mut self, rel: &Relationship) {
        if let Some(set) = self.adjacency.get_mut(&rel.source_id) {
            set.remove(&rel.id);
        }
        if let Some(set) = self.adjacency.get_mut(&rel.target_id) {
            set.remove(&rel.id);
        }
    }

    fn apply(&mut self, command: &GraphCommand) -> Result<()> {
        match command {
            GraphCommand::UpsertEntity(entity) => {
                let mut entity = entity.clone();
                if let Some(existing) = self.entities.get(&entity.id) {
                    entity.created_at = existing.created_at;
                }
                entity.updated_at = Utc::now();
                self.entities.insert(entity.id, entity);
            }
            GraphCommand::UpsertRelationship(rel) => {
                if !self.entities.contains_key(&rel.source_id) {
                    return Err(GraphError::EndpointMissing {
                        relationship: rel.id,
                        endpoint: rel.source_id,
                    });
                }
                if !self.entities.contains_key(&rel.target_id) {
                    return Err(GraphError::EndpointMissing {
                        relationship: rel.id,
                        endpoint: rel.target_id,
                    });
                }
                if let Some(previous) = self.relationships.insert(rel.id, rel.clone()) {
                    self.detach(&previous);
                }
                self.attach(rel);
            }
            GraphCommand::DeleteEntity(id) => {
                self.entities
                    .remove(id)
                    .ok_or(GraphError::EntityNotFound { id: *id })?;
                // Endpoint deletion invalidates its edges.
                let touching: Vec<Uuid> = self
                    .adjacency
                    .remove(id)
                    .map(|set| set.into_iter().collect())
                    .unwrap_or_default();
                for rel_id in touching {
                    if let Some(rel) = self.relationships.remove(&rel_id) {
                        self.detach(&rel);
                    }
                }
            }
            GraphCommand::DeleteRelationship(id) => {
                let rel = self
                    .relationships
                    .remove(id)
                    .ok_or(GraphError::RelationshipNotFound { id: *id })?;
                self.detach(&rel);
            }
        }
        Ok(())
    }

    /// Validate a command against current state plus the batch's pending
    /// effects, so `execute` can reject before mutating anything.
    fn precheck(&self, commands: &[GraphCommand]) -> Result<()> {
        let mut pending_entities: HashSet<Uuid> = HashSet::new();
        let mut pending_deletes: HashSet<Uuid> = HashSet::new();
        for command in commands {
            match command {
                GraphCommand::UpsertEntity(entity) => {
                    pending_entities.insert(entity.id);
                    pending_deletes.remove(&entity.id);
                }
                GraphCommand::UpsertRelationship(rel) => {
                    for endpoint in [rel.source_id, rel.target_id] {
                        let exists = (self.entities.contains_key(&endpoint)
                            && !pending_deletes.contains(&endpoint))
                            || pending_entities.contains(&endpoint);
                        if !exists {
                            return Err(GraphError::EndpointMissing {
                                relationship: rel.id,
                                endpoint,
                            });
                        }
                    }
                }
                GraphCommand::DeleteEntity(id) => {
                    let was_pending = pending_entities.remove(id);
                    let exists = was_pending
                        || (self.entities.contains_key(id) && !pending_deletes.contains(id));
                    if !exists {
                        return Err(GraphError::EntityNotFound { id: *id });
                    }
                    pending_deletes.insert(*id);
                }
                GraphCommand::DeleteRelationship(id) => {
                    if !self.relationships.contains_key(id) {
                        return Err(GraphError::RelationshipNotFound { id: *id });
                    }
                }
            }
        }
        Ok(())
    }

    fn collect(&self, roots: &[Uuid], depth: usize, rel_types: &[RelationshipType]) -> Subgraph {
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut edge_ids: HashSet<Uuid> = HashSet::new();
        let mut frontier: VecDeque<(Uuid, usize)> = VecDeque::new();
        for root in roots {
            if self.entities.contains_key(root) && seen.insert(*root) {
                frontier.push_back((*root, 0));
            }
        }

        while let Some((current, dist)) = frontier.pop_front() {
            if dist >= depth {
                continue;
            }
            let Some(touching) = self.adjacency.get(&current) else {
                continue;
            };
            let mut ordered: Vec<Uuid> = touching.iter().copied().collect();
            ordered.sort_by_key(|id| id.to_string());
            for rel_id in ordered {
                let Some(rel) = self.relationships.get(&rel_id) else {
                    continue;
                };
                if !rel_types.is_empty() && !rel_types.contains(&rel.relationship_type) {
                    continue;
                }
                edge_ids.insert(rel_id);
                if let Some(neighbor) = rel.other_endpoint(current) {
                    if seen.insert(neighbor) {
                        frontier.push_back((neighbor, dist + 1));
                    }
                }
            }
        }

        let mut entities: Vec<GraphEntity> = seen
            .iter()
            .filter_map(|id| self.entities.get(id).cloned())
            .collect();
        entities.sort_by_key(|e| e.id.to_string());
        let mut relationships: Vec<Relationship> = edge_ids
            .iter()
            .filter_map(|id| self.relationships.get(id).cloned())
            // Keep only edges whose both endpoints landed in the slice.
            .filter(|r| seen.contains(&r.source_id) && seen.contains(&r.target_id))
            .collect();
        relationships.sort_by_key(|r| r.id.to_string());

        Subgraph {
            entities,
            relationships,
        }
    }

    fn filtered(&self, node_filter: &NodeFilter, rel_filter: &RelationshipFilter) -> Subgraph {
        let mut entities: Vec<GraphEntity> = self
            .entities
            .values()
            .filter(|e| node_filter.matches(e))
            .cloned()
            .collect();
        entities.sort_by_key(|e| e.id.to_string());
        let kept: HashSet<Uuid> = entities.iter().map(|e| e.id).collect();

        let mut relationships: Vec<Relationship> = self
            .relationships
            .values()
            .filter(|r| {
                rel_filter.matches(r) && kept.contains(&r.source_id) && kept.contains(&r.target_id)
            })
            .cloned()
            .collect();
        relationships.sort_by_key(|r| r.id.to_string());

        Subgraph {
            entities,
            relationships,
        }
    }
}

/// In-memory [`GraphStore`] implementation.
#[derive(Clone, Default)]
pub struct MemoryGraphStore {
    data: Arc<RwLock<GraphData>>,
    projections: Arc<RwLock<HashMap<String, (Subgraph, ProjectionInfo)>>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entity_count(&self) -> usize {
        self.data.read().await.entities.len()
    }

    pub async fn relationship_count(&self) -> usize {
        self.data.read().await.relationships.len()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_entity(&self, entity: GraphEntity) -> Result<GraphEntity> {
        let mut data = self.data.write().await;
        data.apply(&GraphCommand::UpsertEntity(entity.clone()))?;
        Ok(data.entities[&entity.id].clone())
    }

    async fn upsert_relationship(&self, relationship: Relationship) -> Result<Relationship> {
        let mut data = self.data.write().await;
        data.apply(&GraphCommand::UpsertRelationship(relationship.clone()))?;
        Ok(relationship)
    }

    async fn get_entity(&self, id: Uuid) -> Result<GraphEntity> {
        self.data
            .read()
            .await
            .entities
            .get(&id)
            .cloned()
            .ok_or(GraphError::EntityNotFound { id })
    }

    async fn get_relationship(&self, id: Uuid) -> Result<Relationship> {
        self.data
            .read()
            .await
            .relationships
            .get(&id)
            .cloned()
            .ok_or(GraphError::RelationshipNotFound { id })
    }

    async fn delete_entity(&self, id: Uuid) -> Result<()> {
        let mut data = self.data.write().await;
        data.apply(&GraphCommand::DeleteEntity(id))
    }

    async fn get_neighborhood(
        &self,
        id: Uuid,
        depth: usize,
        rel_types: &[RelationshipType],
    ) -> Result<Neighborhood> {
        let data = self.data.read().await;
        if !data.entities.contains_key(&id) {
            return Err(GraphError::EntityNotFound { id });
        }
        let slice = data.collect(&[id], depth, rel_types);
        Ok(Neighborhood {
            root: Some(id),
            entities: slice.entities,
            relationships: slice.relationships,
        })
    }

    async fn shortest_paths(
        &self,
        sources: &[Uuid],
        targets: &[Uuid],
        max_len: usize,
        max_results: usize,
    ) -> Result<Vec<GraphPath>> {
        let data = self.data.read().await;
        // Bound the search space to the reachable slice first.
        let roots: Vec<Uuid> = sources.iter().chain(targets.iter()).copied().collect();
        let slice = data.collect(&roots, max_len, &[]);
        drop(data);
        Ok(find_paths(&slice, sources, targets, max_len, max_results))
    }

    async fn subgraph(&self, ids: &[Uuid], depth: usize) -> Result<Subgraph> {
        let data = self.data.read().await;
        Ok(data.collect(ids, depth, &[]))
    }

    async fn project(
        &self,
        name: &str,
        node_filter: &NodeFilter,
        rel_filter: &RelationshipFilter,
    ) -> Result<ProjectionInfo> {
        let snapshot = self.data.read().await.filtered(node_filter, rel_filter);
        let info = ProjectionInfo {
            name: name.to_string(),
            entity_count: snapshot.entities.len(),
            relationship_count: snapshot.relationships.len(),
            created_at: Utc::now(),
        };
        let mut projections = self.projections.write().await;
        if projections.contains_key(name) {
            return Err(GraphError::ProjectionExists {
                name: name.to_string(),
            });
        }
        debug!(name, entities = info.entity_count, "projection created");
        projections.insert(name.to_string(), (snapshot, info.clone()));
        Ok(info)
    }

    async fn projection(&self, name: &str) -> Result<Subgraph> {
        self.projections
            .read()
            .await
            .get(name)
            .map(|(subgraph, _)| subgraph.clone())
            .ok_or_else(|| GraphError::ProjectionNotFound {
                name: name.to_string(),
            })
    }

    async fn drop_projection(&self, name: &str) -> Result<()> {
        self.projections.write().await.remove(name);
        Ok(())
    }

    async fn execute(&self, commands: Vec<GraphCommand>) -> Result<()> {
        let mut data = self.data.write().await;
        // All-or-nothing: validate the whole batch before applying any of
        // it, then apply under the same write guard.
        data.precheck(&commands)?;
        for command in &commands {
            data.apply(command)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;

    fn account(n: u128) -> GraphEntity {
        GraphEntity::new(Uuid::from_u128(n), EntityType::Account)
    }

    fn transfer(from: u128, to: u128) -> Relationship {
        Relationship::new(
            RelationshipType::TransferredTo,
            Uuid::from_u128(from),
            Uuid::from_u128(to),
        )
    }

    #[tokio::test]
    async fn relationship_requires_endpoints() {
        let store = MemoryGraphStore::new();
        store.upsert_entity(account(1)).await.unwrap();

        let err = store.upsert_relationship(transfer(1, 2)).await.unwrap_err();
        assert!(matches!(err, GraphError::EndpointMissing { .. }));

        store.upsert_entity(account(2)).await.unwrap();
        store.upsert_relationship(transfer(1, 2)).await.unwrap();
        assert_eq!(store.relationship_count().await, 1);
    }

    #[tokio::test]
    async fn deleting_entity_invalidates_edges() {
        let store = MemoryGraphStore::new();
        store.upsert_entity(account(1)).await.unwrap();
        store.upsert_entity(account(2)).await.unwrap();
        store.upsert_relationship(transfer(1, 2)).await.unwrap();

        store.delete_entity(Uuid::from_u128(2)).await.unwrap();
        assert_eq!(store.relationship_count().await, 0);
        assert_eq!(store.entity_count().await, 1);
    }

    #[tokio::test]
    async fn execute_is_all_or_nothing() {
        let store = MemoryGraphStore::new();
        let bad_batch = vec![
            GraphCommand::UpsertEntity(account(1)),
            // Endpoint 9 never appears anywhere.
            GraphCommand::UpsertRelationship(transfer(1, 9)),
        ];
        assert!(store.execute(bad_batch).await.is_err());
        assert_eq!(store.entity_count().await, 0);

        let good_batch = vec![
            GraphCommand::UpsertEntity(account(1)),
            GraphCommand::UpsertEntity(account(2)),
            GraphCommand::UpsertRelationship(transfer(1, 2)),
        ];
        store.execute(good_batch).await.unwrap();
        assert_eq!(store.entity_count().await, 2);
        assert_eq!(store.relationship_count().await, 1);
    }

    #[tokio::test]
    async fn neighborhood_respects_depth_and_types() {
        let store = MemoryGraphStore::new();
        for n in 1..=4 {
            store.upsert_entity(account(n)).await.unwrap();
        }
        store.upsert_relationship(transfer(1, 2)).await.unwrap();
        store.upsert_relationship(transfer(2, 3)).await.unwrap();
        store
            .upsert_relationship(Relationship::new(
                RelationshipType::Owns,
                Uuid::from_u128(3),
                Uuid::from_u128(4),
            ))
            .await
            .unwrap();

        let one_hop = store
            .get_neighborhood(Uuid::from_u128(1), 1, &[])
            .await
            .unwrap();
        assert_eq!(one_hop.entities.len(), 2);

        let transfers_only = store
            .get_neighborhood(Uuid::from_u128(1), 3, &[RelationshipType::TransferredTo])
            .await
            .unwrap();
        assert_eq!(transfers_only.entities.len(), 3);
        assert!(transfers_only
            .relationships
            .iter()
            .all(|r| r.relationship_type == RelationshipType::TransferredTo));
    }

    #[tokio::test]
    async fn projection_lifecycle() {
        let store = MemoryGraphStore::new();
        store.upsert_entity(account(1).with_risk_score(0.9)).await.unwrap();
        store.upsert_entity(account(2).with_risk_score(0.1)).await.unwrap();

        let filter = NodeFilter {
            min_risk_score: Some(0.5),
            ..Default::default()
        };
        let info = store
            .project("risky", &filter, &RelationshipFilter::default())
            .await
            .unwrap();
        assert_eq!(info.entity_count, 1);

        let err = store
            .project("risky", &filter, &RelationshipFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::ProjectionExists { .. }));

        store.drop_projection("risky").await.unwrap();
        assert!(store.projection("risky").await.is_err());
    }

    #[tokio::test]
    async fn upsert_entity_is_idempotent_on_id() {
        let store = MemoryGraphStore::new();
        let first = store.upsert_entity(account(1)).await.unwrap();
        let again = store
            .upsert_entity(account(1).with_risk_score(0.7))
            .await
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.created_at, first.created_at);
        assert_eq!(store.entity_count().await, 1);
        assert_eq!(store.get_entity(first.id).await.unwrap().risk_score, 0.7);
    }
}
