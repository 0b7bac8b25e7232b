//! PostgreSQL graph store adapter.
//!
//! Entities and relationships live in two tables with JSONB property
//! bags. Bulk mutation batches run inside one transaction; traversal
//! operations hydrate the bounded slice of interest and reuse the shared
//! deterministic search, so ordering matches the in-memory adapter.

use super::search::find_paths;
use super::{
    GraphCommand, GraphStore, NodeFilter, ProjectionInfo, RelationshipFilter,
};
use crate::error::{GraphError, Result};
use crate::model::{
    EntityType, GraphEntity, GraphPath, Neighborhood, Relationship, RelationshipType, Subgraph,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// PostgreSQL-backed [`GraphStore`]. The adapter owns its pool; callers
/// never share connections.
pub struct PostgresGraphStore {
    pool: Arc<PgPool>,
    projections: RwLock<HashMap<String, (Vec<Uuid>, Vec<Uuid>, ProjectionInfo)>>,
}

impl PostgresGraphStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            projections: RwLock::new(HashMap::new()),
        }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS graph_entities (
                id UUID PRIMARY KEY,
                entity_type VARCHAR(64) NOT NULL,
                properties JSONB NOT NULL DEFAULT '{}',
                risk_score DOUBLE PRECISION NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS graph_relationships (
                id UUID PRIMARY KEY,
                relationship_type VARCHAR(64) NOT NULL,
                source_id UUID NOT NULL REFERENCES graph_entities(id) ON DELETE CASCADE,
                target_id UUID NOT NULL REFERENCES graph_entities(id) ON DELETE CASCADE,
                properties JSONB NOT NULL DEFAULT '{}',
                confidence DOUBLE PRECISION NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_graph_rel_source ON graph_relationships (source_id);
            CREATE INDEX IF NOT EXISTS idx_graph_rel_target ON graph_relationships (target_id);
            CREATE INDEX IF NOT EXISTS idx_graph_rel_type ON graph_relationships (relationship_type);
            CREATE INDEX IF NOT EXISTS idx_graph_entity_type ON graph_entities (entity_type);
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;
        info!("graph tables initialized");
        Ok(())
    }

    fn row_to_entity(row: &sqlx::postgres::PgRow) -> Result<GraphEntity> {
        let entity_type: String = row.try_get("entity_type")?;
        let properties: serde_json::Value = row.try_get("properties")?;
        Ok(GraphEntity {
            id: row.try_get("id")?,
            entity_type: EntityType::parse(&entity_type),
            properties: serde_json::from_value(properties)?,
            risk_score: row.try_get("risk_score")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_relationship(row: &sqlx::postgres::PgRow) -> Result<Relationship> {
        let relationship_type: String = row.try_get("relationship_type")?;
        let properties: serde_json::Value = row.try_get("properties")?;
        Ok(Relationship {
            id: row.try_get("id")?,
            relationship_type: RelationshipType::parse(&relationship_type),
            source_id: row.try_get("source_id")?,
            target_id: row.try_get("target_id")?,
            properties: serde_json::from_value(properties)?,
            confidence: row.try_get("confidence")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn upsert_entity_tx(
        tx: &mut Transaction<'_, Postgres>,
        entity: &GraphEntity,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO graph_entities (id, entity_type, properties, risk_score, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                entity_type = EXCLUDED.entity_type,
                properties = EXCLUDED.properties,
                risk_score = EXCLUDED.risk_score,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(entity.id)
        .bind(entity.entity_type.as_str())
        .bind(serde_json::to_value(&entity.properties)?)
        .bind(entity.risk_score)
        .bind(entity.created_at)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_relationship_tx(
        tx: &mut Transaction<'_, Postgres>,
        rel: &Relationship,
    ) -> Result<()> {
        for endpoint in [rel.source_id, rel.target_id] {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM graph_entities WHERE id = $1)")
                    .bind(endpoint)
                    .fetch_one(&mut **tx)
                    .await?;
            if !exists {
                return Err(GraphError::EndpointMissing {
                    relationship: rel.id,
                    endpoint,
                });
            }
        }
        sqlx::query(
            r#"
            INSERT INTO graph_relationships
                (id, relationship_type, source_id, target_id, properties, confidence, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                relationship_type = EXCLUDED.relationship_type,
                source_id = EXCLUDED.source_id,
                target_id = EXCLUDED.target_id,
                properties = EXCLUDED.properties,
                confidence = EXCLUDED.confidence
            "#,
        )
        .bind(rel.id)
        .bind(rel.relationship_type.as_str())
        .bind(rel.source_id)
        .bind(rel.target_id)
        .bind(serde_json::to_value(&rel.properties)?)
        .bind(rel.confidence)
        .bind(rel.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Frontier-at-a-time traversal; each round fetches every edge
    /// touching the current frontier.
    async fn collect(
        &self,
        roots: &[Uuid],
        depth: usize,
        rel_types: &[RelationshipType],
    ) -> Result<Subgraph> {
        let mut seen: HashSet<Uuid> = roots.iter().copied().collect();
        let mut frontier: VecDeque<Uuid> = roots.iter().copied().collect();
        let mut relationships: HashMap<Uuid, Relationship> = HashMap::new();

        for _ in 0..depth {
            if frontier.is_empty() {
                break;
            }
            let batch: Vec<Uuid> = frontier.drain(..).collect();
            let type_names: Vec<String> =
                rel_types.iter().map(|t| t.as_str().to_string()).collect();
            let rows = sqlx::query(
                r#"
                SELECT * FROM graph_relationships
                WHERE (source_id = ANY($1) OR target_id = ANY($1))
                  AND (cardinality($2::text[]) = 0 OR relationship_type = ANY($2))
                "#,
            )
            .bind(&batch)
            .bind(&type_names)
            .fetch_all(self.pool.as_ref())
            .await?;

            for row in &rows {
                let rel = Self::row_to_relationship(row)?;
                for endpoint in [rel.source_id, rel.target_id] {
                    if seen.insert(endpoint) {
                        frontier.push_back(endpoint);
                    }
                }
                relationships.insert(rel.id, rel);
            }
        }

        let ids: Vec<Uuid> = seen.iter().copied().collect();
        let rows = sqlx::query("SELECT * FROM graph_entities WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(self.pool.as_ref())
            .await?;
        let mut entities: Vec<GraphEntity> = rows
            .iter()
            .map(Self::row_to_entity)
            .collect::<Result<_>>()?;
        entities.sort_by_key(|e| e.id.to_string());

        let present: HashSet<Uuid> = entities.iter().map(|e| e.id).collect();
        let mut relationships: Vec<Relationship> = relationships
            .into_values()
            .filter(|r| present.contains(&r.source_id) && present.contains(&r.target_id))
            .collect();
        relationships.sort_by_key(|r| r.id.to_string());

        Ok(Subgraph {
            entities,
            relationships,
        })
    }
}

#[async_trait]
impl GraphStore for PostgresGraphStore {
    async fn upsert_entity(&self, entity: GraphEntity) -> Result<GraphEntity> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_entity_tx(&mut tx, &entity).await?;
        tx.commit().await?;
        self.get_entity(entity.id).await
    }

    async fn upsert_relationship(&self, relationship: Relationship) -> Result<Relationship> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_relationship_tx(&mut tx, &relationship).await?;
        tx.commit().await?;
        Ok(relationship)
    }

    async fn get_entity(&self, id: Uuid) -> Result<GraphEntity> {
        let row = sqlx::query("SELECT * FROM graph_entities WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?
            .ok_or(GraphError::EntityNotFound { id })?;
        Self::row_to_entity(&row)
    }

    async fn get_relationship(&self, id: Uuid) -> Result<Relationship> {
        let row = sqlx::query("SELECT * FROM graph_relationships WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?
            .ok_or(GraphError::RelationshipNotFound { id })?;
        Self::row_to_relationship(&row)
    }

    async fn delete_entity(&self, id: Uuid) -> Result<()> {
        // ON DELETE CASCADE invalidates touching edges.
        let result = sqlx::query("DELETE FROM graph_entities WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(GraphError::EntityNotFound { id });
        }
        Ok(())
    }

    async fn get_neighborhood(
        &self,
        id: Uuid,
        depth: usize,
        rel_types: &[RelationshipType],
    ) -> Result<Neighborhood> {
        // Existence check keeps the NotFound contract of the memory store.
        self.get_entity(id).await?;
        let slice = self.collect(&[id], depth, rel_types).await?;
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
        let roots: Vec<Uuid> = sources.iter().chain(targets.iter()).copied().collect();
        let slice = self.collect(&roots, max_len, &[]).await?;
        Ok(find_paths(&slice, sources, targets, max_len, max_results))
    }

    async fn subgraph(&self, ids: &[Uuid], depth: usize) -> Result<Subgraph> {
        self.collect(ids, depth, &[]).await
    }

    async fn project(
        &self,
        name: &str,
        node_filter: &NodeFilter,
        rel_filter: &RelationshipFilter,
    ) -> Result<ProjectionInfo> {
        {
            let projections = self.projections.read().await;
            if projections.contains_key(name) {
                return Err(GraphError::ProjectionExists {
                    name: name.to_string(),
                });
            }
        }

        let entity_rows = sqlx::query("SELECT * FROM graph_entities")
            .fetch_all(self.pool.as_ref())
            .await?;
        let mut entity_ids: Vec<Uuid> = Vec::new();
        for row in &entity_rows {
            let entity = Self::row_to_entity(row)?;
            if node_filter.matches(&entity) {
                entity_ids.push(entity.id);
            }
        }
        let kept: HashSet<Uuid> = entity_ids.iter().copied().collect();

        let rel_rows = sqlx::query("SELECT * FROM graph_relationships")
            .fetch_all(self.pool.as_ref())
            .await?;
        let mut relationship_ids: Vec<Uuid> = Vec::new();
        for row in &rel_rows {
            let rel = Self::row_to_relationship(row)?;
            if rel_filter.matches(&rel) && kept.contains(&rel.source_id) && kept.contains(&rel.target_id)
            {
                relationship_ids.push(rel.id);
            }
        }

        let info = ProjectionInfo {
            name: name.to_string(),
            entity_count: entity_ids.len(),
            relationship_count: relationship_ids.len(),
            created_at: Utc::now(),
        };
        debug!(name, entities = info.entity_count, "projection created");
        self.projections
            .write()
            .await
            .insert(name.to_string(), (entity_ids, relationship_ids, info.clone()));
        Ok(info)
    }

    async fn projection(&self, name: &str) -> Result<Subgraph> {
        let (entity_ids, relationship_ids) = {
            let projections = self.projections.read().await;
            let (e, r, _) = projections
                .get(name)
                .ok_or_else(|| GraphError::ProjectionNotFound {
                    name: name.to_string(),
                })?;
            (e.clone(), r.clone())
        };

        let entity_rows = sqlx::query("SELECT * FROM graph_entities WHERE id = ANY($1)")
            .bind(&entity_ids)
            .fetch_all(self.pool.as_ref())
            .await?;
        let mut entities: Vec<GraphEntity> = entity_rows
            .iter()
            .map(Self::row_to_entity)
            .collect::<Result<_>>()?;
        entities.sort_by_key(|e| e.id.to_string());

        let rel_rows = sqlx::query("SELECT * FROM graph_relationships WHERE id = ANY($1)")
            .bind(&relationship_ids)
            .fetch_all(self.pool.as_ref())
            .await?;
        let mut relationships: Vec<Relationship> = rel_rows
            .iter()
            .map(Self::row_to_relationship)
            .collect::<Result<_>>()?;
        relationships.sort_by_key(|r| r.id.to_string());

        Ok(Subgraph {
            entities,
            relationships,
        })
    }

    async fn drop_projection(&self, name: &str) -> Result<()> {
        self.projections.write().await.remove(name);
        Ok(())
    }

    async fn execute(&self, commands: Vec<GraphCommand>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for command in &commands {
            match command {
                GraphCommand::UpsertEntity(entity) => {
                    Self::upsert_entity_tx(&mut tx, entity).await?
                }
                GraphCommand::UpsertRelationship(rel) => {
                    Self::upsert_relationship_tx(&mut tx, rel).await?
                }
                GraphCommand::DeleteEntity(id) => {
                    let result = sqlx::query("DELETE FROM graph_entities WHERE id = $1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    if result.rows_affected() == 0 {
                        return Err(GraphError::EntityNotFound { id: *id });
                    }
                }
                GraphCommand::DeleteRelationship(id) => {
                    let result = sqlx::query("DELETE FROM graph_relationships WHERE id = $1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    if result.rows_affected() == 0 {
                        return Err(GraphError::RelationshipNotFound { id: *id });
                    }
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
