//! Administrative operations against the graph and audit stores.

use crate::commands::run::Completion;
use crate::AdminCommands;
use aegis_core::audit::PostgresAuditRepository;
use aegis_core::bus::RedisEventBus;
use aegis_core::config::AegisConfig;
use aegis_core::metrics::CoreMetrics;
use aegis_core::{CancellationToken, Error};
use aegis_graph::store::{scratch_projection_name, NodeFilter, RelationshipFilter};
use aegis_graph::{
    DetectionRequest, EntityType, GraphStore, PatternDetector, PostgresGraphStore,
};
use aegis_ingest::EntityResolver;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

pub async fn execute(command: AdminCommands, config: AegisConfig) -> Result<Completion, Error> {
    match command {
        AdminCommands::Migrate => migrate(config).await,
        AdminCommands::Backfill { from, to } => backfill(config, from, to).await,
        AdminCommands::Reindex => reindex(config).await,
    }
}

/// Create or update every schema the core owns.
async fn migrate(config: AegisConfig) -> Result<Completion, Error> {
    let pool = Arc::new(
        aegis_core::database::connect_pool(&config.database)
            .await
            .map_err(|e| Error::wrapping(e, "admin.migrate"))?,
    );

    let graph = PostgresGraphStore::new(pool.clone());
    graph
        .initialize()
        .await
        .map_err(|e| Error::wrapping(e.into(), "admin.migrate graph"))?;

    let audit = PostgresAuditRepository::new(pool);
    audit
        .initialize()
        .await
        .map_err(|e| Error::wrapping(e, "admin.migrate audit"))?;

    info!("schemas migrated");
    Ok(Completion::Finished)
}

/// Re-run pattern detection over `[from, to)`, emitting any detections
/// the live sweeps missed.
async fn backfill(
    config: AegisConfig,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Completion, Error> {
    if to <= from {
        return Err(Error::invalid("backfill window is empty: --to must be after --from"));
    }

    let pool = Arc::new(
        aegis_core::database::connect_pool(&config.database)
            .await
            .map_err(|e| Error::wrapping(e, "admin.backfill"))?,
    );
    let graph: Arc<dyn GraphStore> = Arc::new(PostgresGraphStore::new(pool));
    let bus = Arc::new(
        RedisEventBus::connect(config.redis.clone())
            .await
            .map_err(|e| Error::wrapping(e, "admin.backfill bus"))?,
    );
    let metrics = CoreMetrics::new_unregistered();
    let detector = PatternDetector::new(
        graph.clone(),
        bus,
        config.topics.pattern_detected.clone(),
        config.detector.clone(),
        metrics,
    );

    // Materialize the historical window and detect over its entity set.
    let name = scratch_projection_name("backfill");
    let rel_filter = RelationshipFilter {
        since: Some(from),
        until: Some(to),
        ..Default::default()
    };
    graph
        .project(&name, &NodeFilter::default(), &rel_filter)
        .await
        .map_err(|e| Error::wrapping(e.into(), "admin.backfill project"))?;
    let window = graph
        .projection(&name)
        .await
        .map_err(|e| Error::wrapping(e.into(), "admin.backfill materialize"))?;
    graph
        .drop_projection(&name)
        .await
        .map_err(|e| Error::wrapping(e.into(), "admin.backfill release"))?;

    let entity_ids: Vec<_> = window.entities.iter().map(|e| e.id).collect();
    info!(
        entities = entity_ids.len(),
        relationships = window.relationships.len(),
        "backfill window materialized"
    );
    if entity_ids.is_empty() {
        info!("nothing to backfill");
        return Ok(Completion::Finished);
    }

    let report = detector
        .detect(
            &DetectionRequest {
                entity_ids,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .map_err(|e| Error::wrapping(e.into(), "admin.backfill detect"))?;
    info!(
        matches = report.matches.len(),
        elapsed_ms = report.processing_time_ms,
        "backfill detection completed"
    );
    Ok(Completion::Finished)
}

/// Rebuild the resolver's key index from persisted account entities.
async fn reindex(config: AegisConfig) -> Result<Completion, Error> {
    let pool = Arc::new(
        aegis_core::database::connect_pool(&config.database)
            .await
            .map_err(|e| Error::wrapping(e, "admin.reindex"))?,
    );
    let graph: Arc<dyn GraphStore> = Arc::new(PostgresGraphStore::new(pool));
    let resolver = EntityResolver::new(graph.clone(), config.resolver.clone());

    let name = scratch_projection_name("reindex");
    graph
        .project(&name, &NodeFilter::default(), &RelationshipFilter::default())
        .await
        .map_err(|e| Error::wrapping(e.into(), "admin.reindex project"))?;
    let snapshot = graph
        .projection(&name)
        .await
        .map_err(|e| Error::wrapping(e.into(), "admin.reindex materialize"))?;
    graph
        .drop_projection(&name)
        .await
        .map_err(|e| Error::wrapping(e.into(), "admin.reindex release"))?;

    let mut indexed = 0u64;
    for entity in &snapshot.entities {
        let name = match entity.entity_type {
            EntityType::Account => entity.property_str("account_id"),
            _ => entity.property_str("name"),
        };
        if let Some(name) = name {
            resolver.register(entity, name).await;
            indexed += 1;
        }
    }
    info!(indexed, total = snapshot.entities.len(), "resolver index rebuilt");
    Ok(Completion::Finished)
}
