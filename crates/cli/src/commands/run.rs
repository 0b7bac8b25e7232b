//! Worker process startup: wire the adapters, spawn the component's
//! tasks, and wait for a shutdown signal.

use crate::RunCommands;
use aegis_case::{
    AlertManager, CaseRepository, InvestigationManager, WorkflowEngine,
};
use aegis_core::audit::{AuditLog, PostgresAuditRepository};
use aegis_core::bus::{BusStream, EventBus, RedisEventBus};
use aegis_core::config::AegisConfig;
use aegis_core::events::{AegisEvent, AnalysisCompleted, EventEnvelope};
use aegis_core::fanout::RealtimeHub;
use aegis_core::metrics::{CoreMetrics, MetricsRegistry};
use aegis_core::{CancellationToken, Error, ErrorKind};
use aegis_graph::analytics::{AnalysisScope, AnalyticsEngine, CommunityAlgorithm, CommunityParams, InfluenceParams};
use aegis_graph::{DetectionRequest, GraphStore, PatternDetector, PostgresGraphStore};
use aegis_ingest::{
    EntityResolver, IngestionJobStore, IngestionPipeline, Transaction, TransactionBatcher,
    ValidationPipeline,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How a worker run ended.
pub enum Completion {
    Finished,
    Interrupted,
}

pub async fn execute(command: RunCommands, config: AegisConfig) -> Result<Completion, Error> {
    let cancel = CancellationToken::new();
    // The registry is owned here and threaded through the constructors;
    // nothing registers into a process-wide singleton.
    let metrics_registry = MetricsRegistry::new();
    let services = Services::connect(&config, cancel.clone(), &metrics_registry).await?;
    spawn_signal_handler(cancel.clone());

    let outcome = match command {
        RunCommands::IngestService => ingest_service(services, config, cancel).await,
        RunCommands::GraphService => graph_service(services, config, cancel).await,
        RunCommands::PatternService { scan_interval } => {
            pattern_service(services, config, scan_interval, cancel).await
        }
        RunCommands::AlertService => alert_service(services, config, cancel).await,
    };

    debug!("final metrics snapshot:\n{}", metrics_registry.metrics_text());
    outcome
}

/// Shared adapter wiring for every worker.
struct Services {
    graph: Arc<dyn GraphStore>,
    bus: Arc<dyn EventBus>,
    audit: AuditLog,
    metrics: Arc<CoreMetrics>,
}

impl Services {
    async fn connect(
        config: &AegisConfig,
        cancel: CancellationToken,
        metrics_registry: &MetricsRegistry,
    ) -> Result<Self, Error> {
        let metrics = CoreMetrics::new(metrics_registry);

        let pool = Arc::new(
            aegis_core::database::connect_pool(&config.database)
                .await
                .map_err(|e| Error::wrapping(e, "startup.database"))?,
        );
        let graph = PostgresGraphStore::new(pool.clone());
        graph
            .initialize()
            .await
            .map_err(|e| Error::wrapping(e.into(), "startup.graph_schema"))?;

        let bus: Arc<dyn EventBus> = Arc::new(
            RedisEventBus::connect(config.redis.clone())
                .await
                .map_err(|e| Error::wrapping(e, "startup.bus"))?,
        );

        let audit_repo = Arc::new(PostgresAuditRepository::new(pool));
        audit_repo
            .initialize()
            .await
            .map_err(|e| Error::wrapping(e, "startup.audit_schema"))?;
        let (audit, flusher) = AuditLog::new(
            audit_repo,
            &config.audit,
            Some((bus.clone(), config.topics.audit_events.clone())),
            metrics.clone(),
        )?;
        // The flusher lives for the process lifetime; it drains on cancel.
        tokio::spawn(flusher.run(cancel));

        Ok(Self {
            graph: Arc::new(graph),
            bus,
            audit,
            metrics,
        })
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            cancel.cancel();
        }
    });
}

async fn ingest_service(
    services: Services,
    config: AegisConfig,
    cancel: CancellationToken,
) -> Result<Completion, Error> {
    let resolver = Arc::new(EntityResolver::new(
        services.graph.clone(),
        config.resolver.clone(),
    ));
    let batcher = Arc::new(TransactionBatcher::new(
        services.graph.clone(),
        resolver.clone(),
        services.bus.clone(),
        config.topics.transaction_flow.clone(),
        config.ingestion.clone(),
        services.audit.clone(),
        services.metrics.clone(),
    ));
    tokio::spawn(batcher.clone().run_timeouts(cancel.clone()));

    let validator = ValidationPipeline::new(&config.validation, &config.ingestion)
        .map_err(|e| Error::wrapping(e.into(), "startup.validator"))?;
    let pipeline = IngestionPipeline::new(
        validator,
        batcher,
        resolver,
        services.bus.clone(),
        Arc::new(aegis_core::object_store::MemoryObjectStore::new()),
        IngestionJobStore::new(),
        config.topics.clone(),
        config.ingestion.clone(),
    );

    // Retention sweeps run alongside intake.
    let audit = services.audit.clone();
    let retention_cancel = cancel.clone();
    tokio::spawn(async move {
        audit
            .run_retention(std::time::Duration::from_secs(3_600), retention_cancel)
            .await;
    });

    let mut stream: Box<dyn BusStream> = services
        .bus
        .subscribe("ingestion", std::slice::from_ref(&config.topics.transaction_intake))
        .await
        .map_err(|e| Error::wrapping(e, "startup.subscribe_intake"))?;
    info!(topic = %config.topics.transaction_intake, "ingest service consuming");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Completion::Interrupted),
            received = stream.recv() => {
                let Some(message) = received? else {
                    return Ok(Completion::Finished);
                };
                if let AegisEvent::TransactionSubmitted(submission) = &message.envelope.event {
                    match serde_json::from_value::<Transaction>(submission.record.clone()) {
                        Ok(txn) => {
                            if let Err(e) = pipeline.ingest_one(txn).await {
                                if e.kind() == ErrorKind::Overloaded {
                                    // Back off without committing; the
                                    // message will be redelivered.
                                    warn!("intake overloaded; backing off");
                                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                                    continue;
                                }
                                error!(error = %e, "ingestion failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "undecodable submission"),
                    }
                }
                stream.commit(&message).await?;
            }
        }
    }
}

async fn graph_service(
    services: Services,
    config: AegisConfig,
    cancel: CancellationToken,
) -> Result<Completion, Error> {
    let engine = AnalyticsEngine::new(services.graph.clone(), config.analytics.clone());
    let mut stream: Box<dyn BusStream> = services
        .bus
        .subscribe("analytics", std::slice::from_ref(&config.topics.analysis_requested))
        .await
        .map_err(|e| Error::wrapping(e, "startup.subscribe_analysis"))?;
    info!("graph service consuming analysis requests");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Completion::Interrupted),
            received = stream.recv() => {
                let Some(message) = received? else {
                    return Ok(Completion::Finished);
                };
                if let AegisEvent::AnalysisRequested(request) = &message.envelope.event {
                    let scope = AnalysisScope::Entities {
                        ids: request.entity_ids.clone(),
                        depth: config.analytics.max_path_depth,
                    };
                    let started = std::time::Instant::now();
                    let summary = match request.analysis_type.as_str() {
                        "centrality" => engine
                            .centrality(&scope, &cancel)
                            .await
                            .and_then(|r| Ok(serde_json::to_value(r)?)),
                        "communities" => engine
                            .communities(
                                &scope,
                                CommunityAlgorithm::Louvain,
                                &CommunityParams::default(),
                                &cancel,
                            )
                            .await
                            .and_then(|r| Ok(serde_json::to_value(r)?)),
                        "influence" => engine
                            .influence(
                                &scope,
                                &InfluenceParams {
                                    seed_entities: request.entity_ids.clone(),
                                    damping: None,
                                    max_iterations: None,
                                },
                                &cancel,
                            )
                            .await
                            .and_then(|r| Ok(serde_json::to_value(r)?)),
                        "network" => engine
                            .network_metrics(&scope, &cancel)
                            .await
                            .and_then(|r| Ok(serde_json::to_value(r)?)),
                        other => {
                            warn!(analysis = other, "unknown analysis type");
                            stream.commit(&message).await?;
                            continue;
                        }
                    };

                    match summary {
                        Ok(summary) => {
                            let envelope = EventEnvelope::new(AegisEvent::AnalysisCompleted(
                                AnalysisCompleted {
                                    request_id: request.request_id,
                                    analysis_type: request.analysis_type.clone(),
                                    processing_time_ms: started.elapsed().as_millis() as u64,
                                    summary,
                                },
                            ));
                            if let Err(e) = services
                                .bus
                                .publish(
                                    &config.topics.analysis_completed,
                                    &request.request_id.to_string(),
                                    &envelope,
                                )
                                .await
                            {
                                services.metrics.bus_publish_failures_total.inc();
                                warn!(error = %e, "analysis completion publish failed");
                            }
                        }
                        Err(e) => error!(error = %e, "analysis failed"),
                    }
                }
                stream.commit(&message).await?;
            }
        }
    }
}

async fn pattern_service(
    services: Services,
    config: AegisConfig,
    scan_interval: u64,
    cancel: CancellationToken,
) -> Result<Completion, Error> {
    let detector = PatternDetector::new(
        services.graph.clone(),
        services.bus.clone(),
        config.topics.pattern_detected.clone(),
        config.detector.clone(),
        services.metrics.clone(),
    );
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(scan_interval));
    let mut consecutive_timeouts = 0u32;
    info!(scan_interval, "pattern service scanning");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Completion::Interrupted),
            _ = ticker.tick() => {
                match detector.detect(&DetectionRequest::default(), &cancel).await {
                    Ok(report) => {
                        consecutive_timeouts = 0;
                        if !report.matches.is_empty() {
                            info!(
                                matches = report.matches.len(),
                                elapsed_ms = report.processing_time_ms,
                                "detection sweep completed"
                            );
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Timeout => {
                        consecutive_timeouts += 1;
                        warn!(consecutive_timeouts, "detection sweep timed out");
                        if consecutive_timeouts >= 3 {
                            // Repeated projection timeouts are an
                            // operational alert.
                            let _ = services.audit.log_event(
                                aegis_core::AuditCategory::System,
                                "detector_projection_timeouts",
                                None,
                                None,
                                "detect",
                                serde_json::json!({"consecutive": consecutive_timeouts}),
                                aegis_core::AuditResult::Failure,
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "detection sweep failed"),
                }
            }
        }
    }
}

async fn alert_service(
    services: Services,
    config: AegisConfig,
    cancel: CancellationToken,
) -> Result<Completion, Error> {
    let repo = CaseRepository::new();
    let (manager, compensator) = AlertManager::new(
        repo.clone(),
        &config.alerts,
        services.audit.clone(),
        services.bus.clone(),
        config.topics.clone(),
        services.metrics.clone(),
    );
    tokio::spawn(compensator.run(cancel.clone()));

    let workflow = Arc::new(WorkflowEngine::new());
    let investigations = Arc::new(InvestigationManager::new(
        repo,
        services.audit.clone(),
        services.bus.clone(),
        config.topics.clone(),
        workflow.clone(),
    ));

    // Overdue-step sweeper.
    let sweeper_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = sweeper_cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let overdue = investigations.workflow().check_overdue(chrono::Utc::now()).await;
                    for step in overdue {
                        warn!(
                            instance = %step.instance_id,
                            step = %step.step_name,
                            escalated = step.escalated,
                            "workflow step overdue"
                        );
                    }
                }
            }
        }
    });

    // Realtime fan-out rides in the alert service process.
    let hub = Arc::new(RealtimeHub::new(&config.fanout, services.metrics.clone()));
    let fanout_cancel = cancel.clone();
    let fanout_bus = services.bus.clone();
    let fanout_config = config.fanout.clone();
    tokio::spawn(async move {
        if let Err(e) = hub.run(fanout_bus, fanout_config, fanout_cancel).await {
            error!(error = %e, "realtime fan-out stopped");
        }
    });

    match manager.run(cancel.clone()).await {
        Ok(()) => {
            if cancel.is_cancelled() {
                Ok(Completion::Interrupted)
            } else {
                Ok(Completion::Finished)
            }
        }
        Err(e) => Err(e.into()),
    }
}
