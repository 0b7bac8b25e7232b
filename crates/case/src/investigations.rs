//! # Investigation Manager
//!
//! Bundles alerts into cases, attaches evidence and a workflow
//! enactment, and enforces the OPEN -> IN_PROGRESS -> {CLOSED, ARCHIVED}
//! lifecycle. Archived investigations are read-only but stay searchable.

use crate::error::{CaseError, Result};
use crate::model::{Investigation, InvestigationFilter, InvestigationStatus};
use crate::repository::CaseRepository;
use crate::workflow::WorkflowEngine;
use aegis_core::audit::{AuditCategory, AuditLog, AuditResult};
use aegis_core::bus::EventBus;
use aegis_core::config::TopicConfig;
use aegis_core::events::{
    AegisEvent, EventEnvelope, InvestigationCreated, InvestigationUpdated,
};
use aegis_core::types::Priority;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Request to open an investigation.
#[derive(Debug, Clone)]
pub struct OpenInvestigation {
    pub name: String,
    pub description: String,
    pub priority: Priority,
    pub alert_ids: Vec<Uuid>,
    pub created_by: String,
    /// Workflow template to enact, if any.
    pub workflow_template: Option<String>,
}

pub struct InvestigationManager {
    repo: CaseRepository,
    audit: AuditLog,
    bus: Arc<dyn EventBus>,
    topics: TopicConfig,
    workflow: Arc<WorkflowEngine>,
}

impl InvestigationManager {
    pub fn new(
        repo: CaseRepository,
        audit: AuditLog,
        bus: Arc<dyn EventBus>,
        topics: TopicConfig,
        workflow: Arc<WorkflowEngine>,
    ) -> Self {
        Self {
            repo,
            audit,
            bus,
            topics,
            workflow,
        }
    }

    pub fn workflow(&self) -> &Arc<WorkflowEngine> {
        &self.workflow
    }

    /// Open an investigation over the given alerts. Entity scope is the
    /// union of the alerts' entity sets.
    pub async fn open(&self, request: OpenInvestigation) -> Result<Investigation> {
        let mut entity_ids: BTreeSet<Uuid> = BTreeSet::new();
        for alert_id in &request.alert_ids {
            let alert = self.repo.get_alert(*alert_id).await?;
            entity_ids.extend(alert.entity_ids.iter().copied());
        }

        let now = Utc::now();
        let mut investigation = Investigation {
            id: Uuid::new_v4(),
            name: request.name,
            description: request.description,
            status: InvestigationStatus::Open,
            priority: request.priority,
            entity_ids: entity_ids.into_iter().collect(),
            alert_ids: request.alert_ids.clone(),
            evidence_ids: Vec::new(),
            workflow_instance_id: None,
            created_by: request.created_by.clone(),
            assigned_to: None,
            created_at: now,
            updated_at: now,
        };

        // Audit synchronously with the creation.
        self.audit.log_event(
            AuditCategory::Compliance,
            "investigation_opened",
            Some(&request.created_by),
            Some(("investigation", &investigation.id.to_string())),
            "create",
            serde_json::json!({
                "alerts": request.alert_ids,
                "priority": investigation.priority,
            }),
            AuditResult::Success,
        )?;

        if let Some(template_id) = &request.workflow_template {
            let instance = self
                .workflow
                .start_instance(template_id, investigation.id, None)
                .await?;
            investigation.workflow_instance_id = Some(instance.id);
        }

        let investigation = self.repo.insert_investigation(investigation).await;
        info!(investigation = %investigation.id, "investigation opened");

        let envelope = EventEnvelope::new(AegisEvent::InvestigationCreated(InvestigationCreated {
            investigation_id: investigation.id,
            name: investigation.name.clone(),
            priority: investigation.priority,
            alert_ids: investigation.alert_ids.clone(),
        }));
        if let Err(e) = self
            .bus
            .publish(
                &self.topics.investigation_created,
                &investigation.id.to_string(),
                &envelope,
            )
            .await
        {
            warn!(error = %e, "investigation created event failed");
        }
        Ok(investigation)
    }

    /// Transition the lifecycle; archived cases are immutable.
    pub async fn update_status(
        &self,
        id: Uuid,
        next: InvestigationStatus,
        actor: &str,
    ) -> Result<Investigation> {
        let mut investigation = self.repo.get_investigation(id).await?;
        if investigation.status == InvestigationStatus::Archived {
            return Err(CaseError::ArchivedImmutable { id });
        }
        if !investigation.status.can_transition_to(next) {
            return Err(CaseError::InvalidTransition {
                from: investigation.status.to_string(),
                to: next.to_string(),
            });
        }

        let previous = investigation.status;
        self.audit.log_event(
            AuditCategory::Compliance,
            "investigation_status_changed",
            Some(actor),
            Some(("investigation", &id.to_string())),
            "transition",
            serde_json::json!({"from": previous.to_string(), "to": next.to_string()}),
            AuditResult::Success,
        )?;

        investigation.status = next;
        investigation.updated_at = Utc::now();
        let investigation = self.repo.update_investigation(investigation).await?;
        info!(investigation = %id, from = %previous, to = %next, "investigation transitioned");
        self.emit_updated(&investigation).await;
        Ok(investigation)
    }

    /// Reassign; allowed while the case is open.
    pub async fn assign(&self, id: Uuid, assignee: &str, actor: &str) -> Result<Investigation> {
        let mut investigation = self.repo.get_investigation(id).await?;
        if investigation.status.is_terminal() {
            return Err(CaseError::InvalidTransition {
                from: investigation.status.to_string(),
                to: format!("assign:{}", assignee),
            });
        }

        self.audit.log_event(
            AuditCategory::Compliance,
            "investigation_assigned",
            Some(actor),
            Some(("investigation", &id.to_string())),
            "assign",
            serde_json::json!({"assignee": assignee}),
            AuditResult::Success,
        )?;

        investigation.assigned_to = Some(assignee.to_string());
        investigation.updated_at = Utc::now();
        let investigation = self.repo.update_investigation(investigation).await?;
        self.emit_updated(&investigation).await;
        Ok(investigation)
    }

    /// Attach another alert, widening the entity scope.
    pub async fn add_alert(&self, id: Uuid, alert_id: Uuid, actor: &str) -> Result<Investigation> {
        let mut investigation = self.repo.get_investigation(id).await?;
        if investigation.status.is_terminal() {
            return Err(CaseError::ArchivedImmutable { id });
        }
        let alert = self.repo.get_alert(alert_id).await?;

        self.audit.log_event(
            AuditCategory::Compliance,
            "investigation_alert_attached",
            Some(actor),
            Some(("investigation", &id.to_string())),
            "attach",
            serde_json::json!({"alert_id": alert_id}),
            AuditResult::Success,
        )?;

        if !investigation.alert_ids.contains(&alert_id) {
            investigation.alert_ids.push(alert_id);
        }
        for entity in alert.entity_ids {
            if !investigation.entity_ids.contains(&entity) {
                investigation.entity_ids.push(entity);
            }
        }
        investigation.updated_at = Utc::now();
        let investigation = self.repo.update_investigation(investigation).await?;
        self.emit_updated(&investigation).await;
        Ok(investigation)
    }

    pub async fn get(&self, id: Uuid) -> Result<Investigation> {
        self.repo.get_investigation(id).await
    }

    /// Search; archived investigations remain visible.
    pub async fn find(&self, filter: &InvestigationFilter) -> Vec<Investigation> {
        self.repo.find_investigations(filter).await
    }

    async fn emit_updated(&self, investigation: &Investigation) {
        let envelope = EventEnvelope::new(AegisEvent::InvestigationUpdated(InvestigationUpdated {
            investigation_id: investigation.id,
            status: investigation.status.to_string(),
            assigned_to: investigation.assigned_to.clone(),
        }));
        if let Err(e) = self
            .bus
            .publish(
                &self.topics.investigation_updated,
                &investigation.id.to_string(),
                &envelope,
            )
            .await
        {
            warn!(error = %e, "investigation updated event failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Alert, AlertStatus};
    use aegis_core::audit::MemoryAuditRepository;
    use aegis_core::bus::MemoryEventBus;
    use aegis_core::config::AuditConfig;
    use aegis_core::metrics::CoreMetrics;

    struct Fixture {
        manager: InvestigationManager,
        repo: CaseRepository,
        cancel: tokio_util::sync::CancellationToken,
    }

    async fn fixture() -> Fixture {
        let repo = CaseRepository::new();
        let (audit, flusher) = AuditLog::new(
            Arc::new(MemoryAuditRepository::new()),
            &AuditConfig::default(),
            None,
            CoreMetrics::new_unregistered(),
        )
        .unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        tokio::spawn(flusher.run(cancel.clone()));

        Fixture {
            manager: InvestigationManager::new(
                repo.clone(),
                audit,
                Arc::new(MemoryEventBus::new()),
                TopicConfig::default(),
                Arc::new(WorkflowEngine::new()),
            ),
            repo,
            cancel,
        }
    }

    async fn seeded_alert(repo: &CaseRepository, entities: &[u128]) -> Alert {
        let now = Utc::now();
        repo.insert_alert(Alert {
            id: Uuid::new_v4(),
            title: "test alert".to_string(),
            description: String::new(),
            priority: Priority::High,
            status: AlertStatus::Open,
            rule_id: "smurfing/high".to_string(),
            entity_ids: entities.iter().map(|n| Uuid::from_u128(*n)).collect(),
            pattern_id: None,
            created_at: now,
            updated_at: now,
            assigned_to: None,
            escalation_count: 0,
            last_escalated_at: None,
        })
        .await
    }

    #[tokio::test]
    async fn open_unions_alert_entity_scopes() {
        let f = fixture().await;
        let a = seeded_alert(&f.repo, &[1, 2]).await;
        let b = seeded_alert(&f.repo, &[2, 3]).await;

        let investigation = f
            .manager
            .open(OpenInvestigation {
                name: "ring around B1".to_string(),
                description: String::new(),
                priority: Priority::High,
                alert_ids: vec![a.id, b.id],
                created_by: "analyst-1".to_string(),
                workflow_template: None,
            })
            .await
            .unwrap();

        assert_eq!(investigation.entity_ids.len(), 3);
        assert_eq!(investigation.status, InvestigationStatus::Open);
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn lifecycle_enforced_and_archive_is_readonly() {
        let f = fixture().await;
        let alert = seeded_alert(&f.repo, &[1]).await;
        let investigation = f
            .manager
            .open(OpenInvestigation {
                name: "case".to_string(),
                description: String::new(),
                priority: Priority::Medium,
                alert_ids: vec![alert.id],
                created_by: "analyst-1".to_string(),
                workflow_template: None,
            })
            .await
            .unwrap();

        // OPEN cannot jump straight to ARCHIVED.
        let err = f
            .manager
            .update_status(investigation.id, InvestigationStatus::Archived, "a")
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::InvalidTransition { .. }));

        f.manager
            .update_status(investigation.id, InvestigationStatus::InProgress, "a")
            .await
            .unwrap();
        f.manager
            .update_status(investigation.id, InvestigationStatus::Closed, "a")
            .await
            .unwrap();
        f.manager
            .update_status(investigation.id, InvestigationStatus::Archived, "a")
            .await
            .unwrap();

        // Archived is immutable but searchable.
        let err = f
            .manager
            .assign(investigation.id, "analyst-2", "a")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CaseError::InvalidTransition { .. } | CaseError::ArchivedImmutable { .. }
        ));
        let found = f
            .manager
            .find(&InvestigationFilter {
                status: Some(InvestigationStatus::Archived),
                ..Default::default()
            })
            .await;
        assert_eq!(found.len(), 1);
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn attached_alert_widens_scope() {
        let f = fixture().await;
        let a = seeded_alert(&f.repo, &[1]).await;
        let b = seeded_alert(&f.repo, &[9]).await;
        let investigation = f
            .manager
            .open(OpenInvestigation {
                name: "case".to_string(),
                description: String::new(),
                priority: Priority::Low,
                alert_ids: vec![a.id],
                created_by: "analyst-1".to_string(),
                workflow_template: None,
            })
            .await
            .unwrap();

        let widened = f
            .manager
            .add_alert(investigation.id, b.id, "analyst-1")
            .await
            .unwrap();
        assert!(widened.alert_ids.contains(&b.id));
        assert!(widened.entity_ids.contains(&Uuid::from_u128(9)));
        f.cancel.cancel();
    }
}
