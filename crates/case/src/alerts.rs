//! # Alert Manager
//!
//! Consumes `pattern_detected` events, applies the rule table, and keeps
//! one live alert per `(rule_id, entity-set)`: repeated detections inside
//! the cooldown window escalate priority instead of duplicating.
//!
//! Every state transition writes its audit record synchronously with the
//! transition; if the audit enqueue fails the transition does not commit.
//! Post-transition event emission failures are compensated by a
//! background task that retries until success or bounded expiry, then
//! surfaces an operational audit record.

use crate::error::{CaseError, Result};
use crate::model::{Alert, AlertStatus};
use crate::repository::CaseRepository;
use crate::rules::AlertRuleTable;
use aegis_core::audit::{AuditCategory, AuditLog, AuditResult};
use aegis_core::bus::{BusStream, EventBus};
use aegis_core::config::{AlertsConfig, TopicConfig};
use aegis_core::events::{
    AegisEvent, AlertCreated, AlertUpdated, EventEnvelope, PatternDetected,
};
use aegis_core::metrics::CoreMetrics;
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a pattern detection resulted in.
#[derive(Debug, Clone)]
pub enum PatternAction {
    Created(Alert),
    Escalated(Alert),
    /// Live alert existed but the detection fell outside the cooldown;
    /// the alert was refreshed without a priority bump.
    Refreshed(Alert),
    /// No rule for this `(pattern_type, severity)`.
    NoRule,
    /// Rule exists but does not auto-open; detection awaits promotion.
    AwaitingPromotion,
}

struct PendingEmit {
    topic: String,
    key: String,
    envelope: EventEnvelope,
    first_attempt: Instant,
}

pub struct AlertManager {
    repo: CaseRepository,
    rules: AlertRuleTable,
    audit: AuditLog,
    bus: Arc<dyn EventBus>,
    topics: TopicConfig,
    cooldown: Duration,
    compensator: mpsc::Sender<PendingEmit>,
    metrics: Arc<CoreMetrics>,
}

impl AlertManager {
    /// Build the manager and its emit compensator; spawn the compensator
    /// with `tokio::spawn(compensator.run(cancel))`.
    pub fn new(
        repo: CaseRepository,
        config: &AlertsConfig,
        audit: AuditLog,
        bus: Arc<dyn EventBus>,
        topics: TopicConfig,
        metrics: Arc<CoreMetrics>,
    ) -> (Arc<Self>, EmitCompensator) {
        let (sender, receiver) = mpsc::channel(1_024);
        let manager = Arc::new(Self {
            repo,
            rules: AlertRuleTable::from_config(config),
            audit: audit.clone(),
            bus: bus.clone(),
            topics,
            cooldown: Duration::seconds(config.cooldown_secs),
            compensator: sender,
            metrics: metrics.clone(),
        });
        let compensator = EmitCompensator {
            receiver,
            bus,
            audit,
            expiry: std::time::Duration::from_secs(config.emit_retry_expiry_secs),
            backoff: std::time::Duration::from_millis(config.emit_retry_backoff_ms),
            metrics,
        };
        (manager, compensator)
    }

    pub fn repository(&self) -> &CaseRepository {
        &self.repo
    }

    /// Apply the rule table to one detection.
    pub async fn handle_pattern(&self, detection: &PatternDetected) -> Result<PatternAction> {
        let Some(rule) = self
            .rules
            .lookup(&detection.pattern_type, detection.severity)
        else {
            debug!(
                pattern = %detection.pattern_type,
                severity = %detection.severity,
                "no alert rule; detection ignored"
            );
            return Ok(PatternAction::NoRule);
        };
        if !rule.auto_open {
            return Ok(PatternAction::AwaitingPromotion);
        }

        match self
            .repo
            .find_live_alert(&rule.rule_id, &detection.entity_ids)
            .await
        {
            Some(alert) => self.reraise(alert, detection).await,
            None => self
                .open_alert(rule.rule_id.clone(), rule.priority, detection)
                .await
                .map(PatternAction::Created),
        }
    }

    async fn open_alert(
        &self,
        rule_id: String,
        priority: aegis_core::types::Priority,
        detection: &PatternDetected,
    ) -> Result<Alert> {
        let mut entity_ids = detection.entity_ids.clone();
        entity_ids.sort_by_key(|id| id.to_string());

        let now = Utc::now();
        let alert = Alert {
            id: Uuid::new_v4(),
            title: format!(
                "{} pattern across {} entities",
                detection.pattern_type,
                entity_ids.len()
            ),
            description: format!(
                "Detected {} with confidence {:.2}",
                detection.pattern_type, detection.confidence
            ),
            priority,
            status: AlertStatus::Open,
            rule_id,
            entity_ids,
            pattern_id: Some(detection.pattern_id),
            created_at: now,
            updated_at: now,
            assigned_to: None,
            escalation_count: 0,
            last_escalated_at: None,
        };

        // Audit is synchronous with the transition: a failed enqueue
        // aborts the creation.
        self.audit.log_event(
            AuditCategory::Compliance,
            "alert_created",
            None,
            Some(("alert", &alert.id.to_string())),
            "create",
            serde_json::json!({
                "rule_id": alert.rule_id,
                "priority": alert.priority,
                "pattern_id": detection.pattern_id,
            }),
            AuditResult::Success,
        )?;

        let alert = self.repo.insert_alert(alert).await;
        self.metrics.alerts_created_total.inc();
        info!(alert = %alert.id, rule = %alert.rule_id, priority = %alert.priority, "alert opened");

        let envelope = EventEnvelope::new(AegisEvent::AlertCreated(AlertCreated {
            alert_id: alert.id,
            rule_id: alert.rule_id.clone(),
            priority: alert.priority,
            entity_ids: alert.entity_ids.clone(),
            pattern_id: alert.pattern_id,
        }));
        self.publish_or_compensate(&self.topics.alert_created, &alert.id.to_string(), envelope)
            .await;
        Ok(alert)
    }

    async fn reraise(&self, mut alert: Alert, detection: &PatternDetected) -> Result<PatternAction> {
        let now = Utc::now();
        let within_cooldown = now - alert.updated_at <= self.cooldown;

        if within_cooldown {
            let previous = alert.priority;
            alert.priority = alert.priority.escalated();
            alert.escalation_count += 1;
            alert.last_escalated_at = Some(now);
            alert.updated_at = now;

            self.audit.log_event(
                AuditCategory::Compliance,
                "alert_escalated",
                None,
                Some(("alert", &alert.id.to_string())),
                "escalate",
                serde_json::json!({
                    "from_priority": previous,
                    "to_priority": alert.priority,
                    "escalation_count": alert.escalation_count,
                    "pattern_id": detection.pattern_id,
                }),
                AuditResult::Success,
            )?;
            let alert = self.repo.update_alert(alert).await?;
            self.emit_updated(&alert).await;
            info!(alert = %alert.id, priority = %alert.priority, "alert escalated");
            Ok(PatternAction::Escalated(alert))
        } else {
            alert.updated_at = now;
            self.audit.log_event(
                AuditCategory::Compliance,
                "alert_redetected",
                None,
                Some(("alert", &alert.id.to_string())),
                "refresh",
                serde_json::json!({"pattern_id": detection.pattern_id}),
                AuditResult::Success,
            )?;
            let alert = self.repo.update_alert(alert).await?;
            self.emit_updated(&alert).await;
            Ok(PatternAction::Refreshed(alert))
        }
    }

    /// Transition an alert's status. The audit record is written in the
    /// same operation; an `Overloaded` audit buffer aborts the
    /// transition.
    pub async fn update_status(
        &self,
        alert_id: Uuid,
        next: AlertStatus,
        actor: &str,
    ) -> Result<Alert> {
        let mut alert = self.repo.get_alert(alert_id).await?;
        if !alert.status.can_transition_to(next) {
            return Err(CaseError::InvalidTransition {
                from: alert.status.to_string(),
                to: next.to_string(),
            });
        }

        let previous = alert.status;
        self.audit.log_event(
            AuditCategory::Compliance,
            "alert_status_changed",
            Some(actor),
            Some(("alert", &alert_id.to_string())),
            "transition",
            serde_json::json!({"from": previous.to_string(), "to": next.to_string()}),
            AuditResult::Success,
        )?;

        alert.status = next;
        alert.updated_at = Utc::now();
        let alert = self.repo.update_alert(alert).await?;
        info!(alert = %alert_id, from = %previous, to = %next, actor, "alert transitioned");
        self.emit_updated(&alert).await;
        Ok(alert)
    }

    /// Reassign; allowed in any non-terminal state.
    pub async fn assign(&self, alert_id: Uuid, assignee: &str, actor: &str) -> Result<Alert> {
        let mut alert = self.repo.get_alert(alert_id).await?;
        if alert.status.is_terminal() {
            return Err(CaseError::InvalidTransition {
                from: alert.status.to_string(),
                to: format!("assign:{}", assignee),
            });
        }

        self.audit.log_event(
            AuditCategory::Compliance,
            "alert_assigned",
            Some(actor),
            Some(("alert", &alert_id.to_string())),
            "assign",
            serde_json::json!({"assignee": assignee}),
            AuditResult::Success,
        )?;

        alert.assigned_to = Some(assignee.to_string());
        alert.updated_at = Utc::now();
        let alert = self.repo.update_alert(alert).await?;
        self.emit_updated(&alert).await;
        Ok(alert)
    }

    async fn emit_updated(&self, alert: &Alert) {
        let envelope = EventEnvelope::new(AegisEvent::AlertUpdated(AlertUpdated {
            alert_id: alert.id,
            status: alert.status.to_string(),
            priority: alert.priority,
            assigned_to: alert.assigned_to.clone(),
        }));
        self.publish_or_compensate(&self.topics.alert_updated, &alert.id.to_string(), envelope)
            .await;
    }

    /// The transition stands even when the emit fails; the compensator
    /// retries in the background.
    async fn publish_or_compensate(&self, topic: &str, key: &str, envelope: EventEnvelope) {
        if let Err(e) = self.bus.publish(topic, key, &envelope).await {
            self.metrics.bus_publish_failures_total.inc();
            warn!(topic, key, error = %e, "alert event publish failed; compensating");
            let pending = PendingEmit {
                topic: topic.to_string(),
                key: key.to_string(),
                envelope,
                first_attempt: Instant::now(),
            };
            if self.compensator.try_send(pending).is_err() {
                error!(topic, key, "compensator queue full; emit lost");
                let _ = self.audit.log_event(
                    AuditCategory::System,
                    "event_emit_lost",
                    None,
                    None,
                    "publish",
                    serde_json::json!({"topic": topic, "key": key}),
                    AuditResult::Failure,
                );
            }
        }
    }

    /// Consume `pattern_detected` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut stream: Box<dyn BusStream> = self
            .bus
            .subscribe("alert-manager", std::slice::from_ref(&self.topics.pattern_detected))
            .await
            .map_err(CaseError::Core)?;
        info!("alert manager consuming pattern detections");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("alert manager stopping");
                    return Ok(());
                }
                received = stream.recv() => {
                    let Some(message) = received.map_err(CaseError::Core)? else {
                        return Ok(());
                    };
                    if let AegisEvent::PatternDetected(detection) = &message.envelope.event {
                        match self.handle_pattern(detection).await {
                            Ok(action) => debug!(?action, "pattern handled"),
                            Err(e) => {
                                // Overloaded audit means the transition was
                                // refused; leave the message uncommitted for
                                // redelivery.
                                error!(error = %e, "pattern handling failed");
                                if e.kind() == aegis_core::ErrorKind::Overloaded {
                                    continue;
                                }
                            }
                        }
                    }
                    stream.commit(&message).await.map_err(CaseError::Core)?;
                }
            }
        }
    }
}

/// Background retry of failed event emissions, bounded by expiry.
pub struct EmitCompensator {
    receiver: mpsc::Receiver<PendingEmit>,
    bus: Arc<dyn EventBus>,
    audit: AuditLog,
    expiry: std::time::Duration,
    backoff: std::time::Duration,
    metrics: Arc<CoreMetrics>,
}

impl EmitCompensator {
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let pending = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("emit compensator stopping");
                    return;
                }
                received = self.receiver.recv() => match received {
                    Some(pending) => pending,
                    None => return,
                },
            };

            loop {
                if pending.first_attempt.elapsed() >= self.expiry {
                    self.metrics.bus_publish_failures_total.inc();
                    error!(topic = %pending.topic, key = %pending.key, "emit retry expired");
                    let _ = self.audit.log_event(
                        AuditCategory::System,
                        "event_emit_expired",
                        None,
                        None,
                        "publish",
                        serde_json::json!({"topic": pending.topic, "key": pending.key}),
                        AuditResult::Failure,
                    );
                    break;
                }
                match self
                    .bus
                    .publish(&pending.topic, &pending.key, &pending.envelope)
                    .await
                {
                    Ok(_) => {
                        debug!(topic = %pending.topic, key = %pending.key, "compensated emit succeeded");
                        break;
                    }
                    Err(e) => {
                        warn!(topic = %pending.topic, error = %e, "compensated emit failed; retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(self.backoff) => {}
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::audit::MemoryAuditRepository;
    use aegis_core::bus::MemoryEventBus;
    use aegis_core::config::AuditConfig;
    use aegis_core::types::{Priority, Severity};

    struct Fixture {
        manager: Arc<AlertManager>,
        bus: Arc<MemoryEventBus>,
        audit_backend: Arc<MemoryAuditRepository>,
        topics: TopicConfig,
        cancel: CancellationToken,
    }

    async fn fixture() -> Fixture {
        fixture_with(AuditConfig {
            flush_interval_ms: 10,
            ..AuditConfig::default()
        })
        .await
    }

    async fn fixture_with(audit_config: AuditConfig) -> Fixture {
        let bus = Arc::new(MemoryEventBus::new());
        let audit_backend = Arc::new(MemoryAuditRepository::new());
        let metrics = CoreMetrics::new_unregistered();
        let (audit, flusher) =
            AuditLog::new(audit_backend.clone(), &audit_config, None, metrics.clone()).unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(flusher.run(cancel.clone()));

        let topics = TopicConfig::default();
        let (manager, compensator) = AlertManager::new(
            CaseRepository::new(),
            &AlertsConfig::default(),
            audit,
            bus.clone(),
            topics.clone(),
            metrics,
        );
        tokio::spawn(compensator.run(cancel.clone()));

        Fixture {
            manager,
            bus,
            audit_backend,
            topics,
            cancel,
        }
    }

    fn detection(entities: &[u128], severity: Severity) -> PatternDetected {
        PatternDetected {
            pattern_id: Uuid::new_v4(),
            pattern_type: "smurfing".to_string(),
            entity_ids: entities.iter().map(|n| Uuid::from_u128(*n)).collect(),
            relationship_ids: vec![],
            confidence: 0.9,
            severity,
            evidence: serde_json::json!({}),
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn detection_opens_alert_with_rule_priority() {
        let f = fixture().await;
        let action = f
            .manager
            .handle_pattern(&detection(&[1, 2, 3], Severity::High))
            .await
            .unwrap();

        let PatternAction::Created(alert) = action else {
            panic!("expected alert creation");
        };
        assert_eq!(alert.priority, Priority::High);
        assert_eq!(alert.status, AlertStatus::Open);
        assert_eq!(alert.rule_id, "smurfing/high");
        assert_eq!(f.bus.topic_len(&f.topics.alert_created).await, 1);
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn repeat_detection_escalates_within_cooldown() {
        let f = fixture().await;
        let first = f
            .manager
            .handle_pattern(&detection(&[1, 2, 3], Severity::High))
            .await
            .unwrap();
        let PatternAction::Created(alert) = first else {
            panic!("expected creation");
        };

        let second = f
            .manager
            .handle_pattern(&detection(&[3, 2, 1], Severity::High))
            .await
            .unwrap();
        let PatternAction::Escalated(escalated) = second else {
            panic!("expected escalation, not duplication");
        };
        assert_eq!(escalated.id, alert.id);
        assert_eq!(escalated.priority, Priority::Critical);
        assert_eq!(escalated.escalation_count, 1);
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn transitions_follow_lifecycle_and_audit() {
        let f = fixture().await;
        let PatternAction::Created(alert) = f
            .manager
            .handle_pattern(&detection(&[7, 8], Severity::High))
            .await
            .unwrap()
        else {
            panic!("expected creation");
        };

        f.manager
            .update_status(alert.id, AlertStatus::Investigating, "analyst-1")
            .await
            .unwrap();
        f.manager
            .update_status(alert.id, AlertStatus::Resolved, "analyst-1")
            .await
            .unwrap();

        // Terminal alerts refuse further transitions.
        let err = f
            .manager
            .update_status(alert.id, AlertStatus::Investigating, "analyst-1")
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::InvalidTransition { .. }));

        // One audit record per transition, queryable by alert id.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        use aegis_core::audit::{AuditBackend, AuditFilter};
        let records = f
            .audit_backend
            .query(
                &AuditFilter {
                    entity_id: Some(alert.id.to_string()),
                    event_type: Some("alert_status_changed".to_string()),
                    ..Default::default()
                },
                aegis_core::types::Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn saturated_audit_buffer_blocks_transition() {
        // Tiny buffer with no flusher consuming it.
        let bus = Arc::new(MemoryEventBus::new());
        let metrics = CoreMetrics::new_unregistered();
        let (audit, _flusher) = AuditLog::new(
            Arc::new(MemoryAuditRepository::new()),
            &AuditConfig {
                buffer_size: 1,
                ..AuditConfig::default()
            },
            None,
            metrics.clone(),
        )
        .unwrap();
        let (manager, _compensator) = AlertManager::new(
            CaseRepository::new(),
            &AlertsConfig::default(),
            audit.clone(),
            bus,
            TopicConfig::default(),
            metrics,
        );

        // First creation consumes the single buffer slot.
        let PatternAction::Created(alert) = manager
            .handle_pattern(&detection(&[1], Severity::High))
            .await
            .unwrap()
        else {
            panic!("expected creation");
        };

        // Buffer is now full: the next transition must not commit.
        let err = manager
            .update_status(alert.id, AlertStatus::Investigating, "analyst-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), aegis_core::ErrorKind::Overloaded);

        let unchanged = manager.repository().get_alert(alert.id).await.unwrap();
        assert_eq!(unchanged.status, AlertStatus::Open);
    }

    #[tokio::test]
    async fn low_severity_star_awaits_promotion() {
        let f = fixture().await;
        let mut low = detection(&[4, 5, 6], Severity::Low);
        low.pattern_type = "star".to_string();
        let action = f.manager.handle_pattern(&low).await.unwrap();
        assert!(matches!(action, PatternAction::AwaitingPromotion));
        assert_eq!(f.bus.topic_len(&f.topics.alert_created).await, 0);
        f.cancel.cancel();
    }
}
