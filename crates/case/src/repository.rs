//! Arena repositories for the case aggregates.
//!
//! Alerts, investigations, and evidence live in separate arenas keyed by
//! stable ids; cross-aggregate references are ids resolved through these
//! lookups. Single writer behind each exclusive lock, many readers behind
//! the shared lock.

use crate::error::{CaseError, Result};
use crate::model::{
    Alert, AlertStatus, Evidence, Investigation, InvestigationFilter,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Arenas {
    alerts: HashMap<Uuid, Alert>,
    /// `(rule_id, entity_set_key)` -> non-terminal alert id.
    alert_keys: HashMap<(String, String), Uuid>,
    investigations: HashMap<Uuid, Investigation>,
    evidence: HashMap<Uuid, Evidence>,
    /// content hash -> storage_ref, for hash-equal deduplication.
    evidence_refs: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct CaseRepository {
    arenas: Arc<RwLock<Arenas>>,
}

impl CaseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    // Alerts

    pub async fn insert_alert(&self, alert: Alert) -> Alert {
        let mut arenas = self.arenas.write().await;
        let key = (
            alert.rule_id.clone(),
            Alert::entity_set_key(&alert.entity_ids),
        );
        arenas.alert_keys.insert(key, alert.id);
        arenas.alerts.insert(alert.id, alert.clone());
        alert
    }

    pub async fn get_alert(&self, id: Uuid) -> Result<Alert> {
        self.arenas
            .read()
            .await
            .alerts
            .get(&id)
            .cloned()
            .ok_or(CaseError::AlertNotFound { id })
    }

    /// The live (non-terminal) alert for a `(rule_id, entity-set)` key.
    pub async fn find_live_alert(&self, rule_id: &str, entity_ids: &[Uuid]) -> Option<Alert> {
        let arenas = self.arenas.read().await;
        let key = (rule_id.to_string(), Alert::entity_set_key(entity_ids));
        let id = arenas.alert_keys.get(&key)?;
        arenas
            .alerts
            .get(id)
            .filter(|alert| !alert.status.is_terminal())
            .cloned()
    }

    pub async fn update_alert(&self, alert: Alert) -> Result<Alert> {
        let mut arenas = self.arenas.write().await;
        if !arenas.alerts.contains_key(&alert.id) {
            return Err(CaseError::AlertNotFound { id: alert.id });
        }
        if alert.status.is_terminal() {
            // Terminal alerts release their dedupe key so a fresh
            // detection opens a new alert.
            let key = (
                alert.rule_id.clone(),
                Alert::entity_set_key(&alert.entity_ids),
            );
            if arenas.alert_keys.get(&key) == Some(&alert.id) {
                arenas.alert_keys.remove(&key);
            }
        }
        arenas.alerts.insert(alert.id, alert.clone());
        Ok(alert)
    }

    pub async fn alerts_by_status(&self, status: AlertStatus) -> Vec<Alert> {
        let arenas = self.arenas.read().await;
        let mut found: Vec<Alert> = arenas
            .alerts
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
    }

    // Investigations

    pub async fn insert_investigation(&self, investigation: Investigation) -> Investigation {
        self.arenas
            .write()
            .await
            .investigations
            .insert(investigation.id, investigation.clone());
        investigation
    }

    pub async fn get_investigation(&self, id: Uuid) -> Result<Investigation> {
        self.arenas
            .read()
            .await
            .investigations
            .get(&id)
            .cloned()
            .ok_or(CaseError::InvestigationNotFound { id })
    }

    pub async fn update_investigation(&self, investigation: Investigation) -> Result<Investigation> {
        let mut arenas = self.arenas.write().await;
        if !arenas.investigations.contains_key(&investigation.id) {
            return Err(CaseError::InvestigationNotFound {
                id: investigation.id,
            });
        }
        arenas
            .investigations
            .insert(investigation.id, investigation.clone());
        Ok(investigation)
    }

    /// Archived investigations stay searchable until retention expires.
    pub async fn find_investigations(&self, filter: &InvestigationFilter) -> Vec<Investigation> {
        let arenas = self.arenas.read().await;
        let mut found: Vec<Investigation> = arenas
            .investigations
            .values()
            .filter(|inv| {
                filter.status.map_or(true, |s| inv.status == s)
                    && filter.priority.map_or(true, |p| inv.priority == p)
                    && filter
                        .assigned_to
                        .as_ref()
                        .map_or(true, |a| inv.assigned_to.as_ref() == Some(a))
                    && filter
                        .entity_id
                        .map_or(true, |id| inv.entity_ids.contains(&id))
                    && filter.created_after.map_or(true, |t| inv.created_at >= t)
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
    }

    // Evidence

    /// Insert evidence, deduplicating the storage ref by content hash:
    /// two rows with the same hash share one stored object.
    pub async fn insert_evidence(&self, mut evidence: Evidence) -> (Evidence, bool) {
        let mut arenas = self.arenas.write().await;
        let bytes_already_stored = match arenas.evidence_refs.get(&evidence.hash) {
            Some(existing_ref) => {
                evidence.storage_ref = existing_ref.clone();
                true
            }
            None => {
                arenas
                    .evidence_refs
                    .insert(evidence.hash.clone(), evidence.storage_ref.clone());
                false
            }
        };
        arenas.evidence.insert(evidence.id, evidence.clone());
        (evidence, bytes_already_stored)
    }

    pub async fn get_evidence(&self, id: Uuid) -> Result<Evidence> {
        self.arenas
            .read()
            .await
            .evidence
            .get(&id)
            .cloned()
            .ok_or(CaseError::EvidenceNotFound { id })
    }

    pub async fn update_evidence(&self, evidence: Evidence) -> Result<Evidence> {
        let mut arenas = self.arenas.write().await;
        if !arenas.evidence.contains_key(&evidence.id) {
            return Err(CaseError::EvidenceNotFound { id: evidence.id });
        }
        arenas.evidence.insert(evidence.id, evidence.clone());
        Ok(evidence)
    }

    pub async fn evidence_for_investigation(&self, investigation_id: Uuid) -> Vec<Evidence> {
        let arenas = self.arenas.read().await;
        let mut found: Vec<Evidence> = arenas
            .evidence
            .values()
            .filter(|e| e.investigation_id == investigation_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.collected_at.cmp(&b.collected_at));
        found
    }
}
