//! Alert, investigation, and evidence aggregates.
//!
//! Aggregates reference each other by stable id only; cross-aggregate
//! navigation goes through the repository, never embedded pointers.

use aegis_core::types::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Open,
    Investigating,
    Resolved,
    Dismissed,
}

impl AlertStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::Dismissed)
    }

    /// OPEN -> INVESTIGATING -> {RESOLVED, DISMISSED}; OPEN may also be
    /// dismissed directly.
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (AlertStatus::Open, AlertStatus::Investigating)
                | (AlertStatus::Open, AlertStatus::Dismissed)
                | (AlertStatus::Investigating, AlertStatus::Resolved)
                | (AlertStatus::Investigating, AlertStatus::Dismissed)
        )
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertStatus::Open => "OPEN",
            AlertStatus::Investigating => "INVESTIGATING",
            AlertStatus::Resolved => "RESOLVED",
            AlertStatus::Dismissed => "DISMISSED",
        };
        f.write_str(s)
    }
}

/// An actionable finding raised from pattern detections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: AlertStatus,
    /// Rule that raised the alert: `pattern_type/severity`.
    pub rule_id: String,
    /// Sorted; together with `rule_id` this keys the alert.
    pub entity_ids: Vec<Uuid>,
    pub pattern_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_to: Option<String>,
    /// Repeated detections within the cooldown escalate instead of
    /// duplicating.
    pub escalation_count: u32,
    pub last_escalated_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Order-independent identity of the entity set.
    pub fn entity_set_key(entity_ids: &[Uuid]) -> String {
        let mut ids: Vec<String> = entity_ids.iter().map(Uuid::to_string).collect();
        ids.sort();
        ids.join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvestigationStatus {
    Open,
    InProgress,
    Closed,
    Archived,
}

impl InvestigationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvestigationStatus::Closed | InvestigationStatus::Archived
        )
    }

    pub fn can_transition_to(&self, next: InvestigationStatus) -> bool {
        matches!(
            (self, next),
            (InvestigationStatus::Open, InvestigationStatus::InProgress)
                | (InvestigationStatus::Open, InvestigationStatus::Closed)
                | (InvestigationStatus::InProgress, InvestigationStatus::Closed)
                | (InvestigationStatus::Closed, InvestigationStatus::Archived)
        )
    }
}

impl fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvestigationStatus::Open => "OPEN",
            InvestigationStatus::InProgress => "IN_PROGRESS",
            InvestigationStatus::Closed => "CLOSED",
            InvestigationStatus::Archived => "ARCHIVED",
        };
        f.write_str(s)
    }
}

/// A case bundling alerts, evidence, and a workflow enactment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Investigation {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: InvestigationStatus,
    pub priority: Priority,
    pub entity_ids: Vec<Uuid>,
    pub alert_ids: Vec<Uuid>,
    pub evidence_ids: Vec<Uuid>,
    pub workflow_instance_id: Option<Uuid>,
    pub created_by: String,
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Search filter over investigations; all fields conjunctive.
#[derive(Debug, Clone, Default)]
pub struct InvestigationFilter {
    pub status: Option<InvestigationStatus>,
    pub priority: Option<Priority>,
    pub assigned_to: Option<String>,
    pub entity_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustodyAction {
    Collected,
    Accessed,
    Transferred,
    Verified,
    Modified,
}

impl fmt::Display for CustodyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CustodyAction::Collected => "collected",
            CustodyAction::Accessed => "accessed",
            CustodyAction::Transferred => "transferred",
            CustodyAction::Verified => "verified",
            CustodyAction::Modified => "modified",
        };
        f.write_str(s)
    }
}

/// One append-only chain-of-custody entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustodyEntry {
    pub actor: String,
    pub action: CustodyAction,
    pub timestamp: DateTime<Utc>,
    /// Hash of the previous chain entry; empty for the genesis entry.
    pub prior_hash: String,
    /// Hash of the evidence bytes as observed by this access.
    pub new_hash: String,
}

/// Content-addressed evidence attached to an investigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: Uuid,
    pub investigation_id: Uuid,
    pub evidence_type: String,
    pub description: String,
    pub source: String,
    pub collected_by: String,
    /// SHA-256 of the evidence bytes; rows with equal hashes share a
    /// storage_ref.
    pub hash: String,
    pub storage_ref: String,
    pub chain_of_custody: Vec<CustodyEntry>,
    pub collected_at: DateTime<Utc>,
}

/// Outcome of chain-of-custody verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub ok: bool,
    /// Index of the first broken entry when not ok.
    pub break_position: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_transitions() {
        assert!(AlertStatus::Open.can_transition_to(AlertStatus::Investigating));
        assert!(AlertStatus::Open.can_transition_to(AlertStatus::Dismissed));
        assert!(AlertStatus::Investigating.can_transition_to(AlertStatus::Resolved));
        assert!(!AlertStatus::Open.can_transition_to(AlertStatus::Resolved));
        assert!(!AlertStatus::Resolved.can_transition_to(AlertStatus::Open));
        assert!(AlertStatus::Resolved.is_terminal());
    }

    #[test]
    fn investigation_transitions() {
        assert!(InvestigationStatus::Open.can_transition_to(InvestigationStatus::InProgress));
        assert!(InvestigationStatus::InProgress.can_transition_to(InvestigationStatus::Closed));
        assert!(InvestigationStatus::Closed.can_transition_to(InvestigationStatus::Archived));
        assert!(!InvestigationStatus::Archived.can_transition_to(InvestigationStatus::Open));
    }

    #[test]
    fn entity_set_key_is_order_independent() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        assert_eq!(Alert::entity_set_key(&[a, b]), Alert::entity_set_key(&[b, a]));
    }
}
