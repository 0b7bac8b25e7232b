//! # Evidence Vault
//!
//! Content-addressed evidence storage with an append-only chain of
//! custody. Every access appends `(actor, action, timestamp, prior_hash,
//! new_hash)`: `prior_hash` links to the previous chain entry and
//! `new_hash` is the hash of the evidence bytes as observed. Verification
//! recomputes both link and content hashes and reports the position of
//! the first break.

use crate::error::{CaseError, Result};
use crate::model::{ChainVerification, CustodyAction, CustodyEntry, Evidence};
use crate::repository::CaseRepository;
use aegis_core::audit::{AuditCategory, AuditLog, AuditResult};
use aegis_core::object_store::{collect_bytes, ObjectMetadata, ObjectStore};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Request to attach new evidence to an investigation.
#[derive(Debug, Clone)]
pub struct EvidenceSubmission {
    pub investigation_id: Uuid,
    pub evidence_type: String,
    pub description: String,
    pub source: String,
    pub collected_by: String,
}

pub struct EvidenceVault {
    repo: CaseRepository,
    object_store: Arc<dyn ObjectStore>,
    audit: AuditLog,
}

impl EvidenceVault {
    pub fn new(repo: CaseRepository, object_store: Arc<dyn ObjectStore>, audit: AuditLog) -> Self {
        Self {
            repo,
            object_store,
            audit,
        }
    }

    pub fn hash_bytes(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Hash of one chain entry, for `prior_hash` linking.
    pub fn hash_entry(entry: &CustodyEntry) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entry.actor.as_bytes());
        hasher.update(entry.action.to_string().as_bytes());
        hasher.update(entry.timestamp.to_rfc3339().as_bytes());
        hasher.update(entry.prior_hash.as_bytes());
        hasher.update(entry.new_hash.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Store evidence bytes and open its custody chain. Two submissions
    /// with identical bytes share one stored object.
    pub async fn add_evidence(
        &self,
        submission: EvidenceSubmission,
        bytes: Vec<u8>,
    ) -> Result<Evidence> {
        // Referenced investigation must exist and be writable.
        let investigation = self
            .repo
            .get_investigation(submission.investigation_id)
            .await?;
        if investigation.status == crate::model::InvestigationStatus::Archived {
            return Err(CaseError::ArchivedImmutable {
                id: investigation.id,
            });
        }

        let hash = Self::hash_bytes(&bytes);
        let storage_ref = format!("evidence/{}", hash);

        let genesis = CustodyEntry {
            actor: submission.collected_by.clone(),
            action: CustodyAction::Collected,
            timestamp: Utc::now(),
            prior_hash: String::new(),
            new_hash: hash.clone(),
        };
        let evidence = Evidence {
            id: Uuid::new_v4(),
            investigation_id: submission.investigation_id,
            evidence_type: submission.evidence_type,
            description: submission.description,
            source: submission.source,
            collected_by: submission.collected_by.clone(),
            hash: hash.clone(),
            storage_ref,
            chain_of_custody: vec![genesis],
            collected_at: Utc::now(),
        };

        let (evidence, already_stored) = self.repo.insert_evidence(evidence).await;
        if !already_stored {
            self.object_store
                .put(
                    &evidence.storage_ref,
                    bytes,
                    ObjectMetadata {
                        content_type: "application/octet-stream".to_string(),
                        size_bytes: 0,
                        created_at: Utc::now(),
                        attributes: HashMap::from([(
                            "sha256".to_string(),
                            evidence.hash.clone(),
                        )]),
                    },
                )
                .await
                .map_err(CaseError::Core)?;
        }

        // Attach to the investigation.
        let mut investigation = investigation;
        investigation.evidence_ids.push(evidence.id);
        investigation.updated_at = Utc::now();
        self.repo.update_investigation(investigation).await?;

        self.audit.log_event(
            AuditCategory::Compliance,
            "evidence_collected",
            Some(&submission.collected_by),
            Some(("evidence", &evidence.id.to_string())),
            "collect",
            serde_json::json!({"hash": evidence.hash, "shared_object": already_stored}),
            AuditResult::Success,
        )?;

        info!(evidence = %evidence.id, hash = %evidence.hash, "evidence collected");
        Ok(evidence)
    }

    /// Record an access or transfer, observing the current bytes.
    pub async fn record_access(
        &self,
        evidence_id: Uuid,
        actor: &str,
        action: CustodyAction,
    ) -> Result<CustodyEntry> {
        let mut evidence = self.repo.get_evidence(evidence_id).await?;
        let bytes = collect_bytes(
            self.object_store
                .get(&evidence.storage_ref)
                .await
                .map_err(CaseError::Core)?,
        )
        .await
        .map_err(CaseError::Core)?;

        let prior = evidence
            .chain_of_custody
            .last()
            .map(Self::hash_entry)
            .unwrap_or_default();
        let entry = CustodyEntry {
            actor: actor.to_string(),
            action,
            timestamp: Utc::now(),
            prior_hash: prior,
            new_hash: Self::hash_bytes(&bytes),
        };
        evidence.chain_of_custody.push(entry.clone());
        self.repo.update_evidence(evidence).await?;

        self.audit.log_event(
            AuditCategory::DataAccess,
            "evidence_accessed",
            Some(actor),
            Some(("evidence", &evidence_id.to_string())),
            &action.to_string(),
            serde_json::Value::Null,
            AuditResult::Success,
        )?;
        Ok(entry)
    }

    /// Verify the chain: every entry must link to its predecessor and,
    /// absent an authorized modification, observe unchanged bytes. The
    /// verification itself is an access and appends to the chain, so
    /// tampering surfaces as a break at the first post-tampering entry. A
    /// break records a `violation` audit event.
    pub async fn verify_chain_of_custody(
        &self,
        evidence_id: Uuid,
        actor: &str,
    ) -> Result<ChainVerification> {
        self.record_access(evidence_id, actor, CustodyAction::Verified)
            .await?;
        let evidence = self.repo.get_evidence(evidence_id).await?;
        let chain = &evidence.chain_of_custody;

        let mut break_position: Option<usize> = None;
        for (i, entry) in chain.iter().enumerate() {
            if i == 0 {
                if entry.new_hash != evidence.hash || !entry.prior_hash.is_empty() {
                    break_position = Some(0);
                    break;
                }
                continue;
            }
            let expected_link = Self::hash_entry(&chain[i - 1]);
            if entry.prior_hash != expected_link {
                break_position = Some(i);
                break;
            }
            if entry.action != CustodyAction::Modified && entry.new_hash != chain[i - 1].new_hash {
                break_position = Some(i);
                break;
            }
        }

        let verification = ChainVerification {
            ok: break_position.is_none(),
            break_position,
        };

        if let Some(position) = break_position {
            warn!(evidence = %evidence_id, position, "chain of custody break detected");
            self.audit.log_event(
                AuditCategory::Violation,
                "custody_chain_broken",
                Some(actor),
                Some(("evidence", &evidence_id.to_string())),
                "verify",
                serde_json::json!({"break_position": position, "chain_length": chain.len()}),
                AuditResult::Failure,
            )?;
        }
        Ok(verification)
    }
}
