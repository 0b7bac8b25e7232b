use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Audit categories with their retention and forwarding characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Compliance,
    Authentication,
    DataAccess,
    System,
    Violation,
}

impl AuditCategory {
    pub const ALL: [AuditCategory; 5] = [
        AuditCategory::Compliance,
        AuditCategory::Authentication,
        AuditCategory::DataAccess,
        AuditCategory::System,
        AuditCategory::Violation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Compliance => "compliance",
            AuditCategory::Authentication => "authentication",
            AuditCategory::DataAccess => "data_access",
            AuditCategory::System => "system",
            AuditCategory::Violation => "violation",
        }
    }

    /// Built-in retention defaults, in days. `compliance`, `data_access`
    /// and `violation` are expected to be overridden per environment.
    pub fn default_retention_days(&self) -> u32 {
        match self {
            AuditCategory::Compliance => 2_555,
            AuditCategory::Authentication => 90,
            AuditCategory::DataAccess => 365,
            AuditCategory::System => 180,
            AuditCategory::Violation => 1_825,
        }
    }

    /// Bulk export of this category requires prior approval.
    pub fn requires_export_approval(&self) -> bool {
        matches!(self, AuditCategory::DataAccess)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compliance" => Some(AuditCategory::Compliance),
            "authentication" => Some(AuditCategory::Authentication),
            "data_access" => Some(AuditCategory::DataAccess),
            "system" => Some(AuditCategory::System),
            "violation" => Some(AuditCategory::Violation),
            _ => None,
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cipher strength applied to a category's record details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionLevel {
    #[default]
    None,
    /// AES-256-GCM over the `details` payload.
    Standard,
    /// AES-256-GCM over `details`, `ip_address` and `user_agent`.
    High,
}

impl EncryptionLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(EncryptionLevel::None),
            "standard" => Some(EncryptionLevel::Standard),
            "high" => Some(EncryptionLevel::High),
            _ => None,
        }
    }
}

/// Outcome of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditResult::Success => "success",
            AuditResult::Failure => "failure",
            AuditResult::Denied => "denied",
        };
        f.write_str(s)
    }
}

/// One immutable audit record. Retention deletes whole records, never
/// fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub category: AuditCategory,
    pub event_type: String,
    pub user_id: Option<String>,
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub action: String,
    pub result: AuditResult,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Level the stored `details` were encrypted at.
    pub encryption: EncryptionLevel,
}

impl AuditRecord {
    pub fn builder(
        category: AuditCategory,
        event_type: impl Into<String>,
        action: impl Into<String>,
    ) -> AuditRecordBuilder {
        AuditRecordBuilder::new(category, event_type, action)
    }
}

/// Builder for audit records.
pub struct AuditRecordBuilder {
    record: AuditRecord,
}

impl AuditRecordBuilder {
    pub fn new(
        category: AuditCategory,
        event_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            record: AuditRecord {
                id: Uuid::new_v4(),
                category,
                event_type: event_type.into(),
                user_id: None,
                entity_id: None,
                entity_type: None,
                action: action.into(),
                result: AuditResult::Success,
                details: serde_json::Value::Null,
                timestamp: Utc::now(),
                ip_address: None,
                user_agent: None,
                encryption: EncryptionLevel::None,
            },
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.record.user_id = Some(user_id.into());
        self
    }

    pub fn entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.record.entity_type = Some(entity_type.into());
        self.record.entity_id = Some(entity_id.into());
        self
    }

    pub fn result(mut self, result: AuditResult) -> Self {
        self.record.result = result;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.record.details = details;
        self
    }

    pub fn source(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.record.ip_address = Some(ip_address.into());
        self.record.user_agent = Some(user_agent.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.record.timestamp = timestamp;
        self
    }

    pub fn build(self) -> AuditRecord {
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_complete_record() {
        let record = AuditRecord::builder(AuditCategory::Compliance, "transaction_ingested", "ingest")
            .user("analyst-1")
            .entity("transaction", "t-9")
            .details(serde_json::json!({"amount": "9500"}))
            .build();

        assert_eq!(record.category, AuditCategory::Compliance);
        assert_eq!(record.result, AuditResult::Success);
        assert_eq!(record.entity_id.as_deref(), Some("t-9"));
        assert_eq!(record.encryption, EncryptionLevel::None);
    }

    #[test]
    fn category_round_trips_through_str() {
        for category in AuditCategory::ALL {
            assert_eq!(AuditCategory::parse(category.as_str()), Some(category));
        }
    }

    #[test]
    fn data_access_requires_export_approval() {
        assert!(AuditCategory::DataAccess.requires_export_approval());
        assert!(!AuditCategory::System.requires_export_approval());
    }
}
