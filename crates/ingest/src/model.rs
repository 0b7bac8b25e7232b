//! Transaction intake model and validation outcomes.

use aegis_core::types::{Currency, RiskLevel};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Transaction classes; destination-account requirements differ per class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionType {
    WireTransfer,
    DirectDebit,
    DirectCredit,
    CardPayment,
    CashDeposit,
    CashWithdrawal,
    Other(String),
}

impl TransactionType {
    pub fn as_str(&self) -> &str {
        match self {
            TransactionType::WireTransfer => "WIRE_TRANSFER",
            TransactionType::DirectDebit => "DIRECT_DEBIT",
            TransactionType::DirectCredit => "DIRECT_CREDIT",
            TransactionType::CardPayment => "CARD_PAYMENT",
            TransactionType::CashDeposit => "CASH_DEPOSIT",
            TransactionType::CashWithdrawal => "CASH_WITHDRAWAL",
            TransactionType::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "WIRE_TRANSFER" => TransactionType::WireTransfer,
            "DIRECT_DEBIT" => TransactionType::DirectDebit,
            "DIRECT_CREDIT" => TransactionType::DirectCredit,
            "CARD_PAYMENT" => TransactionType::CardPayment,
            "CASH_DEPOSIT" => TransactionType::CashDeposit,
            "CASH_WITHDRAWAL" => TransactionType::CashWithdrawal,
            other => TransactionType::Other(other.to_string()),
        }
    }

    /// Classes that move funds to a named counterparty account.
    pub fn requires_destination(&self) -> bool {
        matches!(
            self,
            TransactionType::WireTransfer
                | TransactionType::DirectDebit
                | TransactionType::DirectCredit
        )
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TransactionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TransactionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(TransactionType::parse(&s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Ach,
    Swift,
    Sepa,
    Card,
    Cash,
    Internal,
    Unknown,
}

impl Default for PaymentMethod {
    fn default() -> Self {
        PaymentMethod::Unknown
    }
}

/// Intake lifecycle: received -> validated -> (persisted | rejected).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Received,
    Validated,
    Persisted,
    Rejected,
    Failed,
}

/// One transactional event. Immutable after validation; identified by
/// `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub currency: Currency,
    /// Canonical graph entity behind the source account; set by the
    /// resolver during enrichment.
    pub from_entity: Option<Uuid>,
    pub to_entity: Option<Uuid>,
    pub from_account: Option<String>,
    pub to_account: Option<String>,
    pub payment_method: PaymentMethod,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub source_system: Option<String>,
    /// Grouping for atomic persistence; assigned at intake when absent.
    pub batch_id: Option<Uuid>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Transaction {
    /// A minimally-populated record, as the intake adapters construct it.
    pub fn new(
        transaction_type: TransactionType,
        amount: Decimal,
        currency: Currency,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: None,
            transaction_type,
            status: TransactionStatus::Received,
            amount,
            currency,
            from_entity: None,
            to_entity: None,
            from_account: None,
            to_account: None,
            payment_method: PaymentMethod::Unknown,
            description: String::new(),
            timestamp,
            risk_score: 0.0,
            risk_level: RiskLevel::Low,
            source_system: None,
            batch_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_accounts(
        mut self,
        from_account: impl Into<String>,
        to_account: impl Into<String>,
    ) -> Self {
        self.from_account = Some(from_account.into());
        self.to_account = Some(to_account.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Derive the risk band from the current score.
    pub fn update_risk_level(&mut self) {
        self.risk_level = RiskLevel::from_score(self.risk_score);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Fatal; the record is rejected.
    Error,
    /// Fatal and weighted double in quality scoring.
    Critical,
    /// Informational; the record is still accepted.
    Warning,
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub field: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(code: &str, field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: IssueSeverity::Error,
            field: field.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn critical(code: &str, field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: IssueSeverity::Critical,
            field: field.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn warning(code: &str, field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: IssueSeverity::Warning,
            field: field.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Outcome of one validator pass over one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub transaction_id: Uuid,
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    /// Quality in [0,1]: 1.0 minus 0.2 per error (0.4 per critical) and
    /// 0.05 per warning.
    pub quality_score: f64,
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    pub fn error_codes(&self) -> Vec<&str> {
        self.errors.iter().map(|i| i.code.as_str()).collect()
    }

    pub fn warning_codes(&self) -> Vec<&str> {
        self.warnings.iter().map(|i| i.code.as_str()).collect()
    }

    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|i| i.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn transaction_json_round_trip_is_identity() {
        let mut txn = Transaction::new(
            TransactionType::WireTransfer,
            dec!(9500.00),
            Currency::new("USD"),
            Utc::now(),
        )
        .with_accounts("ACCT0001AA", "ACCT0002BB")
        .with_description("invoice 4411 settlement")
        .with_external_id("core-77123");
        txn.metadata
            .insert("channel".to_string(), serde_json::json!("branch"));

        let json = serde_json::to_string(&txn).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, txn);
    }

    #[test]
    fn destination_requirement_per_type() {
        assert!(TransactionType::WireTransfer.requires_destination());
        assert!(TransactionType::DirectDebit.requires_destination());
        assert!(TransactionType::DirectCredit.requires_destination());
        assert!(!TransactionType::CashDeposit.requires_destination());
        assert!(!TransactionType::Other("CHECK".to_string()).requires_destination());
    }

    #[test]
    fn risk_level_follows_score() {
        let mut txn = Transaction::new(
            TransactionType::CardPayment,
            dec!(10),
            Currency::new("EUR"),
            Utc::now(),
        );
        txn.risk_score = 0.8;
        txn.update_risk_level();
        assert_eq!(txn.risk_level, RiskLevel::Critical);
    }
}
