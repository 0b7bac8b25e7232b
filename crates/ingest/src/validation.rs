//! # Validation Pipeline
//!
//! Per-record validation in four phases: basic fields, schema by
//! transaction type, business rules, quality scoring. Errors are fatal;
//! warnings are informational. A record is accepted iff it has no errors.

use crate::model::{
    IssueSeverity, Transaction, ValidationIssue, ValidationResult,
};
use aegis_core::config::{IngestionConfig, ValidationConfig};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::debug;

// Fatal rule codes.
pub const AMOUNT_NOT_POSITIVE: &str = "AMOUNT_NOT_POSITIVE";
pub const AMOUNT_LIMIT_EXCEEDED: &str = "AMOUNT_LIMIT_EXCEEDED";
pub const CURRENCY_NOT_ACCEPTED: &str = "CURRENCY_NOT_ACCEPTED";
pub const SOURCE_ACCOUNT_REQUIRED: &str = "SOURCE_ACCOUNT_REQUIRED";
pub const DESTINATION_ACCOUNT_REQUIRED: &str = "DESTINATION_ACCOUNT_REQUIRED";
pub const INVALID_ACCOUNT_FORMAT: &str = "INVALID_ACCOUNT_FORMAT";
pub const TIMESTAMP_IN_FUTURE: &str = "TIMESTAMP_IN_FUTURE";

// Warning rule codes.
pub const SAME_ACCOUNT: &str = "SAME_ACCOUNT";
pub const STRUCTURING_RISK: &str = "STRUCTURING_RISK";
pub const LARGE_AMOUNT: &str = "LARGE_AMOUNT";
pub const OFF_HOURS: &str = "OFF_HOURS";
pub const WEEKEND: &str = "WEEKEND";
pub const GENERIC_DESCRIPTION: &str = "GENERIC_DESCRIPTION";
pub const SHORT_DESCRIPTION: &str = "SHORT_DESCRIPTION";
pub const STALE_TIMESTAMP: &str = "STALE_TIMESTAMP";

/// Stateless validator; construct once and share.
pub struct ValidationPipeline {
    config: ValidationConfig,
    accepted_currencies: HashSet<String>,
    account_pattern: Regex,
    generic_descriptions: HashSet<String>,
}

impl ValidationPipeline {
    pub fn new(validation: &ValidationConfig, ingestion: &IngestionConfig) -> crate::error::Result<Self> {
        let account_pattern = Regex::new(&validation.account_id_pattern).map_err(|e| {
            crate::error::IngestError::Core(aegis_core::Error::invalid(format!(
                "invalid account_id_pattern: {}",
                e
            )))
        })?;
        Ok(Self {
            config: validation.clone(),
            accepted_currencies: ingestion
                .accepted_currencies
                .iter()
                .map(|c| c.to_ascii_uppercase())
                .collect(),
            account_pattern,
            generic_descriptions: validation
                .generic_descriptions
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
        })
    }

    /// Validate one record against `now`.
    pub fn validate(&self, txn: &Transaction, now: DateTime<Utc>) -> ValidationResult {
        let mut issues: Vec<ValidationIssue> = Vec::new();

        self.basic_fields(txn, &mut issues);
        self.schema_by_type(txn, &mut issues);
        self.business_rules(txn, now, &mut issues);

        let (errors, warnings): (Vec<ValidationIssue>, Vec<ValidationIssue>) = issues
            .into_iter()
            .partition(|i| i.severity != IssueSeverity::Warning);

        let quality_score = quality(&errors, &warnings);
        let valid = errors.is_empty();
        debug!(
            transaction_id = %txn.id,
            valid,
            errors = errors.len(),
            warnings = warnings.len(),
            quality_score,
            "validated"
        );

        ValidationResult {
            transaction_id: txn.id,
            valid,
            errors,
            warnings,
            quality_score,
            validated_at: now,
        }
    }

    /// Phase 1: presence and format of core fields.
    fn basic_fields(&self, txn: &Transaction, issues: &mut Vec<ValidationIssue>) {
        if txn.amount <= Decimal::ZERO {
            issues.push(ValidationIssue::error(
                AMOUNT_NOT_POSITIVE,
                Some("amount"),
                format!("amount must be positive, got {}", txn.amount),
            ));
        }

        if !txn.currency.is_well_formed()
            || !self.accepted_currencies.contains(txn.currency.as_str())
        {
            issues.push(ValidationIssue::error(
                CURRENCY_NOT_ACCEPTED,
                Some("currency"),
                format!("currency {} is not in the accepted set", txn.currency),
            ));
        }

        match &txn.from_account {
            None => issues.push(ValidationIssue::error(
                SOURCE_ACCOUNT_REQUIRED,
                Some("from_account"),
                "source account is required",
            )),
            Some(account) if !self.account_pattern.is_match(account) => {
                issues.push(ValidationIssue::error(
                    INVALID_ACCOUNT_FORMAT,
                    Some("from_account"),
                    format!("account id '{}' does not match the required pattern", account),
                ));
            }
            Some(_) => {}
        }

        if let Some(account) = &txn.to_account {
            if !self.account_pattern.is_match(account) {
                issues.push(ValidationIssue::error(
                    INVALID_ACCOUNT_FORMAT,
                    Some("to_account"),
                    format!("account id '{}' does not match the required pattern", account),
                ));
            }
        }
    }

    /// Phase 2: schema requirements that depend on the transaction type.
    fn schema_by_type(&self, txn: &Transaction, issues: &mut Vec<ValidationIssue>) {
        if txn.transaction_type.requires_destination() && txn.to_account.is_none() {
            issues.push(ValidationIssue::error(
                DESTINATION_ACCOUNT_REQUIRED,
                Some("to_account"),
                format!(
                    "destination account is required for {}",
                    txn.transaction_type
                ),
            ));
        }
    }

    /// Phase 3: the enumerated business rules.
    fn business_rules(&self, txn: &Transaction, now: DateTime<Utc>, issues: &mut Vec<ValidationIssue>) {
        if let (Some(from), Some(to)) = (&txn.from_account, &txn.to_account) {
            if from == to {
                issues.push(ValidationIssue::warning(
                    SAME_ACCOUNT,
                    None,
                    "source and destination accounts are identical",
                ));
            }
        }

        // Hard cap is exclusive: exactly the cap passes, a cent above fails.
        if txn.amount > self.config.amount_hard_cap {
            issues.push(ValidationIssue::critical(
                AMOUNT_LIMIT_EXCEEDED,
                Some("amount"),
                format!(
                    "amount {} exceeds the hard cap {}",
                    txn.amount, self.config.amount_hard_cap
                ),
            ));
        } else {
            // Structuring band is [low, high): the low bound warns, the
            // high bound does not.
            if txn.amount >= self.config.structuring_low && txn.amount < self.config.structuring_high
            {
                issues.push(ValidationIssue::warning(
                    STRUCTURING_RISK,
                    Some("amount"),
                    format!(
                        "amount {} falls in the structuring band [{}, {})",
                        txn.amount, self.config.structuring_low, self.config.structuring_high
                    ),
                ));
            }
            if txn.amount > self.config.amount_soft_cap {
                issues.push(ValidationIssue::warning(
                    LARGE_AMOUNT,
                    Some("amount"),
                    format!(
                        "amount {} exceeds the large-amount threshold {}",
                        txn.amount, self.config.amount_soft_cap
                    ),
                ));
            }
        }

        // Timestamp rules. The skew tolerance is inclusive: exactly
        // now + tolerance is accepted.
        let skew = Duration::seconds(self.config.future_skew_tolerance_secs);
        if txn.timestamp > now + skew {
            issues.push(ValidationIssue::error(
                TIMESTAMP_IN_FUTURE,
                Some("timestamp"),
                format!("timestamp {} is beyond the allowed clock skew", txn.timestamp),
            ));
        } else {
            if txn.timestamp < now - Duration::days(self.config.stale_threshold_days) {
                issues.push(ValidationIssue::warning(
                    STALE_TIMESTAMP,
                    Some("timestamp"),
                    format!(
                        "timestamp {} is older than {} days",
                        txn.timestamp, self.config.stale_threshold_days
                    ),
                ));
            }

            let hour = txn.timestamp.hour();
            if hour < self.config.business_hours_start || hour >= self.config.business_hours_end {
                issues.push(ValidationIssue::warning(
                    OFF_HOURS,
                    Some("timestamp"),
                    format!("transaction at {:02}:00 UTC is outside business hours", hour),
                ));
            }
            if matches!(txn.timestamp.weekday(), Weekday::Sat | Weekday::Sun) {
                issues.push(ValidationIssue::warning(
                    WEEKEND,
                    Some("timestamp"),
                    "transaction falls on a weekend",
                ));
            }
        }

        // Description quality.
        let description = txn.description.trim();
        if self
            .generic_descriptions
            .contains(&description.to_ascii_lowercase())
        {
            issues.push(ValidationIssue::warning(
                GENERIC_DESCRIPTION,
                Some("description"),
                format!("description '{}' is generic", description),
            ));
        }
        if description.len() < self.config.min_description_length {
            issues.push(ValidationIssue::warning(
                SHORT_DESCRIPTION,
                Some("description"),
                format!(
                    "description shorter than {} characters",
                    self.config.min_description_length
                ),
            ));
        }
    }
}

/// Quality score: start at 1.0; subtract 0.2 per error, 0.4 per critical
/// error, 0.05 per warning; clamp to [0,1].
fn quality(errors: &[ValidationIssue], warnings: &[ValidationIssue]) -> f64 {
    let mut score = 1.0_f64;
    for issue in errors {
        score -= match issue.severity {
            IssueSeverity::Critical => 0.4,
            _ => 0.2,
        };
    }
    score -= 0.05 * warnings.len() as f64;
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransactionType;
    use aegis_core::types::Currency;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn pipeline() -> ValidationPipeline {
        ValidationPipeline::new(&ValidationConfig::default(), &IngestionConfig::default()).unwrap()
    }

    /// Tuesday 10:00 UTC: inside business hours, not a weekend.
    fn weekday_morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 28, 10, 0, 0).unwrap()
    }

    fn txn(amount: Decimal) -> Transaction {
        Transaction::new(
            TransactionType::WireTransfer,
            amount,
            Currency::new("USD"),
            weekday_morning(),
        )
        .with_accounts("ACCT0001AA", "ACCT0002BB")
        .with_description("invoice 4411 settlement")
    }

    #[test]
    fn clean_record_is_accepted_with_full_quality() {
        let result = pipeline().validate(&txn(dec!(250.00)), weekday_morning());
        assert!(result.valid);
        assert!(result.errors.is_empty());
        assert!(result.warnings.is_empty());
        assert_eq!(result.quality_score, 1.0);
    }

    #[test]
    fn hard_cap_boundary() {
        let p = pipeline();
        let now = weekday_morning();

        // Exactly 1,000,000: accepted, large-amount warning.
        let at_cap = p.validate(&txn(dec!(1_000_000)), now);
        assert!(at_cap.valid);
        assert!(at_cap.has_warning(LARGE_AMOUNT));

        // A cent above: rejected.
        let above = p.validate(&txn(dec!(1_000_000.01)), now);
        assert!(!above.valid);
        assert!(above.error_codes().contains(&AMOUNT_LIMIT_EXCEEDED));
    }

    #[test]
    fn structuring_band_is_half_open() {
        let p = pipeline();
        let now = weekday_morning();

        assert!(p.validate(&txn(dec!(9_000)), now).has_warning(STRUCTURING_RISK));
        assert!(p.validate(&txn(dec!(9_999.99)), now).has_warning(STRUCTURING_RISK));
        assert!(!p.validate(&txn(dec!(10_000)), now).has_warning(STRUCTURING_RISK));
        assert!(!p.validate(&txn(dec!(8_999.99)), now).has_warning(STRUCTURING_RISK));
    }

    #[test]
    fn future_skew_boundary() {
        let p = pipeline();
        let now = weekday_morning();

        let mut exactly = txn(dec!(100));
        exactly.timestamp = now + Duration::minutes(5);
        assert!(p.validate(&exactly, now).valid);

        let mut over = txn(dec!(100));
        over.timestamp = now + Duration::minutes(5) + Duration::seconds(1);
        let result = p.validate(&over, now);
        assert!(!result.valid);
        assert!(result.error_codes().contains(&TIMESTAMP_IN_FUTURE));
    }

    #[test]
    fn stale_timestamp_warns() {
        let p = pipeline();
        let now = weekday_morning();
        let mut old = txn(dec!(100));
        old.timestamp = now - Duration::days(8);
        let result = p.validate(&old, now);
        assert!(result.valid);
        assert!(result.has_warning(STALE_TIMESTAMP));
    }

    #[test]
    fn off_hours_and_weekend_warn() {
        let p = pipeline();
        // Saturday 23:30 UTC.
        let ts = Utc.with_ymd_and_hms(2026, 7, 25, 23, 30, 0).unwrap();
        let mut late = txn(dec!(100));
        late.timestamp = ts;
        let result = p.validate(&late, ts);
        assert!(result.has_warning(OFF_HOURS));
        assert!(result.has_warning(WEEKEND));
    }

    #[test]
    fn account_rules() {
        let p = pipeline();
        let now = weekday_morning();

        let mut no_source = txn(dec!(100));
        no_source.from_account = None;
        assert!(p
            .validate(&no_source, now)
            .error_codes()
            .contains(&SOURCE_ACCOUNT_REQUIRED));

        let mut no_dest = txn(dec!(100));
        no_dest.to_account = None;
        assert!(p
            .validate(&no_dest, now)
            .error_codes()
            .contains(&DESTINATION_ACCOUNT_REQUIRED));

        // Cash deposits do not need a destination.
        let mut cash = txn(dec!(100));
        cash.transaction_type = TransactionType::CashDeposit;
        cash.to_account = None;
        assert!(p.validate(&cash, now).valid);

        let mut bad_format = txn(dec!(100));
        bad_format.from_account = Some("a!".to_string());
        assert!(p
            .validate(&bad_format, now)
            .error_codes()
            .contains(&INVALID_ACCOUNT_FORMAT));

        let mut same = txn(dec!(100));
        same.to_account = same.from_account.clone();
        assert!(p.validate(&same, now).has_warning(SAME_ACCOUNT));
    }

    #[test]
    fn description_rules() {
        let p = pipeline();
        let now = weekday_morning();

        let generic = txn(dec!(100)).with_description("Payment");
        let result = p.validate(&generic, now);
        assert!(result.has_warning(GENERIC_DESCRIPTION));
        // "Payment" is 7 chars; no short-description warning.
        assert!(!result.has_warning(SHORT_DESCRIPTION));

        let short = txn(dec!(100)).with_description("ok");
        assert!(p.validate(&short, now).has_warning(SHORT_DESCRIPTION));
    }

    #[test]
    fn quality_score_arithmetic() {
        let p = pipeline();
        let now = weekday_morning();

        // One structuring warning: 1.0 - 0.05.
        let structuring = p.validate(&txn(dec!(9_500)), now);
        assert!(structuring.valid);
        assert!((structuring.quality_score - 0.95).abs() < 1e-9);

        // Critical amount error: 1.0 - 0.4.
        let capped = p.validate(&txn(dec!(2_000_000)), now);
        assert!(!capped.valid);
        assert!((capped.quality_score - 0.6).abs() < 1e-9);

        // Unsupported currency (plain error) + short description warning.
        let mut odd = txn(dec!(100));
        odd.currency = Currency::new("XXX");
        odd.description = "ok".to_string();
        let result = p.validate(&odd, now);
        assert!((result.quality_score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn score_clamps_at_zero() {
        let p = pipeline();
        let now = weekday_morning();
        let mut broken = Transaction::new(
            TransactionType::WireTransfer,
            dec!(-5),
            Currency::new("ZZZ"),
            now + Duration::days(2),
        );
        broken.description = "x".to_string();
        let result = p.validate(&broken, now);
        assert!(!result.valid);
        assert!(result.quality_score >= 0.0);
    }
}
