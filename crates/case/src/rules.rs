//! Alert rule table: `(pattern_type, severity) -> (priority, auto_open)`.

use aegis_core::config::AlertsConfig;
use aegis_core::types::{Priority, Severity};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub rule_id: String,
    pub priority: Priority,
    /// When false the detection is recorded but no alert is raised until
    /// an analyst promotes it.
    pub auto_open: bool,
}

/// Immutable rule lookup built from configuration at startup.
#[derive(Debug, Clone, Default)]
pub struct AlertRuleTable {
    rules: HashMap<(String, Severity), AlertRule>,
}

impl AlertRuleTable {
    pub fn from_config(config: &AlertsConfig) -> Self {
        let mut rules = HashMap::new();
        for entry in &config.rules {
            let Some(severity) = parse_severity(&entry.severity) else {
                warn!(severity = %entry.severity, "unknown severity in alert rule; skipped");
                continue;
            };
            let Some(priority) = parse_priority(&entry.priority) else {
                warn!(priority = %entry.priority, "unknown priority in alert rule; skipped");
                continue;
            };
            let rule_id = format!("{}/{}", entry.pattern_type, entry.severity);
            rules.insert(
                (entry.pattern_type.clone(), severity),
                AlertRule {
                    rule_id,
                    priority,
                    auto_open: entry.auto_open,
                },
            );
        }
        Self { rules }
    }

    pub fn lookup(&self, pattern_type: &str, severity: Severity) -> Option<&AlertRule> {
        self.rules.get(&(pattern_type.to_string(), severity))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn parse_severity(s: &str) -> Option<Severity> {
    match s.to_ascii_lowercase().as_str() {
        "low" => Some(Severity::Low),
        "medium" => Some(Severity::Medium),
        "high" => Some(Severity::High),
        "critical" => Some(Severity::Critical),
        _ => None,
    }
}

fn parse_priority(s: &str) -> Option<Priority> {
    match s.to_ascii_uppercase().as_str() {
        "LOW" => Some(Priority::Low),
        "MEDIUM" => Some(Priority::Medium),
        "HIGH" => Some(Priority::High),
        "CRITICAL" => Some(Priority::Critical),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_maps_smurfing_high() {
        let table = AlertRuleTable::from_config(&AlertsConfig::default());
        let rule = table.lookup("smurfing", Severity::High).unwrap();
        assert_eq!(rule.priority, Priority::High);
        assert!(rule.auto_open);
        assert_eq!(rule.rule_id, "smurfing/high");
    }

    #[test]
    fn unknown_combination_has_no_rule() {
        let table = AlertRuleTable::from_config(&AlertsConfig::default());
        assert!(table.lookup("teleportation", Severity::High).is_none());
    }
}
