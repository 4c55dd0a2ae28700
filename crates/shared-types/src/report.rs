//! Validation report types
//!
//! Reports aggregate bottom-up: violations per rule into `ValidationResult`,
//! results per MCP file into `McpValidationReport`, file reports per building
//! into `ComplianceReport`. Every report is built fresh per validation call
//! and never mutated after return.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rule::{Jurisdiction, RuleCategory, Severity};

/// One failed-condition instance tied to a specific object and rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub code_reference: Option<String>,
    pub object_id: String,
    pub object_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of one calculation action. The formula string is retained as debug
/// metadata; results are keyed by the action's `output_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationOutcome {
    pub formula: String,
    pub result: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub rule_id: String,
    pub rule_name: String,
    pub category: RuleCategory,
    /// A rule passes when it produced no Error-severity violations.
    pub passed: bool,
    pub violations: Vec<ValidationViolation>,
    pub calculations: BTreeMap<String, CalculationOutcome>,
}

impl ValidationResult {
    pub fn warning_count(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| v.severity == Severity::Warning)
            .count()
    }
}

/// Per-MCP-file aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpValidationReport {
    pub mcp_id: String,
    pub mcp_name: String,
    pub jurisdiction: Jurisdiction,
    pub validation_date: DateTime<Utc>,
    pub total_rules: usize,
    pub passed_rules: usize,
    pub failed_rules: usize,
    pub total_violations: usize,
    pub total_warnings: usize,
    pub results: Vec<ValidationResult>,
}

/// Per-building aggregate across all applicable MCP files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub building_id: String,
    pub building_name: String,
    /// `passed_rules / total_rules * 100`, equal weight per rule.
    pub overall_compliance_score: f64,
    /// Count of Error-severity violations across all files.
    pub critical_violations: usize,
    pub total_violations: usize,
    pub total_warnings: usize,
    pub validation_reports: Vec<McpValidationReport>,
    pub recommendations: Vec<String>,
}

impl ComplianceReport {
    /// Flat view over every violation in every file report.
    pub fn violations(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.validation_reports
            .iter()
            .flat_map(|r| r.results.iter())
            .flat_map(|r| r.violations.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_violation(severity: Severity) -> ValidationViolation {
        ValidationViolation {
            rule_id: "E-101".into(),
            rule_name: "Outlet load limit".into(),
            severity,
            message: "load exceeds circuit rating".into(),
            code_reference: Some("NEC 210.21".into()),
            object_id: "outlet-1".into(),
            object_type: "electrical_outlet".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_warning_count() {
        let result = ValidationResult {
            rule_id: "E-101".into(),
            rule_name: "Outlet load limit".into(),
            category: RuleCategory::Electrical,
            passed: false,
            violations: vec![
                sample_violation(Severity::Error),
                sample_violation(Severity::Warning),
                sample_violation(Severity::Warning),
            ],
            calculations: BTreeMap::new(),
        };
        assert_eq!(result.warning_count(), 2);
    }

    #[test]
    fn test_report_serialization_shape() {
        let report = ComplianceReport {
            building_id: "b1".into(),
            building_name: "Annex".into(),
            overall_compliance_score: 87.5,
            critical_violations: 1,
            total_violations: 3,
            total_warnings: 2,
            validation_reports: vec![],
            recommendations: vec!["Verify NEC 210.21 circuit ratings.".into()],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["overall_compliance_score"], 87.5);
        assert_eq!(json["critical_violations"], 1);
        assert!(json["validation_reports"].as_array().unwrap().is_empty());
    }
}
