//! Rule action execution.
//!
//! Actions run in declaration order against the matched object set.
//! Violation-style actions emit one violation per matched object;
//! calculation actions evaluate a formula over aggregates of the matched
//! set and feed their result to later actions in the same rule. A failing
//! action degrades to no output and never aborts the rule.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use shared_types::{
    BuildingModel, BuildingObject, CalculationOutcome, McpRule, RuleAction, Severity,
    ValidationResult, ValidationViolation,
};
use tracing::warn;

use crate::formula::{self, FormulaContext};
use crate::spatial::SpatialAnalyzer;

/// Executes the actions of matched rules. Stateless; borrowed per run.
pub struct ActionExecutor<'a> {
    model: &'a BuildingModel,
    analyzer: &'a SpatialAnalyzer,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(model: &'a BuildingModel, analyzer: &'a SpatialAnalyzer) -> Self {
        Self { model, analyzer }
    }

    /// Run every action of `rule` against the matched object indices,
    /// producing the rule's `ValidationResult`.
    pub fn execute(&self, rule: &McpRule, matched: &[usize]) -> ValidationResult {
        let matched_objects: Vec<&BuildingObject> =
            matched.iter().map(|i| &self.model.objects[*i]).collect();

        let mut violations = Vec::new();
        let mut calculations: BTreeMap<String, CalculationOutcome> = BTreeMap::new();

        for action in &rule.actions {
            match action {
                RuleAction::Validation {
                    message,
                    severity,
                    code_reference,
                } => self.emit_violations(
                    rule,
                    &matched_objects,
                    message,
                    *severity,
                    code_reference,
                    &mut violations,
                ),
                RuleAction::Warning {
                    message,
                    code_reference,
                } => self.emit_violations(
                    rule,
                    &matched_objects,
                    message,
                    Severity::Warning,
                    code_reference,
                    &mut violations,
                ),
                RuleAction::Error {
                    message,
                    code_reference,
                } => self.emit_violations(
                    rule,
                    &matched_objects,
                    message,
                    Severity::Error,
                    code_reference,
                    &mut violations,
                ),
                RuleAction::Calculation {
                    formula,
                    unit,
                    output_name,
                } => {
                    let ctx = self.build_context(&matched_objects, &calculations);
                    match formula::evaluate(formula, &ctx) {
                        Ok(result) => {
                            if calculations.contains_key(output_name) {
                                warn!(
                                    rule_id = %rule.rule_id,
                                    output_name,
                                    "duplicate calculation output, last write wins"
                                );
                            }
                            calculations.insert(
                                output_name.clone(),
                                CalculationOutcome {
                                    formula: formula.clone(),
                                    result,
                                    unit: unit.clone(),
                                },
                            );
                        }
                        Err(err) => {
                            warn!(
                                rule_id = %rule.rule_id,
                                output_name,
                                error = %err,
                                "calculation failed, skipping output"
                            );
                        }
                    }
                }
            }
        }

        let passed = !violations.iter().any(|v| v.severity == Severity::Error);
        ValidationResult {
            rule_id: rule.rule_id.clone(),
            rule_name: rule.name.clone(),
            category: rule.category,
            passed,
            violations,
            calculations,
        }
    }

    fn emit_violations(
        &self,
        rule: &McpRule,
        matched: &[&BuildingObject],
        message: &str,
        severity: Severity,
        code_reference: &Option<String>,
        out: &mut Vec<ValidationViolation>,
    ) {
        for object in matched {
            out.push(ValidationViolation {
                rule_id: rule.rule_id.clone(),
                rule_name: rule.name.clone(),
                severity,
                message: message.to_string(),
                code_reference: code_reference.clone(),
                object_id: object.object_id.clone(),
                object_type: object.object_type.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Aggregate variables over the matched set: `count`, geometric sums
    /// from the spatial analyzer and locations, per-property numeric sums,
    /// and every prior calculation result by output name.
    fn build_context(
        &self,
        matched: &[&'a BuildingObject],
        calculations: &BTreeMap<String, CalculationOutcome>,
    ) -> FormulaContext<'a> {
        let mut ctx = FormulaContext::with_model(&self.model.objects);
        ctx.set_variable("count", matched.len() as f64);

        let mut area = 0.0;
        let mut volume = 0.0;
        let mut width = 0.0;
        let mut height = 0.0;
        let mut depth = 0.0;
        let mut perimeter = 0.0;
        for object in matched {
            if let Some(spatial) = self.analyzer.object(&object.object_id) {
                area += spatial.area;
                volume += spatial.volume;
            }
            if let Some(loc) = &object.location {
                width += loc.width;
                height += loc.height;
                depth += loc.depth;
                perimeter += 2.0 * (loc.width + loc.depth);
            }
        }
        ctx.set_variable("area", area);
        ctx.set_variable("volume", volume);
        ctx.set_variable("width", width);
        ctx.set_variable("height", height);
        ctx.set_variable("depth", depth);
        ctx.set_variable("perimeter", perimeter);

        let mut property_sums: HashMap<&str, f64> = HashMap::new();
        for object in matched {
            for (name, value) in &object.properties {
                if let Ok(n) = value.as_number() {
                    *property_sums.entry(name.as_str()).or_insert(0.0) += n;
                }
            }
        }
        for (name, sum) in property_sums {
            ctx.set_variable(name, sum);
        }

        for (output_name, outcome) in calculations {
            ctx.set_variable(output_name.clone(), outcome.result);
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::RuleCategory;

    fn model() -> BuildingModel {
        serde_json::from_str(
            r#"{
                "building_id": "b1",
                "building_name": "Test",
                "objects": [
                    {"object_id": "o1", "object_type": "electrical_outlet",
                     "properties": {"load": 20},
                     "location": {"x": 0, "y": 0, "z": 0, "width": 0.1, "height": 0.1, "depth": 0.1}},
                    {"object_id": "o2", "object_type": "electrical_outlet",
                     "properties": {"load": 30},
                     "location": {"x": 5, "y": 0, "z": 0, "width": 0.1, "height": 0.1, "depth": 0.1}}
                ]
            }"#,
        )
        .unwrap()
    }

    fn rule(actions: Vec<RuleAction>) -> McpRule {
        McpRule {
            rule_id: "E-101".into(),
            name: "Outlet load".into(),
            description: None,
            category: RuleCategory::Electrical,
            priority: 10,
            conditions: vec![],
            actions,
            enabled: true,
        }
    }

    fn action(json: serde_json::Value) -> RuleAction {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_violation_per_matched_object() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let executor = ActionExecutor::new(&m, &analyzer);

        let r = rule(vec![action(serde_json::json!({
            "type": "validation",
            "message": "load too high",
            "severity": "error",
            "code_reference": "NEC 210.21"
        }))]);

        let result = executor.execute(&r, &[0, 1]);
        assert_eq!(result.violations.len(), 2);
        assert!(!result.passed);
        assert_eq!(result.violations[0].object_id, "o1");
        assert_eq!(result.violations[1].object_id, "o2");
    }

    #[test]
    fn test_empty_match_produces_no_violations_and_passes() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let executor = ActionExecutor::new(&m, &analyzer);

        let r = rule(vec![action(serde_json::json!({
            "type": "error",
            "message": "never fires"
        }))]);

        let result = executor.execute(&r, &[]);
        assert!(result.violations.is_empty());
        assert!(result.passed);
    }

    #[test]
    fn test_warning_action_does_not_fail_rule() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let executor = ActionExecutor::new(&m, &analyzer);

        let r = rule(vec![action(serde_json::json!({
            "type": "warning",
            "message": "consider a dedicated circuit"
        }))]);

        let result = executor.execute(&r, &[0]);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].severity, Severity::Warning);
        assert!(result.passed);
    }

    #[test]
    fn test_calculation_over_matched_aggregates() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let executor = ActionExecutor::new(&m, &analyzer);

        let r = rule(vec![action(serde_json::json!({
            "type": "calculation",
            "formula": "load * 1.25",
            "unit": "W",
            "output_name": "design_load"
        }))]);

        let result = executor.execute(&r, &[0, 1]);
        let outcome = &result.calculations["design_load"];
        assert!((outcome.result - 62.5).abs() < 1e-9); // (20 + 30) * 1.25
        assert_eq!(outcome.unit.as_deref(), Some("W"));
    }

    #[test]
    fn test_calculation_results_feed_later_actions() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let executor = ActionExecutor::new(&m, &analyzer);

        let r = rule(vec![
            action(serde_json::json!({
                "type": "calculation",
                "formula": "load",
                "output_name": "total_load"
            })),
            action(serde_json::json!({
                "type": "calculation",
                "formula": "total_load / count",
                "output_name": "avg_load"
            })),
        ]);

        let result = executor.execute(&r, &[0, 1]);
        assert!((result.calculations["avg_load"].result - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_output_name_last_write_wins() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let executor = ActionExecutor::new(&m, &analyzer);

        let r = rule(vec![
            action(serde_json::json!({
                "type": "calculation", "formula": "1", "output_name": "x"
            })),
            action(serde_json::json!({
                "type": "calculation", "formula": "2", "output_name": "x"
            })),
        ]);

        let result = executor.execute(&r, &[0]);
        assert_eq!(result.calculations.len(), 1);
        assert_eq!(result.calculations["x"].result, 2.0);
    }

    #[test]
    fn test_failing_calculation_degrades_without_aborting() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let executor = ActionExecutor::new(&m, &analyzer);

        let r = rule(vec![
            action(serde_json::json!({
                "type": "calculation", "formula": "load + (", "output_name": "broken"
            })),
            action(serde_json::json!({
                "type": "calculation", "formula": "count", "output_name": "still_runs"
            })),
        ]);

        let result = executor.execute(&r, &[0, 1]);
        assert!(!result.calculations.contains_key("broken"));
        assert_eq!(result.calculations["still_runs"].result, 2.0);
    }
}
