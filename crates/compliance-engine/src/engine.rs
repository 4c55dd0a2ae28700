//! Validation engine orchestration.
//!
//! `ValidationEngine` owns the ruleset registry, the report cache, and the
//! metrics sink, and drives the per-file pipeline: match conditions, execute
//! actions, aggregate reports. Rules run by priority descending with
//! declaration order breaking ties; cancellation is cooperative and checked
//! between rules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lazy_static::lazy_static;
use shared_types::{
    BuildingModel, ComplianceReport, Jurisdiction, McpFile, McpRule, McpValidationReport,
    PropertyValue, RuleCondition, Severity, ValidationResult,
};
use tracing::{info, info_span};

use crate::actions::ActionExecutor;
use crate::cache::ReportCache;
use crate::conditions::ConditionMatcher;
use crate::error::EngineError;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::registry::RulesetRegistry;
use crate::spatial::SpatialAnalyzer;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    /// Rayon pool size for parallel validation; 0 uses the rayon default.
    pub worker_count: usize,
    /// Objects per chunk when condition matching is parallelized.
    pub chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 128,
            cache_ttl: Duration::from_secs(300),
            worker_count: 0,
            chunk_size: 250,
        }
    }
}

/// Cooperative cancellation flag shared with a caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-condition outcome from `test_rule`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionCheck {
    pub description: String,
    pub matched: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleTestOutcome {
    pub passed: bool,
    pub condition_results: Vec<ConditionCheck>,
}

lazy_static! {
    /// Code-reference prefix to remediation guidance.
    static ref REMEDIATIONS: Vec<(&'static str, &'static str)> = vec![
        ("NEC", "Review branch circuit loading and overcurrent protection against the National Electrical Code."),
        ("IPC", "Review fixture counts, drainage and venting against the International Plumbing Code."),
        ("IMC", "Review duct sizing and ventilation rates against the International Mechanical Code."),
        ("ASHRAE", "Review ventilation and thermal design against the referenced ASHRAE standard."),
        ("IBC", "Review structural members and load paths against the International Building Code."),
        ("NFPA", "Review fire protection coverage and egress against the referenced NFPA standard."),
        ("ADA", "Review clearances and reach ranges against ADA accessibility requirements."),
        ("IECC", "Review envelope and equipment efficiency against the International Energy Conservation Code."),
    ];
}

pub struct ValidationEngine {
    registry: RulesetRegistry,
    cache: ReportCache,
    metrics: Arc<dyn MetricsSink>,
    config: EngineConfig,
}

impl ValidationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_metrics(config, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(config: EngineConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let cache = ReportCache::in_memory(config.cache_capacity, config.cache_ttl);
        Self {
            registry: RulesetRegistry::new(),
            cache,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn register_ruleset(&mut self, file: McpFile) {
        self.registry.register(file);
    }

    pub fn registry(&self) -> &RulesetRegistry {
        &self.registry
    }

    /// Lookup that also returns disabled rules; they are excluded from
    /// validation but stay retrievable for tooling.
    pub fn get_rule(&self, mcp_id: &str, rule_id: &str) -> Option<McpRule> {
        self.registry
            .get(mcp_id)
            .and_then(|f| f.rule(rule_id).cloned())
    }

    pub fn invalidate_cache(&self, building_id: &str) {
        self.cache.invalidate(building_id);
    }

    pub fn validate(
        &self,
        model: &BuildingModel,
        mcp_ids: &[&str],
        token: &CancellationToken,
    ) -> Result<Arc<ComplianceReport>, EngineError> {
        self.validate_as(model, mcp_ids, token, None)
    }

    /// `validate` with an optional verified user id carried into the
    /// tracing span for audit attribution.
    pub fn validate_as(
        &self,
        model: &BuildingModel,
        mcp_ids: &[&str],
        token: &CancellationToken,
        user_id: Option<&str>,
    ) -> Result<Arc<ComplianceReport>, EngineError> {
        let span = info_span!(
            "validate",
            building_id = %model.building_id,
            user_id = user_id.unwrap_or("")
        );
        let _guard = span.enter();

        let files = self.resolve_files(mcp_ids)?;
        self.run(model, &files, token)
    }

    /// Validate against the layered ruleset for a jurisdiction. Fallback to
    /// broader rules is a degrade, never an error.
    pub fn validate_jurisdiction(
        &self,
        model: &BuildingModel,
        jurisdiction: &Jurisdiction,
        token: &CancellationToken,
    ) -> Result<Arc<ComplianceReport>, EngineError> {
        let span = info_span!(
            "validate",
            building_id = %model.building_id,
            jurisdiction = %jurisdiction.key()
        );
        let _guard = span.enter();

        let resolved = self.registry.resolve(jurisdiction);
        let effective = McpFile {
            mcp_id: resolved
                .matched_key
                .clone()
                .unwrap_or_else(|| jurisdiction.key()),
            name: format!("Effective rules for {}", jurisdiction.key()),
            jurisdiction: jurisdiction.clone(),
            version: resolved
                .files
                .iter()
                .map(|f| f.version.as_str())
                .collect::<Vec<_>>()
                .join("+"),
            effective_date: None,
            rules: resolved.rules,
        };
        self.run(model, &[Arc::new(effective)], token)
    }

    pub(crate) fn cache(&self) -> &ReportCache {
        &self.cache
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub(crate) fn resolve_files(&self, mcp_ids: &[&str]) -> Result<Vec<Arc<McpFile>>, EngineError> {
        mcp_ids
            .iter()
            .map(|id| {
                self.registry
                    .get(id)
                    .ok_or_else(|| EngineError::RulesetNotLoaded((*id).to_string()))
            })
            .collect()
    }

    pub(crate) fn run(
        &self,
        model: &BuildingModel,
        files: &[Arc<McpFile>],
        token: &CancellationToken,
    ) -> Result<Arc<ComplianceReport>, EngineError> {
        let file_refs: Vec<&McpFile> = files.iter().map(Arc::as_ref).collect();
        let key = ReportCache::key(model, &file_refs);
        if let Some(hit) = self.cache.get(&key) {
            self.metrics.increment("cache_hits", 1);
            return Ok(hit);
        }
        self.metrics.increment("cache_misses", 1);

        let analyzer = SpatialAnalyzer::new(model);
        let matcher = ConditionMatcher::new(model, &analyzer);
        let executor = ActionExecutor::new(model, &analyzer);

        let mut file_reports = Vec::with_capacity(files.len());
        for file in files {
            let mut results = Vec::new();
            for index in sorted_rule_indices(&file.rules) {
                if token.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                let rule = &file.rules[index];
                let matched = matcher.match_rule(rule);
                results.push(executor.execute(rule, &matched));
            }
            file_reports.push(assemble_file_report(file, results));
        }

        let report = Arc::new(assemble_compliance_report(model, file_reports));
        self.metrics.increment("validations_run", 1);
        self.metrics
            .increment("violations_found", report.total_violations as u64);
        info!(
            building_id = %model.building_id,
            score = report.overall_compliance_score,
            violations = report.total_violations,
            "validation finished"
        );

        self.cache.put(&model.building_id, &key, report.clone());
        Ok(report)
    }

    /// Dry-run a rule's conditions against a synthetic object carrying the
    /// sample properties, one object per referenced element type.
    pub fn test_rule(
        &self,
        rule: &McpRule,
        sample_properties: &HashMap<String, PropertyValue>,
    ) -> RuleTestOutcome {
        let mut element_types = Vec::new();
        for condition in &rule.conditions {
            collect_element_types(condition, &mut element_types);
        }
        element_types.dedup();

        let objects = element_types
            .iter()
            .map(|t| shared_types::BuildingObject {
                object_id: format!("sample-{}", t),
                object_type: t.clone(),
                properties: sample_properties.clone(),
                location: None,
                connections: Vec::new(),
            })
            .collect();
        let model = BuildingModel {
            building_id: "rule-test".into(),
            building_name: "rule-test".into(),
            objects,
            metadata: HashMap::new(),
        };

        let analyzer = SpatialAnalyzer::new(&model);
        let matcher = ConditionMatcher::new(&model, &analyzer);
        let all: Vec<usize> = (0..model.objects.len()).collect();

        let condition_results: Vec<ConditionCheck> = rule
            .conditions
            .iter()
            .map(|condition| ConditionCheck {
                description: describe_condition(condition),
                matched: !matcher.narrow(std::slice::from_ref(condition), all.clone()).is_empty(),
            })
            .collect();

        RuleTestOutcome {
            passed: !condition_results.is_empty() && condition_results.iter().all(|c| c.matched),
            condition_results,
        }
    }
}

/// Indices of enabled rules, priority descending, declaration order breaking
/// ties.
pub(crate) fn sorted_rule_indices(rules: &[McpRule]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..rules.len()).filter(|i| rules[*i].enabled).collect();
    indices.sort_by_key(|i| (std::cmp::Reverse(rules[*i].priority), *i));
    indices
}

pub(crate) fn assemble_file_report(
    file: &McpFile,
    results: Vec<ValidationResult>,
) -> McpValidationReport {
    let passed_rules = results.iter().filter(|r| r.passed).count();
    McpValidationReport {
        mcp_id: file.mcp_id.clone(),
        mcp_name: file.name.clone(),
        jurisdiction: file.jurisdiction.clone(),
        validation_date: Utc::now(),
        total_rules: results.len(),
        passed_rules,
        failed_rules: results.len() - passed_rules,
        total_violations: results.iter().map(|r| r.violations.len()).sum(),
        total_warnings: results.iter().map(|r| r.warning_count()).sum(),
        results,
    }
}

pub(crate) fn assemble_compliance_report(
    model: &BuildingModel,
    validation_reports: Vec<McpValidationReport>,
) -> ComplianceReport {
    let total_rules: usize = validation_reports.iter().map(|r| r.total_rules).sum();
    let passed_rules: usize = validation_reports.iter().map(|r| r.passed_rules).sum();
    let score = if total_rules == 0 {
        0.0
    } else {
        passed_rules as f64 / total_rules as f64 * 100.0
    };

    let critical_violations = validation_reports
        .iter()
        .flat_map(|r| r.results.iter())
        .flat_map(|r| r.violations.iter())
        .filter(|v| v.severity == Severity::Error)
        .count();

    let recommendations = build_recommendations(&validation_reports);

    ComplianceReport {
        building_id: model.building_id.clone(),
        building_name: model.building_name.clone(),
        overall_compliance_score: score,
        critical_violations,
        total_violations: validation_reports.iter().map(|r| r.total_violations).sum(),
        total_warnings: validation_reports.iter().map(|r| r.total_warnings).sum(),
        validation_reports,
        recommendations,
    }
}

/// Remediation texts from the code-reference table, then per-category
/// counts for violations with no recognized reference.
fn build_recommendations(reports: &[McpValidationReport]) -> Vec<String> {
    let mut recommendations: Vec<String> = Vec::new();
    let mut uncovered: Vec<(shared_types::RuleCategory, usize)> = Vec::new();

    for result in reports.iter().flat_map(|r| r.results.iter()) {
        for violation in &result.violations {
            let remediation = violation.code_reference.as_deref().and_then(|reference| {
                REMEDIATIONS
                    .iter()
                    .find(|(prefix, _)| reference.starts_with(prefix))
                    .map(|(_, text)| *text)
            });
            match remediation {
                Some(text) => {
                    if !recommendations.iter().any(|r| r == text) {
                        recommendations.push(text.to_string());
                    }
                }
                None => match uncovered.iter_mut().find(|(c, _)| *c == result.category) {
                    Some((_, count)) => *count += 1,
                    None => uncovered.push((result.category, 1)),
                },
            }
        }
    }

    for (category, count) in uncovered {
        recommendations.push(format!(
            "Address {} {} violation(s) flagged during validation.",
            count,
            category.label()
        ));
    }
    recommendations
}

fn collect_element_types(condition: &RuleCondition, out: &mut Vec<String>) {
    match condition {
        RuleCondition::Property { element_type, .. }
        | RuleCondition::Spatial { element_type, .. }
        | RuleCondition::Relationship { element_type, .. } => {
            if !out.contains(element_type) {
                out.push(element_type.clone());
            }
        }
        RuleCondition::Composite { conditions, .. } => {
            for sub in conditions {
                collect_element_types(sub, out);
            }
        }
    }
}

fn describe_condition(condition: &RuleCondition) -> String {
    match condition {
        RuleCondition::Property {
            element_type,
            property,
            ..
        } => format!("property check on {}.{}", element_type, property),
        RuleCondition::Spatial {
            element_type,
            relationship,
            target_type,
            ..
        } => format!(
            "spatial {:?} between {} and {}",
            relationship, element_type, target_type
        ),
        RuleCondition::Relationship {
            element_type,
            target_type,
            ..
        } => format!("connection from {} to {}", element_type, target_type),
        RuleCondition::Composite {
            operator,
            conditions,
        } => format!("{:?} of {} sub-conditions", operator, conditions.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::RecordingMetrics;
    use std::time::Instant;

    fn model_with_outlets(loads: &[f64]) -> BuildingModel {
        let objects: Vec<serde_json::Value> = loads
            .iter()
            .enumerate()
            .map(|(i, load)| {
                serde_json::json!({
                    "object_id": format!("o{}", i),
                    "object_type": "electrical_outlet",
                    "properties": {"load": load},
                    "location": {"x": (i as f64) * 2.0, "y": 0, "z": 0,
                                 "width": 0.1, "height": 0.1, "depth": 0.1}
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({
            "building_id": "b1",
            "building_name": "Annex",
            "objects": objects
        }))
        .unwrap()
    }

    fn load_rule(rule_id: &str, priority: u32, threshold: f64, enabled: bool) -> serde_json::Value {
        serde_json::json!({
            "rule_id": rule_id,
            "name": format!("load over {}", threshold),
            "category": "electrical",
            "priority": priority,
            "enabled": enabled,
            "conditions": [
                {"type": "property", "element_type": "electrical_outlet",
                 "property": "load", "operator": ">", "value": threshold}
            ],
            "actions": [
                {"type": "error", "message": "overloaded", "code_reference": "NEC 210.21"}
            ]
        })
    }

    fn file_with_rules(rules: Vec<serde_json::Value>) -> McpFile {
        serde_json::from_value(serde_json::json!({
            "mcp_id": "nec-2024",
            "name": "NEC",
            "jurisdiction": {"country": "US"},
            "version": "2024.1",
            "rules": rules
        }))
        .unwrap()
    }

    #[test]
    fn test_rules_run_by_priority_then_declaration_order() {
        let rules: Vec<McpRule> = vec![
            serde_json::from_value(load_rule("low", 1, 0.0, true)).unwrap(),
            serde_json::from_value(load_rule("high-a", 9, 0.0, true)).unwrap(),
            serde_json::from_value(load_rule("high-b", 9, 0.0, true)).unwrap(),
        ];
        let order: Vec<&str> = sorted_rule_indices(&rules)
            .into_iter()
            .map(|i| rules[i].rule_id.as_str())
            .collect();
        assert_eq!(order, vec!["high-a", "high-b", "low"]);
    }

    #[test]
    fn test_disabled_rule_excluded_but_retrievable() {
        let mut engine = ValidationEngine::new(EngineConfig::default());
        engine.register_ruleset(file_with_rules(vec![
            load_rule("on", 5, 100.0, true),
            load_rule("off", 5, 0.0, false),
        ]));

        let model = model_with_outlets(&[20.0]);
        let report = engine
            .validate(&model, &["nec-2024"], &CancellationToken::new())
            .unwrap();

        let results = &report.validation_reports[0].results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_id, "on");
        // The disabled rule would have fired on every outlet.
        assert_eq!(report.total_violations, 0);
        assert!(engine.get_rule("nec-2024", "off").is_some());
    }

    #[test]
    fn test_score_and_critical_count() {
        let mut engine = ValidationEngine::new(EngineConfig::default());
        engine.register_ruleset(file_with_rules(vec![
            load_rule("fails", 5, 10.0, true),
            load_rule("passes", 5, 1000.0, true),
        ]));

        let model = model_with_outlets(&[20.0, 30.0]);
        let report = engine
            .validate(&model, &["nec-2024"], &CancellationToken::new())
            .unwrap();

        assert_eq!(report.overall_compliance_score, 50.0);
        assert_eq!(report.critical_violations, 2);
        assert_eq!(report.total_violations, 2);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("National Electrical Code")));
    }

    #[test]
    fn test_empty_ruleset_scores_zero() {
        let mut engine = ValidationEngine::new(EngineConfig::default());
        engine.register_ruleset(file_with_rules(vec![]));

        let model = model_with_outlets(&[20.0]);
        let report = engine
            .validate(&model, &["nec-2024"], &CancellationToken::new())
            .unwrap();
        assert_eq!(report.overall_compliance_score, 0.0);
        assert_eq!(report.total_violations, 0);
    }

    #[test]
    fn test_unknown_ruleset_id_is_an_error() {
        let engine = ValidationEngine::new(EngineConfig::default());
        let model = model_with_outlets(&[20.0]);
        assert!(matches!(
            engine.validate(&model, &["missing"], &CancellationToken::new()),
            Err(EngineError::RulesetNotLoaded(_))
        ));
    }

    #[test]
    fn test_cancellation_between_rules() {
        let mut engine = ValidationEngine::new(EngineConfig::default());
        engine.register_ruleset(file_with_rules(vec![load_rule("r1", 5, 0.0, true)]));

        let token = CancellationToken::new();
        token.cancel();
        let model = model_with_outlets(&[20.0]);
        assert!(matches!(
            engine.validate(&model, &["nec-2024"], &token),
            Err(EngineError::Cancelled)
        ));
    }

    #[test]
    fn test_jurisdiction_fallback_still_validates() {
        let mut engine = ValidationEngine::new(EngineConfig::default());
        engine.register_ruleset(file_with_rules(vec![load_rule("r1", 5, 10.0, true)]));

        let model = model_with_outlets(&[20.0]);
        let report = engine
            .validate_jurisdiction(
                &model,
                &Jurisdiction::state("US", "WY"),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(report.total_violations, 1);
    }

    #[test]
    fn test_category_fallback_recommendation() {
        let mut engine = ValidationEngine::new(EngineConfig::default());
        let mut rule = load_rule("r1", 5, 10.0, true);
        rule["actions"][0]["code_reference"] = serde_json::Value::Null;
        engine.register_ruleset(file_with_rules(vec![rule]));

        let model = model_with_outlets(&[20.0, 30.0]);
        let report = engine
            .validate(&model, &["nec-2024"], &CancellationToken::new())
            .unwrap();
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("2 electrical violation(s)")));
    }

    #[test]
    fn test_test_rule_outcome() {
        let engine = ValidationEngine::new(EngineConfig::default());
        let rule: McpRule = serde_json::from_value(load_rule("r1", 5, 15.0, true)).unwrap();

        let mut sample = HashMap::new();
        sample.insert("load".to_string(), PropertyValue::Number(20.0));
        let outcome = engine.test_rule(&rule, &sample);
        assert!(outcome.passed);
        assert_eq!(outcome.condition_results.len(), 1);
        assert!(outcome.condition_results[0].matched);

        sample.insert("load".to_string(), PropertyValue::Number(5.0));
        let outcome = engine.test_rule(&rule, &sample);
        assert!(!outcome.passed);
    }

    #[test]
    fn test_cache_hit_is_fast_and_counted() {
        let metrics = Arc::new(RecordingMetrics::default());
        let mut engine =
            ValidationEngine::with_metrics(EngineConfig::default(), metrics.clone());

        // A heavy workload: 1000 located objects and a batch of rules with
        // spatial scans.
        let loads: Vec<f64> = (0..1000).map(|i| (i % 60) as f64).collect();
        let model = model_with_outlets(&loads);
        let mut rules: Vec<serde_json::Value> = (0..10)
            .map(|i| load_rule(&format!("p{}", i), 5, (i * 10) as f64, true))
            .collect();
        for i in 0..10 {
            rules.push(serde_json::json!({
                "rule_id": format!("s{}", i),
                "name": "outlet spacing",
                "category": "electrical",
                "priority": 3,
                "conditions": [
                    {"type": "spatial", "element_type": "electrical_outlet",
                     "relationship": "within_distance", "target_type": "electrical_outlet",
                     "max_distance": 3.0 + i as f64}
                ],
                "actions": [{"type": "warning", "message": "crowded outlets"}]
            }));
        }
        engine.register_ruleset(file_with_rules(rules));

        let token = CancellationToken::new();
        let started = Instant::now();
        let cold = engine.validate(&model, &["nec-2024"], &token).unwrap();
        let cold_time = started.elapsed();

        let started = Instant::now();
        let warm = engine.validate(&model, &["nec-2024"], &token).unwrap();
        let warm_time = started.elapsed();

        assert_eq!(
            cold.overall_compliance_score,
            warm.overall_compliance_score
        );
        assert!(
            warm_time * 10 < cold_time,
            "expected >=10x speedup, cold {:?} warm {:?}",
            cold_time,
            warm_time
        );
        let counters = metrics.counters.lock();
        assert_eq!(counters["cache_misses"], 1);
        assert_eq!(counters["cache_hits"], 1);
    }

    #[test]
    fn test_invalidate_forces_recompute() {
        let metrics = Arc::new(RecordingMetrics::default());
        let mut engine =
            ValidationEngine::with_metrics(EngineConfig::default(), metrics.clone());
        engine.register_ruleset(file_with_rules(vec![load_rule("r1", 5, 10.0, true)]));

        let model = model_with_outlets(&[20.0]);
        let token = CancellationToken::new();
        engine.validate(&model, &["nec-2024"], &token).unwrap();
        engine.invalidate_cache("b1");
        engine.validate(&model, &["nec-2024"], &token).unwrap();

        assert_eq!(metrics.counters.lock()["cache_misses"], 2);
    }
}
