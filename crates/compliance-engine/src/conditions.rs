//! Rule condition matching.
//!
//! A rule's top-level conditions narrow the candidate set sequentially (an
//! implicit AND). Matching is total: a type mismatch or missing property
//! excludes the object and is logged at debug, never raised as an error.

use std::collections::{HashSet, VecDeque};

use shared_types::{
    BuildingModel, CompareOp, CompositeOp, McpRule, PropertyValue, RuleCondition,
};
use tracing::{debug, warn};

use crate::spatial::SpatialAnalyzer;

/// Maximum composite nesting. Checked at load time and enforced again here
/// so a hand-built rule cannot recurse unboundedly.
pub const MAX_COMPOSITE_DEPTH: usize = 8;

/// Maximum `connections` hops for relationship conditions.
pub const MAX_TRAVERSAL_DEPTH: usize = 4;

/// Matches rule conditions against one model. Borrowed per validation run.
pub struct ConditionMatcher<'a> {
    model: &'a BuildingModel,
    analyzer: &'a SpatialAnalyzer,
}

impl<'a> ConditionMatcher<'a> {
    pub fn new(model: &'a BuildingModel, analyzer: &'a SpatialAnalyzer) -> Self {
        Self { model, analyzer }
    }

    /// Indices (into `model.objects`, in declaration order) of the objects
    /// matching every condition of the rule. A rule with no conditions
    /// matches nothing.
    pub fn match_rule(&self, rule: &McpRule) -> Vec<usize> {
        if rule.conditions.is_empty() {
            return Vec::new();
        }
        let all: Vec<usize> = (0..self.model.objects.len()).collect();
        self.narrow(&rule.conditions, all)
    }

    /// Narrow an explicit candidate set through a condition list. Exposed so
    /// parallel execution can match over object chunks.
    pub fn narrow(&self, conditions: &[RuleCondition], mut candidates: Vec<usize>) -> Vec<usize> {
        for condition in conditions {
            if candidates.is_empty() {
                break;
            }
            candidates = self.apply(condition, &candidates, 1);
        }
        candidates
    }

    fn apply(&self, condition: &RuleCondition, candidates: &[usize], depth: usize) -> Vec<usize> {
        if depth > MAX_COMPOSITE_DEPTH {
            warn!(depth, "composite condition exceeds nesting limit, matching nothing");
            return Vec::new();
        }

        match condition {
            RuleCondition::Property {
                element_type,
                property,
                operator,
                value,
            } => candidates
                .iter()
                .copied()
                .filter(|i| {
                    let object = &self.model.objects[*i];
                    object.object_type == *element_type
                        && self.property_matches(object, property, *operator, value)
                })
                .collect(),

            RuleCondition::Spatial {
                element_type,
                relationship,
                target_type,
                max_distance,
            } => candidates
                .iter()
                .copied()
                .filter(|i| {
                    let object = &self.model.objects[*i];
                    object.object_type == *element_type
                        && self.analyzer.relates_to_type(
                            &object.object_id,
                            *relationship,
                            target_type,
                            *max_distance,
                        )
                })
                .collect(),

            RuleCondition::Relationship {
                element_type,
                relationship: _,
                target_type,
            } => candidates
                .iter()
                .copied()
                .filter(|i| {
                    let object = &self.model.objects[*i];
                    object.object_type == *element_type
                        && self.connected_to_type(*i, target_type)
                })
                .collect(),

            RuleCondition::Composite {
                operator,
                conditions,
            } => match operator {
                CompositeOp::And => {
                    let mut set = candidates.to_vec();
                    for sub in conditions {
                        if set.is_empty() {
                            break;
                        }
                        set = self.apply(sub, &set, depth + 1);
                    }
                    set
                }
                CompositeOp::Or => {
                    // Order-preserving union over the original candidate
                    // order, so results are stable across chunkings.
                    let mut seen = HashSet::new();
                    for sub in conditions {
                        for i in self.apply(sub, candidates, depth + 1) {
                            seen.insert(i);
                        }
                    }
                    candidates
                        .iter()
                        .copied()
                        .filter(|i| seen.contains(i))
                        .collect()
                }
            },
        }
    }

    fn property_matches(
        &self,
        object: &shared_types::BuildingObject,
        property: &str,
        operator: CompareOp,
        expected: &PropertyValue,
    ) -> bool {
        let Some(actual) = object.property(property) else {
            debug!(
                object_id = %object.object_id,
                property,
                "property missing, object excluded"
            );
            return false;
        };

        match compare(operator, actual, expected) {
            Some(result) => result,
            None => {
                debug!(
                    object_id = %object.object_id,
                    property,
                    actual_kind = actual.kind(),
                    expected_kind = expected.kind(),
                    "property type mismatch, object excluded"
                );
                false
            }
        }
    }

    /// Breadth-first search over `connections`, bounded by
    /// `MAX_TRAVERSAL_DEPTH` hops and a visited set. The graph may contain
    /// cycles and dangling ids.
    fn connected_to_type(&self, start: usize, target_type: &str) -> bool {
        let start_id = &self.model.objects[start].object_id;
        let mut visited: HashSet<&str> = HashSet::from([start_id.as_str()]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(start_id.as_str(), 0)]);

        while let Some((id, hops)) = queue.pop_front() {
            if hops >= MAX_TRAVERSAL_DEPTH {
                continue;
            }
            let Some(object) = self.model.object_by_id(id) else {
                continue;
            };
            for next_id in &object.connections {
                if !visited.insert(next_id.as_str()) {
                    continue;
                }
                if let Some(next) = self.model.object_by_id(next_id) {
                    if next.object_type == target_type {
                        return true;
                    }
                }
                queue.push_back((next_id.as_str(), hops + 1));
            }
        }
        false
    }
}

/// `None` means the operand types do not support the operator.
fn compare(operator: CompareOp, actual: &PropertyValue, expected: &PropertyValue) -> Option<bool> {
    match operator {
        CompareOp::Eq => Some(values_equal(actual, expected)),
        CompareOp::Ne => Some(!values_equal(actual, expected)),
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            let a = actual.as_number().ok()?;
            let b = expected.as_number().ok()?;
            Some(match operator {
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                _ => unreachable!(),
            })
        }
        CompareOp::In => match expected {
            PropertyValue::List(items) => Some(items.iter().any(|v| values_equal(actual, v))),
            PropertyValue::Text(haystack) => {
                let needle = actual.as_text().ok()?;
                Some(haystack.contains(needle))
            }
            _ => None,
        },
    }
}

fn values_equal(a: &PropertyValue, b: &PropertyValue) -> bool {
    match (a, b) {
        (PropertyValue::Number(x), PropertyValue::Number(y)) => x == y,
        (PropertyValue::Text(x), PropertyValue::Text(y)) => x == y,
        (PropertyValue::Bool(x), PropertyValue::Bool(y)) => x == y,
        (PropertyValue::List(x), PropertyValue::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        _ => false,
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
                     "properties": {"load": 20, "gfci": true},
                     "connections": ["p1"]},
                    {"object_id": "o2", "object_type": "electrical_outlet",
                     "properties": {"load": 50, "gfci": false},
                     "connections": ["o1"]},
                    {"object_id": "o3", "object_type": "electrical_outlet",
                     "properties": {"load": "heavy"}},
                    {"object_id": "p1", "object_type": "electrical_panel",
                     "properties": {"rating": 200},
                     "connections": ["o1"]},
                    {"object_id": "r1", "object_type": "room",
                     "properties": {"usage": "kitchen"},
                     "location": {"x": 0, "y": 0, "z": 0, "width": 10, "height": 3, "depth": 8}},
                    {"object_id": "s1", "object_type": "sprinkler",
                     "location": {"x": 2, "y": 2, "z": 2.5, "width": 0.2, "height": 0.2, "depth": 0.2}}
                ]
            }"#,
        )
        .unwrap()
    }

    fn rule(conditions: Vec<RuleCondition>) -> McpRule {
        McpRule {
            rule_id: "T-1".into(),
            name: "test".into(),
            description: None,
            category: RuleCategory::Electrical,
            priority: 10,
            conditions,
            actions: vec![],
            enabled: true,
        }
    }

    fn property_cond(element_type: &str, property: &str, op: &str, value: serde_json::Value) -> RuleCondition {
        serde_json::from_value(serde_json::json!({
            "type": "property",
            "element_type": element_type,
            "property": property,
            "operator": op,
            "value": value
        }))
        .unwrap()
    }

    fn matched_ids(m: &BuildingModel, indices: &[usize]) -> Vec<String> {
        indices.iter().map(|i| m.objects[*i].object_id.clone()).collect()
    }

    #[test]
    fn test_property_comparison() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let matcher = ConditionMatcher::new(&m, &analyzer);

        let r = rule(vec![property_cond("electrical_outlet", "load", ">=", 50.0.into())]);
        assert_eq!(matched_ids(&m, &matcher.match_rule(&r)), vec!["o2"]);

        let r = rule(vec![property_cond("electrical_outlet", "gfci", "==", true.into())]);
        assert_eq!(matched_ids(&m, &matcher.match_rule(&r)), vec!["o1"]);
    }

    #[test]
    fn test_type_mismatch_and_missing_property_exclude() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let matcher = ConditionMatcher::new(&m, &analyzer);

        // o3 has a text load, o1/o2 numeric; ">" over text excludes o3.
        let r = rule(vec![property_cond("electrical_outlet", "load", ">", 0.0.into())]);
        assert_eq!(matched_ids(&m, &matcher.match_rule(&r)), vec!["o1", "o2"]);

        // No outlet has "voltage".
        let r = rule(vec![property_cond("electrical_outlet", "voltage", ">", 0.0.into())]);
        assert!(matcher.match_rule(&r).is_empty());
    }

    #[test]
    fn test_in_operator() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let matcher = ConditionMatcher::new(&m, &analyzer);

        let r = rule(vec![property_cond(
            "room",
            "usage",
            "in",
            serde_json::json!(["kitchen", "bathroom"]),
        )]);
        assert_eq!(matched_ids(&m, &matcher.match_rule(&r)), vec!["r1"]);
    }

    #[test]
    fn test_top_level_conditions_narrow() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let matcher = ConditionMatcher::new(&m, &analyzer);

        let r = rule(vec![
            property_cond("electrical_outlet", "load", ">", 0.0.into()),
            property_cond("electrical_outlet", "gfci", "==", false.into()),
        ]);
        assert_eq!(matched_ids(&m, &matcher.match_rule(&r)), vec!["o2"]);
    }

    #[test]
    fn test_empty_conditions_match_nothing() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let matcher = ConditionMatcher::new(&m, &analyzer);
        assert!(matcher.match_rule(&rule(vec![])).is_empty());
    }

    #[test]
    fn test_composite_or_preserves_order() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let matcher = ConditionMatcher::new(&m, &analyzer);

        let composite: RuleCondition = serde_json::from_value(serde_json::json!({
            "type": "composite",
            "operator": "OR",
            "conditions": [
                {"type": "property", "element_type": "electrical_outlet",
                 "property": "gfci", "operator": "==", "value": false},
                {"type": "property", "element_type": "electrical_outlet",
                 "property": "gfci", "operator": "==", "value": true}
            ]
        }))
        .unwrap();
        // Union comes back in declaration order, not sub-condition order.
        let r = rule(vec![composite]);
        assert_eq!(matched_ids(&m, &matcher.match_rule(&r)), vec!["o1", "o2"]);
    }

    #[test]
    fn test_spatial_condition() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let matcher = ConditionMatcher::new(&m, &analyzer);

        let spatial: RuleCondition = serde_json::from_value(serde_json::json!({
            "type": "spatial",
            "element_type": "room",
            "relationship": "contains",
            "target_type": "sprinkler"
        }))
        .unwrap();
        let r = rule(vec![spatial]);
        assert_eq!(matched_ids(&m, &matcher.match_rule(&r)), vec!["r1"]);
    }

    #[test]
    fn test_relationship_traversal_multi_hop() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let matcher = ConditionMatcher::new(&m, &analyzer);

        // o2 -> o1 -> p1, two hops.
        let relationship: RuleCondition = serde_json::from_value(serde_json::json!({
            "type": "relationship",
            "element_type": "electrical_outlet",
            "relationship": "connected_to",
            "target_type": "electrical_panel"
        }))
        .unwrap();
        let r = rule(vec![relationship]);
        assert_eq!(matched_ids(&m, &matcher.match_rule(&r)), vec!["o1", "o2"]);
    }

    #[test]
    fn test_relationship_traversal_is_cycle_safe() {
        // o1 <-> p1 is a cycle; traversal must terminate and o3 (no
        // connections) must not match.
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let matcher = ConditionMatcher::new(&m, &analyzer);

        let relationship: RuleCondition = serde_json::from_value(serde_json::json!({
            "type": "relationship",
            "element_type": "electrical_panel",
            "relationship": "connected_to",
            "target_type": "water_heater"
        }))
        .unwrap();
        let r = rule(vec![relationship]);
        assert!(matcher.match_rule(&r).is_empty());
    }

    #[test]
    fn test_excessive_nesting_matches_nothing() {
        let m = model();
        let analyzer = SpatialAnalyzer::new(&m);
        let matcher = ConditionMatcher::new(&m, &analyzer);

        let mut cond = property_cond("electrical_outlet", "load", ">", 0.0.into());
        for _ in 0..MAX_COMPOSITE_DEPTH + 1 {
            cond = RuleCondition::Composite {
                operator: CompositeOp::And,
                conditions: vec![cond],
            };
        }
        let r = rule(vec![cond]);
        assert!(matcher.match_rule(&r).is_empty());
    }
}
