//! MCP file and building model loading.
//!
//! Rule files load leniently: every definition problem in a file is
//! collected into the outcome and malformed rules are skipped, so one bad
//! rule never blocks the rest of the file. Only a malformed top-level
//! envelope, or a malformed building model, is a hard failure.

use std::collections::HashSet;

use serde_json::Value;
use shared_types::{BuildingModel, McpFile, McpRule, RuleAction};
use tracing::info;

use crate::conditions::MAX_COMPOSITE_DEPTH;
use crate::error::{EngineError, RuleDefinitionError};

/// A loaded file plus every definition problem found in it. Rules that
/// produced a skip-level error are absent from `file.rules`.
#[derive(Debug)]
pub struct LoadOutcome {
    pub file: McpFile,
    pub errors: Vec<RuleDefinitionError>,
}

pub fn load_building_model(json: &str) -> Result<BuildingModel, EngineError> {
    serde_json::from_str(json).map_err(|e| EngineError::InvalidModel(e.to_string()))
}

pub fn load_mcp_file(json: &str) -> Result<LoadOutcome, EngineError> {
    let raw: Value =
        serde_json::from_str(json).map_err(|e| EngineError::InvalidMcpFile(e.to_string()))?;
    parse_mcp_value(raw)
}

fn parse_mcp_value(mut raw: Value) -> Result<LoadOutcome, EngineError> {
    let raw_rules = match raw.get_mut("rules") {
        Some(Value::Array(rules)) => std::mem::take(rules),
        _ => return Err(EngineError::InvalidMcpFile("missing rules array".into())),
    };

    // Parse the envelope without the rules so one malformed rule cannot
    // fail the whole file.
    raw["rules"] = Value::Array(Vec::new());
    let mut file: McpFile = serde_json::from_value(raw)
        .map_err(|e| EngineError::InvalidMcpFile(e.to_string()))?;
    if file.mcp_id.is_empty() {
        return Err(EngineError::InvalidMcpFile("empty mcp_id".into()));
    }

    let mut errors = Vec::new();
    for (index, raw_rule) in raw_rules.into_iter().enumerate() {
        let rule_id = raw_rule
            .get("rule_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let push_error = |errors: &mut Vec<RuleDefinitionError>, message: String| {
            errors.push(RuleDefinitionError {
                mcp_id: file.mcp_id.clone(),
                rule_index: index,
                rule_id: rule_id.clone(),
                message,
            });
        };

        let rule: McpRule = match serde_json::from_value(raw_rule) {
            Ok(rule) => rule,
            Err(e) => {
                push_error(&mut errors, e.to_string());
                continue;
            }
        };

        let mut skip = false;
        if rule.rule_id.is_empty() {
            push_error(&mut errors, "empty rule_id".into());
            skip = true;
        }
        if rule.name.is_empty() {
            push_error(&mut errors, "empty rule name".into());
            skip = true;
        }
        if rule.priority == 0 {
            push_error(&mut errors, "priority must be greater than zero".into());
            skip = true;
        }
        if rule.conditions.is_empty() {
            push_error(&mut errors, "rule has no conditions".into());
            skip = true;
        }
        if rule.actions.is_empty() {
            push_error(&mut errors, "rule has no actions".into());
            skip = true;
        }
        if let Some(depth) = rule
            .conditions
            .iter()
            .map(|c| c.nesting_depth())
            .max()
            .filter(|d| *d > MAX_COMPOSITE_DEPTH)
        {
            push_error(
                &mut errors,
                format!(
                    "composite nesting depth {} exceeds limit {}",
                    depth, MAX_COMPOSITE_DEPTH
                ),
            );
            skip = true;
        }

        // Duplicate outputs are flagged but the rule still loads; the
        // executor applies last write wins at runtime.
        let mut outputs = HashSet::new();
        for action in &rule.actions {
            if let RuleAction::Calculation { output_name, .. } = action {
                if !outputs.insert(output_name.as_str()) {
                    push_error(
                        &mut errors,
                        format!("duplicate calculation output: {}", output_name),
                    );
                }
            }
        }

        if !skip {
            file.rules.push(rule);
        }
    }

    info!(
        mcp_id = %file.mcp_id,
        loaded = file.rules.len(),
        errors = errors.len(),
        "MCP file loaded"
    );
    Ok(LoadOutcome { file, errors })
}
