//! Ruleset registry and jurisdiction resolution.
//!
//! MCP files register under their jurisdiction key. Resolution walks the
//! chain country, state, city from broad to specific and layers amendments:
//! an amendment rule with a colliding `rule_id` replaces the broader rule,
//! a new `rule_id` appends. An unknown jurisdiction falls back to the
//! broadest available rules with a warning, never a failure.

use std::collections::HashMap;
use std::sync::Arc;

use shared_types::{Jurisdiction, McpFile, McpRule};
use tracing::{info, warn};

/// Outcome of resolving a jurisdiction to its effective rule list.
#[derive(Debug, Clone)]
pub struct ResolvedRuleset {
    pub jurisdiction: Jurisdiction,
    /// Most specific jurisdiction key that contributed rules.
    pub matched_key: Option<String>,
    /// Contributing files, broadest first.
    pub files: Vec<Arc<McpFile>>,
    /// Layered rules in effective order.
    pub rules: Vec<McpRule>,
    /// True when the requested level had no files and broader rules were
    /// used instead.
    pub fallback: bool,
}

#[derive(Default)]
pub struct RulesetRegistry {
    files: HashMap<String, Arc<McpFile>>,
    by_jurisdiction: HashMap<String, Vec<String>>,
}

impl RulesetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file under its id and jurisdiction key. Re-registering an
    /// id replaces the previous version.
    pub fn register(&mut self, file: McpFile) {
        let key = file.jurisdiction.key();
        let mcp_id = file.mcp_id.clone();
        info!(mcp_id = %mcp_id, jurisdiction = %key, rules = file.rules.len(), "ruleset registered");

        if self.files.insert(mcp_id.clone(), Arc::new(file)).is_none() {
            self.by_jurisdiction.entry(key).or_default().push(mcp_id);
        }
    }

    pub fn get(&self, mcp_id: &str) -> Option<Arc<McpFile>> {
        self.files.get(mcp_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Keys from broadest to most specific for a jurisdiction, e.g.
    /// `["US", "US-CA", "US-CA-SF"]`.
    fn key_chain(jurisdiction: &Jurisdiction) -> Vec<String> {
        let mut chain = vec![jurisdiction.clone()];
        while let Some(parent) = chain.last().and_then(|j| j.parent()) {
            chain.push(parent);
        }
        chain.reverse();
        chain.into_iter().map(|j| j.key()).collect()
    }

    /// Effective rules for a jurisdiction with amendment layering.
    pub fn resolve(&self, jurisdiction: &Jurisdiction) -> ResolvedRuleset {
        let chain = Self::key_chain(jurisdiction);
        let requested_key = chain.last().cloned().unwrap_or_default();

        let mut files: Vec<Arc<McpFile>> = Vec::new();
        let mut matched_key = None;
        for key in &chain {
            if let Some(ids) = self.by_jurisdiction.get(key) {
                matched_key = Some(key.clone());
                for id in ids {
                    if let Some(file) = self.files.get(id) {
                        files.push(file.clone());
                    }
                }
            }
        }

        let mut rules: Vec<McpRule> = Vec::new();
        for file in &files {
            for rule in &file.rules {
                match rules.iter_mut().find(|r| r.rule_id == rule.rule_id) {
                    // Amendment replaces the broader rule in place, keeping
                    // its position in the effective order.
                    Some(existing) => *existing = rule.clone(),
                    None => rules.push(rule.clone()),
                }
            }
        }

        let fallback = matched_key.as_deref() != Some(requested_key.as_str());
        if files.is_empty() {
            warn!(jurisdiction = %requested_key, "no rulesets for jurisdiction");
        } else if fallback {
            warn!(
                jurisdiction = %requested_key,
                matched = matched_key.as_deref().unwrap_or(""),
                "jurisdiction not found, using broader rules"
            );
        }

        ResolvedRuleset {
            jurisdiction: jurisdiction.clone(),
            matched_key,
            files,
            rules,
            fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn file(mcp_id: &str, jurisdiction: Jurisdiction, rule_ids: &[(&str, u32)]) -> McpFile {
        let rules = rule_ids
            .iter()
            .map(|(id, priority)| {
                serde_json::from_value(serde_json::json!({
                    "rule_id": id,
                    "name": format!("rule {}", id),
                    "category": "electrical",
                    "priority": priority,
                    "conditions": [],
                    "actions": []
                }))
                .unwrap()
            })
            .collect();
        McpFile {
            mcp_id: mcp_id.into(),
            name: mcp_id.into(),
            jurisdiction,
            version: "2024.1".into(),
            effective_date: None,
            rules,
        }
    }

    fn registry() -> RulesetRegistry {
        let mut r = RulesetRegistry::new();
        r.register(file(
            "nec-base",
            Jurisdiction::country("US"),
            &[("E-101", 10), ("E-102", 20)],
        ));
        r.register(file(
            "ca-amendments",
            Jurisdiction::state("US", "CA"),
            &[("E-102", 30), ("E-200", 5)],
        ));
        r
    }

    #[test]
    fn test_country_resolution_has_base_only() {
        let resolved = registry().resolve(&Jurisdiction::country("US"));
        let ids: Vec<&str> = resolved.rules.iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["E-101", "E-102"]);
        assert!(!resolved.fallback);
        assert_eq!(resolved.matched_key.as_deref(), Some("US"));
    }

    #[test]
    fn test_state_amendment_replaces_and_appends() {
        let resolved = registry().resolve(&Jurisdiction::state("US", "CA"));
        let ids: Vec<&str> = resolved.rules.iter().map(|r| r.rule_id.as_str()).collect();
        // E-102 keeps its base position but carries the amended priority.
        assert_eq!(ids, vec!["E-101", "E-102", "E-200"]);
        let amended = resolved.rules.iter().find(|r| r.rule_id == "E-102").unwrap();
        assert_eq!(amended.priority, 30);
        assert!(!resolved.fallback);
    }

    #[test]
    fn test_unknown_state_falls_back_to_country() {
        let resolved = registry().resolve(&Jurisdiction::state("US", "WY"));
        let ids: Vec<&str> = resolved.rules.iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["E-101", "E-102"]);
        assert!(resolved.fallback);
        assert_eq!(resolved.matched_key.as_deref(), Some("US"));
    }

    #[test]
    fn test_unknown_country_is_empty_not_error() {
        let resolved = registry().resolve(&Jurisdiction::country("FR"));
        assert!(resolved.rules.is_empty());
        assert!(resolved.matched_key.is_none());
    }

    #[test]
    fn test_city_layering_over_state_and_country() {
        let mut r = registry();
        r.register(file(
            "sf-amendments",
            Jurisdiction::city("US", "CA", "SF"),
            &[("E-101", 99)],
        ));
        let resolved = r.resolve(&Jurisdiction::city("US", "CA", "SF"));
        let amended = resolved.rules.iter().find(|r| r.rule_id == "E-101").unwrap();
        assert_eq!(amended.priority, 99);
        assert_eq!(resolved.files.len(), 3);
        assert_eq!(resolved.matched_key.as_deref(), Some("US-CA-SF"));
    }

    #[test]
    fn test_reregister_replaces_file() {
        let mut r = registry();
        r.register(file("nec-base", Jurisdiction::country("US"), &[("E-101", 11)]));
        assert_eq!(r.len(), 2);
        let resolved = r.resolve(&Jurisdiction::country("US"));
        assert_eq!(resolved.rules.len(), 1);
        assert_eq!(resolved.rules[0].priority, 11);
    }
}
