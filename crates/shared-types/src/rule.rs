//! MCP rule file types
//!
//! An MCP file is a jurisdiction-scoped JSON document of building-code rules.
//! Conditions and actions are serde-tagged enums, so an unknown "type" string
//! fails at deserialization instead of falling through a default branch at
//! evaluation time.

use serde::{Deserialize, Serialize};

use crate::model::PropertyValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Electrical,
    Plumbing,
    Hvac,
    Structural,
    FireSafety,
    Accessibility,
    Energy,
    #[serde(other)]
    General,
}

impl RuleCategory {
    pub fn label(&self) -> &'static str {
        match self {
            RuleCategory::Electrical => "electrical",
            RuleCategory::Plumbing => "plumbing",
            RuleCategory::Hvac => "hvac",
            RuleCategory::Structural => "structural",
            RuleCategory::FireSafety => "fire_safety",
            RuleCategory::Accessibility => "accessibility",
            RuleCategory::Energy => "energy",
            RuleCategory::General => "general",
        }
    }
}

/// Comparison operators for property conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "in")]
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompositeOp {
    And,
    Or,
}

/// Spatial relationships a condition can test between two object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialRelationship {
    Intersects,
    Contains,
    Adjacent,
    Near,
    WithinDistance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Compare one property of every object of `element_type`.
    Property {
        element_type: String,
        property: String,
        operator: CompareOp,
        value: PropertyValue,
    },
    /// Test a geometric relationship against objects of `target_type`.
    Spatial {
        element_type: String,
        relationship: SpatialRelationship,
        target_type: String,
        #[serde(default)]
        max_distance: Option<f64>,
    },
    /// Follow `connections` edges looking for an object of `target_type`.
    Relationship {
        element_type: String,
        relationship: String,
        target_type: String,
    },
    /// Combine sub-conditions with AND/OR. Nesting depth is bounded.
    Composite {
        operator: CompositeOp,
        conditions: Vec<RuleCondition>,
    },
}

impl RuleCondition {
    /// Depth of composite nesting: leaves are 1.
    pub fn nesting_depth(&self) -> usize {
        match self {
            RuleCondition::Composite { conditions, .. } => {
                1 + conditions.iter().map(|c| c.nesting_depth()).max().unwrap_or(0)
            }
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Emit a violation with the given severity for each matched object.
    Validation {
        message: String,
        severity: Severity,
        #[serde(default)]
        code_reference: Option<String>,
    },
    /// Shorthand for a Warning-severity validation.
    Warning {
        message: String,
        #[serde(default)]
        code_reference: Option<String>,
    },
    /// Shorthand for an Error-severity validation.
    Error {
        message: String,
        #[serde(default)]
        code_reference: Option<String>,
    },
    /// Evaluate `formula` over the matched set, storing the result under
    /// `output_name` for later actions in the same rule.
    Calculation {
        formula: String,
        #[serde(default)]
        unit: Option<String>,
        output_name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRule {
    pub rule_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: RuleCategory,
    /// Execution priority, highest first. Must be > 0.
    pub priority: u32,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// `{country, state?, city?, county?}` tuple selecting applicable rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Jurisdiction {
    pub country: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub county: Option<String>,
}

impl Jurisdiction {
    pub fn country(country: &str) -> Self {
        Self {
            country: country.to_string(),
            state: None,
            city: None,
            county: None,
        }
    }

    pub fn state(country: &str, state: &str) -> Self {
        Self {
            country: country.to_string(),
            state: Some(state.to_string()),
            city: None,
            county: None,
        }
    }

    pub fn city(country: &str, state: &str, city: &str) -> Self {
        Self {
            country: country.to_string(),
            state: Some(state.to_string()),
            city: Some(city.to_string()),
            county: None,
        }
    }

    /// Canonical key string, e.g. `US`, `US-CA`, `US-CA-SF`.
    pub fn key(&self) -> String {
        let mut key = self.country.to_uppercase();
        if let Some(state) = &self.state {
            key.push('-');
            key.push_str(&state.to_uppercase());
            if let Some(city) = &self.city {
                key.push('-');
                key.push_str(&city.to_uppercase());
            }
        }
        key
    }

    /// Next broader jurisdiction: city -> state -> country -> none.
    pub fn parent(&self) -> Option<Jurisdiction> {
        if self.city.is_some() {
            Some(Jurisdiction {
                city: None,
                county: None,
                ..self.clone()
            })
        } else if self.state.is_some() {
            Some(Jurisdiction::country(&self.country))
        } else {
            None
        }
    }
}

impl std::fmt::Display for Jurisdiction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpFile {
    pub mcp_id: String,
    pub name: String,
    pub jurisdiction: Jurisdiction,
    pub version: String,
    #[serde(default)]
    pub effective_date: Option<String>,
    pub rules: Vec<McpRule>,
}

impl McpFile {
    pub fn rule(&self, rule_id: &str) -> Option<&McpRule> {
        self.rules.iter().find(|r| r.rule_id == rule_id)
    }
}
