//! Shared data model for MCP building-code validation
//!
//! Input types (building models and rule files), the property-value
//! variant type, and the report family produced by the engine. Kept apart
//! from the engine crate so transports and tooling can depend on the
//! types alone.

pub mod model;
pub mod report;
pub mod rule;

pub use model::{BuildingModel, BuildingObject, Location, PropertyTypeError, PropertyValue};
pub use report::{
    CalculationOutcome, ComplianceReport, McpValidationReport, ValidationResult,
    ValidationViolation,
};
pub use rule::{
    CompareOp, CompositeOp, Jurisdiction, McpFile, McpRule, RuleAction, RuleCategory,
    RuleCondition, Severity, SpatialRelationship,
};
