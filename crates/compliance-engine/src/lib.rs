//! Building-code validation engine
//!
//! This crate implements the MCP (Model Code Provision) validation
//! pipeline: rule files resolve through the jurisdiction registry, rule
//! conditions match building objects with property, spatial, relationship
//! and composite logic, and matched rules execute their actions into
//! compliance reports. Reports are cached by content fingerprint, and the
//! parallel engine runs the same pipeline over a rayon worker pool with
//! bit-identical aggregation.

pub mod actions;
pub mod cache;
pub mod conditions;
pub mod engine;
pub mod error;
pub mod formula;
pub mod loader;
pub mod metrics;
pub mod parallel;
pub mod registry;
pub mod spatial;

pub use actions::ActionExecutor;
pub use cache::{CacheStore, InMemoryStore, ReportCache};
pub use conditions::{ConditionMatcher, MAX_COMPOSITE_DEPTH, MAX_TRAVERSAL_DEPTH};
pub use engine::{
    CancellationToken, ConditionCheck, EngineConfig, RuleTestOutcome, ValidationEngine,
};
pub use error::{CacheError, EngineError, FormulaError, RuleDefinitionError};
pub use formula::{evaluate, FormulaContext};
pub use loader::{load_building_model, load_mcp_file, LoadOutcome};
pub use metrics::{MetricsSink, NoopMetrics};
pub use parallel::ParallelEngine;
pub use registry::{ResolvedRuleset, RulesetRegistry};
pub use spatial::{BoundingBox, SpatialAnalyzer, SpatialObject, SpatialStatistics};
