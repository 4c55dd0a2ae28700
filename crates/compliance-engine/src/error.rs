use thiserror::Error;

/// Errors from the formula evaluator.
///
/// `DivisionByZero` is produced by the stack machine but converted to a
/// logged `0.0` result by the public `evaluate` entry point; callers only
/// observe it through internal APIs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("unsafe token in formula: {0}")]
    UnsafeToken(String),

    #[error("unbalanced parentheses")]
    UnbalancedParens,

    #[error("invalid character in formula: {0:?}")]
    InvalidChar(char),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("function {function} expects {expected} argument(s), found {found}")]
    BadArity {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("cannot convert between {from} and {to}")]
    UnitMismatch { from: String, to: String },

    #[error("malformed expression")]
    Malformed,
}

/// One problem found while loading a rule from an MCP file. All definition
/// errors for a file are collected and returned together.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{mcp_id} rule {rule_index} ({rule_id}): {message}")]
pub struct RuleDefinitionError {
    pub mcp_id: String,
    pub rule_index: usize,
    /// Empty when the rule had no parseable id.
    pub rule_id: String,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid building model: {0}")]
    InvalidModel(String),

    #[error("invalid MCP file: {0}")]
    InvalidMcpFile(String),

    #[error("no ruleset loaded for id: {0}")]
    RulesetNotLoaded(String),

    #[error("validation cancelled")]
    Cancelled,

    #[error("worker pool: {0}")]
    WorkerPool(String),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}
