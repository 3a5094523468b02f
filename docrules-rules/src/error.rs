use std::path::PathBuf;
use std::time::Duration;

use docrules_core::DocRulesError;
use thiserror::Error;

/// Errors returned when loading, validating or storing rule sets.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rules path does not exist: {0}")]
    MissingPath(String),
    #[error("failed to read rules from {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse rules from {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid rule configuration: {0}")]
    InvalidRule(String),
    #[error("duplicate rule code `{code}` in namespace {namespace}")]
    DuplicateRule { code: String, namespace: String },
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error("rule `{0}` is not a global rule")]
    NotGlobal(String),
    #[error("rule source unavailable: {0}")]
    Source(String),
}

impl RuleError {
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RuleError::Io {
            path: path.into().display().to_string(),
            source,
        }
    }

    pub fn parse_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        RuleError::Parse {
            path: path.into().display().to_string(),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        RuleError::InvalidRule(message.into())
    }
}

impl From<sqlx::Error> for RuleError {
    fn from(err: sqlx::Error) -> Self {
        RuleError::Source(err.to_string())
    }
}

impl From<DocRulesError> for RuleError {
    fn from(err: DocRulesError) -> Self {
        RuleError::Source(err.to_string())
    }
}

/// Problems met while evaluating a condition. The offending leaf evaluates
/// to false and evaluation continues.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("invalid pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("`{field}` cannot be compared with {operator}: `{left}` vs `{right}`")]
    NotComparable {
        field: String,
        operator: String,
        left: String,
        right: String,
    },
}

/// Problems met while applying an action. The target field is left unchanged.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActionError {
    #[error("reference table `{0}` is not available for this run")]
    UnknownTable(String),
    #[error("lookup key `{field}` is empty")]
    EmptyLookupKey { field: String },
    #[error("no row in `{table}` matches `{value}` (best confidence {confidence:.2})")]
    NoMatch {
        table: String,
        value: String,
        confidence: f64,
    },
    #[error("matched row in `{table}` has no value in column `{column}`")]
    MissingColumn { table: String, column: String },
    #[error("`{field}` is not numeric: `{value}`")]
    NonNumeric { field: String, value: String },
    #[error("division by zero in formula `{formula}`")]
    DivisionByZero { formula: String },
    #[error("formula `{formula}` failed: {message}")]
    Formula { formula: String, message: String },
}

/// Errors that abort a whole document run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("rule set could not be loaded: {0}")]
    RuleSetLoad(#[from] RuleError),
    #[error("document run exceeded its {0:?} budget")]
    Timeout(Duration),
}

impl From<RunError> for DocRulesError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::RuleSetLoad(inner) => DocRulesError::RuleSetLoad(inner.to_string()),
            RunError::Timeout(_) => DocRulesError::Evaluation(err.to_string()),
        }
    }
}
