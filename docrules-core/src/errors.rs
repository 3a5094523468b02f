use std::io;

use thiserror::Error;

/// Result type used across the docrules core crate.
pub type Result<T> = std::result::Result<T, DocRulesError>;

/// Canonical error representation shared by the workspace crates.
#[derive(Debug, Error)]
pub enum DocRulesError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("rule set could not be loaded: {0}")]
    RuleSetLoad(String),

    #[error("document evaluation failed: {0}")]
    Evaluation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    General(String),
}

impl From<serde_json::Error> for DocRulesError {
    fn from(err: serde_json::Error) -> Self {
        DocRulesError::Deserialization(err.to_string())
    }
}

impl From<sqlx::Error> for DocRulesError {
    fn from(err: sqlx::Error) -> Self {
        DocRulesError::Database(err.to_string())
    }
}

impl From<anyhow::Error> for DocRulesError {
    fn from(err: anyhow::Error) -> Self {
        DocRulesError::General(err.to_string())
    }
}

/// Dedicated configuration error used by the configuration module.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("required environment variable missing: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for environment variable {key}: {value}")]
    InvalidEnvVar { key: String, value: String },
}

impl From<ConfigError> for DocRulesError {
    fn from(value: ConfigError) -> Self {
        DocRulesError::Config(value.to_string())
    }
}
