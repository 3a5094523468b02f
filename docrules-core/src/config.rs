use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{ConfigError, DocRulesError};

/// Prefix used by every docrules environment variable.
pub const ENV_PREFIX: &str = "DOCRULES_";

const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8081";
const DEFAULT_RUN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RULE_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Runtime environment used by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        }
    }
}

/// Process configuration shared by the CLI and the rule service.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Postgres URL holding `reglas_negocio`. File-based runs leave it unset.
    pub database_url: Option<String>,
    pub environment: Environment,
    pub node_name: String,
    pub http_bind: String,
    /// Time budget for a single document run.
    pub run_timeout: Duration,
    /// How long a tenant's resolved rule set may be served from cache.
    pub rule_cache_ttl: Duration,
    /// Maximum number of documents evaluated concurrently in a batch.
    pub max_concurrency: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            environment: Environment::Development,
            node_name: "docrules-node".to_string(),
            http_bind: DEFAULT_HTTP_BIND.to_string(),
            run_timeout: Duration::from_millis(DEFAULT_RUN_TIMEOUT_MS),
            rule_cache_ttl: Duration::from_secs(DEFAULT_RULE_CACHE_TTL_SECS),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl CoreConfig {
    /// Loads configuration from the process environment (and `.env` when present).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_prefix(ENV_PREFIX)
    }

    /// Loads configuration from env vars prefixed with the provided value.
    ///
    /// `DATABASE_URL` without prefix is accepted as a fallback for the
    /// prefixed database key.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(prefix, |key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = |suffix: &str| format!("{}{}", prefix, suffix);
        let defaults = Self::default();

        let database_url = lookup(&key("DATABASE_URL"))
            .or_else(|| lookup("DATABASE_URL"))
            .filter(|value| !value.trim().is_empty());

        let environment = lookup(&key("ENV"))
            .map(|raw| Environment::parse(&raw))
            .unwrap_or_default();

        let node_name = lookup(&key("NODE_NAME")).unwrap_or(defaults.node_name);
        let http_bind = lookup(&key("HTTP_BIND")).unwrap_or(defaults.http_bind);

        let run_timeout = parse_var::<u64, _>(&lookup, &key("RUN_TIMEOUT_MS"))?
            .map(Duration::from_millis)
            .unwrap_or(defaults.run_timeout);

        let rule_cache_ttl = parse_var::<u64, _>(&lookup, &key("RULE_CACHE_TTL_SECS"))?
            .map(Duration::from_secs)
            .unwrap_or(defaults.rule_cache_ttl);

        let max_concurrency = parse_var::<usize, _>(&lookup, &key("MAX_CONCURRENCY"))?
            .unwrap_or(defaults.max_concurrency)
            .max(1);

        Ok(Self {
            database_url,
            environment,
            node_name,
            http_bind,
            run_timeout,
            rule_cache_ttl,
            max_concurrency,
        })
    }

    /// Builds the configuration from an in-memory map, mostly for tests.
    pub fn from_map(prefix: &str, values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| values.get(key).cloned())
    }

    /// Returns the Postgres URL, failing when none was configured.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar(format!("{}DATABASE_URL", ENV_PREFIX)))
    }

    /// Whether the service is running in production.
    pub fn is_production(&self) -> bool {
        matches!(self.environment, Environment::Production)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                value: raw,
            }),
    }
}

/// Helper that loads config and converts to the canonical error type.
pub fn load_core_config() -> Result<CoreConfig, DocRulesError> {
    Ok(CoreConfig::from_env()?)
}
