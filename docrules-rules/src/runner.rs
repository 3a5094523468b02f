use std::sync::Arc;
use std::time::{Duration, Instant};

use docrules_core::config::CoreConfig;
use docrules_protocol::document::Document;
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::engine::RuleEngine;
use crate::error::RunError;
use crate::lookup::{ReferenceSource, ReferenceTables};
use crate::outcome::RunOutcome;
use crate::ruleset::RuleFilter;
use crate::source::{RuleSetCache, RuleSource};

/// Budget and parallelism of document runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub max_concurrency: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            cache_ttl: Duration::from_secs(300),
            max_concurrency: 8,
        }
    }
}

impl From<&CoreConfig> for RunnerSettings {
    fn from(config: &CoreConfig) -> Self {
        Self {
            timeout: config.run_timeout,
            cache_ttl: config.rule_cache_ttl,
            max_concurrency: config.max_concurrency.max(1),
        }
    }
}

/// Fetches the tenant's rule set and reference tables, then runs the
/// engine under a time budget.
#[derive(Clone)]
pub struct DocumentRunner {
    cache: RuleSetCache,
    references: Arc<dyn ReferenceSource>,
    settings: RunnerSettings,
}

impl DocumentRunner {
    pub fn new(
        rules: Arc<dyn RuleSource>,
        references: Arc<dyn ReferenceSource>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            cache: RuleSetCache::new(rules, settings.cache_ttl),
            references,
            settings,
        }
    }

    pub fn settings(&self) -> RunnerSettings {
        self.settings
    }

    /// Drops cached rule sets after a rule or link edit.
    pub fn invalidate(&self, tenant: Option<&str>) {
        self.cache.invalidate(tenant);
    }

    pub async fn run(
        &self,
        tenant: &str,
        document: Document,
        filter: &RuleFilter,
    ) -> Result<RunOutcome, RunError> {
        let budget = self.settings.timeout;
        let started = Instant::now();

        let engine = tokio::time::timeout(budget, self.prepare(tenant, filter))
            .await
            .map_err(|_| RunError::Timeout(budget))??;

        let remaining = budget.saturating_sub(started.elapsed());
        let outcome = engine.run_within(document, remaining)?;
        info!(
            tenant = %tenant,
            fingerprint = %outcome.report.rule_set_fingerprint,
            diagnostics = outcome.report.diagnostics.len(),
            verdict = ?outcome.report.verdict,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "document evaluated"
        );
        Ok(outcome)
    }

    /// Runs documents concurrently; results keep the input order.
    pub async fn run_batch(
        &self,
        tenant: &str,
        documents: Vec<Document>,
        filter: &RuleFilter,
    ) -> Vec<Result<RunOutcome, RunError>> {
        stream::iter(documents)
            .map(|document| self.run(tenant, document, filter))
            .buffered(self.settings.max_concurrency.max(1))
            .collect()
            .await
    }

    async fn prepare(&self, tenant: &str, filter: &RuleFilter) -> Result<RuleEngine, RunError> {
        let snapshot = self.cache.get(tenant, filter).await?;
        let tables = ReferenceTables::prefetch(
            self.references.as_ref(),
            tenant,
            &snapshot.required_tables(),
        )
        .await
        .map_err(|err| {
            warn!(tenant = %tenant, error = %err, "reference prefetch failed");
            RunError::RuleSetLoad(err)
        })?;
        Ok(RuleEngine::new(snapshot).with_tables(tables))
    }
}
