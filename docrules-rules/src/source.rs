use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::RuleError;
use crate::link::TenantLinks;
use crate::ruleset::{RuleCatalog, RuleFilter, RuleSet, RuleSetSnapshot};

/// Asynchronous provider of rule definitions and tenant links.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Rules visible to `tenant` (its own plus every global) and the
    /// tenant's link rows.
    async fn fetch_catalog(&self, tenant: &str) -> Result<RuleCatalog, RuleError>;
}

#[async_trait]
impl RuleSource for RuleCatalog {
    async fn fetch_catalog(&self, tenant: &str) -> Result<RuleCatalog, RuleError> {
        let rules = self
            .rules()
            .iter()
            .filter(|rule| rule.tenant_id.as_deref().map_or(true, |owner| owner == tenant))
            .cloned()
            .collect();
        let links: TenantLinks = self.links().for_tenant(tenant).cloned().collect();
        RuleCatalog::new(rules, links)
    }
}

struct CachedSet {
    snapshot: RuleSetSnapshot,
    loaded_at: Instant,
}

/// TTL cache of resolved rule sets keyed by tenant and filter.
///
/// Entries are immutable snapshots; editing a rule must be followed by
/// [`RuleSetCache::invalidate`]. A load that was in flight when the cache
/// was invalidated is returned to its caller but never cached.
#[derive(Clone)]
pub struct RuleSetCache {
    source: Arc<dyn RuleSource>,
    ttl: Duration,
    entries: Arc<RwLock<HashMap<(String, RuleFilter), CachedSet>>>,
    generation: Arc<AtomicU64>,
}

impl RuleSetCache {
    pub fn new(source: Arc<dyn RuleSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached snapshot, loading it from the source when absent
    /// or expired.
    pub async fn get(&self, tenant: &str, filter: &RuleFilter) -> Result<RuleSetSnapshot, RuleError> {
        let key = (tenant.to_string(), filter.clone());
        let cached = self
            .entries
            .read()
            .get(&key)
            .filter(|entry| entry.loaded_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.snapshot));
        if let Some(snapshot) = cached {
            return Ok(snapshot);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let catalog = self.source.fetch_catalog(tenant).await?;
        let snapshot = Arc::new(RuleSet::resolve(&catalog, tenant, filter, Utc::now()));
        debug!(
            tenant = %tenant,
            rules = snapshot.len(),
            fingerprint = %snapshot.fingerprint(),
            "rule set loaded"
        );

        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) != generation {
            debug!(tenant = %tenant, "cache invalidated during load; not caching");
            return Ok(snapshot);
        }
        entries.insert(
            key,
            CachedSet {
                snapshot: Arc::clone(&snapshot),
                loaded_at: Instant::now(),
            },
        );
        Ok(snapshot)
    }

    /// Drops cached sets for `tenant`, or every set when `None`.
    pub fn invalidate(&self, tenant: Option<&str>) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        match tenant {
            Some(tenant) => entries.retain(|(owner, _), _| owner != tenant),
            None => entries.clear(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::TenantRuleLink;
    use crate::rule::Rule;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct CountingSource {
        catalog: RuleCatalog,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RuleSource for CountingSource {
        async fn fetch_catalog(&self, tenant: &str) -> Result<RuleCatalog, RuleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.catalog.fetch_catalog(tenant).await
        }
    }

    fn catalog() -> RuleCatalog {
        let rules: Vec<Rule> = serde_json::from_value(json!([
            {"codigo": "G", "tipo": "TRANSFORMACION"},
            {"codigo": "A", "tipo": "TRANSFORMACION", "tenantId": "tenant-a"},
            {"codigo": "B", "tipo": "TRANSFORMACION", "tenantId": "tenant-b"}
        ]))
        .expect("rules");
        RuleCatalog::new(
            rules,
            [TenantRuleLink::new("tenant-a", "G", true)].into_iter().collect(),
        )
        .expect("catalog")
    }

    #[tokio::test]
    async fn catalog_source_scopes_to_tenant() {
        let scoped = catalog().fetch_catalog("tenant-a").await.expect("catalog");
        let codes: Vec<_> = scoped.rules().iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["G", "A"]);
        assert_eq!(scoped.links().len(), 1);
    }

    #[tokio::test]
    async fn caches_until_invalidated() {
        let source = Arc::new(CountingSource {
            catalog: catalog(),
            calls: AtomicUsize::new(0),
        });
        let cache = RuleSetCache::new(source.clone(), Duration::from_secs(300));
        let filter = RuleFilter::all();

        let first = cache.get("tenant-a", &filter).await.expect("set");
        let second = cache.get("tenant-a", &filter).await.expect("set");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.len(), 2);

        cache.invalidate(Some("tenant-a"));
        cache.get("tenant-a", &filter).await.expect("set");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    /// Serves whatever catalog is current; the first fetch blocks until
    /// released so an edit can land while it is in flight.
    struct EditedSource {
        catalog: parking_lot::Mutex<RuleCatalog>,
        started: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RuleSource for EditedSource {
        async fn fetch_catalog(&self, tenant: &str) -> Result<RuleCatalog, RuleError> {
            let current = self.catalog.lock().clone();
            let scoped = current.fetch_catalog(tenant).await?;
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.started.notify_one();
                self.release.notified().await;
            }
            Ok(scoped)
        }
    }

    fn version(code: &str) -> RuleCatalog {
        let rules: Vec<Rule> = serde_json::from_value(json!([
            {"codigo": code, "tipo": "TRANSFORMACION", "tenantId": "t"}
        ]))
        .expect("rules");
        RuleCatalog::new(rules, TenantLinks::default()).expect("catalog")
    }

    fn codes(set: &RuleSet) -> Vec<String> {
        set.rules().iter().map(|rule| rule.code.clone()).collect()
    }

    #[tokio::test]
    async fn edit_during_load_is_not_masked() {
        let source = Arc::new(EditedSource {
            catalog: parking_lot::Mutex::new(version("V1")),
            started: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let cache = RuleSetCache::new(source.clone(), Duration::from_secs(300));

        let in_flight = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get("t", &RuleFilter::all()).await }
        });
        source.started.notified().await;
        *source.catalog.lock() = version("V2");
        cache.invalidate(Some("t"));
        source.release.notify_one();

        let stale = in_flight.await.expect("join").expect("set");
        assert_eq!(codes(&stale), vec!["V1"]);
        assert!(cache.is_empty());

        let fresh = cache.get("t", &RuleFilter::all()).await.expect("set");
        assert_eq!(codes(&fresh), vec!["V2"]);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_reloads() {
        let source = Arc::new(CountingSource {
            catalog: catalog(),
            calls: AtomicUsize::new(0),
        });
        let cache = RuleSetCache::new(source.clone(), Duration::ZERO);
        let filter = RuleFilter::all();

        cache.get("tenant-b", &filter).await.expect("set");
        cache.get("tenant-b", &filter).await.expect("set");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
