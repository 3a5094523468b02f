use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RuleError;
use crate::link::{LinkState, TenantLinks, TenantRuleLink};
use crate::rule::Rule;
use crate::ruleset::RuleCatalog;
use crate::source::RuleSource;

/// Versioned history entry for a stored rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleHistoryEntry {
    pub version: u32,
    pub rule: Rule,
    pub created_at: DateTime<Utc>,
    pub updated_by: Option<String>,
}

impl RuleHistoryEntry {
    fn new(version: u32, rule: Rule, updated_by: Option<String>) -> Self {
        Self {
            version,
            rule,
            created_at: Utc::now(),
            updated_by,
        }
    }
}

/// Rules of one namespace keyed by code. `None` holds the globals.
type Namespaces = BTreeMap<Option<String>, BTreeMap<String, Vec<RuleHistoryEntry>>>;

#[derive(Default)]
struct StoreState {
    namespaces: Namespaces,
    links: TenantLinks,
}

/// In-memory multi-tenant rule store with version tracking.
#[derive(Default, Clone)]
pub struct RuleStore {
    inner: Arc<RwLock<StoreState>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with a catalog, one version per rule.
    pub fn from_catalog(catalog: &RuleCatalog) -> Self {
        let store = Self::new();
        for rule in catalog.rules() {
            store.put_rule(rule.clone(), Some("seed".to_string()));
        }
        for link in catalog.links().iter() {
            store.inner.write().links.upsert(link.clone());
        }
        store
    }

    /// Tenants that own rules or link rows.
    pub fn tenants(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut tenants: Vec<String> = inner
            .namespaces
            .keys()
            .flatten()
            .cloned()
            .chain(inner.links.iter().map(|link| link.tenant_id.clone()))
            .collect();
        tenants.sort();
        tenants.dedup();
        tenants
    }

    /// Latest version of every rule in the namespace (`None` for globals).
    pub fn list_rules(&self, tenant: Option<&str>) -> Vec<RuleHistoryEntry> {
        let inner = self.inner.read();
        inner
            .namespaces
            .get(&tenant.map(str::to_string))
            .map(|rules| {
                rules
                    .values()
                    .filter_map(|versions| versions.last().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn rule_history(&self, tenant: Option<&str>, code: &str) -> Vec<RuleHistoryEntry> {
        let inner = self.inner.read();
        inner
            .namespaces
            .get(&tenant.map(str::to_string))
            .and_then(|rules| rules.get(code).cloned())
            .unwrap_or_default()
    }

    pub fn latest_rule(&self, tenant: Option<&str>, code: &str) -> Option<RuleHistoryEntry> {
        let inner = self.inner.read();
        inner
            .namespaces
            .get(&tenant.map(str::to_string))
            .and_then(|rules| rules.get(code))
            .and_then(|versions| versions.last().cloned())
    }

    /// Inserts a new version of the rule in its namespace.
    pub fn put_rule(&self, mut rule: Rule, updated_by: Option<String>) -> RuleHistoryEntry {
        let mut inner = self.inner.write();
        let namespace = inner.namespaces.entry(rule.tenant_id.clone()).or_default();

        if rule.id.trim().is_empty() {
            rule.id = format!("rule-{}", Uuid::new_v4());
        }

        let history = namespace.entry(rule.code.clone()).or_default();
        let version = history.last().map(|last| last.version + 1).unwrap_or(1);
        let entry = RuleHistoryEntry::new(version, rule, updated_by);
        history.push(entry.clone());
        entry
    }

    /// Appends a version with `activa = false`.
    pub fn disable_rule(
        &self,
        tenant: Option<&str>,
        code: &str,
        updated_by: Option<String>,
    ) -> Result<RuleHistoryEntry, RuleError> {
        let mut inner = self.inner.write();
        let history = inner
            .namespaces
            .get_mut(&tenant.map(str::to_string))
            .and_then(|rules| rules.get_mut(code))
            .ok_or_else(|| RuleError::NotFound(code.to_string()))?;

        let latest = history
            .last()
            .cloned()
            .ok_or_else(|| RuleError::NotFound(code.to_string()))?;

        if !latest.rule.active {
            return Ok(latest);
        }

        let mut disabled = latest.rule;
        disabled.active = false;
        let entry = RuleHistoryEntry::new(latest.version + 1, disabled, updated_by);
        history.push(entry.clone());
        Ok(entry)
    }

    /// Enables or disables a global rule for `tenant`.
    pub fn set_link(&self, tenant: &str, code: &str, active: bool) -> Result<TenantRuleLink, RuleError> {
        let mut inner = self.inner.write();
        let is_global = inner
            .namespaces
            .get(&None)
            .map_or(false, |globals| globals.contains_key(code));
        if !is_global {
            return Err(RuleError::NotGlobal(code.to_string()));
        }

        let link = TenantRuleLink::new(tenant, code, active);
        inner.links.upsert(link.clone());
        Ok(link)
    }

    pub fn link_state(&self, tenant: &str, code: &str) -> LinkState {
        self.inner.read().links.state(tenant, code)
    }

    /// Latest versions visible to `tenant`, as a catalog.
    pub fn catalog_for(&self, tenant: &str) -> Result<RuleCatalog, RuleError> {
        let inner = self.inner.read();
        let latest = |namespace: &Option<String>| -> Vec<Rule> {
            inner
                .namespaces
                .get(namespace)
                .map(|rules| {
                    rules
                        .values()
                        .filter_map(|versions| versions.last().map(|entry| entry.rule.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut rules = latest(&None);
        rules.extend(latest(&Some(tenant.to_string())));
        let links = inner.links.for_tenant(tenant).cloned().collect();
        RuleCatalog::new(rules, links)
    }
}

#[async_trait]
impl RuleSource for RuleStore {
    async fn fetch_catalog(&self, tenant: &str) -> Result<RuleCatalog, RuleError> {
        self.catalog_for(tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruleset::{RuleFilter, RuleSet};
    use serde_json::json;

    fn sample_rule(code: &str, tenant: Option<&str>) -> Rule {
        serde_json::from_value(json!({
            "codigo": code,
            "tipo": "TRANSFORMACION",
            "tenantId": tenant,
            "acciones": [{"operacion": "TRIM_SPACES", "campo": "descripcion"}]
        }))
        .expect("rule")
    }

    #[test]
    fn versioning_is_tracked() {
        let store = RuleStore::new();
        let entry1 = store.put_rule(sample_rule("TRIM", Some("tenant-a")), None);
        assert_eq!(entry1.version, 1);

        let mut updated = entry1.rule.clone();
        updated.description = Some("updated".into());
        let entry2 = store.put_rule(updated, Some("alice".into()));
        assert_eq!(entry2.version, 2);
        assert_eq!(entry2.updated_by.as_deref(), Some("alice"));

        let history = store.rule_history(Some("tenant-a"), "TRIM");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].version, 2);
        assert_eq!(store.tenants(), vec!["tenant-a".to_string()]);
    }

    #[test]
    fn disabling_rule_creates_new_version() {
        let store = RuleStore::new();
        let entry = store.put_rule(sample_rule("TRIM", Some("tenant-a")), None);

        let disabled = store
            .disable_rule(Some("tenant-a"), "TRIM", Some("system".into()))
            .expect("disable rule");
        assert!(!disabled.rule.active);
        assert_eq!(disabled.version, entry.version + 1);

        let catalog = store.catalog_for("tenant-a").expect("catalog");
        let set = RuleSet::resolve(&catalog, "tenant-a", &RuleFilter::all(), Utc::now());
        assert!(set.is_empty(), "disabled rules should be skipped");
    }

    #[test]
    fn links_only_apply_to_global_rules() {
        let store = RuleStore::new();
        store.put_rule(sample_rule("GLOBAL", None), None);
        store.put_rule(sample_rule("PROPIA", Some("tenant-a")), None);

        assert!(matches!(
            store.set_link("tenant-a", "PROPIA", true),
            Err(RuleError::NotGlobal(_))
        ));
        assert_eq!(store.link_state("tenant-a", "GLOBAL"), LinkState::InheritedDisabled);

        store.set_link("tenant-a", "GLOBAL", true).expect("link");
        let catalog = store.catalog_for("tenant-a").expect("catalog");
        let set = RuleSet::resolve(&catalog, "tenant-a", &RuleFilter::all(), Utc::now());
        assert_eq!(set.len(), 2);

        store.set_link("tenant-a", "GLOBAL", false).expect("link");
        assert_eq!(store.link_state("tenant-a", "GLOBAL"), LinkState::ExplicitlyDisabled);
    }
}
