use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Enablement of a global rule for one tenant.
///
/// A missing link row leaves the rule off; only an explicit enabled link
/// brings a global rule into the tenant's effective set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    InheritedDisabled,
    ExplicitlyEnabled,
    ExplicitlyDisabled,
}

impl LinkState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, LinkState::ExplicitlyEnabled)
    }
}

/// Row of `tenant_reglas_globales`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantRuleLink {
    pub tenant_id: String,
    #[serde(rename = "codigo", alias = "ruleCode")]
    pub rule_code: String,
    #[serde(rename = "activa")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TenantRuleLink {
    pub fn new(tenant_id: impl Into<String>, rule_code: impl Into<String>, active: bool) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            rule_code: rule_code.into(),
            active,
            updated_at: Some(Utc::now()),
        }
    }

    pub fn state(&self) -> LinkState {
        if self.active {
            LinkState::ExplicitlyEnabled
        } else {
            LinkState::ExplicitlyDisabled
        }
    }
}

/// Link rows indexed by tenant, then by global rule code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantLinks {
    by_tenant: BTreeMap<String, BTreeMap<String, TenantRuleLink>>,
}

impl TenantLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the link for its (tenant, rule) pair.
    pub fn upsert(&mut self, link: TenantRuleLink) -> Option<TenantRuleLink> {
        self.by_tenant
            .entry(link.tenant_id.clone())
            .or_default()
            .insert(link.rule_code.clone(), link)
    }

    pub fn get(&self, tenant: &str, rule_code: &str) -> Option<&TenantRuleLink> {
        self.by_tenant.get(tenant)?.get(rule_code)
    }

    pub fn state(&self, tenant: &str, rule_code: &str) -> LinkState {
        self.get(tenant, rule_code)
            .map_or(LinkState::InheritedDisabled, TenantRuleLink::state)
    }

    pub fn for_tenant<'a>(&'a self, tenant: &str) -> impl Iterator<Item = &'a TenantRuleLink> + 'a {
        self.by_tenant.get(tenant).into_iter().flat_map(BTreeMap::values)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TenantRuleLink> {
        self.by_tenant.values().flat_map(BTreeMap::values)
    }

    pub fn len(&self) -> usize {
        self.by_tenant.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tenant.values().all(BTreeMap::is_empty)
    }
}

impl FromIterator<TenantRuleLink> for TenantLinks {
    fn from_iter<I: IntoIterator<Item = TenantRuleLink>>(iter: I) -> Self {
        let mut links = Self::new();
        for link in iter {
            links.upsert(link);
        }
        links
    }
}
