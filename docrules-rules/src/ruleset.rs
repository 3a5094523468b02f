use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use docrules_protocol::document::Scope;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::RuleError;
use crate::link::TenantLinks;
use crate::rule::{Rule, RuleType};

/// Every known rule, global and tenant-owned, plus the tenant links.
#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    rules: Vec<Rule>,
    links: TenantLinks,
}

impl RuleCatalog {
    /// Builds a catalog, rejecting duplicate codes within a namespace.
    pub fn new(rules: Vec<Rule>, links: TenantLinks) -> Result<Self, RuleError> {
        ensure_unique_codes(&rules)?;
        Ok(Self { rules, links })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn links(&self) -> &TenantLinks {
        &self.links
    }
}

pub(crate) fn ensure_unique_codes(rules: &[Rule]) -> Result<(), RuleError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert((rule.namespace(), rule.code.as_str())) {
            return Err(RuleError::DuplicateRule {
                code: rule.code.clone(),
                namespace: rule.namespace().to_string(),
            });
        }
    }
    Ok(())
}

/// Restricts a run to some rule families. Empty means every family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleFilter {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub kinds: BTreeSet<RuleType>,
}

impl RuleFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(kinds: impl IntoIterator<Item = RuleType>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }

    pub fn accepts(&self, kind: RuleType) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// Immutable, ordered set of rules effective for one tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    tenant: String,
    rules: Vec<Rule>,
    fingerprint: String,
}

pub type RuleSetSnapshot = Arc<RuleSet>;

impl RuleSet {
    /// Sorts the rules by priority, then code, with globals before
    /// tenant-owned rules on a tie.
    pub fn new(tenant: impl Into<String>, mut rules: Vec<Rule>) -> Self {
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.code.cmp(&b.code))
                .then_with(|| a.tenant_id.is_some().cmp(&b.tenant_id.is_some()))
                .then_with(|| a.id.cmp(&b.id))
        });
        let fingerprint = fingerprint(&rules);
        Self {
            tenant: tenant.into(),
            rules,
            fingerprint,
        }
    }

    /// Effective set for `tenant`: explicitly enabled globals plus the
    /// tenant's own rules, active and in force at `as_of`.
    pub fn resolve(
        catalog: &RuleCatalog,
        tenant: &str,
        filter: &RuleFilter,
        as_of: DateTime<Utc>,
    ) -> Self {
        let rules: Vec<Rule> = catalog
            .rules
            .iter()
            .filter(|rule| match rule.tenant_id.as_deref() {
                None => catalog.links.state(tenant, &rule.code).is_enabled(),
                Some(owner) => owner == tenant,
            })
            .filter(|rule| rule.is_in_force(as_of) && filter.accepts(rule.kind))
            .cloned()
            .collect();

        debug!(
            tenant = %tenant,
            considered = catalog.rules.len(),
            effective = rules.len(),
            "resolved effective rule set"
        );
        Self::new(tenant, rules)
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// SHA-256 over the ordered rule definitions.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Rules evaluated on instances of `scope`, in order.
    pub fn chain(&self, scope: Scope) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |rule| rule.applies_to(scope))
    }

    /// Reference tables read by any lookup action of the set.
    pub fn required_tables(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .flat_map(|rule| rule.actions.iter())
            .flat_map(|action| action.tables())
            .map(str::to_string)
            .collect()
    }
}

fn fingerprint(rules: &[Rule]) -> String {
    let mut hasher = Sha256::new();
    for rule in rules {
        match serde_json::to_vec(rule) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(rule.id.as_bytes()),
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
