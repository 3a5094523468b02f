//! Business rules engine for extracted financial documents.
//!
//! Rules are declarative JSON/YAML records owned by a tenant or shared
//! globally. Each rule pairs a condition tree with an ordered list of field
//! actions and is applied to the document header, its line items and its tax
//! lines. Global rules only run for tenants that explicitly enable them.

mod action;
mod condition;
mod engine;
mod error;
mod executor;
mod formula;
mod link;
mod loader;
mod lookup;
mod outcome;
mod repository;
mod rule;
mod ruleset;
mod runner;
mod service;
mod source;
mod store;
mod transform;

pub use action::{Action, ActionSpec, ChainStep, ValueSource};
pub use condition::{
    Comparison, Condition, ConditionSpec, EvalContext, FieldPath, Operand, Operator, Pattern,
    Quantifier,
};
pub use engine::RuleEngine;
pub use error::{ActionError, ConditionError, RuleError, RunError};
pub use executor::{ActionEffect, ActionEnv};
pub use formula::Formula;
pub use link::{LinkState, TenantLinks, TenantRuleLink};
pub use loader::{load_catalog, load_rules};
pub use lookup::{
    normalize_key, InMemoryReferenceSource, LookupMatch, ReferenceSource, ReferenceTable,
    ReferenceTables,
};
pub use outcome::{Diagnostic, DiagnosticKind, RunOutcome, RunReport, Verdict};
pub use repository::PgRuleRepository;
pub use rule::{Rule, RuleSpec, RuleTarget, RuleType, Severity, Validation};
pub use ruleset::{RuleCatalog, RuleFilter, RuleSet, RuleSetSnapshot};
pub use runner::{DocumentRunner, RunnerSettings};
pub use service::{RuleApiBuilder, RuleServiceConfig};
pub use source::{RuleSetCache, RuleSource};
pub use store::{RuleHistoryEntry, RuleStore};
pub use transform::{FieldTransformation, Transformation};
