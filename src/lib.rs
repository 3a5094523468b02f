//! docrules: business rules applied to extracted financial documents.
//!
//! The workspace is split into:
//!
//! * `docrules-core`: configuration, errors, logging and the Postgres pool
//! * `docrules-protocol`: the document model (header, line items, tax lines)
//! * `docrules-rules`: rule model, engine, rule store and REST service
//! * `docrules-cli`: the `docrules` binary

pub use docrules_core as core;
pub use docrules_protocol as protocol;
pub use docrules_rules as rules;

pub use docrules_protocol::document::{Document, FieldStore, FieldValue, Scope, ScopeInstance};
pub use docrules_rules::{
    Rule, RuleCatalog, RuleEngine, RuleFilter, RuleSet, RunOutcome, RunReport, Verdict,
};
