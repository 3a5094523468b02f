use docrules_protocol::document::{Document, Scope, ScopeInstance};
use serde::{Deserialize, Serialize};

use crate::executor::ActionEffect;
use crate::rule::Severity;

/// Export decision derived from validation findings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    #[default]
    Pass,
    Warn,
    Blocked,
}

impl Verdict {
    /// The more severe of the two.
    pub fn merge(self, other: Verdict) -> Verdict {
        use Verdict::*;
        match (self, other) {
            (Blocked, _) | (_, Blocked) => Blocked,
            (Warn, _) | (_, Warn) => Warn,
            (Pass, Pass) => Pass,
        }
    }

    pub fn from_severity(level: Severity) -> Verdict {
        match level {
            Severity::Error => Verdict::Blocked,
            Severity::Warning => Verdict::Warn,
        }
    }
}

/// What happened when a rule met a scope instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticKind {
    Matched { changes: Vec<ActionEffect> },
    NotMatched,
    Skipped { stopped_by: String },
    RuleError { message: String },
    ActionError { action: String, message: String },
    ValidationFailed { level: Severity, message: String },
}

/// One entry of the run trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub rule_code: String,
    pub scope: Scope,
    pub scope_index: usize,
    pub matched: bool,
    #[serde(flatten)]
    pub kind: DiagnosticKind,
}

impl Diagnostic {
    pub fn new(rule_code: impl Into<String>, instance: ScopeInstance, matched: bool, kind: DiagnosticKind) -> Self {
        Self {
            rule_code: rule_code.into(),
            scope: instance.scope,
            scope_index: instance.index,
            matched,
            kind,
        }
    }

    pub fn instance(&self) -> ScopeInstance {
        ScopeInstance {
            scope: self.scope,
            index: self.scope_index,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.kind,
            DiagnosticKind::RuleError { .. } | DiagnosticKind::ActionError { .. }
        )
    }
}

/// Diagnostics of one run, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub tenant_id: String,
    pub rule_set_fingerprint: String,
    pub verdict: Verdict,
    pub diagnostics: Vec<Diagnostic>,
}

impl RunReport {
    pub fn new(tenant_id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            rule_set_fingerprint: fingerprint.into(),
            verdict: Verdict::Pass,
            diagnostics: Vec::new(),
        }
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        if let DiagnosticKind::ValidationFailed { level, .. } = &diagnostic.kind {
            self.verdict = self.verdict.merge(Verdict::from_severity(*level));
        }
        self.diagnostics.push(diagnostic);
    }

    /// Codes of the rules that matched, in evaluation order.
    pub fn matched_rules(&self) -> Vec<&str> {
        self.diagnostics
            .iter()
            .filter(|d| matches!(d.kind, DiagnosticKind::Matched { .. }))
            .map(|d| d.rule_code.as_str())
            .collect()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    pub fn for_instance(&self, instance: ScopeInstance) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(move |d| d.instance() == instance)
    }

    pub fn is_blocked(&self) -> bool {
        self.verdict == Verdict::Blocked
    }
}

/// Mutated document plus its report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub document: Document,
    pub report: RunReport,
}
