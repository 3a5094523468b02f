use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use docrules_protocol::document::{Document, ScopeInstance};
use tracing::{debug, warn};

use crate::condition::EvalContext;
use crate::error::RunError;
use crate::executor::ActionEnv;
use crate::lookup::ReferenceTables;
use crate::outcome::{Diagnostic, DiagnosticKind, RunOutcome, RunReport};
use crate::rule::{Rule, RuleType};
use crate::ruleset::{RuleSet, RuleSetSnapshot};

/// Evaluates an immutable rule set against documents.
///
/// The engine holds no per-run state; each call works on the document it
/// is handed and returns the trail of what happened.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rule_set: RuleSetSnapshot,
    tables: ReferenceTables,
}

impl RuleEngine {
    pub fn new(rule_set: impl Into<RuleSetSnapshot>) -> Self {
        Self {
            rule_set: rule_set.into(),
            tables: ReferenceTables::new(),
        }
    }

    /// Reference tables available to lookup actions.
    pub fn with_tables(mut self, tables: ReferenceTables) -> Self {
        self.tables = tables;
        self
    }

    pub fn rule_set(&self) -> &RuleSet {
        &self.rule_set
    }

    pub fn snapshot(&self) -> RuleSetSnapshot {
        Arc::clone(&self.rule_set)
    }

    /// Runs the rule set over `document` and returns the mutated copy.
    pub fn run(&self, mut document: Document) -> RunOutcome {
        let report = self.execute(&mut document, None).unwrap_or_else(|_| {
            RunReport::new(self.rule_set.tenant(), self.rule_set.fingerprint())
        });
        RunOutcome { document, report }
    }

    /// Like [`RuleEngine::run`], giving up once `budget` has elapsed.
    pub fn run_within(&self, mut document: Document, budget: Duration) -> Result<RunOutcome, RunError> {
        let report = self.execute(&mut document, Some((Instant::now() + budget, budget)))?;
        Ok(RunOutcome { document, report })
    }

    /// Mutates `document` in place.
    pub fn apply(&self, document: &mut Document) -> RunReport {
        self.execute(document, None).unwrap_or_else(|_| {
            RunReport::new(self.rule_set.tenant(), self.rule_set.fingerprint())
        })
    }

    fn execute(
        &self,
        document: &mut Document,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<RunReport, RunError> {
        let mut report = RunReport::new(self.rule_set.tenant(), self.rule_set.fingerprint());

        for instance in document.instances() {
            // Stop-on-match is per instance and per rule family.
            let mut stopped: HashMap<RuleType, &str> = HashMap::new();

            for rule in self.rule_set.chain(instance.scope) {
                if let Some((at, budget)) = deadline {
                    if Instant::now() >= at {
                        warn!(tenant = %self.rule_set.tenant(), "rule run timed out");
                        return Err(RunError::Timeout(budget));
                    }
                }

                if let Some(by) = stopped.get(&rule.kind) {
                    report.push(Diagnostic::new(
                        &rule.code,
                        instance,
                        false,
                        DiagnosticKind::Skipped {
                            stopped_by: by.to_string(),
                        },
                    ));
                    continue;
                }

                let matched = self.evaluate_rule(rule, document, instance, &mut report);
                if matched && rule.stop_on_match {
                    debug!(rule = %rule.code, instance = %instance, "stop on match");
                    stopped.insert(rule.kind, &rule.code);
                }
            }
        }

        Ok(report)
    }

    fn evaluate_rule(
        &self,
        rule: &Rule,
        document: &mut Document,
        instance: ScopeInstance,
        report: &mut RunReport,
    ) -> bool {
        let mut issues = Vec::new();
        let matched = {
            let ctx = EvalContext::new(document, instance, &rule.field_transforms);
            rule.condition.evaluate(&ctx, &mut issues)
        };
        // A condition that could not be evaluated never matches, whatever
        // NOT or OR made of the failed leaf.
        let matched = matched && issues.is_empty();

        for issue in issues {
            report.push(Diagnostic::new(
                &rule.code,
                instance,
                matched,
                DiagnosticKind::RuleError {
                    message: issue.to_string(),
                },
            ));
        }

        if !matched {
            let kind = match &rule.validation {
                Some(validation) => DiagnosticKind::ValidationFailed {
                    level: validation.level,
                    message: validation.message.clone(),
                },
                None => DiagnosticKind::NotMatched,
            };
            report.push(Diagnostic::new(&rule.code, instance, false, kind));
            return false;
        }

        debug!(rule = %rule.code, instance = %instance, "rule matched");
        let Some(store) = document.store_mut(instance) else {
            return true;
        };
        let env = ActionEnv {
            transforms: &rule.field_transforms,
            tables: &self.tables,
        };

        let mut changes = Vec::with_capacity(rule.actions.len());
        let mut failures = Vec::new();
        for action in &rule.actions {
            match action.apply(store, &env) {
                Ok(effect) => changes.push(effect),
                Err(err) => {
                    warn!(rule = %rule.code, action = action.name(), error = %err, "action failed");
                    failures.push(Diagnostic::new(
                        &rule.code,
                        instance,
                        true,
                        DiagnosticKind::ActionError {
                            action: action.name().to_string(),
                            message: err.to_string(),
                        },
                    ));
                }
            }
        }

        report.push(Diagnostic::new(
            &rule.code,
            instance,
            true,
            DiagnosticKind::Matched { changes },
        ));
        for failure in failures {
            report.push(failure);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Verdict;
    use docrules_protocol::document::FieldValue;
    use serde_json::{json, Value};

    fn rules(values: Value) -> Vec<Rule> {
        serde_json::from_value(values).expect("rules")
    }

    fn document(value: Value) -> Document {
        Document::from_json(&value).expect("document")
    }

    #[test]
    fn stop_on_match_only_suppresses_the_matching_instance() {
        let engine = RuleEngine::new(RuleSet::new(
            "t",
            rules(json!([
                {
                    "codigo": "A", "tipo": "TRANSFORMACION", "aplicaA": "LINEAS", "prioridad": 1,
                    "stopOnMatch": true,
                    "condiciones": [{"campo": "tipo", "operador": "EQUALS", "valor": "X"}],
                    "acciones": [{"operacion": "SET", "campo": "marca", "valor": "A"}]
                },
                {
                    "codigo": "B", "tipo": "TRANSFORMACION", "aplicaA": "LINEAS", "prioridad": 2,
                    "acciones": [{"operacion": "SET", "campo": "marca", "valor": "B"}]
                }
            ])),
        ));
        let outcome = engine.run(document(json!({"lineas": [{"tipo": "X"}, {"tipo": "Y"}]})));

        assert_eq!(outcome.document.lines[0].value("marca").as_text(), "A");
        assert_eq!(outcome.document.lines[1].value("marca").as_text(), "B");
        let skipped: Vec<_> = outcome
            .report
            .diagnostics
            .iter()
            .filter(|d| matches!(d.kind, DiagnosticKind::Skipped { .. }))
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].instance(), ScopeInstance::line(1));
    }

    #[test]
    fn stop_on_match_does_not_cross_rule_families() {
        let engine = RuleEngine::new(RuleSet::new(
            "t",
            rules(json!([
                {
                    "codigo": "T1", "tipo": "TRANSFORMACION", "prioridad": 1, "stopOnMatch": true,
                    "acciones": [{"operacion": "SET", "campo": "x", "valor": "1"}]
                },
                {
                    "codigo": "V1", "tipo": "VALIDACION", "prioridad": 2,
                    "condiciones": [{"campo": "x", "operador": "IS_NOT_NULL"}]
                }
            ])),
        ));
        let outcome = engine.run(document(json!({})));

        assert_eq!(outcome.report.matched_rules(), vec!["T1", "V1"]);
        assert_eq!(outcome.report.verdict, Verdict::Pass);
    }

    #[test]
    fn condition_issue_is_reported_and_run_continues() {
        let engine = RuleEngine::new(RuleSet::new(
            "t",
            rules(json!([
                {
                    "codigo": "ROTA", "tipo": "TRANSFORMACION", "prioridad": 1,
                    "condiciones": [{"campo": "total", "operador": "GREATER_THAN", "valor": 10}],
                    "acciones": [{"operacion": "SET", "campo": "grande", "valor": true}]
                },
                {
                    "codigo": "SIGUE", "tipo": "TRANSFORMACION", "prioridad": 2,
                    "acciones": [{"operacion": "SET", "campo": "visto", "valor": true}]
                }
            ])),
        ));
        let outcome = engine.run(document(json!({"total": "muchos"})));

        let errors: Vec<_> = outcome.report.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].rule_code, "ROTA");
        assert!(matches!(errors[0].kind, DiagnosticKind::RuleError { .. }));
        assert!(!outcome.document.header.contains("grande"));
        assert_eq!(outcome.document.header.value("visto"), &FieldValue::Bool(true));
    }

    #[test]
    fn negated_failing_leaf_does_not_match() {
        let engine = RuleEngine::new(RuleSet::new(
            "t",
            rules(json!([{
                "codigo": "AUTO", "tipo": "TRANSFORMACION",
                "condiciones": {
                    "operador": "NOT",
                    "condicion": {"campo": "total", "operador": "GREATER_THAN", "valor": 1000}
                },
                "acciones": [{"operacion": "SET", "campo": "aprobadoAutomatico", "valor": "SI"}]
            }])),
        ));

        let outcome = engine.run(document(json!({"total": "n/a"})));

        assert!(!outcome.document.header.contains("aprobadoAutomatico"));
        assert!(outcome.report.matched_rules().is_empty());
        let kinds: Vec<_> = outcome.report.diagnostics.iter().map(|d| &d.kind).collect();
        assert!(matches!(kinds[0], DiagnosticKind::RuleError { .. }));
        assert!(matches!(kinds[1], DiagnosticKind::NotMatched));
        assert!(outcome.report.diagnostics.iter().all(|d| !d.matched));

        let fine = engine.run(document(json!({"total": 500})));
        assert_eq!(fine.document.header.value("aprobadoAutomatico").as_text(), "SI");
    }

    #[test]
    fn or_with_failing_branch_fails_closed() {
        let engine = RuleEngine::new(RuleSet::new(
            "t",
            rules(json!([{
                "codigo": "O", "tipo": "TRANSFORMACION",
                "condiciones": {
                    "operador": "OR",
                    "condiciones": [
                        {"campo": "total", "operador": "LESS_THAN", "valor": 0},
                        {"campo": "moneda", "operador": "EQUALS", "valor": "USD"}
                    ]
                },
                "acciones": [{"operacion": "SET", "campo": "revisar", "valor": true}]
            }])),
        ));

        let outcome = engine.run(document(json!({"total": "?", "moneda": "USD"})));

        assert!(!outcome.document.header.contains("revisar"));
        assert_eq!(outcome.report.errors().count(), 1);
    }

    #[test]
    fn tax_line_chain_stops_per_instance() {
        let engine = RuleEngine::new(RuleSet::new(
            "t",
            rules(json!([
                {
                    "codigo": "IVA", "tipo": "TRANSFORMACION", "aplicaA": "IMPUESTOS", "prioridad": 1,
                    "stopOnMatch": true,
                    "condiciones": [{"campo": "tipo", "operador": "EQUALS", "valor": "IVA"}],
                    "acciones": [{"operacion": "SET", "campo": "cuenta", "valor": "2.1.01"}]
                },
                {
                    "codigo": "OTRO", "tipo": "TRANSFORMACION", "aplicaA": "IMPUESTOS", "prioridad": 2,
                    "acciones": [{"operacion": "SET", "campo": "cuenta", "valor": "2.1.99"}]
                },
                {
                    "codigo": "LINEA", "tipo": "TRANSFORMACION", "aplicaA": "LINEAS", "prioridad": 3,
                    "acciones": [{"operacion": "SET", "campo": "cuenta", "valor": "5.1"}]
                }
            ])),
        ));
        let outcome = engine.run(document(json!({
            "lineas": [{"descripcion": "Film"}],
            "impuestos": [{"tipo": "IVA", "alicuota": 21}, {"tipo": "IIBB", "alicuota": 3.5}]
        })));

        assert_eq!(outcome.document.taxes[0].value("cuenta").as_text(), "2.1.01");
        assert_eq!(outcome.document.taxes[1].value("cuenta").as_text(), "2.1.99");
        assert_eq!(outcome.document.lines[0].value("cuenta").as_text(), "5.1");
        assert!(!outcome.document.header.contains("cuenta"));

        let skipped: Vec<_> = outcome
            .report
            .diagnostics
            .iter()
            .filter(|d| matches!(d.kind, DiagnosticKind::Skipped { .. }))
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].rule_code, "OTRO");
        assert_eq!(skipped[0].instance(), ScopeInstance::tax(1));
    }

    #[test]
    fn document_rules_quantify_over_tax_lines() {
        let engine = RuleEngine::new(RuleSet::new(
            "t",
            rules(json!([
                {
                    "codigo": "PERCEPCION", "tipo": "TRANSFORMACION_DOCUMENTO", "prioridad": 1,
                    "condiciones": {
                        "operador": "ANY_TAX_LINE",
                        "condicion": {"campo": "tipo", "operador": "STARTS_WITH", "valor": "PERC"}
                    },
                    "acciones": [{"operacion": "SET", "campo": "conPercepcion", "valor": true}]
                },
                {
                    "codigo": "SOLO_IVA", "tipo": "TRANSFORMACION_DOCUMENTO", "prioridad": 2,
                    "condiciones": {
                        "operador": "ALL_TAX_LINES",
                        "condicion": {"campo": "tipo", "operador": "EQUALS", "valor": "IVA"}
                    },
                    "acciones": [{"operacion": "SET", "campo": "soloIva", "valor": true}]
                }
            ])),
        ));

        let mixed = engine.run(document(json!({
            "impuestos": [{"tipo": "IVA"}, {"tipo": "PERC IIBB"}]
        })));
        assert_eq!(mixed.document.header.value("conPercepcion"), &FieldValue::Bool(true));
        assert!(!mixed.document.header.contains("soloIva"));

        let plain = engine.run(document(json!({"impuestos": [{"tipo": "IVA"}, {"tipo": "iva"}]})));
        assert!(!plain.document.header.contains("conPercepcion"));
        assert_eq!(plain.document.header.value("soloIva"), &FieldValue::Bool(true));
    }

    #[test]
    fn failed_action_leaves_field_and_keeps_later_actions() {
        let engine = RuleEngine::new(RuleSet::new(
            "t",
            rules(json!([{
                "codigo": "LK", "tipo": "TRANSFORMACION",
                "acciones": [
                    {"operacion": "LOOKUP_REPLACE", "campo": "prov", "tabla": "faltante",
                     "claveOrigen": "a", "claveDestino": "b"},
                    {"operacion": "UPPER_CASE", "campo": "prov"}
                ]
            }])),
        ));
        let outcome = engine.run(document(json!({"prov": "acme"})));

        assert_eq!(outcome.document.header.value("prov").as_text(), "ACME");
        let kinds: Vec<_> = outcome.report.diagnostics.iter().map(|d| &d.kind).collect();
        assert!(matches!(kinds[0], DiagnosticKind::Matched { changes } if changes.len() == 1));
        assert!(matches!(kinds[1], DiagnosticKind::ActionError { action, .. } if action == "LOOKUP_REPLACE"));
    }

    #[test]
    fn validation_failure_blocks_the_document() {
        let engine = RuleEngine::new(RuleSet::new(
            "t",
            rules(json!([{
                "codigo": "CUIT", "tipo": "VALIDACION",
                "condiciones": [{"campo": "cuit", "operador": "REGEX", "valor": "^\\d{11}$"}],
                "validacion": {"nivel": "ERROR", "mensaje": "CUIT invalido"}
            }])),
        ));

        let bad = engine.run(document(json!({"cuit": "30-7"})));
        assert_eq!(bad.report.verdict, Verdict::Blocked);

        let good = engine.run(document(json!({"cuit": "30712345679"})));
        assert_eq!(good.report.verdict, Verdict::Pass);
    }

    #[test]
    fn document_rules_read_lines_through_quantifiers() {
        let engine = RuleEngine::new(RuleSet::new(
            "t",
            rules(json!([{
                "codigo": "CON_BANDEJAS", "tipo": "TRANSFORMACION_DOCUMENTO",
                "condiciones": {
                    "operador": "ANY_LINE",
                    "condicion": {"campo": "descripcion", "operador": "CONTAINS", "valor": "bandeja"}
                },
                "acciones": [{"operacion": "SET", "campo": "categoria", "valor": "PACKAGING"}]
            }])),
        ));
        let outcome = engine.run(document(json!({
            "lineas": [{"descripcion": "Film"}, {"descripcion": "BANDEJA 20x30"}]
        })));

        assert_eq!(outcome.document.header.value("categoria").as_text(), "PACKAGING");
        assert!(!outcome.document.lines[1].contains("categoria"));
    }

    #[test]
    fn zero_budget_times_out() {
        let engine = RuleEngine::new(RuleSet::new(
            "t",
            rules(json!([{"codigo": "A", "tipo": "TRANSFORMACION"}])),
        ));
        let result = engine.run_within(document(json!({})), Duration::ZERO);
        assert!(matches!(result, Err(RunError::Timeout(_))));
    }
}
