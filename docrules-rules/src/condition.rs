use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

use docrules_protocol::document::{Document, FieldStore, FieldValue, Scope, ScopeInstance};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{ConditionError, RuleError};
use crate::transform::{read_field, FieldTransformation};

const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// Key of a field inside a [`FieldStore`]. Nested values use dotted keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parse(raw: Option<String>, context: &str) -> Result<Self, RuleError> {
        match raw {
            Some(path) if !path.trim().is_empty() => Ok(FieldPath(path.trim().to_string())),
            _ => Err(RuleError::invalid(format!("{} requires a field name", context))),
        }
    }
}

impl From<&str> for FieldPath {
    fn from(value: &str) -> Self {
        FieldPath::new(value)
    }
}

impl From<String> for FieldPath {
    fn from(value: String) -> Self {
        FieldPath::new(value)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Leaf comparison operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    #[serde(rename = "REGEX", alias = "MATCHES")]
    Matches,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    IsEmpty,
    IsNotEmpty,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
}

impl Operator {
    fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(Value::String(raw.to_ascii_uppercase())).ok()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operator::Equals => "EQUALS",
            Operator::NotEquals => "NOT_EQUALS",
            Operator::Contains => "CONTAINS",
            Operator::NotContains => "NOT_CONTAINS",
            Operator::StartsWith => "STARTS_WITH",
            Operator::EndsWith => "ENDS_WITH",
            Operator::Matches => "REGEX",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
            Operator::IsNull => "IS_NULL",
            Operator::IsNotNull => "IS_NOT_NULL",
            Operator::IsEmpty => "IS_EMPTY",
            Operator::IsNotEmpty => "IS_NOT_EMPTY",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::LessThan => "LESS_THAN",
            Operator::GreaterOrEqual => "GREATER_OR_EQUAL",
            Operator::LessOrEqual => "LESS_OR_EQUAL",
        }
    }

    fn is_unary(&self) -> bool {
        matches!(
            self,
            Operator::IsNull | Operator::IsNotNull | Operator::IsEmpty | Operator::IsNotEmpty
        )
    }
}

/// Case-insensitive regular expression compiled when the rule is loaded.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn compile(source: &str) -> Result<Self, regex::Error> {
        RegexBuilder::new(source)
            .case_insensitive(true)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map(Pattern)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.0.is_match(haystack)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Value(FieldValue),
    List(Vec<FieldValue>),
    Field(FieldPath),
    Pattern(Pattern),
}

/// Leaf node: `campo operador valor`.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub field: FieldPath,
    pub operator: Operator,
    pub operand: Operand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    Any,
    All,
}

/// Validated predicate tree.
///
/// The wire form is [`ConditionSpec`]; conversion rejects malformed trees so
/// evaluation never meets an unknown operator or an invalid literal regex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConditionSpec", into = "ConditionSpec")]
pub enum Condition {
    Always,
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Compare(Comparison),
    /// Evaluates the child against the line items or tax lines of the
    /// document. Only meaningful on the document header.
    Across {
        scope: Scope,
        quantifier: Quantifier,
        condition: Box<Condition>,
    },
}

/// Everything a condition may read while being evaluated.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub document: &'a Document,
    pub instance: ScopeInstance,
    pub transforms: &'a [FieldTransformation],
}

impl<'a> EvalContext<'a> {
    pub fn new(
        document: &'a Document,
        instance: ScopeInstance,
        transforms: &'a [FieldTransformation],
    ) -> Self {
        Self {
            document,
            instance,
            transforms,
        }
    }

    fn store(&self) -> Option<&'a FieldStore> {
        self.document.store(self.instance)
    }

    fn read(&self, field: &FieldPath) -> Cow<'a, FieldValue> {
        match self.store() {
            Some(store) => read_field(store, self.transforms, field.as_str()),
            None => Cow::Owned(FieldValue::Null),
        }
    }

    fn at(&self, instance: ScopeInstance) -> Self {
        Self { instance, ..*self }
    }
}

impl Condition {
    pub fn always() -> Self {
        Condition::Always
    }

    pub fn compare(field: impl Into<FieldPath>, operator: Operator, operand: Operand) -> Self {
        Condition::Compare(Comparison {
            field: field.into(),
            operator,
            operand,
        })
    }

    pub fn equals(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Self::compare(field, Operator::Equals, Operand::Value(value.into()))
    }

    pub fn is_null(field: impl Into<FieldPath>) -> Self {
        Self::compare(field, Operator::IsNull, Operand::None)
    }

    /// Whether the tree reads other scopes of the document.
    pub fn reads_across_scopes(&self) -> bool {
        match self {
            Condition::Across { .. } => true,
            Condition::All(children) | Condition::Any(children) => {
                children.iter().any(Condition::reads_across_scopes)
            }
            Condition::Not(child) => child.reads_across_scopes(),
            Condition::Always | Condition::Compare(_) => false,
        }
    }

    /// Evaluates the tree, short-circuiting AND/OR left to right.
    ///
    /// Recoverable problems make the offending leaf false and are pushed to
    /// `issues`. Callers must treat a non-empty `issues` as a non-match,
    /// since NOT inverts the failed leaf.
    pub fn evaluate(&self, ctx: &EvalContext<'_>, issues: &mut Vec<ConditionError>) -> bool {
        match self {
            Condition::Always => true,
            Condition::All(children) => children.iter().all(|child| child.evaluate(ctx, issues)),
            Condition::Any(children) => children.iter().any(|child| child.evaluate(ctx, issues)),
            Condition::Not(child) => !child.evaluate(ctx, issues),
            Condition::Compare(comparison) => match comparison.evaluate(ctx) {
                Ok(result) => result,
                Err(issue) => {
                    warn!(error = %issue, "condition leaf failed closed");
                    issues.push(issue);
                    false
                }
            },
            Condition::Across {
                scope,
                quantifier,
                condition,
            } => {
                let count = match scope {
                    Scope::LineItem => ctx.document.lines.len(),
                    Scope::TaxLine => ctx.document.taxes.len(),
                    Scope::Document => 1,
                };
                let mut instances = (1..=count).map(|index| match scope {
                    Scope::LineItem => ScopeInstance::line(index),
                    Scope::TaxLine => ScopeInstance::tax(index),
                    Scope::Document => ScopeInstance::document(),
                });
                match quantifier {
                    Quantifier::Any => {
                        instances.any(|instance| condition.evaluate(&ctx.at(instance), issues))
                    }
                    Quantifier::All => {
                        instances.all(|instance| condition.evaluate(&ctx.at(instance), issues))
                    }
                }
            }
        }
    }
}

impl Comparison {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool, ConditionError> {
        let left = ctx.read(&self.field);

        if left.is_null() {
            return Ok(matches!(self.operator, Operator::IsNull | Operator::IsEmpty));
        }

        match self.operator {
            Operator::IsNull => return Ok(false),
            Operator::IsNotNull => return Ok(true),
            Operator::IsEmpty => return Ok(left.is_empty()),
            Operator::IsNotEmpty => return Ok(!left.is_empty()),
            _ => {}
        }

        if let (Operator::Matches, Operand::Pattern(pattern)) = (self.operator, &self.operand) {
            return Ok(pattern.is_match(&left.as_text()));
        }

        let right = match &self.operand {
            Operand::Field(path) => ctx.read(path).into_owned(),
            Operand::Value(value) => value.clone(),
            Operand::List(_) | Operand::None | Operand::Pattern(_) => FieldValue::Null,
        };

        match self.operator {
            Operator::Equals => Ok(!right.is_null() && values_equal(&left, &right)),
            Operator::NotEquals => Ok(right.is_null() || !values_equal(&left, &right)),
            Operator::Contains => Ok(upper(&left).contains(&upper(&right))),
            Operator::NotContains => Ok(!upper(&left).contains(&upper(&right))),
            Operator::StartsWith => Ok(upper(&left).starts_with(&upper(&right))),
            Operator::EndsWith => Ok(upper(&left).ends_with(&upper(&right))),
            Operator::In => Ok(self.candidates(&right).iter().any(|c| values_equal(&left, c))),
            Operator::NotIn => Ok(!self.candidates(&right).iter().any(|c| values_equal(&left, c))),
            Operator::Matches => {
                let source = right.as_text();
                let pattern =
                    Pattern::compile(&source).map_err(|err| ConditionError::InvalidPattern {
                        pattern: source.to_string(),
                        message: err.to_string(),
                    })?;
                Ok(pattern.is_match(&left.as_text()))
            }
            Operator::GreaterThan => self.order(&left, &right).map(|o| o == Ordering::Greater),
            Operator::LessThan => self.order(&left, &right).map(|o| o == Ordering::Less),
            Operator::GreaterOrEqual => self.order(&left, &right).map(|o| o != Ordering::Less),
            Operator::LessOrEqual => self.order(&left, &right).map(|o| o != Ordering::Greater),
            Operator::IsNull | Operator::IsNotNull | Operator::IsEmpty | Operator::IsNotEmpty => {
                Ok(false)
            }
        }
    }

    fn candidates(&self, right: &FieldValue) -> Vec<FieldValue> {
        match &self.operand {
            Operand::List(items) => items.clone(),
            _ => split_list(&right.as_text()),
        }
    }

    fn order(&self, left: &FieldValue, right: &FieldValue) -> Result<Ordering, ConditionError> {
        compare_values(left, right).ok_or_else(|| ConditionError::NotComparable {
            field: self.field.to_string(),
            operator: self.operator.name().to_string(),
            left: left.as_text().into_owned(),
            right: right.as_text().into_owned(),
        })
    }
}

fn upper(value: &FieldValue) -> String {
    value.as_text().to_uppercase()
}

fn split_list(raw: &str) -> Vec<FieldValue> {
    raw.split(',')
        .map(|item| FieldValue::text(item.trim()))
        .collect()
}

/// Equality used by EQUALS/IN: numeric when either side is a number, by
/// calendar day when either side is a date, otherwise case-insensitive text.
pub(crate) fn values_equal(left: &FieldValue, right: &FieldValue) -> bool {
    let numeric = left.is_numeric() || right.is_numeric();
    if numeric {
        if let (Some(l), Some(r)) = (left.as_number(), right.as_number()) {
            return (l - r).abs() < f64::EPSILON;
        }
    }
    let dated = left.is_date() || right.is_date();
    if dated {
        if let (Some(l), Some(r)) = (left.as_date(), right.as_date()) {
            return l == r;
        }
    }
    upper(left) == upper(right)
}

/// Ordering for the relational operators: dates when either side is a
/// date, numbers otherwise.
fn compare_values(left: &FieldValue, right: &FieldValue) -> Option<Ordering> {
    let dated = left.is_date() || right.is_date();
    if dated {
        return Some(left.as_date()?.cmp(&right.as_date()?));
    }
    left.as_number()?.partial_cmp(&right.as_number()?)
}

/// Serialized shape of a condition node.
///
/// Accepts a bare array (implicit AND), a combinator
/// `{operador: AND|OR|NOT, condiciones|condicion}`, a quantifier
/// `{operador: ANY_LINE|ALL_LINES|ANY_TAX_LINE|ALL_TAX_LINES, condicion}`, or
/// a leaf `{campo, operador, valor|valorCampo}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    List(Vec<ConditionSpec>),
    Node(ConditionNodeSpec),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionNodeSpec {
    #[serde(rename = "operador", alias = "operator")]
    pub operator: String,
    #[serde(rename = "campo", default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(rename = "valor", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(rename = "valorCampo", default, skip_serializing_if = "Option::is_none")]
    pub value_field: Option<String>,
    #[serde(rename = "condiciones", default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ConditionSpec>>,
    #[serde(rename = "condicion", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Box<ConditionSpec>>,
}

impl ConditionSpec {
    /// Applies a legacy rule-level `logicOperator` to a bare array.
    pub fn with_logic_operator(self, logic: Option<&str>) -> ConditionSpec {
        match (self, logic) {
            (ConditionSpec::List(items), Some(op)) => ConditionSpec::Node(ConditionNodeSpec {
                operator: op.to_ascii_uppercase(),
                conditions: Some(items),
                ..ConditionNodeSpec::default()
            }),
            (spec, _) => spec,
        }
    }
}

impl TryFrom<ConditionSpec> for Condition {
    type Error = RuleError;

    fn try_from(spec: ConditionSpec) -> Result<Self, Self::Error> {
        match spec {
            ConditionSpec::List(items) => build_group(items, Condition::All),
            ConditionSpec::Node(node) => Condition::try_from(node),
        }
    }
}

fn build_group(
    items: Vec<ConditionSpec>,
    wrap: fn(Vec<Condition>) -> Condition,
) -> Result<Condition, RuleError> {
    let children = items
        .into_iter()
        .map(Condition::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    if children.is_empty() {
        return Ok(Condition::Always);
    }
    Ok(wrap(children))
}

fn single_child(node: ConditionNodeSpec, name: &str) -> Result<Box<Condition>, RuleError> {
    let child = node
        .condition
        .map(|child| *child)
        .or_else(|| {
            node.conditions
                .filter(|items| !items.is_empty())
                .map(ConditionSpec::List)
        })
        .ok_or_else(|| RuleError::invalid(format!("{} requires a nested condition", name)))?;
    Ok(Box::new(Condition::try_from(child)?))
}

impl TryFrom<ConditionNodeSpec> for Condition {
    type Error = RuleError;

    fn try_from(node: ConditionNodeSpec) -> Result<Self, Self::Error> {
        let name = node.operator.trim().to_ascii_uppercase();
        let across = |scope, quantifier, node| -> Result<Condition, RuleError> {
            Ok(Condition::Across {
                scope,
                quantifier,
                condition: single_child(node, &name)?,
            })
        };

        match name.as_str() {
            "ALWAYS" => Ok(Condition::Always),
            "AND" | "ALL" => build_group(node.conditions.unwrap_or_default(), Condition::All),
            "OR" | "ANY" => build_group(node.conditions.unwrap_or_default(), Condition::Any),
            "NOT" => Ok(Condition::Not(single_child(node, "NOT")?)),
            "ANY_LINE" => across(Scope::LineItem, Quantifier::Any, node),
            "ALL_LINES" => across(Scope::LineItem, Quantifier::All, node),
            "ANY_TAX_LINE" => across(Scope::TaxLine, Quantifier::Any, node),
            "ALL_TAX_LINES" => across(Scope::TaxLine, Quantifier::All, node),
            _ => build_comparison(node, &name),
        }
    }
}

fn build_comparison(node: ConditionNodeSpec, name: &str) -> Result<Condition, RuleError> {
    let operator = Operator::parse(name)
        .ok_or_else(|| RuleError::invalid(format!("unknown condition operator `{}`", name)))?;
    let field = FieldPath::parse(node.field, &format!("condition {}", name))?;

    let operand = if operator.is_unary() {
        Operand::None
    } else if let Some(other) = node.value_field.filter(|f| !f.trim().is_empty()) {
        Operand::Field(FieldPath::new(other.trim()))
    } else {
        match (operator, node.value) {
            (_, None) | (_, Some(Value::Null)) => {
                return Err(RuleError::invalid(format!(
                    "condition {} on `{}` requires `valor` or `valorCampo`",
                    name, field
                )))
            }
            (Operator::Matches, Some(raw)) => {
                let source = match raw {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                let pattern = Pattern::compile(&source).map_err(|err| {
                    RuleError::invalid(format!("invalid pattern `{}`: {}", source, err))
                })?;
                Operand::Pattern(pattern)
            }
            (Operator::In | Operator::NotIn, Some(Value::Array(items))) => {
                Operand::List(items.iter().map(FieldValue::from_json).collect())
            }
            (_, Some(raw)) => Operand::Value(FieldValue::from_json(&raw)),
        }
    };

    Ok(Condition::Compare(Comparison {
        field,
        operator,
        operand,
    }))
}

impl From<Condition> for ConditionSpec {
    fn from(condition: Condition) -> Self {
        let node = |operator: &str| ConditionNodeSpec {
            operator: operator.to_string(),
            ..ConditionNodeSpec::default()
        };
        let spec = match condition {
            Condition::Always => node("ALWAYS"),
            Condition::All(children) => ConditionNodeSpec {
                conditions: Some(children.into_iter().map(Into::into).collect()),
                ..node("AND")
            },
            Condition::Any(children) => ConditionNodeSpec {
                conditions: Some(children.into_iter().map(Into::into).collect()),
                ..node("OR")
            },
            Condition::Not(child) => ConditionNodeSpec {
                condition: Some(Box::new((*child).into())),
                ..node("NOT")
            },
            Condition::Across {
                scope,
                quantifier,
                condition,
            } => {
                let name = match (scope, quantifier) {
                    (Scope::TaxLine, Quantifier::Any) => "ANY_TAX_LINE",
                    (Scope::TaxLine, Quantifier::All) => "ALL_TAX_LINES",
                    (_, Quantifier::Any) => "ANY_LINE",
                    (_, Quantifier::All) => "ALL_LINES",
                };
                ConditionNodeSpec {
                    condition: Some(Box::new((*condition).into())),
                    ..node(name)
                }
            }
            Condition::Compare(comparison) => {
                let mut spec = node(comparison.operator.name());
                spec.field = Some(comparison.field.to_string());
                match comparison.operand {
                    Operand::None => {}
                    Operand::Value(value) => spec.value = Some(value.to_json()),
                    Operand::List(items) => {
                        spec.value = Some(Value::Array(items.iter().map(FieldValue::to_json).collect()))
                    }
                    Operand::Field(path) => spec.value_field = Some(path.to_string()),
                    Operand::Pattern(pattern) => {
                        spec.value = Some(Value::String(pattern.as_str().to_string()))
                    }
                }
                spec
            }
        };
        ConditionSpec::Node(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn document(fields: Value) -> Document {
        Document::from_json(&fields).expect("document")
    }

    fn eval(condition: &Condition, doc: &Document) -> (bool, Vec<ConditionError>) {
        let mut issues = Vec::new();
        let ctx = EvalContext::new(doc, ScopeInstance::document(), &[]);
        let result = condition.evaluate(&ctx, &mut issues);
        (result, issues)
    }

    fn parse(value: Value) -> Condition {
        serde_json::from_value(value).expect("condition")
    }

    #[test_case(json!({"campo": "tipo", "operador": "EQUALS", "valor": "bandejas"}), true ; "equals ignores case")]
    #[test_case(json!({"campo": "tipo", "operador": "NOT_EQUALS", "valor": "FILM"}), true ; "not equals")]
    #[test_case(json!({"campo": "descripcion", "operador": "CONTAINS", "valor": "plast"}), true ; "contains ignores case")]
    #[test_case(json!({"campo": "descripcion", "operador": "STARTS_WITH", "valor": "bandeja"}), true ; "starts with")]
    #[test_case(json!({"campo": "total", "operador": "GREATER_THAN", "valor": 1000}), true ; "numeric greater")]
    #[test_case(json!({"campo": "total", "operador": "LESS_OR_EQUAL", "valor": "1210"}), true ; "numeric text operand")]
    #[test_case(json!({"campo": "fecha", "operador": "LESS_THAN", "valor": "2024-06-01"}), true ; "date ordering")]
    #[test_case(json!({"campo": "tipo", "operador": "IN", "valor": "FILM, BANDEJAS"}), true ; "in comma list")]
    #[test_case(json!({"campo": "tipo", "operador": "NOT_IN", "valor": ["FILM", "CAJAS"]}), true ; "not in array")]
    #[test_case(json!({"campo": "cuit", "operador": "REGEX", "valor": "^30-\\d{8}-\\d$"}), true ; "regex")]
    #[test_case(json!({"campo": "codigoProducto", "operador": "IS_NULL"}), true ; "missing is null")]
    #[test_case(json!({"campo": "codigoProducto", "operador": "EQUALS", "valor": "X"}), false ; "missing fails equals")]
    #[test_case(json!({"campo": "codigoProducto", "operador": "NOT_EQUALS", "valor": "X"}), false ; "missing fails not equals")]
    #[test_case(json!({"campo": "vacio", "operador": "IS_EMPTY"}), true ; "empty string")]
    #[test_case(json!({"campo": "tipo", "operador": "EQUALS", "valorCampo": "tipoEsperado"}), true ; "compares against other field")]
    fn evaluates_leaf_operators(spec: Value, expected: bool) {
        let doc = document(json!({
            "tipo": "BANDEJAS",
            "tipoEsperado": "Bandejas",
            "descripcion": "Bandeja plastica",
            "total": 1210.0,
            "fecha": "2024-03-15",
            "cuit": "30-71234567-9",
            "vacio": ""
        }));
        let (result, issues) = eval(&parse(spec), &doc);
        assert_eq!(result, expected);
        assert!(issues.is_empty());
    }

    #[test]
    fn and_short_circuits_left_to_right() {
        let doc = document(json!({"total": "n/a"}));
        let condition = parse(json!({
            "operador": "AND",
            "condiciones": [
                {"campo": "tipo", "operador": "IS_NOT_NULL"},
                {"campo": "total", "operador": "GREATER_THAN", "valor": 5}
            ]
        }));

        let (result, issues) = eval(&condition, &doc);
        assert!(!result);
        assert!(issues.is_empty(), "second leaf must not run");
    }

    #[test]
    fn non_numeric_comparison_fails_closed_with_issue() {
        let doc = document(json!({"total": "n/a"}));
        let condition = parse(json!([
            {"campo": "total", "operador": "GREATER_THAN", "valor": 5}
        ]));

        let (result, issues) = eval(&condition, &doc);
        assert!(!result);
        assert!(matches!(issues[0], ConditionError::NotComparable { .. }));
    }

    #[test]
    fn dynamic_invalid_pattern_fails_closed() {
        let doc = document(json!({"cuit": "30", "patron": "(unclosed"}));
        let condition = parse(json!({"campo": "cuit", "operador": "REGEX", "valorCampo": "patron"}));

        let (result, issues) = eval(&condition, &doc);
        assert!(!result);
        assert!(matches!(issues[0], ConditionError::InvalidPattern { .. }));
    }

    #[test]
    fn literal_invalid_pattern_is_rejected_at_load() {
        let err = serde_json::from_value::<Condition>(
            json!({"campo": "cuit", "operador": "REGEX", "valor": "(unclosed"}),
        )
        .expect_err("must reject");
        assert!(err.to_string().contains("invalid pattern"));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = serde_json::from_value::<Condition>(
            json!({"campo": "cuit", "operador": "SOUNDS_LIKE", "valor": "x"}),
        )
        .expect_err("must reject");
        assert!(err.to_string().contains("SOUNDS_LIKE"));
    }

    #[test]
    fn legacy_array_with_or_logic() {
        let spec: ConditionSpec = serde_json::from_value(json!([
            {"campo": "a", "operador": "EQUALS", "valor": "1"},
            {"campo": "b", "operador": "EQUALS", "valor": "2"}
        ]))
        .expect("spec");
        let condition = Condition::try_from(spec.with_logic_operator(Some("or"))).expect("condition");
        assert!(matches!(condition, Condition::Any(ref children) if children.len() == 2));
    }

    #[test]
    fn quantifier_reads_line_items() {
        let doc = document(json!({
            "numero": "A-1",
            "lineas": [{"descripcion": "Film"}, {"descripcion": "Bandeja x10"}]
        }));
        let any = parse(json!({
            "operador": "ANY_LINE",
            "condicion": {"campo": "descripcion", "operador": "CONTAINS", "valor": "bandeja"}
        }));
        let all = parse(json!({
            "operador": "ALL_LINES",
            "condicion": {"campo": "descripcion", "operador": "CONTAINS", "valor": "bandeja"}
        }));

        assert!(eval(&any, &doc).0);
        assert!(!eval(&all, &doc).0);
        assert!(any.reads_across_scopes());
    }

    #[test]
    fn serialized_form_parses_back() {
        let condition = parse(json!({
            "operador": "OR",
            "condiciones": [
                {"campo": "tipo", "operador": "REGEX", "valor": "^BAND"},
                {"operador": "NOT", "condicion": {"campo": "x", "operador": "IS_NULL"}}
            ]
        }));
        let value = serde_json::to_value(&condition).expect("serialize");
        assert_eq!(parse(value), condition);
    }
}
