use std::fmt;

use chrono::{DateTime, Utc};
use docrules_protocol::document::Scope;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::condition::{Condition, ConditionSpec};
use crate::error::RuleError;
use crate::transform::FieldTransformation;

/// Rule family. Stop-on-match is scoped to one family per scope instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    Extraccion,
    Transformacion,
    TransformacionDocumento,
    Validacion,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Extraccion => "EXTRACCION",
            RuleType::Transformacion => "TRANSFORMACION",
            RuleType::TransformacionDocumento => "TRANSFORMACION_DOCUMENTO",
            RuleType::Validacion => "VALIDACION",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope types a rule is evaluated on (`aplicaA`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RuleTarget {
    Scope(Scope),
    All,
}

impl RuleTarget {
    pub fn includes(&self, scope: Scope) -> bool {
        match self {
            RuleTarget::All => true,
            RuleTarget::Scope(own) => *own == scope,
        }
    }
}

impl Default for RuleTarget {
    fn default() -> Self {
        RuleTarget::Scope(Scope::Document)
    }
}

impl TryFrom<String> for RuleTarget {
    type Error = RuleError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let upper = raw.trim().to_ascii_uppercase();
        if matches!(upper.as_str(), "ALL" | "TODOS") {
            return Ok(RuleTarget::All);
        }
        serde_json::from_value::<Scope>(serde_json::Value::String(upper))
            .map(RuleTarget::Scope)
            .map_err(|_| RuleError::invalid(format!("unknown rule target `{}`", raw)))
    }
}

impl From<RuleTarget> for String {
    fn from(target: RuleTarget) -> Self {
        match target {
            RuleTarget::All => "ALL".to_string(),
            RuleTarget::Scope(scope) => scope.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    Error,
}

/// Finding emitted by a VALIDACION rule whose condition does not hold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Validation {
    #[serde(rename = "nivel", default = "Validation::default_level")]
    pub level: Severity,
    #[serde(rename = "mensaje")]
    pub message: String,
}

impl Validation {
    fn default_level() -> Severity {
        Severity::Error
    }
}

/// Declarative business rule applied to the fields of a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RuleSpec", into = "RuleSpec")]
pub struct Rule {
    pub id: String,
    /// Unique within the owning tenant, or among globals.
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub kind: RuleType,
    /// Ascending evaluation order.
    pub priority: i32,
    pub active: bool,
    /// `None` marks a global rule.
    pub tenant_id: Option<String>,
    pub condition: Condition,
    pub actions: Vec<Action>,
    pub stop_on_match: bool,
    pub target: RuleTarget,
    pub effective_from: Option<DateTime<Utc>>,
    pub field_transforms: Vec<FieldTransformation>,
    pub validation: Option<Validation>,
}

impl Rule {
    pub fn default_priority() -> i32 {
        100
    }

    pub fn is_global(&self) -> bool {
        self.tenant_id.is_none()
    }

    /// Namespace in which `code` must be unique.
    pub fn namespace(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or("global")
    }

    pub fn is_in_force(&self, as_of: DateTime<Utc>) -> bool {
        self.active && self.effective_from.map_or(true, |from| from <= as_of)
    }

    pub fn applies_to(&self, scope: Scope) -> bool {
        self.target.includes(scope)
    }
}

/// Serialized shape of a rule, as stored in rule files and in the
/// `reglas_negocio` configuration column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "codigo", alias = "code")]
    pub code: String,
    #[serde(rename = "nombre", alias = "name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "descripcion", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "tipo")]
    pub kind: RuleType,
    #[serde(rename = "prioridad", default = "Rule::default_priority")]
    pub priority: i32,
    #[serde(rename = "activa", default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(rename = "condiciones", default = "empty_conditions")]
    pub conditions: ConditionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic_operator: Option<String>,
    #[serde(rename = "acciones", default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub stop_on_match: bool,
    #[serde(rename = "aplicaA", default, skip_serializing_if = "Option::is_none")]
    pub target: Option<RuleTarget>,
    #[serde(rename = "fechaVigencia", default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(rename = "transformacionesCampo", default, skip_serializing_if = "Vec::is_empty")]
    pub field_transforms: Vec<FieldTransformation>,
    #[serde(rename = "validacion", default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
}

fn default_active() -> bool {
    true
}

fn empty_conditions() -> ConditionSpec {
    ConditionSpec::List(Vec::new())
}

impl TryFrom<RuleSpec> for Rule {
    type Error = RuleError;

    fn try_from(spec: RuleSpec) -> Result<Self, Self::Error> {
        let code = spec.code.trim().to_string();
        if code.is_empty() {
            return Err(RuleError::invalid("rule requires a non-empty `codigo`"));
        }
        let context = |err: RuleError| RuleError::invalid(format!("rule `{}`: {}", code, err));

        let condition = Condition::try_from(
            spec.conditions
                .with_logic_operator(spec.logic_operator.as_deref()),
        )
        .map_err(context)?;

        if condition.reads_across_scopes() && spec.kind != RuleType::TransformacionDocumento {
            return Err(context(RuleError::invalid(
                "line/tax quantifiers are only allowed in TRANSFORMACION_DOCUMENTO rules",
            )));
        }

        let target = match spec.kind {
            RuleType::TransformacionDocumento => RuleTarget::Scope(Scope::Document),
            _ => spec.target.unwrap_or_default(),
        };

        let name = spec
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| code.clone());

        let validation = match spec.kind {
            RuleType::Validacion => Some(spec.validation.unwrap_or_else(|| Validation {
                level: Severity::Error,
                message: name.clone(),
            })),
            _ => spec.validation,
        };

        Ok(Rule {
            id: spec.id.unwrap_or_else(|| code.clone()),
            code,
            name,
            description: spec.description,
            kind: spec.kind,
            priority: spec.priority,
            active: spec.active,
            tenant_id: spec.tenant_id.filter(|tenant| !tenant.trim().is_empty()),
            condition,
            actions: spec.actions,
            stop_on_match: spec.stop_on_match,
            target,
            effective_from: spec.effective_from,
            field_transforms: spec.field_transforms,
            validation,
        })
    }
}

impl From<Rule> for RuleSpec {
    fn from(rule: Rule) -> Self {
        RuleSpec {
            id: Some(rule.id),
            code: rule.code,
            name: Some(rule.name),
            description: rule.description,
            kind: rule.kind,
            priority: rule.priority,
            active: rule.active,
            tenant_id: rule.tenant_id,
            conditions: rule.condition.into(),
            logic_operator: None,
            actions: rule.actions,
            stop_on_match: rule.stop_on_match,
            target: Some(rule.target),
            effective_from: rule.effective_from,
            field_transforms: rule.field_transforms,
            validation: rule.validation,
        }
    }
}
