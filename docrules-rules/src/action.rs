use docrules_protocol::document::FieldValue;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::condition::FieldPath;
use crate::error::RuleError;
use crate::formula::Formula;
use crate::transform::Transformation;

/// Where an action takes the value it writes.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSource {
    Literal(FieldValue),
    Field(FieldPath),
}

/// One hop of a `LOOKUP_CHAIN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStep {
    #[serde(rename = "tabla")]
    pub table: String,
    #[serde(rename = "claveOrigen", alias = "campoConsulta")]
    pub source_key: String,
    #[serde(rename = "claveDestino", alias = "campoResultado")]
    pub target_key: String,
}

/// Typed mutation applied to the store of the matched scope instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ActionSpec", into = "ActionSpec")]
pub enum Action {
    SetValue {
        field: FieldPath,
        source: ValueSource,
    },
    CopyField {
        from: FieldPath,
        to: FieldPath,
        force: bool,
    },
    LookupReplace {
        field: FieldPath,
        origin: Option<FieldPath>,
        table: String,
        source_key: String,
        target_key: String,
        threshold: f64,
        default: Option<FieldValue>,
    },
    Transform {
        field: FieldPath,
        transformation: Transformation,
    },
    Append {
        field: FieldPath,
        source: ValueSource,
    },
    Calculate {
        field: FieldPath,
        formula: Formula,
    },
    LookupChain {
        field: FieldPath,
        origin: Option<FieldPath>,
        steps: Vec<ChainStep>,
        default: Option<FieldValue>,
    },
}

impl Action {
    pub fn set_value(field: impl Into<FieldPath>, value: impl Into<FieldValue>) -> Self {
        Action::SetValue {
            field: field.into(),
            source: ValueSource::Literal(value.into()),
        }
    }

    pub fn copy_field(from: impl Into<FieldPath>, to: impl Into<FieldPath>) -> Self {
        Action::CopyField {
            from: from.into(),
            to: to.into(),
            force: false,
        }
    }

    pub fn transform(field: impl Into<FieldPath>, transformation: Transformation) -> Self {
        Action::Transform {
            field: field.into(),
            transformation,
        }
    }

    /// Operation name as written in rule files.
    pub fn name(&self) -> &'static str {
        match self {
            Action::SetValue { .. } => "SET_VALUE",
            Action::CopyField { .. } => "COPY_FIELD",
            Action::LookupReplace { .. } => "LOOKUP_REPLACE",
            Action::Transform { transformation, .. } => transformation.name(),
            Action::Append { .. } => "APPEND",
            Action::Calculate { .. } => "CALCULATE",
            Action::LookupChain { .. } => "LOOKUP_CHAIN",
        }
    }

    /// Field written by the action.
    pub fn target(&self) -> &FieldPath {
        match self {
            Action::SetValue { field, .. }
            | Action::LookupReplace { field, .. }
            | Action::Transform { field, .. }
            | Action::Append { field, .. }
            | Action::Calculate { field, .. }
            | Action::LookupChain { field, .. } => field,
            Action::CopyField { to, .. } => to,
        }
    }

    /// Reference tables the action reads.
    pub fn tables(&self) -> Vec<&str> {
        match self {
            Action::LookupReplace { table, .. } => vec![table.as_str()],
            Action::LookupChain { steps, .. } => {
                steps.iter().map(|step| step.table.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Serialized shape of an action, keyed by `operacion`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    #[serde(rename = "operacion", alias = "operation")]
    pub operation: String,
    #[serde(rename = "campo", default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// An explicit `"valor": null` is kept as `Some(Value::Null)`.
    #[serde(
        rename = "valor",
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
    #[serde(rename = "valorCampo", default, skip_serializing_if = "Option::is_none")]
    pub value_field: Option<String>,
    #[serde(rename = "origen", default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(rename = "destino", default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(rename = "forzar", default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(rename = "tabla", default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(
        rename = "claveOrigen",
        alias = "campoConsulta",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_key: Option<String>,
    #[serde(
        rename = "claveDestino",
        alias = "campoResultado",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_key: Option<String>,
    #[serde(rename = "umbralConfianza", default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(rename = "valorDefecto", default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(rename = "cadena", default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<Vec<ChainStep>>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

fn required(value: Option<String>, operation: &str, key: &str) -> Result<String, RuleError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RuleError::invalid(format!("{} requires `{}`", operation, key)))
}

fn optional_path(value: Option<String>) -> Option<FieldPath> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(FieldPath::from)
}

fn value_source(spec: &mut ActionSpec, operation: &str) -> Result<ValueSource, RuleError> {
    if let Some(path) = optional_path(spec.value_field.take()) {
        return Ok(ValueSource::Field(path));
    }
    match spec.value.take() {
        Some(raw) => Ok(ValueSource::Literal(FieldValue::from_json(&raw))),
        None => Err(RuleError::invalid(format!(
            "{} requires `valor` or `valorCampo`",
            operation
        ))),
    }
}

impl TryFrom<ActionSpec> for Action {
    type Error = RuleError;

    fn try_from(mut spec: ActionSpec) -> Result<Self, Self::Error> {
        let operation = spec.operation.trim().to_ascii_uppercase();
        let op = operation.as_str();

        if let Some(transformation) = Transformation::from_name(op) {
            let field = FieldPath::from(required(spec.field, op, "campo")?);
            return Ok(Action::Transform {
                field,
                transformation,
            });
        }

        match op {
            "SET_VALUE" | "SET" => {
                let field = FieldPath::from(required(spec.field.take(), op, "campo")?);
                let source = value_source(&mut spec, op)?;
                Ok(Action::SetValue { field, source })
            }
            "APPEND" => {
                let field = FieldPath::from(required(spec.field.take(), op, "campo")?);
                let source = value_source(&mut spec, op)?;
                Ok(Action::Append { field, source })
            }
            "COPY_FIELD" => Ok(Action::CopyField {
                from: FieldPath::from(required(spec.origin, op, "origen")?),
                to: FieldPath::from(required(spec.destination, op, "destino")?),
                force: spec.force.unwrap_or(false),
            }),
            "LOOKUP_REPLACE" | "LOOKUP" => {
                let threshold = spec.threshold.unwrap_or(1.0);
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(RuleError::invalid(format!(
                        "{} threshold {} must be within [0, 1]",
                        op, threshold
                    )));
                }
                Ok(Action::LookupReplace {
                    field: FieldPath::from(required(spec.field, op, "campo")?),
                    origin: optional_path(spec.origin),
                    table: required(spec.table, op, "tabla")?,
                    source_key: required(spec.source_key, op, "claveOrigen")?,
                    target_key: required(spec.target_key, op, "claveDestino")?,
                    threshold,
                    default: spec.default.as_ref().map(FieldValue::from_json),
                })
            }
            "CALCULATE" => Ok(Action::Calculate {
                field: FieldPath::from(required(spec.field, op, "campo")?),
                formula: Formula::parse(&required(spec.formula, op, "formula")?)?,
            }),
            "LOOKUP_CHAIN" => {
                let steps = spec.chain.unwrap_or_default();
                if steps.is_empty() {
                    return Err(RuleError::invalid("LOOKUP_CHAIN requires a non-empty `cadena`"));
                }
                Ok(Action::LookupChain {
                    field: FieldPath::from(required(spec.field, op, "campo")?),
                    origin: optional_path(spec.origin),
                    steps,
                    default: spec.default.as_ref().map(FieldValue::from_json),
                })
            }
            other => Err(RuleError::invalid(format!("unknown action `{}`", other))),
        }
    }
}

impl From<Action> for ActionSpec {
    fn from(action: Action) -> Self {
        let mut spec = ActionSpec {
            operation: action.name().to_string(),
            ..ActionSpec::default()
        };
        let put_source = |spec: &mut ActionSpec, source: ValueSource| match source {
            ValueSource::Literal(value) => spec.value = Some(value.to_json()),
            ValueSource::Field(path) => spec.value_field = Some(path.to_string()),
        };

        match action {
            Action::SetValue { field, source } | Action::Append { field, source } => {
                spec.field = Some(field.to_string());
                put_source(&mut spec, source);
            }
            Action::CopyField { from, to, force } => {
                spec.origin = Some(from.to_string());
                spec.destination = Some(to.to_string());
                spec.force = force.then_some(true);
            }
            Action::LookupReplace {
                field,
                origin,
                table,
                source_key,
                target_key,
                threshold,
                default,
            } => {
                spec.field = Some(field.to_string());
                spec.origin = origin.map(|path| path.to_string());
                spec.table = Some(table);
                spec.source_key = Some(source_key);
                spec.target_key = Some(target_key);
                spec.threshold = Some(threshold);
                spec.default = default.map(|value| value.to_json());
            }
            Action::Transform { field, .. } => spec.field = Some(field.to_string()),
            Action::Calculate { field, formula } => {
                spec.field = Some(field.to_string());
                spec.formula = Some(formula.as_str().to_string());
            }
            Action::LookupChain {
                field,
                origin,
                steps,
                default,
            } => {
                spec.field = Some(field.to_string());
                spec.origin = origin.map(|path| path.to_string());
                spec.chain = Some(steps);
                spec.default = default.map(|value| value.to_json());
            }
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<Action, serde_json::Error> {
        serde_json::from_value(value)
    }

    #[test]
    fn parses_required_operations() {
        let set = parse(json!({"operacion": "SET", "campo": "codigoProducto", "valor": "BAND-01"}))
            .expect("set");
        assert_eq!(set, Action::set_value("codigoProducto", "BAND-01"));

        let copy = parse(json!({"operacion": "COPY_FIELD", "origen": "a", "destino": "b"}))
            .expect("copy");
        assert_eq!(copy, Action::copy_field("a", "b"));

        let zeros = parse(json!({"operacion": "REMOVE_LEADING_ZEROS", "campo": "cuit"}))
            .expect("zeros");
        assert_eq!(zeros.name(), "REMOVE_LEADING_ZEROS");

        let lookup = parse(json!({
            "operacion": "LOOKUP_REPLACE",
            "campo": "proveedor",
            "tabla": "proveedores",
            "claveOrigen": "cuit",
            "claveDestino": "codigo",
            "umbralConfianza": 0.9
        }))
        .expect("lookup");
        assert_eq!(lookup.tables(), vec!["proveedores"]);
    }

    #[test]
    fn explicit_null_is_a_literal() {
        let clear = parse(json!({"operacion": "SET_VALUE", "campo": "codigoProducto", "valor": null}))
            .expect("null literal");
        assert_eq!(
            clear,
            Action::SetValue {
                field: FieldPath::from("codigoProducto"),
                source: ValueSource::Literal(FieldValue::Null),
            }
        );

        let value = serde_json::to_value(&clear).expect("serialize");
        assert_eq!(value.get("valor"), Some(&Value::Null));
        assert_eq!(parse(value).expect("parse back"), clear);
    }

    #[test]
    fn rejects_malformed_actions_at_load() {
        assert!(parse(json!({"operacion": "SET_VALUE", "campo": "x"})).is_err());
        assert!(parse(json!({"operacion": "COPY_FIELD", "origen": "a"})).is_err());
        assert!(parse(json!({"operacion": "CALCULATE", "campo": "x", "formula": "{a} +"})).is_err());
        assert!(parse(json!({"operacion": "EXPLODE", "campo": "x"})).is_err());
        assert!(parse(json!({
            "operacion": "LOOKUP_REPLACE", "campo": "x", "tabla": "t",
            "claveOrigen": "a", "claveDestino": "b", "umbralConfianza": 1.5
        }))
        .is_err());
    }

    #[test]
    fn serialized_form_parses_back() {
        let action = parse(json!({
            "operacion": "LOOKUP_CHAIN",
            "campo": "dimension",
            "origen": "numeroTarjeta",
            "cadena": [
                {"tabla": "tarjetas", "claveOrigen": "numero", "claveDestino": "usuario"},
                {"tabla": "usuarios", "campoConsulta": "id", "campoResultado": "dimension"}
            ],
            "valorDefecto": "SIN_ASIGNAR"
        }))
        .expect("chain");

        let value = serde_json::to_value(&action).expect("serialize");
        assert_eq!(value["cadena"][1]["claveOrigen"], json!("id"));
        assert_eq!(parse(value).expect("parse back"), action);
    }
}
