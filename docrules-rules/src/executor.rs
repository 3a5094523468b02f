use docrules_protocol::document::{FieldStore, FieldValue};
use serde::{Deserialize, Serialize};

use crate::action::{Action, ChainStep, ValueSource};
use crate::condition::FieldPath;
use crate::error::ActionError;
use crate::lookup::ReferenceTables;
use crate::transform::{read_field, FieldTransformation};

/// Result of applying one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionEffect {
    Changed {
        field: String,
        before: FieldValue,
        after: FieldValue,
    },
    Unchanged {
        field: String,
    },
}

impl ActionEffect {
    pub fn is_changed(&self) -> bool {
        matches!(self, ActionEffect::Changed { .. })
    }
}

/// Read-only inputs shared by every action of a rule.
#[derive(Clone, Copy)]
pub struct ActionEnv<'a> {
    pub transforms: &'a [FieldTransformation],
    pub tables: &'a ReferenceTables,
}

impl Action {
    /// Applies the action to `store`. On error the store is left untouched.
    pub fn apply(&self, store: &mut FieldStore, env: &ActionEnv<'_>) -> Result<ActionEffect, ActionError> {
        match self {
            Action::SetValue { field, source } => {
                let value = resolve(store, env, source);
                Ok(write(store, field, value))
            }
            Action::CopyField { from, to, force } => {
                let value = read_field(store, env.transforms, from.as_str()).into_owned();
                if value.is_null() || (!force && !store.value(to.as_str()).is_null()) {
                    return Ok(unchanged(to));
                }
                Ok(write(store, to, value))
            }
            Action::Transform {
                field,
                transformation,
            } => {
                let current = store.value(field.as_str());
                if current.is_null() {
                    return Ok(unchanged(field));
                }
                let next = transformation.apply(current);
                Ok(write(store, field, next))
            }
            Action::Append { field, source } => {
                let suffix = resolve(store, env, source);
                let current = store.value(field.as_str());
                let mut text = if current.is_null() {
                    String::new()
                } else {
                    current.as_text().into_owned()
                };
                if !suffix.is_null() {
                    text.push_str(&suffix.as_text());
                }
                Ok(write(store, field, FieldValue::Text(text)))
            }
            Action::Calculate { field, formula } => {
                let value = formula.evaluate(|path| {
                    let value = read_field(store, env.transforms, path);
                    if value.is_null() {
                        return Ok(None);
                    }
                    value.as_number().map(Some).ok_or_else(|| ActionError::NonNumeric {
                        field: path.to_string(),
                        value: value.as_text().into_owned(),
                    })
                })?;
                Ok(write(store, field, FieldValue::Number(value)))
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
                let query_field = origin.as_ref().unwrap_or(field);
                let query = read_field(store, env.transforms, query_field.as_str()).into_owned();
                let reference = env
                    .tables
                    .get(table)
                    .ok_or_else(|| ActionError::UnknownTable(table.clone()))?;

                let outcome = if query.is_empty() {
                    Err(ActionError::EmptyLookupKey {
                        field: query_field.to_string(),
                    })
                } else {
                    match reference.best_match(source_key, &query.as_text()) {
                        Some(found) if found.confidence >= *threshold => {
                            let replacement = found.row.value(target_key);
                            if replacement.is_null() {
                                Err(ActionError::MissingColumn {
                                    table: table.clone(),
                                    column: target_key.clone(),
                                })
                            } else {
                                Ok(replacement.clone())
                            }
                        }
                        best => Err(ActionError::NoMatch {
                            table: table.clone(),
                            value: query.as_text().into_owned(),
                            confidence: best.map_or(0.0, |found| found.confidence),
                        }),
                    }
                };
                finish_lookup(store, field, outcome, default.as_ref())
            }
            Action::LookupChain {
                field,
                origin,
                steps,
                default,
            } => {
                let query_field = origin.as_ref().unwrap_or(field);
                let start = read_field(store, env.transforms, query_field.as_str()).into_owned();
                let outcome = if start.is_empty() {
                    Err(ActionError::EmptyLookupKey {
                        field: query_field.to_string(),
                    })
                } else {
                    follow_chain(env.tables, steps, start)
                };
                finish_lookup(store, field, outcome, default.as_ref())
            }
        }
    }
}

fn follow_chain(
    tables: &ReferenceTables,
    steps: &[ChainStep],
    start: FieldValue,
) -> Result<FieldValue, ActionError> {
    let mut current = start;
    for step in steps {
        let table = tables
            .get(&step.table)
            .ok_or_else(|| ActionError::UnknownTable(step.table.clone()))?;
        let query = current.as_text().into_owned();
        let row = table
            .exact(&step.source_key, &query)
            .ok_or_else(|| ActionError::NoMatch {
                table: step.table.clone(),
                value: query.clone(),
                confidence: 0.0,
            })?;
        current = row.value(&step.target_key).clone();
        if current.is_null() {
            return Err(ActionError::MissingColumn {
                table: step.table.clone(),
                column: step.target_key.clone(),
            });
        }
    }
    Ok(current)
}

/// Writes the lookup result, falling back to the default value when the
/// lookup did not resolve. Unknown tables are never defaulted.
fn finish_lookup(
    store: &mut FieldStore,
    field: &FieldPath,
    outcome: Result<FieldValue, ActionError>,
    default: Option<&FieldValue>,
) -> Result<ActionEffect, ActionError> {
    match (outcome, default) {
        (Ok(value), _) => Ok(write(store, field, value)),
        (Err(err @ ActionError::UnknownTable(_)), _) => Err(err),
        (Err(_), Some(fallback)) => Ok(write(store, field, fallback.clone())),
        (Err(err), None) => Err(err),
    }
}

fn resolve(store: &FieldStore, env: &ActionEnv<'_>, source: &ValueSource) -> FieldValue {
    match source {
        ValueSource::Literal(value) => value.clone(),
        ValueSource::Field(path) => read_field(store, env.transforms, path.as_str()).into_owned(),
    }
}

fn unchanged(field: &FieldPath) -> ActionEffect {
    ActionEffect::Unchanged {
        field: field.to_string(),
    }
}

fn write(store: &mut FieldStore, field: &FieldPath, value: FieldValue) -> ActionEffect {
    let before = store.value(field.as_str()).clone();
    if before == value && store.contains(field.as_str()) {
        return unchanged(field);
    }
    store.set(field.as_str(), value.clone());
    ActionEffect::Changed {
        field: field.to_string(),
        before,
        after: value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::ReferenceTable;
    use crate::transform::Transformation;
    use serde_json::{json, Value};

    fn action(value: Value) -> Action {
        serde_json::from_value(value).expect("action")
    }

    fn store(value: Value) -> FieldStore {
        serde_json::from_value(value).expect("store")
    }

    fn tables() -> ReferenceTables {
        let rows = |value: Value| -> Vec<FieldStore> { serde_json::from_value(value).expect("rows") };
        [
            ReferenceTable::new(
                "proveedores",
                rows(json!([
                    {"cuit": "30-71234567-9", "codigo": "PROV-001", "nombre": "Plasticos del Sur"},
                    {"cuit": "30-70000000-1", "codigo": "PROV-002", "nombre": "Film Argentina"}
                ])),
            ),
            ReferenceTable::new("tarjetas", rows(json!([{"numero": "4509", "usuario": "U7"}]))),
            ReferenceTable::new("usuarios", rows(json!([{"id": "U7", "dimension": "VENTAS"}]))),
        ]
        .into_iter()
        .collect()
    }

    fn apply(action: &Action, store: &mut FieldStore) -> Result<ActionEffect, ActionError> {
        let tables = tables();
        let env = ActionEnv {
            transforms: &[],
            tables: &tables,
        };
        action.apply(store, &env)
    }

    #[test]
    fn copy_field_never_overwrites_populated_destination() {
        let copy = Action::copy_field("cuitExtraido", "cuit");
        let mut fields = store(json!({"cuitExtraido": "30712345679", "cuit": "20111111112"}));

        let effect = apply(&copy, &mut fields).expect("effect");
        assert!(!effect.is_changed());
        assert_eq!(fields.value("cuit").as_text(), "20111111112");

        let forced = action(json!({"operacion": "COPY_FIELD", "origen": "cuitExtraido", "destino": "cuit", "forzar": true}));
        assert!(apply(&forced, &mut fields).expect("effect").is_changed());
        assert_eq!(fields.value("cuit").as_text(), "30712345679");
    }

    #[test]
    fn copy_field_fills_null_destination() {
        let mut fields = store(json!({"cuitExtraido": "30712345679", "cuit": null}));
        let effect = apply(&Action::copy_field("cuitExtraido", "cuit"), &mut fields).expect("effect");
        assert!(effect.is_changed());
    }

    #[test]
    fn remove_leading_zeros_leaves_null_field_alone() {
        let strip = Action::transform("cuit", Transformation::RemoveLeadingZeros);
        let mut fields = FieldStore::new();

        let effect = apply(&strip, &mut fields).expect("effect");
        assert_eq!(effect, ActionEffect::Unchanged { field: "cuit".into() });
        assert!(!fields.contains("cuit"));

        fields.set("cuit", "000");
        apply(&strip, &mut fields).expect("effect");
        assert_eq!(fields.value("cuit").as_text(), "0");
    }

    #[test]
    fn later_actions_observe_earlier_effects() {
        let first = Action::set_value("codigo", "0042");
        let second = Action::transform("codigo", Transformation::RemoveLeadingZeros);
        let third = action(json!({"operacion": "APPEND", "campo": "codigo", "valor": "-A"}));
        let mut fields = FieldStore::new();

        for step in [&first, &second, &third] {
            apply(step, &mut fields).expect("effect");
        }
        assert_eq!(fields.value("codigo").as_text(), "42-A");
    }

    #[test]
    fn calculate_writes_numbers_and_rejects_text() {
        let calc = action(json!({"operacion": "CALCULATE", "campo": "iva", "formula": "{neto} * 21 / 100"}));
        let mut fields = store(json!({"neto": "1000"}));
        apply(&calc, &mut fields).expect("effect");
        assert_eq!(fields.value("iva").as_number(), Some(210.0));

        let mut bad = store(json!({"neto": "mil"}));
        assert!(matches!(apply(&calc, &mut bad), Err(ActionError::NonNumeric { .. })));
        assert!(!bad.contains("iva"));
    }

    #[test]
    fn lookup_replace_honours_threshold_and_default() {
        let lookup = action(json!({
            "operacion": "LOOKUP_REPLACE",
            "campo": "proveedor",
            "tabla": "proveedores",
            "claveOrigen": "nombre",
            "claveDestino": "codigo",
            "umbralConfianza": 0.9
        }));

        let mut close = store(json!({"proveedor": "PLASTICOS DEL SUR SA"}));
        apply(&lookup, &mut close).expect("effect");
        assert_eq!(close.value("proveedor").as_text(), "PROV-001");

        let mut far = store(json!({"proveedor": "Metalurgica Norte"}));
        assert!(matches!(apply(&lookup, &mut far), Err(ActionError::NoMatch { .. })));
        assert_eq!(far.value("proveedor").as_text(), "Metalurgica Norte");

        let with_default = action(json!({
            "operacion": "LOOKUP_REPLACE",
            "campo": "proveedor",
            "tabla": "proveedores",
            "claveOrigen": "nombre",
            "claveDestino": "codigo",
            "umbralConfianza": 0.9,
            "valorDefecto": "PROV-000"
        }));
        apply(&with_default, &mut far).expect("effect");
        assert_eq!(far.value("proveedor").as_text(), "PROV-000");
    }

    #[test]
    fn lookup_on_unknown_table_is_an_error_even_with_default() {
        let lookup = action(json!({
            "operacion": "LOOKUP_REPLACE",
            "campo": "x",
            "tabla": "inexistente",
            "claveOrigen": "a",
            "claveDestino": "b",
            "valorDefecto": "Z"
        }));
        let mut fields = store(json!({"x": "1"}));
        assert_eq!(
            apply(&lookup, &mut fields),
            Err(ActionError::UnknownTable("inexistente".into()))
        );
    }

    #[test]
    fn lookup_chain_follows_tables() {
        let chain = action(json!({
            "operacion": "LOOKUP_CHAIN",
            "campo": "dimension",
            "origen": "numeroTarjeta",
            "cadena": [
                {"tabla": "tarjetas", "claveOrigen": "numero", "claveDestino": "usuario"},
                {"tabla": "usuarios", "claveOrigen": "id", "claveDestino": "dimension"}
            ]
        }));
        let mut fields = store(json!({"numeroTarjeta": "4509"}));
        apply(&chain, &mut fields).expect("effect");
        assert_eq!(fields.value("dimension").as_text(), "VENTAS");

        let mut missing = store(json!({"numeroTarjeta": "9999"}));
        assert!(apply(&chain, &mut missing).is_err());
        assert!(!missing.contains("dimension"));
    }

    #[test]
    fn value_field_reads_through_transformations() {
        let set = action(json!({"operacion": "SET", "campo": "cuit", "valorCampo": "cuitExtraido"}));
        let transforms = vec![FieldTransformation {
            field: "cuitExtraido".into(),
            transformation: Transformation::RemoveLeadingZeros,
        }];
        let tables = ReferenceTables::new();
        let env = ActionEnv {
            transforms: &transforms,
            tables: &tables,
        };
        let mut fields = store(json!({"cuitExtraido": "00307"}));

        set.apply(&mut fields, &env).expect("effect");
        assert_eq!(fields.value("cuit").as_text(), "307");
        assert_eq!(fields.value("cuitExtraido").as_text(), "00307");
    }
}
