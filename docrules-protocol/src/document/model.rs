use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::scope::{Scope, ScopeInstance};
use super::store::FieldStore;

const LINE_KEYS: [&str; 3] = ["lineItems", "lineas", "documento_lineas"];
const TAX_KEYS: [&str; 3] = ["taxLines", "impuestos", "documento_impuestos"];

/// Errors raised while ingesting a document payload.
#[derive(Debug, Error, PartialEq)]
pub enum DocumentError {
    #[error("document payload must be a JSON object")]
    NotAnObject,
    #[error("entry {index} of `{key}` must be a JSON object")]
    InvalidEntry { key: String, index: usize },
}

/// Extracted fields of one document: a header plus ordered line items and
/// tax lines.
///
/// `lineas`/`documento_lineas` and `impuestos`/`documento_impuestos` are
/// accepted as collection keys only when they hold arrays; a scalar
/// `impuestos` stays a header field. Output always uses `lineItems` and
/// `taxLines`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Document {
    pub header: FieldStore,
    pub lines: Vec<FieldStore>,
    pub taxes: Vec<FieldStore>,
}

impl Document {
    pub fn new(header: FieldStore) -> Self {
        Self {
            header,
            lines: Vec::new(),
            taxes: Vec::new(),
        }
    }

    pub fn with_line(mut self, line: FieldStore) -> Self {
        self.lines.push(line);
        self
    }

    pub fn with_tax(mut self, tax: FieldStore) -> Self {
        self.taxes.push(tax);
        self
    }

    /// Parses a JSON payload produced by the extraction collaborator.
    pub fn from_json(value: &Value) -> Result<Self, DocumentError> {
        let object = value.as_object().ok_or(DocumentError::NotAnObject)?;
        let mut header = Map::new();
        let mut lines = Vec::new();
        let mut taxes = Vec::new();

        for (key, entry) in object {
            match entry {
                Value::Array(items) if LINE_KEYS.contains(&key.as_str()) => {
                    lines.extend(collect_stores(key, items)?);
                }
                Value::Array(items) if TAX_KEYS.contains(&key.as_str()) => {
                    taxes.extend(collect_stores(key, items)?);
                }
                _ => {
                    header.insert(key.clone(), entry.clone());
                }
            }
        }

        Ok(Self {
            header: FieldStore::from_json_object(&header),
            lines,
            taxes,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut root = match self.header.to_json() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        root.insert(
            "lineItems".to_string(),
            Value::Array(self.lines.iter().map(FieldStore::to_json).collect()),
        );
        root.insert(
            "taxLines".to_string(),
            Value::Array(self.taxes.iter().map(FieldStore::to_json).collect()),
        );
        Value::Object(root)
    }

    /// Every scope instance in evaluation order: header, lines, taxes.
    pub fn instances(&self) -> Vec<ScopeInstance> {
        std::iter::once(ScopeInstance::document())
            .chain((1..=self.lines.len()).map(ScopeInstance::line))
            .chain((1..=self.taxes.len()).map(ScopeInstance::tax))
            .collect()
    }

    pub fn store(&self, instance: ScopeInstance) -> Option<&FieldStore> {
        match instance.scope {
            Scope::Document => Some(&self.header),
            Scope::LineItem => instance.index.checked_sub(1).and_then(|i| self.lines.get(i)),
            Scope::TaxLine => instance.index.checked_sub(1).and_then(|i| self.taxes.get(i)),
        }
    }

    pub fn store_mut(&mut self, instance: ScopeInstance) -> Option<&mut FieldStore> {
        match instance.scope {
            Scope::Document => Some(&mut self.header),
            Scope::LineItem => instance
                .index
                .checked_sub(1)
                .and_then(|i| self.lines.get_mut(i)),
            Scope::TaxLine => instance
                .index
                .checked_sub(1)
                .and_then(|i| self.taxes.get_mut(i)),
        }
    }
}

fn collect_stores(key: &str, items: &[Value]) -> Result<Vec<FieldStore>, DocumentError> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            item.as_object()
                .map(FieldStore::from_json_object)
                .ok_or_else(|| DocumentError::InvalidEntry {
                    key: key.to_string(),
                    index,
                })
        })
        .collect()
}

impl TryFrom<Value> for Document {
    type Error = DocumentError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Document::from_json(&value)
    }
}

impl From<Document> for Value {
    fn from(document: Document) -> Self {
        document.to_json()
    }
}
