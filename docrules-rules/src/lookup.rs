use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use docrules_protocol::document::FieldStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RuleError;

/// Rows of one reference table (`parametros_maestros`-style master data).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceTable {
    pub name: String,
    pub rows: Vec<FieldStore>,
}

/// Best row found for a lookup query.
#[derive(Debug, Clone, Copy)]
pub struct LookupMatch<'a> {
    pub row: &'a FieldStore,
    pub confidence: f64,
}

/// Normalises a lookup key: whitespace and dashes removed, uppercased.
pub fn normalize_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(char::to_uppercase)
        .collect()
}

impl ReferenceTable {
    pub fn new(name: impl Into<String>, rows: Vec<FieldStore>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }

    /// Highest-confidence row for `query` in `column`.
    ///
    /// Exact normalised matches score 1.0; others are scored with
    /// Jaro-Winkler similarity. Ties keep the earliest row.
    pub fn best_match(&self, column: &str, query: &str) -> Option<LookupMatch<'_>> {
        let wanted = normalize_key(query);
        if wanted.is_empty() {
            return None;
        }

        let mut best: Option<LookupMatch<'_>> = None;
        for row in &self.rows {
            let candidate = row.value(column);
            if candidate.is_null() {
                continue;
            }
            let key = normalize_key(&candidate.as_text());
            let confidence = if key == wanted {
                1.0
            } else {
                strsim::jaro_winkler(&wanted, &key)
            };
            if best.map_or(true, |current| confidence > current.confidence) {
                best = Some(LookupMatch { row, confidence });
            }
            if confidence >= 1.0 {
                break;
            }
        }
        best
    }

    /// First row whose normalised `column` equals the normalised query.
    pub fn exact(&self, column: &str, query: &str) -> Option<&FieldStore> {
        let wanted = normalize_key(query);
        if wanted.is_empty() {
            return None;
        }
        self.rows.iter().find(|row| {
            let value = row.value(column);
            !value.is_null() && normalize_key(&value.as_text()) == wanted
        })
    }
}

/// Reference tables prefetched for one run.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTables {
    tables: HashMap<String, Arc<ReferenceTable>>,
}

impl ReferenceTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: ReferenceTable) {
        self.tables.insert(table.name.clone(), Arc::new(table));
    }

    pub fn get(&self, name: &str) -> Option<&ReferenceTable> {
        self.tables.get(name).map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Fetches every named table from `source`. Tables the source does not
    /// know are left out and surface later as action errors.
    pub async fn prefetch(
        source: &dyn ReferenceSource,
        tenant: &str,
        names: &BTreeSet<String>,
    ) -> Result<Self, RuleError> {
        let mut tables = Self::new();
        for name in names {
            match source.fetch_table(tenant, name).await? {
                Some(table) => tables.insert(table),
                None => debug!(table = %name, tenant = %tenant, "reference table not found"),
            }
        }
        Ok(tables)
    }
}

impl FromIterator<ReferenceTable> for ReferenceTables {
    fn from_iter<I: IntoIterator<Item = ReferenceTable>>(iter: I) -> Self {
        let mut tables = Self::new();
        for table in iter {
            tables.insert(table);
        }
        tables
    }
}

/// Asynchronous provider of reference tables.
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn fetch_table(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<ReferenceTable>, RuleError>;
}

/// Reference tables held in memory, shared by every tenant.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReferenceSource {
    tables: HashMap<String, ReferenceTable>,
}

impl InMemoryReferenceSource {
    pub fn new(tables: impl IntoIterator<Item = ReferenceTable>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|table| (table.name.clone(), table))
                .collect(),
        }
    }

    /// Loads every `*.json` file in `dir` as a table named after the file
    /// stem. Each file holds an array of row objects.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, RuleError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(RuleError::MissingPath(dir.display().to_string()));
        }

        let mut tables = Vec::new();
        for entry in fs::read_dir(dir).map_err(|err| RuleError::from_io(dir, err))? {
            let entry = entry.map_err(|err| RuleError::from_io(dir, err))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let raw = fs::read_to_string(&path).map_err(|err| RuleError::from_io(&path, err))?;
            let rows: Vec<FieldStore> = serde_json::from_str(&raw)
                .map_err(|err| RuleError::parse_error(&path, err.to_string()))?;
            tables.push(ReferenceTable::new(name, rows));
        }
        Ok(Self::new(tables))
    }

    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ReferenceSource for InMemoryReferenceSource {
    async fn fetch_table(
        &self,
        _tenant: &str,
        name: &str,
    ) -> Result<Option<ReferenceTable>, RuleError> {
        Ok(self.tables.get(name).cloned())
    }
}
