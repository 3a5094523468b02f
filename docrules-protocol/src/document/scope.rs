use std::fmt;

use serde::{Deserialize, Serialize};

/// Granularity a rule reads from and writes to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    #[serde(rename = "DOCUMENT", alias = "DOCUMENTO")]
    Document,
    #[serde(rename = "LINE_ITEM", alias = "LINEAS", alias = "LINEA")]
    LineItem,
    #[serde(rename = "TAX_LINE", alias = "IMPUESTOS", alias = "IMPUESTO")]
    TaxLine,
}

impl Scope {
    pub const ALL: [Scope; 3] = [Scope::Document, Scope::LineItem, Scope::TaxLine];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Document => "DOCUMENT",
            Scope::LineItem => "LINE_ITEM",
            Scope::TaxLine => "TAX_LINE",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete scope of a document.
///
/// The document header has index 0; line items and tax lines are numbered
/// from 1 in document order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ScopeInstance {
    pub scope: Scope,
    pub index: usize,
}

impl ScopeInstance {
    pub fn document() -> Self {
        Self {
            scope: Scope::Document,
            index: 0,
        }
    }

    pub fn line(sequence: usize) -> Self {
        Self {
            scope: Scope::LineItem,
            index: sequence,
        }
    }

    pub fn tax(sequence: usize) -> Self {
        Self {
            scope: Scope::TaxLine,
            index: sequence,
        }
    }
}

impl fmt::Display for ScopeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Document => f.write_str("DOCUMENT"),
            scope => write!(f, "{}#{}", scope, self.index),
        }
    }
}
