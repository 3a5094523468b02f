//! Document model exchanged between the extraction collaborators, the
//! rules engine and the persistence layer.

pub mod document;

pub mod prelude {
    pub use crate::document::{
        Document, DocumentError, FieldStore, FieldValue, Scope, ScopeInstance,
    };
}
