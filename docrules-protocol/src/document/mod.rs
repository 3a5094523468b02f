mod model;
mod scope;
mod store;
mod value;

pub use model::{Document, DocumentError};
pub use scope::{Scope, ScopeInstance};
pub use store::FieldStore;
pub use value::FieldValue;
