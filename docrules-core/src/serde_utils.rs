use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{DocRulesError, Result};

/// Serializes a value to pretty JSON with canonical error handling.
pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|err| DocRulesError::Serialization(err.to_string()))
}

/// Deserializes a JSON string into the provided type with shared error semantics.
pub fn from_json_str<T: DeserializeOwned>(input: &str) -> Result<T> {
    serde_json::from_str(input).map_err(|err| DocRulesError::Deserialization(err.to_string()))
}

/// Reads and deserializes a JSON file, naming the file in the error.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|err| {
        DocRulesError::Deserialization(format!("{}: {}", path.display(), err))
    })
}
