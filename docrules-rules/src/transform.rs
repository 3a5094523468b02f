use std::borrow::Cow;

use docrules_protocol::document::{FieldStore, FieldValue};
use serde::{Deserialize, Serialize};

/// String normalisations shared by actions and read-side field
/// transformations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transformation {
    RemoveLeadingZeros,
    RemoveTrailingZeros,
    TrimSpaces,
    UpperCase,
    LowerCase,
}

impl Transformation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "REMOVE_LEADING_ZEROS" => Some(Transformation::RemoveLeadingZeros),
            "REMOVE_TRAILING_ZEROS" => Some(Transformation::RemoveTrailingZeros),
            "TRIM_SPACES" => Some(Transformation::TrimSpaces),
            "UPPER_CASE" => Some(Transformation::UpperCase),
            "LOWER_CASE" => Some(Transformation::LowerCase),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transformation::RemoveLeadingZeros => "REMOVE_LEADING_ZEROS",
            Transformation::RemoveTrailingZeros => "REMOVE_TRAILING_ZEROS",
            Transformation::TrimSpaces => "TRIM_SPACES",
            Transformation::UpperCase => "UPPER_CASE",
            Transformation::LowerCase => "LOWER_CASE",
        }
    }

    /// Applies the transformation to a string.
    ///
    /// Stripping leading zeros never yields an empty string: an all-zero
    /// input becomes `"0"`.
    pub fn apply_text(&self, input: &str) -> String {
        match self {
            Transformation::RemoveLeadingZeros => {
                let stripped = input.trim_start_matches('0');
                if stripped.is_empty() {
                    "0".to_string()
                } else {
                    stripped.to_string()
                }
            }
            Transformation::RemoveTrailingZeros => input.trim_end_matches('0').to_string(),
            Transformation::TrimSpaces => input.trim().to_string(),
            Transformation::UpperCase => input.to_uppercase(),
            Transformation::LowerCase => input.to_lowercase(),
        }
    }

    /// Applies the transformation to a value; the result is always text.
    pub fn apply(&self, value: &FieldValue) -> FieldValue {
        FieldValue::Text(self.apply_text(&value.as_text()))
    }
}

/// Read-side transformation declared on a rule (`transformacionesCampo`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldTransformation {
    #[serde(rename = "campo")]
    pub field: String,
    #[serde(rename = "transformacion")]
    pub transformation: Transformation,
}

/// Reads `key` from `store`, applying every read-side transformation
/// declared for it. Null values are returned untouched.
pub fn read_field<'a>(
    store: &'a FieldStore,
    transforms: &[FieldTransformation],
    key: &str,
) -> Cow<'a, FieldValue> {
    let value = store.value(key);
    if value.is_null() {
        return Cow::Borrowed(value);
    }

    let mut applicable = transforms.iter().filter(|t| t.field == key).peekable();
    if applicable.peek().is_none() {
        return Cow::Borrowed(value);
    }

    let mut current = value.clone();
    for transform in applicable {
        current = transform.transformation.apply(&current);
    }
    Cow::Owned(current)
}
