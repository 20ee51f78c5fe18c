//! Parse-with-fallback combinator.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Result of trying to parse text as JSON. Text that does not parse is kept
/// verbatim instead of being treated as an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Parsed<T> {
    Parsed(T),
    Raw(String),
}

impl<T: DeserializeOwned> Parsed<T> {
    pub fn from_json(text: &str) -> Self {
        match serde_json::from_str::<T>(text) {
            Ok(value) => Self::Parsed(value),
            Err(_) => Self::Raw(text.to_string()),
        }
    }
}

impl<T> Parsed<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Parsed(value) => Some(value),
            Self::Raw(_) => None,
        }
    }
}
