//! Opaque records keyed by identifier.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Record identifier.
///
/// The backend's wire format is not ours to fix, so both integer and
/// string identifiers are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Str(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{id}"),
            Self::Str(id) => f.write_str(id),
        }
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::Str(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self::Str(id)
    }
}

/// A record as the client sees it: an identifier plus whatever fields the
/// resource carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a record with no fields.
    #[must_use]
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Get a field by name.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_flattens_fields() {
        let record: Record =
            serde_json::from_str(r#"{"id": 3, "name": "blue circle", "shape": "circle"}"#).unwrap();
        assert_eq!(record.id, RecordId::Int(3));
        assert_eq!(record.field("shape"), Some(&Value::from("circle")));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["name"], "blue circle");
        assert_eq!(json["id"], 3);
    }

    #[test]
    fn test_string_ids() {
        let record: Record = serde_json::from_str(r#"{"id": "a-17"}"#).unwrap();
        assert_eq!(record.id, RecordId::from("a-17"));
        assert_eq!(record.id.to_string(), "a-17");
    }
}
