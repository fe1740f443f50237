//! Documents, references and dotted field paths

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

use crate::error::{Result, StoreError};

/// Field map of a document body
pub type Fields = Map<String, Value>;

/// Reference to a document, usable as a foreign key inside other documents.
///
/// Serialized as `collection/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocRef {
    collection: String,
    id: String,
}

impl DocRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

impl FromStr for DocRef {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((collection, id)) if !collection.is_empty() && !id.is_empty() && !id.contains('/') => {
                Ok(Self::new(collection, id))
            }
            _ => Err(StoreError::InvalidReference(s.to_string())),
        }
    }
}

impl Serialize for DocRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DocRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A stored document with its bookkeeping metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub reference: DocRef,
    /// Incremented on every write; used for optimistic preconditions
    pub version: u64,
    pub fields: Fields,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    pub fn id(&self) -> &str {
        self.reference.id()
    }

    /// Look up a field by dotted path
    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path(&self.fields, path)
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(Value::as_f64)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Deserialize the body into a typed record. The document id is exposed as `id`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let mut fields = self.fields.clone();
        fields.insert("id".to_string(), Value::String(self.reference.id().to_string()));
        Ok(serde_json::from_value(Value::Object(fields))?)
    }
}

/// Convert a serializable record into document fields, dropping its `id`
pub fn to_fields<T: Serialize>(record: &T) -> Result<Fields> {
    match serde_json::to_value(record)? {
        Value::Object(mut map) => {
            map.remove("id");
            Ok(map)
        }
        other => Err(StoreError::InvalidField(format!("record is not an object: {}", other))),
    }
}

pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with("__") || path.split('.').any(str::is_empty) {
        return Err(StoreError::InvalidField(path.to_string()));
    }
    Ok(())
}

/// Resolve a dotted path (`stages.uncertainty`) inside a field map
pub fn get_path<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Set a dotted path, creating intermediate maps as needed
pub(crate) fn set_path(fields: &mut Fields, path: &str, value: Value) -> Result<()> {
    validate_path(path)?;
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = parts.pop().ok_or_else(|| StoreError::InvalidField(path.to_string()))?;

    let mut current = fields;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry
            .as_object_mut()
            .ok_or_else(|| StoreError::InvalidField(path.to_string()))?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Add `by` to a numeric value. Integers stay integers while the operand is integral.
pub(crate) fn add_number(current: Option<&Value>, by: f64) -> Option<Value> {
    if !by.is_finite() {
        return None;
    }
    let base = match current {
        None | Some(Value::Null) => Number::from(0),
        Some(Value::Number(n)) => n.clone(),
        Some(_) => return None,
    };

    if let Some(i) = base.as_i64()
        && by.fract() == 0.0
        && by.abs() < 9.0e15
    {
        return i.checked_add(by as i64).map(Value::from);
    }

    let sum = base.as_f64()? + by;
    Number::from_f64(sum).map(Value::Number)
}
