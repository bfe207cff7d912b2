//! Decoded JSON value model used by the normalizer.
//!
//! [`CacheValue`] is an explicit tagged variant over everything a query
//! result can contain. The normalizer matches on it exhaustively; no
//! runtime type probing is involved.
//!
//! The only variant without a JSON counterpart is [`CacheValue::EntityId`],
//! a string the caller has marked as a server-assigned global id. It
//! serializes as a plain JSON string, so the tag does not survive a trip
//! through storage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// A decoded JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum CacheValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// A recognized global entity id.
    EntityId(String),
    List(Vec<CacheValue>),
    Map(BTreeMap<String, CacheValue>),
}

impl CacheValue {
    #[must_use]
    pub fn is_map(&self) -> bool {
        matches!(self, Self::Map(_))
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, CacheValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::EntityId(s) => Some(s),
            _ => None,
        }
    }

    /// Field lookup on a map value. `None` for non-maps.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CacheValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// The in-band entity id of a map, if one of its fields is tagged.
    ///
    /// When several fields are tagged the lexicographically first key wins.
    #[must_use]
    pub fn inline_entity_id(&self) -> Option<&str> {
        self.as_map()?.values().find_map(|v| match v {
            Self::EntityId(id) => Some(id.as_str()),
            _ => None,
        })
    }

    /// Convert into a `serde_json::Value`, dropping the entity-id tag.
    #[must_use]
    pub fn into_json(self) -> Value {
        self.into()
    }

    /// Canonical JSON text (object keys sorted, no whitespace).
    #[must_use]
    pub fn to_canonical_string(&self) -> String {
        // BTreeMap ordering makes the serializer output canonical.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<Value> for CacheValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<CacheValue> for Value {
    fn from(value: CacheValue) -> Self {
        match value {
            CacheValue::Null => Value::Null,
            CacheValue::Bool(b) => Value::Bool(b),
            CacheValue::Number(n) => Value::Number(n),
            CacheValue::String(s) | CacheValue::EntityId(s) => Value::String(s),
            CacheValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            CacheValue::Map(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, Value::from(v));
                }
                Value::Object(out)
            }
        }
    }
}

impl From<&str> for CacheValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for CacheValue {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<bool> for CacheValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion_preserves_structure() {
        let json = json!({
            "a": [1, 2.5, "x", null, true],
            "b": {"c": {"d": -3}}
        });
        let value = CacheValue::from(json.clone());
        assert!(value.is_map());
        assert_eq!(value.into_json(), json);
    }

    #[test]
    fn test_entity_id_serializes_as_string() {
        let mut map = BTreeMap::new();
        map.insert("id".to_string(), CacheValue::EntityId("G1".into()));
        map.insert("price".to_string(), CacheValue::from(10));
        let value = CacheValue::Map(map);

        assert_eq!(value.inline_entity_id(), Some("G1"));
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(text, r#"{"id":"G1","price":10}"#);

        // Tag does not survive the round trip
        let back: CacheValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back.get("id"), Some(&CacheValue::String("G1".into())));
        assert_eq!(back.inline_entity_id(), None);
    }

    #[test]
    fn test_canonical_string_sorts_keys() {
        let a = CacheValue::from(json!({"z": 1, "a": {"y": 2, "b": 3}}));
        let b = CacheValue::from(json!({"a": {"b": 3, "y": 2}, "z": 1}));
        assert_eq!(a.to_canonical_string(), b.to_canonical_string());
        assert_eq!(a.to_canonical_string(), r#"{"a":{"b":3,"y":2},"z":1}"#);
    }

    #[test]
    fn test_accessors_on_non_maps() {
        let v = CacheValue::from("text");
        assert_eq!(v.as_str(), Some("text"));
        assert!(v.get("x").is_none());
        assert!(v.inline_entity_id().is_none());
    }
}
