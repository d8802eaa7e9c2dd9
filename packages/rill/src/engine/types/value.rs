use super::multiset::FastMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use smol_str::SmolStr;

/// The dynamic value type flowing through the dataflow graph.
///
/// Rows from base collections, namespaced join records and projected
/// outputs are all `RillValue`s. Numbers are f64 throughout, matching the
/// JSON boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RillValue {
    Null,
    Bool(bool),
    Number(f64),
    Str(SmolStr),
    Array(Vec<RillValue>),
    Object(FastMap<SmolStr, RillValue>),
}

impl Default for RillValue {
    fn default() -> Self {
        RillValue::Null
    }
}

impl RillValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RillValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RillValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RillValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&FastMap<SmolStr, RillValue>> {
        match self {
            RillValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<RillValue>> {
        match self {
            RillValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&RillValue> {
        self.as_object()?.get(key)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, RillValue::Null)
    }

    /// Build an object from `(key, value)` pairs. Join results use this to
    /// merge per-alias records into one namespaced row.
    pub fn object_of<K: Into<SmolStr>>(pairs: impl IntoIterator<Item = (K, RillValue)>) -> Self {
        RillValue::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<Value> for RillValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => RillValue::Null,
            Value::Bool(b) => RillValue::Bool(b),
            Value::Number(n) => RillValue::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => RillValue::Str(SmolStr::from(s)),
            Value::Array(arr) => RillValue::Array(arr.into_iter().map(RillValue::from).collect()),
            Value::Object(obj) => RillValue::Object(
                obj.into_iter()
                    .map(|(k, v)| (SmolStr::from(k), RillValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<RillValue> for Value {
    fn from(val: RillValue) -> Self {
        match val {
            RillValue::Null => Value::Null,
            RillValue::Bool(b) => Value::Bool(b),
            RillValue::Number(n) => json!(n),
            RillValue::Str(s) => Value::String(s.to_string()),
            RillValue::Array(arr) => Value::Array(arr.into_iter().map(|v| v.into()).collect()),
            RillValue::Object(obj) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k.to_string(), v.into()))
                    .collect(),
            ),
        }
    }
}
