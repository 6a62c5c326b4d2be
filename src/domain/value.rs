use crate::engine::resolve::Resolvable;
use indexmap::IndexMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Ordered string-keyed map used for JSON objects, rows and literals.
pub type Map = IndexMap<String, Value>;

/// A value flowing through the harness.
///
/// Declarations may hold `Deferred` entries anywhere inside arrays and
/// objects; resolution replaces them with concrete values.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(Map),
    Deferred(Arc<dyn Resolvable>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Decimal,
    String,
    Bytes,
    Array,
    Object,
    Deferred,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Decimal => "decimal",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Deferred => "deferred",
        };
        write!(f, "{label}")
    }
}

impl Value {
    pub fn deferred<R: Resolvable + 'static>(resolvable: R) -> Self {
        Value::Deferred(Arc::new(resolvable))
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(bytes.into())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
            Value::Deferred(_) => ValueKind::Deferred,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Value::Deferred(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Decimal(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Numeric zero test used by bool/number comparisons.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Int(value) => *value == 0,
            Value::Float(value) => *value == 0.0,
            Value::Decimal(value) => value.is_zero(),
            _ => false,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(value) => *value,
            Value::Int(_) | Value::Float(_) | Value::Decimal(_) => !self.is_zero(),
            Value::String(value) => !value.is_empty() && !value.eq_ignore_ascii_case("false"),
            Value::Bytes(value) => !value.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Deferred(_) => true,
        }
    }

    /// Length of strings (in characters), bytes, arrays and objects.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::String(value) => Some(value.chars().count()),
            Value::Bytes(value) => Some(value.len()),
            Value::Array(items) => Some(items.len()),
            Value::Object(map) => Some(map.len()),
            _ => None,
        }
    }

    /// Plain text form used for templates, headers, query strings and
    /// regular expression matching.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(value) => value.to_string(),
            Value::Int(value) => value.to_string(),
            Value::Float(value) => value.to_string(),
            Value::Decimal(value) => value.to_string(),
            Value::String(value) => value.clone(),
            Value::Bytes(value) => String::from_utf8_lossy(value).into_owned(),
            Value::Array(_) | Value::Object(_) => self.to_json().to_string(),
            Value::Deferred(inner) => format!("{inner:?}"),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(value) => serde_json::Value::Bool(*value),
            Value::Int(value) => serde_json::Value::from(*value),
            Value::Float(value) => serde_json::Number::from_f64(*value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Decimal(value) => {
                let number = if value.fract().is_zero() {
                    value.to_i64().map(serde_json::Number::from)
                } else {
                    value.to_f64().and_then(serde_json::Number::from_f64)
                };
                number
                    .map(serde_json::Value::Number)
                    .unwrap_or_else(|| serde_json::Value::String(value.to_string()))
            }
            Value::String(value) => serde_json::Value::String(value.clone()),
            Value::Bytes(value) => {
                serde_json::Value::String(String::from_utf8_lossy(value).into_owned())
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Value::Deferred(inner) => serde_json::Value::String(format!("{inner:?}")),
        }
    }

    /// Convert decoded JSON. Integers without a decimal point become `Int`,
    /// everything else numeric becomes `Float`.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(value) => Value::Bool(value),
            serde_json::Value::Number(number) => {
                if let Some(value) = number.as_i64() {
                    Value::Int(value)
                } else {
                    Value::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(value) => Value::String(value),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from_json(value)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(value) => write!(f, "Bool({value})"),
            Value::Int(value) => write!(f, "Int({value})"),
            Value::Float(value) => write!(f, "Float({value})"),
            Value::Decimal(value) => write!(f, "Decimal({value})"),
            Value::String(value) => write!(f, "String({value:?})"),
            Value::Bytes(value) => write!(f, "Bytes({:?})", String::from_utf8_lossy(value)),
            Value::Array(items) => f.debug_list().entries(items).finish(),
            Value::Object(map) => f.debug_map().entries(map.iter()).finish(),
            Value::Deferred(inner) => write!(f, "Deferred({inner:?})"),
        }
    }
}

/// Report form: strings are quoted, containers render as JSON.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::String(value) => write!(f, "{value:?}"),
            Value::Bytes(value) => write!(f, "b{:?}", String::from_utf8_lossy(value)),
            Value::Deferred(inner) => write!(f, "{inner:?}"),
            other => write!(f, "{}", other.to_text()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Deferred(a), Value::Deferred(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

macro_rules! int_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::Int(i64::from(value))
            }
        })*
    };
}

int_from!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        i64::try_from(value).map(Value::Int).unwrap_or(Value::Float(value as f64))
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        i64::try_from(value).map(Value::Int).unwrap_or(Value::Float(value as f64))
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(f64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Value::Decimal(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::String(value.clone())
    }
}

impl From<bytes::Bytes> for Value {
    fn from(value: bytes::Bytes) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Object(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::from_json(value)
    }
}

/// Build an object literal. Entries may hold deferred values.
pub fn object<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Value
where
    K: Into<String>,
    V: Into<Value>,
{
    Value::Object(
        entries
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect(),
    )
}

/// Build an array literal. Items may hold deferred values.
pub fn array<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Value {
    Value::Array(items.into_iter().map(Into::into).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_keeps_integers_and_floats_apart() {
        let value = Value::from_json(json!({"id": 7, "price": 7.5, "tags": ["a", 1]}));
        let map = value.as_object().expect("object");
        assert_eq!(map["id"], Value::Int(7));
        assert_eq!(map["price"], Value::Float(7.5));
        assert_eq!(
            map["tags"],
            Value::Array(vec![Value::from("a"), Value::Int(1)])
        );
    }

    #[test]
    fn object_literal_preserves_declaration_order() {
        let value = object([("id", Value::from("x")), ("cat_id", Value::from(1))]);
        let keys: Vec<_> = value.as_object().expect("object").keys().cloned().collect();
        assert_eq!(keys, vec!["id".to_string(), "cat_id".to_string()]);
    }

    #[test]
    fn text_form_of_containers_is_json() {
        let value = object([("a", 1)]);
        assert_eq!(value.to_text(), r#"{"a":1}"#);
        assert_eq!(Value::Null.to_text(), "");
        assert_eq!(Value::from("plain").to_text(), "plain");
    }

    #[test]
    fn truthiness_follows_emptiness_and_zero() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(3).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::from("FALSE").is_truthy());
        assert!(Value::from("yes").is_truthy());
        assert!(!array(Vec::<Value>::new()).is_truthy());
    }

    #[test]
    fn decimal_serialises_as_number_when_possible() {
        let value = Value::Decimal(Decimal::new(1050, 2));
        assert_eq!(value.to_json(), json!(10.5));
        let whole = Value::Decimal(Decimal::new(42, 0));
        assert_eq!(whole.to_json(), json!(42));
    }
}
