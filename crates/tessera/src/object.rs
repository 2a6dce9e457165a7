use std::fmt;

use indexmap::IndexMap;

use crate::value::{Value, ValueMap};

/// A template value that can be passed to or received from the engine.
///
/// This is the public-facing type at the host boundary: render variables,
/// global values, and the arguments of host-registered filters, tests, and
/// functions are all `Object`s. It owns all of its data and can be freely
/// cloned, serialized, or stored, unlike the internal `Value` type which
/// shares payloads for the duration of a render.
///
/// # JSON Serialization
///
/// `Object` maps naturally onto JSON: `None` ↔ `null`, `Bool` ↔ boolean,
/// `Int`/`Float` ↔ number, `String` ↔ string, `List` ↔ array, and `Map` ↔
/// object (insertion order preserved).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Object {
    /// The null value (renders as `None`).
    None,
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit IEEE 754 float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence.
    List(Vec<Self>),
    /// Insertion-ordered string-keyed mapping.
    Map(IndexMap<String, Self>),
}

impl Object {
    /// Converts a host object into a runtime value, deep-converting containers.
    pub(crate) fn into_value(self) -> Value {
        match self {
            Self::None => Value::None,
            Self::Bool(v) => Value::Bool(v),
            Self::Int(v) => Value::Int(v),
            Self::Float(v) => Value::Float(v),
            Self::String(s) => Value::string(s),
            Self::List(items) => Value::list(items.into_iter().map(Self::into_value).collect()),
            Self::Map(map) => {
                let mut out = ValueMap::default();
                for (k, v) in map {
                    out.insert(k, v.into_value());
                }
                Value::dict(out)
            }
        }
    }

    /// Converts a runtime value back into an owned host object.
    ///
    /// Values with no host representation (callables, macros, loop objects)
    /// degrade to their rendered string form; ranges materialize into lists.
    pub(crate) fn from_value(value: &Value) -> Self {
        match value {
            Value::Undefined | Value::None => Self::None,
            Value::Bool(v) => Self::Bool(*v),
            Value::Int(v) => Self::Int(*v),
            Value::Float(v) => Self::Float(*v),
            Value::Str(s) => Self::String(s.as_str().to_owned()),
            Value::List(items) => Self::List(items.borrow().iter().map(Self::from_value).collect()),
            Value::Dict(map) | Value::Namespace(map) => {
                let mut out = IndexMap::new();
                for (k, v) in map.borrow().iter() {
                    out.insert(k.clone(), Self::from_value(v));
                }
                Self::Map(out)
            }
            Value::Range(r) => Self::List(r.values().iter().map(Self::from_value).collect()),
            other => Self::String(other.to_display_string()),
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.clone().into_value().write_display(&mut out);
        f.write_str(&out)
    }
}

impl From<bool> for Object {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Object {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Object {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Object {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Object {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Object {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<Object>> From<Vec<T>> for Object {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Object>> From<IndexMap<String, T>> for Object {
    fn from(v: IndexMap<String, T>) -> Self {
        Self::Map(v.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_nested_containers() {
        let mut map = IndexMap::new();
        map.insert("name".to_owned(), Object::from("t"));
        map.insert("values".to_owned(), Object::from(vec![1i64, 2, 3]));
        let obj = Object::Map(map);
        let back = Object::from_value(&obj.clone().into_value());
        assert_eq!(back, obj);
    }

    #[test]
    fn json_mapping_is_natural() {
        let obj = Object::List(vec![Object::None, Object::Int(1), Object::from("x")]);
        assert_eq!(serde_json::to_string(&obj).unwrap(), r#"[null,1,"x"]"#);
    }
}
