//! Structural guest values.
//!
//! A [`Value`] is the unit of data that crosses the host/guest boundary. It
//! is plain data except for the [`Value::Reference`] variant, which carries a
//! live cross-heap capability and therefore has no detached clone
//! representation (see [`ExternalCopy`](crate::external_copy::ExternalCopy)).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    reference::Reference,
};

/// Fixed accounting overhead charged per value node.
const VALUE_OVERHEAD_BYTES: usize = 16;

/// Accounting charge for a reference binding. References are host-side
/// bookkeeping; the charge covers the guest-visible slot entry only.
const REFERENCE_BINDING_BYTES: usize = 64;

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<Value>),
    Map(Vec<(String, Value)>),
    /// Opaque cross-heap capability. Not clonable across the boundary.
    Reference(Reference),
}

impl Value {
    /// Approximate heap footprint used by the accountant when this value is
    /// materialized into an isolate's heap.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) => VALUE_OVERHEAD_BYTES,
            Self::String(s) => VALUE_OVERHEAD_BYTES + s.len(),
            Self::Bytes(b) => VALUE_OVERHEAD_BYTES + b.len(),
            Self::Array(items) => {
                VALUE_OVERHEAD_BYTES + items.iter().map(Self::byte_size).sum::<usize>()
            }
            Self::Map(entries) => {
                VALUE_OVERHEAD_BYTES
                    + entries
                        .iter()
                        .map(|(k, v)| k.len() + VALUE_OVERHEAD_BYTES + v.byte_size())
                        .sum::<usize>()
            }
            Self::Reference(_) => REFERENCE_BINDING_BYTES,
        }
    }

    /// Whether this value transitively contains a live reference.
    #[must_use]
    pub fn contains_reference(&self) -> bool {
        match self {
            Self::Reference(_) => true,
            Self::Array(items) => items.iter().any(Self::contains_reference),
            Self::Map(entries) => entries.iter().any(|(_, v)| v.contains_reference()),
            _ => false,
        }
    }

    /// Lower into the serializable mirror, failing on any embedded reference.
    pub(crate) fn to_plain(&self) -> Result<PlainValue> {
        match self {
            Self::Null => Ok(PlainValue::Null),
            Self::Bool(b) => Ok(PlainValue::Bool(*b)),
            Self::Int(i) => Ok(PlainValue::Int(*i)),
            Self::Float(f) => Ok(PlainValue::Float(*f)),
            Self::String(s) => Ok(PlainValue::String(s.clone())),
            Self::Bytes(b) => Ok(PlainValue::Bytes(b.clone())),
            Self::Array(items) => Ok(PlainValue::Array(
                items.iter().map(Self::to_plain).collect::<Result<_>>()?,
            )),
            Self::Map(entries) => Ok(PlainValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_plain()?)))
                    .collect::<Result<_>>()?,
            )),
            Self::Reference(_) => Err(Error::NotClonable),
        }
    }

    pub(crate) fn from_plain(plain: PlainValue) -> Self {
        match plain {
            PlainValue::Null => Self::Null,
            PlainValue::Bool(b) => Self::Bool(b),
            PlainValue::Int(i) => Self::Int(i),
            PlainValue::Float(f) => Self::Float(f),
            PlainValue::String(s) => Self::String(s),
            PlainValue::Bytes(b) => Self::Bytes(b),
            PlainValue::Array(items) => Self::Array(items.into_iter().map(Self::from_plain).collect()),
            PlainValue::Map(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_plain(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(feature = "json")]
impl Value {
    /// Convert a JSON string into a guest value.
    ///
    /// # Errors
    /// Returns an error if the input is not valid JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: serde_json::Value =
            serde_json::from_str(json).map_err(|e| Error::runtime(e.to_string()))?;
        Ok(Self::from_json_value(&parsed))
    }

    /// Convert a guest value into a JSON string.
    ///
    /// # Errors
    /// Fails with [`Error::NotClonable`] if the value holds a reference.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.to_json_value()?).map_err(|e| Error::Engine(e.into()))
    }

    #[must_use]
    pub fn from_json_value(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n.as_i64().map_or_else(
                || Self::Float(n.as_f64().unwrap_or(f64::NAN)),
                Self::Int,
            ),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::Array(items.iter().map(Self::from_json_value).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_json_value(v)))
                    .collect(),
            ),
        }
    }

    /// # Errors
    /// Fails with [`Error::NotClonable`] if the value holds a reference;
    /// bytes are rendered as JSON arrays of integers.
    pub fn to_json_value(&self) -> Result<serde_json::Value> {
        let plain = self.to_plain()?;
        serde_json::to_value(plain_to_json(plain)).map_err(|e| Error::Engine(e.into()))
    }
}

#[cfg(feature = "json")]
fn plain_to_json(plain: PlainValue) -> serde_json::Value {
    match plain {
        PlainValue::Null => serde_json::Value::Null,
        PlainValue::Bool(b) => serde_json::Value::Bool(b),
        PlainValue::Int(i) => serde_json::Value::from(i),
        PlainValue::Float(f) => {
            serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }
        PlainValue::String(s) => serde_json::Value::String(s),
        PlainValue::Bytes(b) => {
            serde_json::Value::Array(b.iter().map(|byte| serde_json::Value::from(*byte)).collect())
        }
        PlainValue::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(plain_to_json).collect())
        }
        PlainValue::Map(entries) => serde_json::Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, plain_to_json(v)))
                .collect(),
        ),
    }
}

/// Serializable mirror of [`Value`] without the reference variant. This is
/// the wire shape of an external copy payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum PlainValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<PlainValue>),
    Map(Vec<(String, PlainValue)>),
}

#[cfg(test)]
mod tests {
    use super::Value;

    #[test]
    fn byte_size_scales_with_payload() {
        let small = Value::String("ab".to_string());
        let large = Value::String("a".repeat(1024));
        assert!(small.byte_size() < large.byte_size());
        assert_eq!(large.byte_size() - small.byte_size(), 1024 - 2);

        let nested = Value::Array(vec![small.clone(), small.clone(), small]);
        assert!(nested.byte_size() > large.byte_size() / 8);
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_roundtrip() {
        let value = Value::from_json(r#"{"a":1,"b":[true,null],"c":"x"}"#).expect("from json");
        let json = value.to_json().expect("to json");
        let got: serde_json::Value = serde_json::from_str(&json).expect("parse");
        let want: serde_json::Value =
            serde_json::from_str(r#"{"a":1,"b":[true,null],"c":"x"}"#).expect("parse");
        assert_eq!(got, want);
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_numbers_split_int_and_float() {
        assert_eq!(Value::from_json("3").expect("int"), Value::Int(3));
        assert_eq!(Value::from_json("3.5").expect("float"), Value::Float(3.5));
    }

    #[test]
    fn plain_roundtrip_preserves_structure() {
        let value = Value::Map(vec![
            ("k".to_string(), Value::Array(vec![Value::Int(1), Value::Null])),
            ("b".to_string(), Value::Bytes(bytes::Bytes::from_static(b"xy"))),
        ]);
        let plain = value.to_plain().expect("plain");
        assert_eq!(Value::from_plain(plain), value);
    }
}
