//! The SAMP value model.
//!
//! SAMP restricts XML-RPC to three shapes: strings, ordered lists and
//! string-keyed maps, nested to any depth. Numbers and booleans travel as
//! strings and are interpreted by whoever reads them.

use crate::protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A string-keyed SAMP map.
pub type RpcMap = BTreeMap<String, RpcValue>;

/// A SAMP-legal value.
///
/// The variant is the value's shape; there is no separate type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcValue {
    String(String),
    List(Vec<RpcValue>),
    Map(RpcMap),
}

/// The shape of an [`RpcValue`], used in parameter signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    String,
    List,
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::String => "string",
            ValueKind::List => "list",
            ValueKind::Map => "map",
        })
    }
}

impl ValueKind {
    /// Classifies an arbitrary JSON value.
    ///
    /// # Errors
    ///
    /// Numbers, booleans and `null` are not SAMP-legal and yield
    /// [`ProtocolError::Format`].
    pub fn classify(value: &serde_json::Value) -> Result<Self, ProtocolError> {
        match value {
            serde_json::Value::String(_) => Ok(ValueKind::String),
            serde_json::Value::Array(_) => Ok(ValueKind::List),
            serde_json::Value::Object(_) => Ok(ValueKind::Map),
            other => Err(illegal_leaf(other)),
        }
    }
}

fn illegal_leaf(value: &serde_json::Value) -> ProtocolError {
    ProtocolError::Format(format!("Not legal SAMP object type: {value}"))
}

impl RpcValue {
    /// Returns the shape of this value.
    ///
    /// # Example
    ///
    /// ```
    /// use sampweb::protocol::{RpcValue, ValueKind};
    ///
    /// assert_eq!(RpcValue::from("x").kind(), ValueKind::String);
    /// assert_eq!(RpcValue::List(vec![]).kind(), ValueKind::List);
    /// ```
    pub fn kind(&self) -> ValueKind {
        match self {
            RpcValue::String(_) => ValueKind::String,
            RpcValue::List(_) => ValueKind::List,
            RpcValue::Map(_) => ValueKind::Map,
        }
    }

    /// Borrows the string, or `None` for a list or map.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrows the items of a list value.
    pub fn as_list(&self) -> Option<&[RpcValue]> {
        match self {
            RpcValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrows the entries of a map value.
    ///
    /// # Returns
    ///
    /// * `Some(&RpcMap)` - If the value is a map.
    /// * `None` - If it is a string or a list.
    pub fn as_map(&self) -> Option<&RpcMap> {
        match self {
            RpcValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Consumes the value, returning the string or a format error naming `what`.
    pub fn into_string(self, what: &str) -> Result<String, ProtocolError> {
        match self {
            RpcValue::String(s) => Ok(s),
            other => Err(shape_error(what, ValueKind::String, other.kind())),
        }
    }

    /// Like [`RpcValue::into_string`], for lists.
    pub fn into_list(self, what: &str) -> Result<Vec<RpcValue>, ProtocolError> {
        match self {
            RpcValue::List(items) => Ok(items),
            other => Err(shape_error(what, ValueKind::List, other.kind())),
        }
    }

    pub fn into_map(self, what: &str) -> Result<RpcMap, ProtocolError> {
        match self {
            RpcValue::Map(map) => Ok(map),
            other => Err(shape_error(what, ValueKind::Map, other.kind())),
        }
    }

    /// Builds a map value from `(key, value)` pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<RpcValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        RpcValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

fn shape_error(what: &str, expected: ValueKind, actual: ValueKind) -> ProtocolError {
    ProtocolError::Format(format!("{what}: expected {expected}, got {actual}"))
}

impl From<&str> for RpcValue {
    fn from(s: &str) -> Self {
        RpcValue::String(s.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(s: String) -> Self {
        RpcValue::String(s)
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(items: Vec<RpcValue>) -> Self {
        RpcValue::List(items)
    }
}

impl From<RpcMap> for RpcValue {
    fn from(map: RpcMap) -> Self {
        RpcValue::Map(map)
    }
}

impl TryFrom<serde_json::Value> for RpcValue {
    type Error = ProtocolError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::String(s) => Ok(RpcValue::String(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(RpcValue::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(RpcValue::List),
            serde_json::Value::Object(members) => members
                .into_iter()
                .map(|(k, v)| RpcValue::try_from(v).map(|v| (k, v)))
                .collect::<Result<RpcMap, _>>()
                .map(RpcValue::Map),
            other => Err(illegal_leaf(&other)),
        }
    }
}

/// Checks that `values` matches `expected` exactly, in arity and in shape.
///
/// # Errors
///
/// Returns [`ProtocolError::ParamMismatch`] on any difference.
pub fn check_params(values: &[RpcValue], expected: &[ValueKind]) -> Result<(), ProtocolError> {
    let actual: Vec<ValueKind> = values.iter().map(RpcValue::kind).collect();
    if actual.as_slice() == expected {
        Ok(())
    } else {
        Err(ProtocolError::ParamMismatch {
            expected: expected.to_vec(),
            actual,
        })
    }
}
