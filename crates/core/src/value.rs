//! Argument value universe.
//!
//! Captured arguments must survive a process restart, so they are restricted
//! to a closed set of shapes: primitives, strings, bytes, lists, and composite
//! values whose type tag has been registered with the serializer.

use core::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RetryError;

/// A single argument (or result) value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ArgValue>),
    Composite(CompositeValue),
}

/// A registered composite value: schema tag + version + JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeValue {
    pub type_tag: String,
    pub version: u32,
    pub payload: serde_json::Value,
}

/// A Rust type that can travel as a composite argument.
///
/// `TYPE_TAG` is the durable name of the type; bump `VERSION` when the payload
/// layout changes so old records can be told apart.
pub trait CompositeArg: Serialize + DeserializeOwned {
    const TYPE_TAG: &'static str;
    const VERSION: u32 = 1;
}

impl ArgValue {
    /// Wrap a registered composite type.
    pub fn composite<T: CompositeArg>(value: &T) -> Result<Self, RetryError> {
        let payload = serde_json::to_value(value)
            .map_err(|e| RetryError::serialization(format!("{}: {e}", T::TYPE_TAG)))?;
        Ok(ArgValue::Composite(CompositeValue {
            type_tag: T::TYPE_TAG.to_string(),
            version: T::VERSION,
            payload,
        }))
    }

    /// Read back a composite value as `T`.
    ///
    /// Fails when the tag differs or the stored version is newer than `T`
    /// knows about.
    pub fn to_composite<T: CompositeArg>(&self) -> Result<T, RetryError> {
        match self {
            ArgValue::Composite(c) if c.type_tag == T::TYPE_TAG => {
                if c.version > T::VERSION {
                    return Err(RetryError::serialization(format!(
                        "{} version {} is newer than supported {}",
                        c.type_tag,
                        c.version,
                        T::VERSION
                    )));
                }
                serde_json::from_value(c.payload.clone())
                    .map_err(|e| RetryError::serialization(format!("{}: {e}", c.type_tag)))
            }
            other => Err(RetryError::serialization(format!(
                "expected composite {}, found {}",
                T::TYPE_TAG,
                other.type_name()
            ))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Null => "null",
            ArgValue::Bool(_) => "bool",
            ArgValue::Int(_) => "int",
            ArgValue::Float(_) => "float",
            ArgValue::Str(_) => "str",
            ArgValue::Bytes(_) => "bytes",
            ArgValue::List(_) => "list",
            ArgValue::Composite(_) => "composite",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ArgValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ArgValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ArgValue]> {
        match self {
            ArgValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Visit this value and every nested value, depth first.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a ArgValue)) {
        visit(self);
        if let ArgValue::List(items) = self {
            for item in items {
                item.walk(visit);
            }
        }
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        ArgValue::Int(i64::from(value))
    }
}

impl From<u32> for ArgValue {
    fn from(value: u32) -> Self {
        ArgValue::Int(i64::from(value))
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Float(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

impl From<Vec<u8>> for ArgValue {
    fn from(value: Vec<u8>) -> Self {
        ArgValue::Bytes(value)
    }
}

impl From<Vec<ArgValue>> for ArgValue {
    fn from(value: Vec<ArgValue>) -> Self {
        ArgValue::List(value)
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ArgValue::Null, Into::into)
    }
}

/// Declared type of a method parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "of", rename_all = "snake_case")]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List(Box<ParamType>),
    /// A composite value with the given type tag.
    Composite(String),
    /// The inner type, or `Null`.
    Optional(Box<ParamType>),
}

impl ParamType {
    pub fn list(of: ParamType) -> Self {
        ParamType::List(Box::new(of))
    }

    pub fn optional(of: ParamType) -> Self {
        ParamType::Optional(Box::new(of))
    }

    pub fn composite<T: CompositeArg>() -> Self {
        ParamType::Composite(T::TYPE_TAG.to_string())
    }

    /// Whether `value` can be passed for a parameter of this type.
    pub fn accepts(&self, value: &ArgValue) -> bool {
        match (self, value) {
            (ParamType::Optional(_), ArgValue::Null) => true,
            (ParamType::Optional(inner), v) => inner.accepts(v),
            (ParamType::Bool, ArgValue::Bool(_))
            | (ParamType::Int, ArgValue::Int(_))
            | (ParamType::Float, ArgValue::Float(_))
            | (ParamType::Str, ArgValue::Str(_))
            | (ParamType::Bytes, ArgValue::Bytes(_)) => true,
            (ParamType::List(inner), ArgValue::List(items)) => {
                items.iter().all(|item| inner.accepts(item))
            }
            (ParamType::Composite(tag), ArgValue::Composite(c)) => *tag == c.type_tag,
            _ => false,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Bool => f.write_str("bool"),
            ParamType::Int => f.write_str("int"),
            ParamType::Float => f.write_str("float"),
            ParamType::Str => f.write_str("str"),
            ParamType::Bytes => f.write_str("bytes"),
            ParamType::List(inner) => write!(f, "list<{inner}>"),
            ParamType::Composite(tag) => write!(f, "{tag}"),
            ParamType::Optional(inner) => write!(f, "{inner}?"),
        }
    }
}
