use std::any::Any;
use std::fmt;
use std::sync::Arc;

use time::macros::format_description;
use time::OffsetDateTime;

use super::key::NodeHandle;

/// Type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    String,
    Boolean,
    Integer,
    Float,
    Date,
    Node,
    JavaObject,
}

impl PropertyType {
    /// Name used in the `type` attribute of the XML record format.
    ///
    /// Strings carry no type attribute and node/opaque values are not
    /// literals, so those return `None`.
    pub fn type_attr(self) -> Option<&'static str> {
        match self {
            PropertyType::Boolean => Some("boolean"),
            PropertyType::Integer => Some("integer"),
            PropertyType::Float => Some("float"),
            PropertyType::Date => Some("date"),
            PropertyType::String | PropertyType::Node | PropertyType::JavaObject => None,
        }
    }

    /// Parses a `type` attribute; unknown or missing values mean string.
    pub fn from_type_attr(attr: Option<&str>) -> PropertyType {
        match attr {
            Some("boolean") => PropertyType::Boolean,
            Some("integer") => PropertyType::Integer,
            Some("float") => PropertyType::Float,
            Some("date") => PropertyType::Date,
            _ => PropertyType::String,
        }
    }
}

/// Opaque host-side value attached to a node. Never persisted.
#[derive(Clone)]
pub struct OpaqueObject(Arc<dyn Any + Send + Sync>);

impl OpaqueObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &OpaqueObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for OpaqueObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueObject({:p})", Arc::as_ptr(&self.0))
    }
}

/// The tagged union stored in a property slot.
#[derive(Debug, Clone)]
pub enum Value {
    String(String),
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Millisecond precision; sub-millisecond parts are dropped on set.
    Date(OffsetDateTime),
    Node(NodeHandle),
    JavaObject(OpaqueObject),
}

impl Value {
    pub fn property_type(&self) -> PropertyType {
        match self {
            Value::String(_) => PropertyType::String,
            Value::Boolean(_) => PropertyType::Boolean,
            Value::Integer(_) => PropertyType::Integer,
            Value::Float(_) => PropertyType::Float,
            Value::Date(_) => PropertyType::Date,
            Value::Node(_) => PropertyType::Node,
            Value::JavaObject(_) => PropertyType::JavaObject,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Value::Node(_) | Value::JavaObject(_))
    }

    /// Builds a date value truncated to whole milliseconds.
    pub fn date(value: OffsetDateTime) -> Value {
        Value::Date(truncate_to_millis(value))
    }

    /// Lenient string conversion used by `Node::get_string`.
    ///
    /// Every literal type converts; node values convert to the target's
    /// name (or id for unresolved handles); opaque objects yield `None`.
    pub fn to_display_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Boolean(b) => Some(b.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(format_float(*f)),
            Value::Date(d) => d
                .format(format_description!(
                    "[year]-[month]-[day] [hour]:[minute]:[second]"
                ))
                .ok(),
            Value::Node(handle) => Some(handle.display_name()),
            Value::JavaObject(_) => None,
        }
    }

    /// Same-type literal equality. Reference values compare by identity.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Node(a), Value::Node(b)) => a.same_target(b),
            (Value::JavaObject(a), Value::JavaObject(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// Formats floats the way the record format expects: integral values keep a
/// trailing `.0` so they read back as floats.
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

pub(crate) fn truncate_to_millis(value: OffsetDateTime) -> OffsetDateTime {
    let nanos = value.nanosecond();
    let truncated = nanos - nanos % 1_000_000;
    value.replace_nanosecond(truncated).unwrap_or(value)
}

/// Typed extraction from a [`Value`] without any cross-type coercion.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl FromValue for OffsetDateTime {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl FromValue for NodeHandle {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Node(h) => Some(h.clone()),
            _ => None,
        }
    }
}

impl FromValue for OpaqueObject {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::JavaObject(o) => Some(o.clone()),
            _ => None,
        }
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

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        Value::date(value)
    }
}
