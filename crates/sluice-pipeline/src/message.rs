//! Structured message model.
//!
//! A [`Message`] carries a fixed set of headers plus an ordered list of
//! [`Field`]s.  Every field holds an array of values of exactly one
//! [`ValueKind`]; the [`FieldValues`] enum makes a mixed-kind array
//! unrepresentable.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default severity assigned to new messages (syslog "debug").
pub const DEFAULT_SEVERITY: i32 = 7;

// ---------------------------------------------------------------------------
// Value kinds and values
// ---------------------------------------------------------------------------

/// The single value kind a field holds for its whole lifetime.
///
/// The numeric codes are part of the guest ABI and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String = 0,
    Bytes = 1,
    Integer = 2,
    Double = 3,
    Bool = 4,
}

impl ValueKind {
    /// Numeric code exposed to guests.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Inverse of [`ValueKind::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::String),
            1 => Some(Self::Bytes),
            2 => Some(Self::Integer),
            3 => Some(Self::Double),
            4 => Some(Self::Bool),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An owned scalar handed from a guest to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Bytes(Vec<u8>),
    Integer(i64),
    Double(f64),
    Bool(bool),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::String(_) => ValueKind::String,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Integer(_) => ValueKind::Integer,
            Self::Double(_) => ValueKind::Double,
            Self::Bool(_) => ValueKind::Bool,
        }
    }
}

/// A scalar handed from the host to a guest.
///
/// String and byte payloads are either borrowed from the message for the
/// duration of the enclosing call or owned by the value itself; in both
/// cases dropping the value is the only release step.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRef<'a> {
    String(Cow<'a, str>),
    Bytes(Cow<'a, [u8]>),
    Integer(i64),
    Double(f64),
    Bool(bool),
}

impl<'a> ValueRef<'a> {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::String(_) => ValueKind::String,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Integer(_) => ValueKind::Integer,
            Self::Double(_) => ValueKind::Double,
            Self::Bool(_) => ValueKind::Bool,
        }
    }

    /// Byte length for string and bytes values, zero for scalars.
    pub fn len(&self) -> usize {
        match self {
            Self::String(s) => s.len(),
            Self::Bytes(b) => b.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach from the message by copying any borrowed payload.
    pub fn into_owned(self) -> Value {
        match self {
            Self::String(s) => Value::String(s.into_owned()),
            Self::Bytes(b) => Value::Bytes(b.into_owned()),
            Self::Integer(i) => Value::Integer(i),
            Self::Double(d) => Value::Double(d),
            Self::Bool(b) => Value::Bool(b),
        }
    }
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// The value array of a field, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "lowercase")]
pub enum FieldValues {
    String(Vec<String>),
    Bytes(Vec<Vec<u8>>),
    Integer(Vec<i64>),
    Double(Vec<f64>),
    Bool(Vec<bool>),
}

impl FieldValues {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::String(_) => ValueKind::String,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Integer(_) => ValueKind::Integer,
            Self::Double(_) => ValueKind::Double,
            Self::Bool(_) => ValueKind::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::String(v) => v.len(),
            Self::Bytes(v) => v.len(),
            Self::Integer(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the element at `index`, if any.
    pub fn get(&self, index: usize) -> Option<ValueRef<'_>> {
        match self {
            Self::String(v) => v.get(index).map(|s| ValueRef::String(Cow::Borrowed(s.as_str()))),
            Self::Bytes(v) => v.get(index).map(|b| ValueRef::Bytes(Cow::Borrowed(b.as_slice()))),
            Self::Integer(v) => v.get(index).copied().map(ValueRef::Integer),
            Self::Double(v) => v.get(index).copied().map(ValueRef::Double),
            Self::Bool(v) => v.get(index).copied().map(ValueRef::Bool),
        }
    }

    /// Remove the element at `index`, shifting later elements down.
    ///
    /// Returns `false` (and leaves the array untouched) when `index` is out
    /// of range.
    pub fn remove(&mut self, index: usize) -> bool {
        if index >= self.len() {
            return false;
        }
        match self {
            Self::String(v) => {
                v.remove(index);
            }
            Self::Bytes(v) => {
                v.remove(index);
            }
            Self::Integer(v) => {
                v.remove(index);
            }
            Self::Double(v) => {
                v.remove(index);
            }
            Self::Bool(v) => {
                v.remove(index);
            }
        }
        true
    }
}

impl From<Value> for FieldValues {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Self::String(vec![s]),
            Value::Bytes(b) => Self::Bytes(vec![b]),
            Value::Integer(i) => Self::Integer(vec![i]),
            Value::Double(d) => Self::Double(vec![d]),
            Value::Bool(b) => Self::Bool(vec![b]),
        }
    }
}

/// A named, single-kind, array-valued datum attached to a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub representation: String,
    #[serde(flatten)]
    pub values: FieldValues,
}

impl Field {
    /// Create a field holding a single value.
    pub fn new(name: impl Into<String>, value: Value, representation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            representation: representation.into(),
            values: FieldValues::from(value),
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.values.kind()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<ValueRef<'_>> {
        self.values.get(index)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A structured pipeline message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    pub uuid: Uuid,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub logger: String,
    pub severity: i32,
    pub payload: String,
    pub env_version: String,
    pub pid: i32,
    pub hostname: String,
    pub fields: Vec<Field>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            uuid: Uuid::nil(),
            timestamp: 0,
            msg_type: String::new(),
            logger: String::new(),
            severity: DEFAULT_SEVERITY,
            payload: String::new(),
            env_version: String::new(),
            pid: 0,
            hostname: String::new(),
            fields: Vec::new(),
        }
    }
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions (into [`Message::fields`]) of every field named `name`, in
    /// declaration order.
    pub fn field_positions(&self, name: &str) -> Vec<usize> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.name == name)
            .map(|(i, _)| i)
            .collect()
    }

    /// All fields named `name`, in declaration order.
    pub fn find_all_fields<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Field> + 'a {
        self.fields.iter().filter(move |f| f.name == name)
    }

    pub fn find_first_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn add_field(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// Remove the field at `position`, preserving the order of the rest.
    pub fn remove_field_at(&mut self, position: usize) -> Option<Field> {
        (position < self.fields.len()).then(|| self.fields.remove(position))
    }
}
