//! Canonical scalar values and the value-type table shared by the binding
//! compiler and row materialization.
//!
//! Every semantic kind maps to exactly one bind operation and one read
//! operation. The mapping is total: anything the table does not recognise
//! degrades to [`ValueKind::Object`], which reads through the generic accessor
//! with an explicit type hint.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Runtime value produced by binding programs and read from result rows.
#[derive(Clone)]
pub enum Value {
    /// SQL null.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed 8-bit integer.
    Byte(i8),
    /// Signed 16-bit integer.
    Short(i16),
    /// Signed 32-bit integer.
    Int(i32),
    /// Signed 64-bit integer.
    Long(i64),
    /// 32-bit floating point value.
    Float(f32),
    /// 64-bit floating point value.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Milliseconds since the Unix epoch, UTC.
    Timestamp(i64),
    /// Binary payload.
    Bytes(Vec<u8>),
    /// Opaque host object; member access goes through the schema.
    Object(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Wraps a host object so binding programs can chain through it.
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Value::Object(Arc::new(value))
    }

    /// Returns the value-type table kind this value naturally binds as.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null | Value::Object(_) => ValueKind::Object,
            Value::Bool(_) => ValueKind::Bool,
            Value::Byte(_) => ValueKind::Byte,
            Value::Short(_) => ValueKind::Short,
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::String(_) => ValueKind::String,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::Bytes(_) => ValueKind::BinaryStream,
        }
    }

    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Widens any integral value to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Bool(v) => Some(i64::from(v)),
            Value::Byte(v) => Some(i64::from(v)),
            Value::Short(v) => Some(i64::from(v)),
            Value::Int(v) => Some(i64::from(v)),
            Value::Long(v) | Value::Timestamp(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Downcasts an opaque object payload.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Object(obj) => obj.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Byte(v) => write!(f, "Byte({v})"),
            Value::Short(v) => write!(f, "Short({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Long(v) => write!(f, "Long({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Double(v) => write!(f, "Double({v})"),
            Value::String(v) => write!(f, "String({v:?})"),
            Value::Timestamp(v) => write!(f, "Timestamp({v})"),
            Value::Bytes(v) => write!(f, "Bytes({} bytes)", v.len()),
            Value::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Byte(v) => write!(f, "{v}"),
            Value::Short(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "'{v}'"),
            Value::Timestamp(v) => write!(f, "ts:{v}"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Object(_) => f.write_str("<object>"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Semantic scalar kinds understood by the value-type table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Boolean.
    Bool,
    /// 8-bit integer.
    Byte,
    /// 16-bit integer.
    Short,
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// UTF-8 string.
    String,
    /// Epoch-millisecond timestamp.
    Timestamp,
    /// Binary payload.
    BinaryStream,
    /// Fallback for anything without a narrower mapping.
    Object,
}

impl ValueKind {
    /// Resolves a kind by name. Unknown names degrade to [`ValueKind::Object`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => ValueKind::Bool,
            "byte" | "i8" | "tinyint" => ValueKind::Byte,
            "short" | "i16" | "smallint" => ValueKind::Short,
            "int" | "i32" | "integer" => ValueKind::Int,
            "long" | "i64" | "bigint" => ValueKind::Long,
            "float" | "f32" | "real" => ValueKind::Float,
            "double" | "f64" => ValueKind::Double,
            "string" | "str" | "text" | "varchar" => ValueKind::String,
            "timestamp" | "datetime" => ValueKind::Timestamp,
            "bytes" | "binary" | "blob" | "binary_stream" => ValueKind::BinaryStream,
            _ => ValueKind::Object,
        }
    }

    /// Looks up this kind's row in the value-type table.
    pub fn info(self) -> KindInfo {
        classify(self)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Byte => "byte",
            ValueKind::Short => "short",
            ValueKind::Int => "int",
            ValueKind::Long => "long",
            ValueKind::Float => "float",
            ValueKind::Double => "double",
            ValueKind::String => "string",
            ValueKind::Timestamp => "timestamp",
            ValueKind::BinaryStream => "binary_stream",
            ValueKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// Statement parameter setter selected for a placeholder.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindOp {
    SetBool,
    SetByte,
    SetShort,
    SetInt,
    SetLong,
    SetFloat,
    SetDouble,
    SetString,
    SetTimestamp,
    SetBinaryStream,
    SetObject,
}

/// Result column getter selected for a projection.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ReadOp {
    GetBool,
    GetByte,
    GetShort,
    GetInt,
    GetLong,
    GetFloat,
    GetDouble,
    GetString,
    GetTimestamp,
    GetBinaryStream,
    /// Generic accessor; carries the declared type name as a hint.
    GetObject {
        hint: Arc<str>,
    },
}

/// One row of the value-type table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindInfo {
    /// Kind this row describes.
    pub kind: ValueKind,
    /// Setter used when binding a parameter of this kind.
    pub bind_op: BindOp,
    /// Getter used when reading a column of this kind. For
    /// [`ValueKind::Object`] the hint is the bare kind name; see
    /// [`KindInfo::hinted_read_op`].
    pub read_op: ReadOp,
    /// Fixed width in bytes, `None` for variable-width kinds.
    pub storage_width: Option<usize>,
    /// Whether reads must pass an explicit type hint.
    pub requires_type_hint: bool,
}

impl KindInfo {
    /// Read operation carrying `hint` when [`KindInfo::requires_type_hint`]
    /// is set, otherwise [`KindInfo::read_op`] unchanged.
    pub fn hinted_read_op(&self, hint: &str) -> ReadOp {
        if self.requires_type_hint {
            ReadOp::GetObject { hint: hint.into() }
        } else {
            self.read_op.clone()
        }
    }
}

/// The value-type table.
pub fn classify(kind: ValueKind) -> KindInfo {
    let (bind_op, read_op, storage_width) = match kind {
        ValueKind::Bool => (BindOp::SetBool, ReadOp::GetBool, Some(1)),
        ValueKind::Byte => (BindOp::SetByte, ReadOp::GetByte, Some(1)),
        ValueKind::Short => (BindOp::SetShort, ReadOp::GetShort, Some(2)),
        ValueKind::Int => (BindOp::SetInt, ReadOp::GetInt, Some(4)),
        ValueKind::Long => (BindOp::SetLong, ReadOp::GetLong, Some(8)),
        ValueKind::Float => (BindOp::SetFloat, ReadOp::GetFloat, Some(4)),
        ValueKind::Double => (BindOp::SetDouble, ReadOp::GetDouble, Some(8)),
        ValueKind::String => (BindOp::SetString, ReadOp::GetString, None),
        ValueKind::Timestamp => (BindOp::SetTimestamp, ReadOp::GetTimestamp, Some(8)),
        ValueKind::BinaryStream => (BindOp::SetBinaryStream, ReadOp::GetBinaryStream, None),
        ValueKind::Object => (
            BindOp::SetObject,
            ReadOp::GetObject {
                hint: Arc::from("object"),
            },
            None,
        ),
    };
    KindInfo {
        kind,
        bind_op,
        read_op,
        storage_width,
        requires_type_hint: kind == ValueKind::Object,
    }
}

/// Static type of an expression as seen by the binding compiler.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// A scalar kind from the value-type table.
    Scalar(ValueKind),
    /// A named host type registered in the schema.
    Object(Arc<str>),
    /// Accepts any argument; reads and binds as an opaque object.
    Any,
}

impl TypeRef {
    /// Boolean scalar.
    pub const BOOL: TypeRef = TypeRef::Scalar(ValueKind::Bool);
    /// 32-bit integer scalar.
    pub const INT: TypeRef = TypeRef::Scalar(ValueKind::Int);
    /// 64-bit integer scalar.
    pub const LONG: TypeRef = TypeRef::Scalar(ValueKind::Long);
    /// 64-bit float scalar.
    pub const DOUBLE: TypeRef = TypeRef::Scalar(ValueKind::Double);
    /// String scalar.
    pub const STRING: TypeRef = TypeRef::Scalar(ValueKind::String);
    /// Timestamp scalar.
    pub const TIMESTAMP: TypeRef = TypeRef::Scalar(ValueKind::Timestamp);
    /// Binary scalar.
    pub const BYTES: TypeRef = TypeRef::Scalar(ValueKind::BinaryStream);

    /// Reference to a named schema type.
    pub fn object(name: impl Into<Arc<str>>) -> Self {
        TypeRef::Object(name.into())
    }

    /// Classifies this type through the value-type table.
    pub fn kind(&self) -> ValueKind {
        match self {
            TypeRef::Scalar(kind) => *kind,
            TypeRef::Object(_) | TypeRef::Any => ValueKind::Object,
        }
    }

    /// Type name passed as the hint to generic accessors.
    pub fn hint(&self) -> String {
        match self {
            TypeRef::Scalar(kind) => kind.to_string(),
            TypeRef::Object(name) => name.to_string(),
            TypeRef::Any => "any".to_owned(),
        }
    }

    /// Whether a parameter of this type accepts an argument of type `arg`.
    pub fn accepts(&self, arg: &TypeRef) -> bool {
        matches!(self, TypeRef::Any) || self == arg
    }
}

impl From<ValueKind> for TypeRef {
    fn from(kind: ValueKind) -> Self {
        TypeRef::Scalar(kind)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hint())
    }
}
