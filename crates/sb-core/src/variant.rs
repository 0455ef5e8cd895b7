use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::native::NativeObject;
use crate::value::ScriptValue;

/// Declared type of a native property, parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NativeType {
    Void,
    Bool,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
    Bytes,
    DateTime,
    List,
    Map,
    /// Pointer to any reflective native object.
    Object,
    /// Pointer to a reflective native object of the named class or a subclass.
    ObjectOf(&'static str),
    /// No declared type; the script value picks its own representation.
    Any,
    /// The raw engine value, passed through unconverted.
    ScriptValue,
    /// A non-reflective value type identified by tag.
    Custom(&'static str),
}

impl NativeType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::String => "String",
            Self::Bytes => "Bytes",
            Self::DateTime => "DateTime",
            Self::List => "List",
            Self::Map => "Map",
            Self::Object => "Object",
            Self::ObjectOf(class_name) => class_name,
            Self::Any => "Any",
            Self::ScriptValue => "ScriptValue",
            Self::Custom(tag) => tag,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::I16 | Self::U16 | Self::I32 | Self::U32 | Self::I64 | Self::U64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_object_pointer(&self) -> bool {
        matches!(self, Self::Object | Self::ObjectOf(_))
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque non-reflective native value carried by tag.
#[derive(Clone)]
pub struct CustomValue {
    tag: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl CustomValue {
    pub fn new<T: Any + Send + Sync>(tag: &'static str, value: T) -> Self {
        Self {
            tag,
            value: Arc::new(value),
        }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn same_instance(&self, other: &CustomValue) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for CustomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomValue({})", self.tag)
    }
}

/// The universal native value representation.
#[derive(Debug, Clone)]
pub enum Variant {
    /// No value; what a duck-typed `undefined` becomes.
    Invalid,
    Null,
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    List(Vec<Variant>),
    Map(BTreeMap<String, Variant>),
    Object(Arc<dyn NativeObject>),
    Custom(CustomValue),
    Script(ScriptValue),
}

impl Variant {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    pub fn native_type(&self) -> NativeType {
        match self {
            Self::Invalid => NativeType::Void,
            Self::Null => NativeType::Object,
            Self::Bool(_) => NativeType::Bool,
            Self::I16(_) => NativeType::I16,
            Self::U16(_) => NativeType::U16,
            Self::I32(_) => NativeType::I32,
            Self::U32(_) => NativeType::U32,
            Self::I64(_) => NativeType::I64,
            Self::U64(_) => NativeType::U64,
            Self::F32(_) => NativeType::F32,
            Self::F64(_) => NativeType::F64,
            Self::String(_) => NativeType::String,
            Self::Bytes(_) => NativeType::Bytes,
            Self::DateTime(_) => NativeType::DateTime,
            Self::List(_) => NativeType::List,
            Self::Map(_) => NativeType::Map,
            Self::Object(_) => NativeType::Object,
            Self::Custom(custom) => NativeType::Custom(custom.tag()),
            Self::Script(_) => NativeType::ScriptValue,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Invalid)
    }

    /// Numeric value widened to `f64`, for any numeric variant.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Self::I16(value) => Some(f64::from(*value)),
            Self::U16(value) => Some(f64::from(*value)),
            Self::I32(value) => Some(f64::from(*value)),
            Self::U32(value) => Some(f64::from(*value)),
            Self::I64(value) => Some(*value as f64),
            Self::U64(value) => Some(*value as f64),
            Self::F32(value) => Some(f64::from(*value)),
            Self::F64(value) => Some(*value),
            Self::DateTime(value) => Some(*value as f64),
            _ => None,
        }
    }

    /// Integral value of the integer variants. Floats and `u64` values past
    /// `i64::MAX` have none.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Self::I16(value) => Some(i64::from(*value)),
            Self::U16(value) => Some(i64::from(*value)),
            Self::I32(value) => Some(i64::from(*value)),
            Self::U32(value) => Some(i64::from(*value)),
            Self::I64(value) | Self::DateTime(value) => Some(*value),
            Self::U64(value) => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<dyn NativeObject>> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Invalid, Self::Invalid) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::I16(a), Self::I16(b)) => a == b,
            (Self::U16(a), Self::U16(b)) => a == b,
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::U32(a), Self::U32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::U64(a), Self::U64(b)) => a == b,
            (Self::F32(a), Self::F32(b)) => a == b,
            (Self::F64(a), Self::F64(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::DateTime(a), Self::DateTime(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (Self::Custom(a), Self::Custom(b)) => a.same_instance(b),
            (Self::Script(a), Self::Script(b)) => a.strict_equals(b),
            _ => false,
        }
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Variant {
    fn from(value: i32) -> Self {
        Self::I32(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Self::F64(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// JSON-shaped rendering; objects, custom values and engine handles become
/// descriptive strings.
impl Serialize for Variant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Invalid | Self::Null => serializer.serialize_unit(),
            Self::Bool(value) => serializer.serialize_bool(*value),
            Self::I16(value) => serializer.serialize_i16(*value),
            Self::U16(value) => serializer.serialize_u16(*value),
            Self::I32(value) => serializer.serialize_i32(*value),
            Self::U32(value) => serializer.serialize_u32(*value),
            Self::I64(value) | Self::DateTime(value) => serializer.serialize_i64(*value),
            Self::U64(value) => serializer.serialize_u64(*value),
            Self::F32(value) => serializer.serialize_f32(*value),
            Self::F64(value) => serializer.serialize_f64(*value),
            Self::String(value) => serializer.serialize_str(value),
            Self::Bytes(bytes) => {
                let mut seq = serializer.serialize_seq(Some(bytes.len()))?;
                for byte in bytes {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Self::Object(object) => {
                serializer.serialize_str(&format!("[object {}]", object.metadata().class_name()))
            }
            Self::Custom(custom) => serializer.serialize_str(&format!("[{}]", custom.tag())),
            Self::Script(_) => serializer.serialize_str("[script value]"),
        }
    }
}
