use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// The representation of a value held by a transactional reference.
///
/// Every reference stores one of these, so the commit path handles all
/// references the same way whatever the user type is. [`TxnValue`] converts
/// between user types and this representation.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    /// Any shared object. Compared by identity, strings by content.
    Object(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Name of the representation kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns `true` when both values are the same for the purpose of the
    /// dirty check: primitives compare bitwise, objects by pointer. Strings
    /// are rebuilt on every conversion, so they compare by content.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Object(a), Value::Object(b)) => {
                if std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)) {
                    return true;
                }
                match (a.downcast_ref::<String>(), b.downcast_ref::<String>()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::Long(v) => write!(f, "Long({})", v),
            Value::Double(v) => write!(f, "Double({})", v),
            Value::Object(o) => {
                if let Some(s) = o.downcast_ref::<String>() {
                    write!(f, "Object({:?})", s)
                } else {
                    write!(f, "Object({:p})", Arc::as_ptr(o))
                }
            }
        }
    }
}

/// Conversion between a user type and the [`Value`] representation.
///
/// Implemented for `bool`, `i32`, `i64`, `u64`, `f64`, `String`, `Arc<T>`,
/// `Option<Arc<T>>` and `Value` itself.
pub trait TxnValue: Sized + Send + Sync + 'static {
    fn into_value(self) -> Value;

    /// Returns `None` when the value has a different representation.
    fn from_value(value: &Value) -> Option<Self>;
}

impl TxnValue for Value {
    fn into_value(self) -> Value {
        self
    }

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl TxnValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl TxnValue for i64 {
    fn into_value(self) -> Value {
        Value::Long(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl TxnValue for i32 {
    fn into_value(self) -> Value {
        Value::Long(i64::from(self))
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Long(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl TxnValue for u64 {
    fn into_value(self) -> Value {
        Value::Long(self as i64)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Long(v) => Some(*v as u64),
            _ => None,
        }
    }
}

impl TxnValue for f64 {
    fn into_value(self) -> Value {
        Value::Double(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl TxnValue for String {
    fn into_value(self) -> Value {
        Value::Object(Arc::new(self))
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(o) => o.downcast_ref::<String>().cloned(),
            _ => None,
        }
    }
}

impl<T: Send + Sync + 'static> TxnValue for Arc<T> {
    fn into_value(self) -> Value {
        Value::Object(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(o) => Arc::clone(o).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl<T: Send + Sync + 'static> TxnValue for Option<Arc<T>> {
    fn into_value(self) -> Value {
        match self {
            Some(object) => Value::Object(object),
            None => Value::Null,
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            Value::Object(o) => Arc::clone(o).downcast::<T>().ok().map(Some),
            _ => None,
        }
    }
}
