//! Runtime values of the reference interpreter.

use std::fmt;

use crate::metadata::{Token, TypeSig};

/// A value on the evaluation stack, in a local, an argument or a field.
///
/// Booleans are widened to [`EmValue::I32`] as they are on the stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmValue {
    /// No value (void return)
    Void,
    /// 32-bit signed integer
    I32(i32),
    /// 64-bit signed integer
    I64(i64),
    /// Reference to a heap object
    ObjectRef(HeapRef),
    /// Null reference
    Null,
    /// Function pointer pushed by `ldftn` / `ldvirtftn`
    Method(Token),
}

impl EmValue {
    /// The default value of a location declared as `sig`.
    #[must_use]
    pub fn default_for(sig: &TypeSig) -> Self {
        match sig {
            TypeSig::Bool | TypeSig::I4 => EmValue::I32(0),
            TypeSig::I8 => EmValue::I64(0),
            TypeSig::Void => EmValue::Void,
            _ => EmValue::Null,
        }
    }

    /// Integer view of the value, widening `I32`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EmValue::I32(v) => Some(i64::from(*v)),
            EmValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// The heap reference, if this is an object reference.
    #[must_use]
    pub fn as_heap_ref(&self) -> Option<HeapRef> {
        match self {
            EmValue::ObjectRef(r) => Some(*r),
            _ => None,
        }
    }

    /// Branch condition semantics: non-zero integers and non-null references are true.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            EmValue::I32(v) => *v != 0,
            EmValue::I64(v) => *v != 0,
            EmValue::ObjectRef(_) | EmValue::Method(_) => true,
            EmValue::Null | EmValue::Void => false,
        }
    }

    /// Returns `true` for [`EmValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, EmValue::Null)
    }
}

impl From<i32> for EmValue {
    fn from(value: i32) -> Self {
        EmValue::I32(value)
    }
}

impl From<i64> for EmValue {
    fn from(value: i64) -> Self {
        EmValue::I64(value)
    }
}

impl From<bool> for EmValue {
    fn from(value: bool) -> Self {
        EmValue::I32(i32::from(value))
    }
}

impl fmt::Display for EmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmValue::Void => write!(f, "void"),
            EmValue::I32(v) => write!(f, "{v}"),
            EmValue::I64(v) => write!(f, "{v}L"),
            EmValue::ObjectRef(r) => write!(f, "{r}"),
            EmValue::Null => write!(f, "null"),
            EmValue::Method(m) => write!(f, "&{m}"),
        }
    }
}

/// Reference to a heap-allocated object.
///
/// Two `HeapRef` values are equal if they point to the same heap object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapRef(pub(crate) u64);

impl HeapRef {
    /// Creates a new heap reference with the given ID.
    #[must_use]
    pub fn new(id: u64) -> Self {
        HeapRef(id)
    }

    /// Returns the internal ID of this heap reference.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapRef({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_truthiness() {
        assert_eq!(EmValue::default_for(&TypeSig::Bool), EmValue::I32(0));
        assert_eq!(EmValue::default_for(&TypeSig::I8), EmValue::I64(0));
        assert_eq!(EmValue::default_for(&TypeSig::String), EmValue::Null);
        assert!(EmValue::from(true).is_truthy());
        assert!(!EmValue::Null.is_truthy());
        assert!(EmValue::ObjectRef(HeapRef::new(1)).is_truthy());
        assert_eq!(EmValue::I32(-3).as_i64(), Some(-3));
    }
}
