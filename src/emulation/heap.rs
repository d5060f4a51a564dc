//! Managed heap of the reference interpreter.

use std::{collections::HashMap, sync::Arc};

use crate::{
    emulation::{EmValue, HeapRef},
    metadata::Token,
    Error, Result,
};

/// One heap-allocated object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeapObject {
    /// Immutable string
    String(Arc<str>),
    /// Instance of a type defined in the module
    Object {
        /// Runtime type
        type_token: Token,
        /// Instance field values; fields never written read as their default
        fields: HashMap<Token, EmValue>,
    },
    /// Single-dimensional array
    Array(Vec<EmValue>),
    /// Callback value with its invocation list of `(target, method)` pairs
    Delegate {
        /// Callback type
        type_token: Token,
        /// Invocation list in call order
        invocations: Vec<(EmValue, Token)>,
    },
    /// Runtime collection
    List(Vec<EmValue>),
    /// Enumerator over a runtime collection
    Enumerator {
        /// The enumerated collection
        list: HeapRef,
        /// Current position, `None` before the first `MoveNext`
        position: Option<usize>,
    },
}

impl HeapObject {
    /// Short name of the object kind for error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HeapObject::String(_) => "string",
            HeapObject::Object { .. } => "object",
            HeapObject::Array(_) => "array",
            HeapObject::Delegate { .. } => "delegate",
            HeapObject::List(_) => "list",
            HeapObject::Enumerator { .. } => "enumerator",
        }
    }

    /// Runtime type of objects and callbacks.
    #[must_use]
    pub fn type_token(&self) -> Option<Token> {
        match self {
            HeapObject::Object { type_token, .. } | HeapObject::Delegate { type_token, .. } => {
                Some(*type_token)
            }
            _ => None,
        }
    }
}

/// Simulated managed heap with an object limit.
#[derive(Debug)]
pub struct ManagedHeap {
    objects: Vec<HeapObject>,
    max_objects: usize,
}

impl ManagedHeap {
    /// Creates a heap holding at most `max_objects` objects.
    #[must_use]
    pub fn new(max_objects: usize) -> Self {
        ManagedHeap {
            objects: Vec::new(),
            max_objects,
        }
    }

    /// Allocates `object`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if the heap is full.
    pub fn alloc(&mut self, object: HeapObject) -> Result<HeapRef> {
        if self.objects.len() >= self.max_objects {
            return Err(Error::Emulation(format!(
                "heap limit of {} objects reached",
                self.max_objects
            )));
        }
        self.objects.push(object);
        Ok(HeapRef::new(self.objects.len() as u64 - 1))
    }

    /// Allocates a string.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if the heap is full.
    pub fn alloc_string(&mut self, value: &str) -> Result<HeapRef> {
        self.alloc(HeapObject::String(Arc::from(value)))
    }

    /// Allocates an instance of `type_token` with all fields at their defaults.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if the heap is full.
    pub fn alloc_object(&mut self, type_token: Token) -> Result<HeapRef> {
        self.alloc(HeapObject::Object {
            type_token,
            fields: HashMap::new(),
        })
    }

    /// The object behind `heap_ref`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] for a dangling reference.
    pub fn get(&self, heap_ref: HeapRef) -> Result<&HeapObject> {
        usize::try_from(heap_ref.id())
            .ok()
            .and_then(|i| self.objects.get(i))
            .ok_or_else(|| Error::Emulation(format!("dangling {heap_ref}")))
    }

    /// Mutable access to the object behind `heap_ref`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] for a dangling reference.
    pub fn get_mut(&mut self, heap_ref: HeapRef) -> Result<&mut HeapObject> {
        usize::try_from(heap_ref.id())
            .ok()
            .and_then(|i| self.objects.get_mut(i))
            .ok_or_else(|| Error::Emulation(format!("dangling {heap_ref}")))
    }

    /// The string behind `heap_ref`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if `heap_ref` is not a string.
    pub fn get_string(&self, heap_ref: HeapRef) -> Result<Arc<str>> {
        match self.get(heap_ref)? {
            HeapObject::String(s) => Ok(Arc::clone(s)),
            other => Err(Error::Emulation(format!("expected string, found {}", other.kind()))),
        }
    }

    /// Reads instance field `field`; `None` if it was never written.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if `heap_ref` is not an object.
    pub fn get_field(&self, heap_ref: HeapRef, field: Token) -> Result<Option<EmValue>> {
        match self.get(heap_ref)? {
            HeapObject::Object { fields, .. } => Ok(fields.get(&field).cloned()),
            other => Err(Error::Emulation(format!(
                "field {field} read on a {}",
                other.kind()
            ))),
        }
    }

    /// Writes instance field `field`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if `heap_ref` is not an object.
    pub fn set_field(&mut self, heap_ref: HeapRef, field: Token, value: EmValue) -> Result<()> {
        match self.get_mut(heap_ref)? {
            HeapObject::Object { fields, .. } => {
                fields.insert(field, value);
                Ok(())
            }
            other => Err(Error::Emulation(format!(
                "field {field} written on a {}",
                other.kind()
            ))),
        }
    }

    /// Number of live objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if nothing was allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for ManagedHeap {
    fn default() -> Self {
        Self::new(1 << 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_fields() {
        let mut heap = ManagedHeap::default();
        let ty = Token::from_parts(Token::TYPE_TABLE, 4);
        let field = Token::from_parts(Token::FIELD_TABLE, 2);
        let obj = heap.alloc_object(ty).unwrap();

        assert_eq!(heap.get_field(obj, field).unwrap(), None);
        heap.set_field(obj, field, EmValue::I32(5)).unwrap();
        assert_eq!(heap.get_field(obj, field).unwrap(), Some(EmValue::I32(5)));
        assert_eq!(heap.get(obj).unwrap().type_token(), Some(ty));
    }

    #[test]
    fn test_heap_limit() {
        let mut heap = ManagedHeap::new(1);
        heap.alloc_string("a").unwrap();
        assert!(matches!(heap.alloc_string("b"), Err(Error::Emulation(_))));
        let s = heap.alloc_string("x");
        assert!(s.is_err());
        assert_eq!(&*heap.get_string(HeapRef::new(0)).unwrap(), "a");
    }
}
