//! Type signatures.
//!
//! [`TypeSig`] describes the declared type of fields, parameters, locals and return values. It
//! carries just enough structure for the analyses: whether a value is a reference, which
//! definition it names, and which element types a container exposes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::metadata::Token;

/// A type signature as it appears on a field, parameter, local or return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeSig {
    /// No value (return type only)
    Void,
    /// Boolean
    Bool,
    /// 32-bit integer
    I4,
    /// 64-bit integer
    I8,
    /// String reference
    String,
    /// Untyped object reference
    Object,
    /// Reference to a class, interface or delegate defined in the module
    Class(Token),
    /// Value type defined in the module
    ValueType(Token),
    /// Single-dimensional zero-based array
    SzArray(Box<TypeSig>),
    /// Instantiated generic type, e.g. `List<Foo>`
    GenericInst(Box<TypeSig>, Vec<TypeSig>),
    /// Type outside the module, known only by name
    External(String),
}

impl TypeSig {
    /// Shorthand for `TypeSig::Class(token)`.
    #[must_use]
    pub const fn class(token: Token) -> Self {
        TypeSig::Class(token)
    }

    /// Shorthand for a single-dimensional array of `element`.
    #[must_use]
    pub fn array(element: TypeSig) -> Self {
        TypeSig::SzArray(Box::new(element))
    }

    /// Shorthand for a generic instantiation of `definition` with `args`.
    #[must_use]
    pub fn generic(definition: Token, args: Vec<TypeSig>) -> Self {
        TypeSig::GenericInst(Box::new(TypeSig::Class(definition)), args)
    }

    /// Returns `true` for primitive and user-defined value types.
    ///
    /// Value types are copied on assignment; a field of value type never aliases another
    /// object and therefore never contributes a type-flow edge.
    #[must_use]
    pub const fn is_value_type(&self) -> bool {
        matches!(
            self,
            TypeSig::Bool | TypeSig::I4 | TypeSig::I8 | TypeSig::ValueType(_)
        )
    }

    /// Returns `true` if the signature denotes an object reference.
    #[must_use]
    pub const fn is_reference(&self) -> bool {
        !self.is_value_type() && !matches!(self, TypeSig::Void)
    }

    /// Returns the definition token this signature names, if any.
    ///
    /// Generic instantiations resolve to their generic definition.
    #[must_use]
    pub fn type_token(&self) -> Option<Token> {
        match self {
            TypeSig::Class(token) | TypeSig::ValueType(token) => Some(*token),
            TypeSig::GenericInst(definition, _) => definition.type_token(),
            _ => None,
        }
    }

    /// Returns the element types exposed by a container signature.
    ///
    /// Arrays expose their element type, generic instantiations expose every type argument.
    /// Any other signature exposes nothing.
    #[must_use]
    pub fn element_types(&self) -> Vec<&TypeSig> {
        match self {
            TypeSig::SzArray(element) => vec![element.as_ref()],
            TypeSig::GenericInst(_, args) => args.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Returns the type yielded by indexing or enumerating this container.
    ///
    /// For generic instantiations this is the last type argument, matching the value slot of
    /// `Dictionary<K, V>` and the only slot of `List<T>`.
    #[must_use]
    pub fn element_type(&self) -> Option<&TypeSig> {
        match self {
            TypeSig::SzArray(element) => Some(element),
            TypeSig::GenericInst(_, args) => args.last(),
            _ => None,
        }
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Void => write!(f, "void"),
            TypeSig::Bool => write!(f, "bool"),
            TypeSig::I4 => write!(f, "int32"),
            TypeSig::I8 => write!(f, "int64"),
            TypeSig::String => write!(f, "string"),
            TypeSig::Object => write!(f, "object"),
            TypeSig::Class(token) => write!(f, "class {token}"),
            TypeSig::ValueType(token) => write!(f, "valuetype {token}"),
            TypeSig::SzArray(element) => write!(f, "{element}[]"),
            TypeSig::GenericInst(definition, args) => {
                write!(f, "{definition}<")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ">")
            }
            TypeSig::External(name) => write!(f, "[extern]{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_classification() {
        assert!(TypeSig::I4.is_value_type());
        assert!(TypeSig::ValueType(Token(0x0200_0001)).is_value_type());
        assert!(!TypeSig::String.is_value_type());
        assert!(TypeSig::Class(Token(0x0200_0001)).is_reference());
        assert!(!TypeSig::Void.is_reference());
    }

    #[test]
    fn test_container_elements() {
        let node = TypeSig::Class(Token(0x0200_0002));
        let list = TypeSig::generic(Token(0x0200_0009), vec![node.clone()]);
        assert_eq!(list.type_token(), Some(Token(0x0200_0009)));
        assert_eq!(list.element_type(), Some(&node));

        let dict = TypeSig::generic(Token(0x0200_000a), vec![TypeSig::String, node.clone()]);
        assert_eq!(dict.element_types().len(), 2);
        assert_eq!(dict.element_type(), Some(&node));

        let array = TypeSig::array(node.clone());
        assert_eq!(array.element_types(), vec![&node]);
        assert_eq!(array.type_token(), None);
    }

    #[test]
    fn test_display() {
        let sig = TypeSig::array(TypeSig::I4);
        assert_eq!(sig.to_string(), "int32[]");
    }
}
