//! Method definitions, parameters and runtime intrinsics.
//!
//! # Key Types
//! - [`MethodDef`] - A method with its signature, flags and optional body
//! - [`MethodModifiers`] - Attribute flags
//! - [`Param`] - A declared parameter
//! - [`Intrinsic`] - Behaviour provided by the runtime for body-less methods

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::{
    assembly::MethodBody,
    metadata::{Token, TypeSig},
};

/// Name of instance constructors
pub const CTOR_NAME: &str = ".ctor";
/// Name of static initializers
pub const CCTOR_NAME: &str = ".cctor";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    /// Method modifiers and properties
    pub struct MethodModifiers: u32 {
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Method cannot be overridden
        const FINAL = 0x0020;
        /// Method is virtual
        const VIRTUAL = 0x0040;
        /// Method always gets a new slot in the vtable
        const NEW_SLOT = 0x0100;
        /// Method does not provide an implementation
        const ABSTRACT = 0x0400;
        /// Method is special
        const SPECIAL_NAME = 0x0800;
        /// Implementation is provided by the runtime or another module
        const EXTERNAL = 0x2000;
        /// Method was emitted by a compiler (lambda bodies, accessors)
        const COMPILER_GENERATED = 0x8000;
    }
}

/// Runtime-provided behaviour of a body-less method.
///
/// The analyses understand these natively: callback invocation and combination, asynchronous
/// dispatch of callbacks, and collection access (which contributes element and enumerator hops
/// to member-access chains).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
pub enum Intrinsic {
    /// `System.Object::.ctor`
    ObjectCtor,
    /// Callback `Invoke`
    DelegateInvoke,
    /// `Delegate.Combine(a, b)` (event subscribe)
    DelegateCombine,
    /// `Delegate.Remove(a, b)` (event unsubscribe)
    DelegateRemove,
    /// Start a thread running the callback argument
    ThreadStart,
    /// Schedule the callback argument as a task
    TaskRun,
    /// Queue the callback argument on the thread pool
    ThreadPoolQueue,
    /// Collection constructor
    CollectionCtor,
    /// `collection[index]`
    CollectionGet,
    /// `collection[index] = value`
    CollectionSet,
    /// `collection.Add(value)`
    CollectionAdd,
    /// `collection.Remove(value)`
    CollectionRemove,
    /// `collection.Clear()`
    CollectionClear,
    /// `collection.Count`
    CollectionCount,
    /// `collection.GetEnumerator()`
    GetEnumerator,
    /// `enumerator.MoveNext()`
    EnumeratorMoveNext,
    /// `enumerator.Current`
    EnumeratorCurrent,
}

impl Intrinsic {
    /// Returns `true` for primitives that run a callback argument asynchronously.
    #[must_use]
    pub const fn is_async_dispatch(self) -> bool {
        matches!(
            self,
            Intrinsic::ThreadStart | Intrinsic::TaskRun | Intrinsic::ThreadPoolQueue
        )
    }

    /// Returns `true` for callback combination (`Combine` / `Remove`).
    #[must_use]
    pub const fn is_delegate_combination(self) -> bool {
        matches!(self, Intrinsic::DelegateCombine | Intrinsic::DelegateRemove)
    }

    /// Returns `true` for collection operations that mutate their receiver.
    #[must_use]
    pub const fn mutates_receiver(self) -> bool {
        matches!(
            self,
            Intrinsic::CollectionSet
                | Intrinsic::CollectionAdd
                | Intrinsic::CollectionRemove
                | Intrinsic::CollectionClear
        )
    }
}

/// A declared method parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name
    pub name: String,
    /// Declared type
    pub sig: TypeSig,
}

impl Param {
    /// Creates a parameter.
    #[must_use]
    pub fn new(name: impl Into<String>, sig: TypeSig) -> Self {
        Param {
            name: name.into(),
            sig,
        }
    }
}

/// A method declared on a type.
///
/// Argument numbering follows the stack machine: for instance methods argument 0 is `this` and
/// declared parameter `i` is argument `i + 1`; for static methods parameter `i` is argument `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Identity of this method
    pub token: Token,
    /// Method name
    pub name: String,
    /// The type declaring this method
    pub declaring_type: Token,
    /// Modifier flags
    pub flags: MethodModifiers,
    /// Declared parameters, excluding `this`
    pub params: Vec<Param>,
    /// Return type
    pub return_type: TypeSig,
    /// Names of generic parameters
    pub generic_params: Vec<String>,
    /// Methods this method explicitly implements or overrides
    pub overrides: Vec<Token>,
    /// Runtime-provided behaviour, for body-less runtime methods
    pub intrinsic: Option<Intrinsic>,
    /// The body, `None` for abstract, external and runtime methods
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// Returns `true` if the method has no `this` argument.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodModifiers::STATIC)
    }

    /// Returns `true` for virtual methods.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(MethodModifiers::VIRTUAL)
    }

    /// Returns `true` for abstract methods.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodModifiers::ABSTRACT)
    }

    /// Returns `true` for methods implemented outside the module.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.flags.contains(MethodModifiers::EXTERNAL) || self.intrinsic.is_some()
    }

    /// Returns `true` for instance constructors.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        !self.is_static() && self.name == CTOR_NAME
    }

    /// Returns `true` for static initializers.
    #[must_use]
    pub fn is_static_constructor(&self) -> bool {
        self.is_static() && self.name == CCTOR_NAME
    }

    /// Returns `true` if the method returns a value.
    #[must_use]
    pub fn returns_value(&self) -> bool {
        self.return_type != TypeSig::Void
    }

    /// Number of stack arguments, including `this`.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(!self.is_static())
    }

    /// Offset of the first declared parameter in argument numbering.
    #[must_use]
    pub fn param_offset(&self) -> usize {
        usize::from(!self.is_static())
    }

    /// Declared type of argument `index` (argument 0 is `this` on instance methods).
    #[must_use]
    pub fn arg_sig(&self, index: usize) -> Option<TypeSig> {
        if !self.is_static() {
            if index == 0 {
                return Some(TypeSig::Class(self.declaring_type));
            }
            return self.params.get(index - 1).map(|p| p.sig.clone());
        }
        self.params.get(index).map(|p| p.sig.clone())
    }

    /// Returns `true` if a body is present.
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(flags: MethodModifiers, params: Vec<Param>) -> MethodDef {
        MethodDef {
            token: Token(0x0600_0001),
            name: "Run".to_string(),
            declaring_type: Token(0x0200_0002),
            flags,
            params,
            return_type: TypeSig::Void,
            generic_params: Vec::new(),
            overrides: Vec::new(),
            intrinsic: None,
            body: None,
        }
    }

    #[test]
    fn test_argument_numbering() {
        let params = vec![Param::new("a", TypeSig::I4), Param::new("b", TypeSig::String)];

        let instance = method(MethodModifiers::empty(), params.clone());
        assert_eq!(instance.arg_count(), 3);
        assert_eq!(instance.arg_sig(0), Some(TypeSig::Class(Token(0x0200_0002))));
        assert_eq!(instance.arg_sig(2), Some(TypeSig::String));
        assert_eq!(instance.arg_sig(3), None);

        let stat = method(MethodModifiers::STATIC, params);
        assert_eq!(stat.arg_count(), 2);
        assert_eq!(stat.arg_sig(0), Some(TypeSig::I4));
        assert_eq!(stat.param_offset(), 0);
    }

    #[test]
    fn test_intrinsic_classes() {
        assert!(Intrinsic::TaskRun.is_async_dispatch());
        assert!(Intrinsic::DelegateRemove.is_delegate_combination());
        assert!(Intrinsic::CollectionClear.mutates_receiver());
        assert!(!Intrinsic::CollectionGet.mutates_receiver());
    }
}
