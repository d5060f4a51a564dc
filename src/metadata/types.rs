//! Type definitions and their attribute flags.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::metadata::Token;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    /// Type attributes relevant to the analysis
    pub struct TypeAttributes: u32 {
        /// Type is an interface
        const INTERFACE = 0x0020;
        /// Type cannot be instantiated
        const ABSTRACT = 0x0080;
        /// Type cannot be derived from
        const SEALED = 0x0100;
        /// Type is a value type (copied on assignment)
        const VALUE_TYPE = 0x0200;
        /// Type is a callback (delegate) type: construction binds a target method, `Invoke`
        /// calls it
        const DELEGATE = 0x0400;
        /// Type was emitted by a compiler (closure holders, state machines)
        const COMPILER_GENERATED = 0x0800;
        /// Type is provided by the runtime and has no analysable bodies
        const RUNTIME = 0x1000;
        /// Type was synthesized by the context rewrite
        const CONTEXT = 0x2000;
    }
}

/// A type defined in (or imported into) a [`crate::metadata::Module`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Identity of this type
    pub token: Token,
    /// Namespace, empty for the global namespace
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Attribute flags
    pub flags: TypeAttributes,
    /// Base type, `None` for the root object type and interfaces
    pub base: Option<Token>,
    /// Directly implemented interfaces
    pub interfaces: Vec<Token>,
    /// Declaring type for nested types
    pub enclosing: Option<Token>,
    /// Fields declared on this type, in declaration order
    pub fields: Vec<Token>,
    /// Methods declared on this type, in declaration order
    pub methods: Vec<Token>,
    /// Names of generic parameters
    pub generic_params: Vec<String>,
}

impl TypeDef {
    /// Creates an empty type definition.
    #[must_use]
    pub fn new(
        token: Token,
        namespace: impl Into<String>,
        name: impl Into<String>,
        flags: TypeAttributes,
        base: Option<Token>,
    ) -> Self {
        TypeDef {
            token,
            namespace: namespace.into(),
            name: name.into(),
            flags,
            base,
            interfaces: Vec::new(),
            enclosing: None,
            fields: Vec::new(),
            methods: Vec::new(),
            generic_params: Vec::new(),
        }
    }

    /// Namespace-qualified name, without nesting information.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Returns `true` if this is an interface.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.flags.contains(TypeAttributes::INTERFACE)
    }

    /// Returns `true` if this is an abstract class or an interface.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.flags
            .intersects(TypeAttributes::ABSTRACT | TypeAttributes::INTERFACE)
    }

    /// Returns `true` if this is a value type.
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        self.flags.contains(TypeAttributes::VALUE_TYPE)
    }

    /// Returns `true` if this is a callback (delegate) type.
    #[must_use]
    pub fn is_delegate(&self) -> bool {
        self.flags.contains(TypeAttributes::DELEGATE)
    }

    /// Returns `true` if this type is provided by the runtime.
    #[must_use]
    pub fn is_runtime(&self) -> bool {
        self.flags.contains(TypeAttributes::RUNTIME)
    }

    /// Returns `true` if this is a compiler-generated closure holder.
    ///
    /// Closure holders are nested, compiler-generated, concrete reference types.
    #[must_use]
    pub fn is_closure(&self) -> bool {
        self.flags.contains(TypeAttributes::COMPILER_GENERATED)
            && self.enclosing.is_some()
            && !self.is_abstract()
            && !self.is_value_type()
            && !self.is_delegate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_classification() {
        let mut closure = TypeDef::new(
            Token(0x0200_0004),
            "",
            "<>c__DisplayClass0",
            TypeAttributes::COMPILER_GENERATED | TypeAttributes::SEALED,
            Some(Token(0x0200_0001)),
        );
        assert!(!closure.is_closure());
        closure.enclosing = Some(Token(0x0200_0003));
        assert!(closure.is_closure());

        let iface = TypeDef::new(
            Token(0x0200_0005),
            "Game",
            "IRunner",
            TypeAttributes::INTERFACE,
            None,
        );
        assert!(iface.is_abstract());
        assert_eq!(iface.qualified_name(), "Game.IRunner");
    }
}
