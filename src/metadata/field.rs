//! Field definitions.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::metadata::{Token, TypeSig};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    /// Field attributes relevant to the analysis
    pub struct FieldAttributes: u32 {
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Field can only be initialized, not written to after init
        const INIT_ONLY = 0x0020;
        /// Value is compile time constant
        const LITERAL = 0x0040;
        /// Field was emitted by a compiler
        const COMPILER_GENERATED = 0x0100;
    }
}

/// A field declared on a type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Identity of this field
    pub token: Token,
    /// Field name
    pub name: String,
    /// The type declaring this field
    pub declaring_type: Token,
    /// Declared type of the field
    pub sig: TypeSig,
    /// Attribute flags
    pub flags: FieldAttributes,
}

impl FieldDef {
    /// Returns `true` for process-global (static) fields.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldAttributes::STATIC)
    }

    /// Returns `true` for compile-time constants, which hold no mutable state.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.flags.contains(FieldAttributes::LITERAL)
    }
}
