//! Call site representation and call target types.
//!
//! This module defines the types used to represent individual call instructions
//! and their resolved targets within the call graph.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoStaticStr};

use crate::metadata::Token;

/// Type of call instruction.
///
/// Represents the opcodes that can reach another method: direct calls, virtual dispatch,
/// object construction and function pointer loads.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
pub enum CallType {
    /// Direct call instruction (`call`).
    #[strum(serialize = "call")]
    Call,
    /// Virtual call instruction (`callvirt`).
    #[strum(serialize = "callvirt")]
    CallVirt,
    /// Object construction (`newobj`).
    #[strum(serialize = "newobj")]
    NewObj,
    /// Load function pointer (`ldftn`).
    #[strum(serialize = "ldftn")]
    Ldftn,
    /// Load virtual function pointer (`ldvirtftn`).
    #[strum(serialize = "ldvirtftn")]
    LdVirtFtn,
}

impl CallType {
    /// Returns `true` if this is a virtual call that requires runtime dispatch.
    #[must_use]
    pub const fn is_virtual(&self) -> bool {
        matches!(self, Self::CallVirt | Self::LdVirtFtn)
    }

    /// Returns `true` if this call creates a new object.
    #[must_use]
    pub const fn is_constructor(&self) -> bool {
        matches!(self, Self::NewObj)
    }

    /// Returns `true` for function pointer loads, which reference a method without calling it.
    #[must_use]
    pub const fn is_function_pointer(&self) -> bool {
        matches!(self, Self::Ldftn | Self::LdVirtFtn)
    }
}

/// How the callees of a site were determined.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
pub enum CallKind {
    /// The named callee is the only callee
    Ordinary,
    /// Callees were found through the override relation
    Virtual,
    /// Callees are the targets of a callback value
    Callback,
}

/// Resolved target of a call instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallTarget {
    /// Resolved to a specific method of the module.
    Resolved(Token),

    /// Virtual call with the possible runtime targets from Class Hierarchy Analysis, or the
    /// single override selected by receiver tracing.
    Virtual {
        /// The declared method being called.
        declared: Token,
        /// All possible runtime targets (including overrides).
        possible_targets: Vec<Token>,
    },

    /// Callback invocation or asynchronous dispatch; the targets are the methods the callback
    /// value can point to.
    Callback {
        /// The invoke / dispatch method named by the instruction.
        via: Token,
        /// Methods the callback value can invoke.
        targets: Vec<Token>,
    },

    /// Target could not be resolved.
    Unresolved {
        /// The original token that couldn't be resolved.
        token: Token,
        /// Reason for resolution failure.
        reason: String,
    },
}

impl CallTarget {
    /// Returns `true` if this target was successfully resolved.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved { .. })
    }

    /// The directly named callee: the method token carried by the instruction.
    #[must_use]
    pub fn primary_token(&self) -> Token {
        match self {
            Self::Resolved(token) => *token,
            Self::Virtual { declared, .. } => *declared,
            Self::Callback { via, .. } => *via,
            Self::Unresolved { token, .. } => *token,
        }
    }

    /// Methods reached implicitly, beyond the named callee: overrides or callback targets.
    #[must_use]
    pub fn implicit_targets(&self) -> &[Token] {
        match self {
            Self::Virtual {
                possible_targets, ..
            } => possible_targets,
            Self::Callback { targets, .. } => targets,
            _ => &[],
        }
    }

    /// Returns all methods this call can transfer control to.
    ///
    /// For virtual calls these are the possible runtime targets, for callback invocations the
    /// named invoke method plus every callback target.
    #[must_use]
    pub fn all_targets(&self) -> Vec<Token> {
        match self {
            Self::Resolved(token) => vec![*token],
            Self::Virtual {
                possible_targets, ..
            } => possible_targets.clone(),
            Self::Callback { via, targets } => {
                let mut all = vec![*via];
                all.extend(targets.iter().copied());
                all
            }
            Self::Unresolved { .. } => Vec::new(),
        }
    }

    /// How the callees were determined.
    #[must_use]
    pub const fn kind(&self) -> CallKind {
        match self {
            Self::Virtual { .. } => CallKind::Virtual,
            Self::Callback { .. } => CallKind::Callback,
            _ => CallKind::Ordinary,
        }
    }
}

/// A specific call instruction within a method body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Instruction index of the call inside the method body.
    pub offset: usize,
    /// Type of call instruction.
    pub call_type: CallType,
    /// Resolved target of the call.
    pub target: CallTarget,
}

impl CallSite {
    /// Creates a new call site.
    #[must_use]
    pub const fn new(offset: usize, call_type: CallType, target: CallTarget) -> Self {
        Self {
            offset,
            call_type,
            target,
        }
    }

    /// Returns `true` if this call may have multiple runtime targets.
    #[must_use]
    pub fn is_polymorphic(&self) -> bool {
        match &self.target {
            CallTarget::Virtual {
                possible_targets, ..
            } => possible_targets.len() > 1,
            CallTarget::Callback { targets, .. } => targets.len() > 1,
            _ => false,
        }
    }

    /// Returns `true` if the call target is resolved.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.target.is_resolved()
    }

    /// How the callees were determined.
    #[must_use]
    pub const fn kind(&self) -> CallKind {
        self.target.kind()
    }
}
