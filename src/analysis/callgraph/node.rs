//! Call graph node representation.
//!
//! This module defines the [`CallGraphNode`] structure which represents
//! a method in the call graph along with its call site information.

use crate::{
    analysis::callgraph::CallSite,
    metadata::{MethodDef, Module, Token},
};

/// A node in the call graph representing a method.
///
/// Each node contains the method's display name and modifiers as well as the call sites within
/// its body. Runtime methods (intrinsics, external methods) get nodes too, so that edges into
/// them are visible.
#[derive(Debug, Clone)]
pub struct CallGraphNode {
    /// The method token uniquely identifying this method in the module.
    pub token: Token,
    /// Full qualified name including type (e.g., "Namespace.Type::Method").
    pub full_name: String,
    /// Whether this is a virtual method that can be overridden.
    pub is_virtual: bool,
    /// Whether this method is abstract (has no implementation body).
    pub is_abstract: bool,
    /// Whether this method is static (not associated with an instance).
    pub is_static: bool,
    /// Whether the implementation lives outside the module (runtime or external).
    pub is_external: bool,
    /// Whether this is a constructor (`.ctor` or `.cctor`).
    pub is_constructor: bool,
    /// All call sites within this method's body.
    pub call_sites: Vec<CallSite>,
    /// Methods that override this method (populated for virtual methods).
    pub overriders: Vec<Token>,
}

impl CallGraphNode {
    /// Creates a node for `method` with no call sites.
    #[must_use]
    pub fn new(module: &Module, method: &MethodDef) -> Self {
        Self {
            token: method.token,
            full_name: module.method_name(method.token),
            is_virtual: method.is_virtual(),
            is_abstract: method.is_abstract(),
            is_static: method.is_static(),
            is_external: method.is_external(),
            is_constructor: method.is_constructor() || method.is_static_constructor(),
            call_sites: Vec::new(),
            overriders: Vec::new(),
        }
    }

    /// Returns the number of call sites in this method.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.call_sites.len()
    }

    /// Returns `true` if this method has a body that can be analyzed.
    #[must_use]
    pub const fn has_body(&self) -> bool {
        !self.is_abstract && !self.is_external
    }

    /// Returns all unique callee tokens from this method, in order of first occurrence.
    ///
    /// For virtual calls every possible target is included, for callback invocations the
    /// invoke method and every callback target.
    #[must_use]
    pub fn callees(&self) -> Vec<Token> {
        let mut callees = Vec::new();
        for site in &self.call_sites {
            for target in site.target.all_targets() {
                if !callees.contains(&target) {
                    callees.push(target);
                }
            }
        }
        callees
    }
}
