//! Configuration for the patch pipeline.
//!
//! This module provides [`WeaveConfig`], which controls which methods are analysed as entry
//! points, how synthesized context types are named, the iteration limits of every fixed point
//! and which boundness decisions are forced by the caller.

use crate::{
    analysis::AnalyzerConfig,
    context::{Boundness, ContextNames},
    metadata::Token,
};

/// Configuration for a weave run.
#[derive(Debug, Clone)]
pub struct WeaveConfig {
    /// Methods the host calls into. When empty, every method without a caller is used.
    pub entry_points: Vec<Token>,

    /// Methods that only run once, before any entry point (bootstrap code).
    pub init_only: Vec<Token>,

    /// Treat every static constructor as init-only (default: true).
    pub include_static_constructors: bool,

    /// Names of the root context type and of synthesized context types.
    pub names: ContextNames,

    /// Maximum passes of the callback fixed point over the module (default: 64).
    pub max_callback_iterations: usize,

    /// Limits of the static field analysis.
    pub analyzer: AnalyzerConfig,

    /// Maximum rounds of the boundness / carrier fixed point (default: 32).
    pub max_binding_rounds: usize,

    /// Run the stack verifier over rewritten bodies (default: true).
    pub verify_stack: bool,

    /// Boundness decisions that take precedence over the derived ones.
    pub asserted: Vec<(Token, Boundness)>,
}

impl Default for WeaveConfig {
    fn default() -> Self {
        Self {
            entry_points: Vec::new(),
            init_only: Vec::new(),
            include_static_constructors: true,
            names: ContextNames::default(),
            max_callback_iterations: 64,
            analyzer: AnalyzerConfig::default(),
            max_binding_rounds: 32,
            verify_stack: true,
            asserted: Vec::new(),
        }
    }
}

impl WeaveConfig {
    /// Uses `entry_points` as the methods the host calls into.
    #[must_use]
    pub fn with_entry_points(mut self, entry_points: impl IntoIterator<Item = Token>) -> Self {
        self.entry_points = entry_points.into_iter().collect();
        self
    }

    /// Uses `init_only` as the bootstrap methods.
    #[must_use]
    pub fn with_init_only(mut self, init_only: impl IntoIterator<Item = Token>) -> Self {
        self.init_only = init_only.into_iter().collect();
        self
    }

    /// Forces the boundness of `method`.
    #[must_use]
    pub fn assert_boundness(mut self, method: Token, boundness: Boundness) -> Self {
        self.asserted.push((method, boundness));
        self
    }

    /// Disables the stack verifier.
    #[must_use]
    pub fn without_verification(mut self) -> Self {
        self.verify_stack = false;
        self
    }
}
