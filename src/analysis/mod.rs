//! Whole-program analysis infrastructure.
//!
//! This module provides the analyses the context weaver is driven by. It builds upon the
//! generic graph infrastructure in [`crate::utils::graph`] to provide domain-specific tools.
//!
//! # Architecture
//!
//! The analysis module is organized into focused sub-modules, leaves first:
//!
//! - [`hierarchy`] - Type inheritance index (ancestors and descendants of every type)
//! - [`callgraph`] - Method inheritance graph, call sites and the inter-procedural call graph
//! - [`callbacks`] - Callback invocation graph (which methods a delegate value can invoke)
//! - [`typeflow`] - Type reference graph reduced to strongly connected components
//! - [`statics`] - Fixed-point static field reference / modification analysis
//! - [`stack`] - Jump-site maps, operand producers and stack depth verification
//! - [`diagnostics`] - Non-fatal findings collected during analysis
//!
//! Results flow bottom-up: the inheritance graph feeds callback and call graph construction,
//! the call graph and the type-flow index feed the static field analyzer, whose
//! [`StaticFieldReport`] drives the context model.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ctxweave::analysis::*;
//!
//! let inheritance = InheritanceGraph::new(&module);
//! let jumps = JumpSiteCache::new();
//! let diagnostics = Diagnostics::new();
//! let callbacks = CallbackGraph::build(&module, &inheritance, &jumps, &diagnostics, 64)?;
//! let callgraph = CallGraph::build(&module, &inheritance, &callbacks, &jumps, &diagnostics)?;
//! let typeflow = TypeFlowIndex::build(&module)?;
//! let analyzer = StaticFieldAnalyzer::run(
//!     &module, &callgraph, &typeflow, &jumps, &diagnostics, AnalyzerConfig::default(),
//! )?;
//! let report = analyzer.report(&entry_points, &[], true);
//! ```

pub mod callbacks;
pub mod callgraph;
pub mod diagnostics;
pub mod hierarchy;
pub mod stack;
pub mod statics;
pub mod typeflow;

// Re-export primary types at module level
pub use callbacks::{CallbackGraph, CallbackGraphStats, CallbackKey};
pub use callgraph::{
    CallGraph, CallGraphNode, CallGraphStats, CallKind, CallSite, CallTarget, CallType,
    InheritanceGraph, ResolverStats,
};
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
pub use hierarchy::TypeHierarchy;
pub use stack::{JumpSiteCache, JumpSiteMap, StackDepths};
pub use statics::{
    AnalyzerConfig, AnalyzerStats, MemberStep, ModificationRecord, StaticFieldAnalyzer,
    StaticFieldReport, StaticOrigin,
};
pub use typeflow::{ComponentId, TypeFlowIndex};
