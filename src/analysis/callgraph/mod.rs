//! Inter-procedural call graph construction and analysis.
//!
//! This module provides call graph construction for a [`crate::metadata::Module`], enabling
//! inter-procedural analysis by building a graph of call relationships between methods.
//!
//! # Architecture
//!
//! The call graph is built by scanning method bodies for call instructions and resolving
//! their targets. For virtual calls, the [`InheritanceGraph`] provides Class Hierarchy
//! Analysis; when the receiver of a call is provably constructed with one concrete type, that
//! type's override is selected instead. Callback invocations resolve through
//! [`crate::analysis::CallbackGraph`].
//!
//! # Components
//!
//! - [`CallGraph`]: The main call graph structure with forward and reverse edges
//! - [`CallGraphNode`]: Information about a method in the call graph
//! - [`CallSite`]: A specific call instruction within a method
//! - [`CallTarget`]: The resolved target(s) of a call, tagged with a [`CallKind`]
//! - [`InheritanceGraph`]: Override sets and override families of virtual methods
//!
//! # Example
//!
//! ```rust,ignore
//! use ctxweave::analysis::{
//!     CallGraph, CallbackGraph, Diagnostics, InheritanceGraph, JumpSiteCache,
//! };
//!
//! let inheritance = InheritanceGraph::new(&module);
//! let jumps = JumpSiteCache::new();
//! let diagnostics = Diagnostics::new();
//! let callbacks = CallbackGraph::build(&module, &inheritance, &jumps, &diagnostics, 64)?;
//! let call_graph = CallGraph::build(&module, &inheritance, &callbacks, &jumps, &diagnostics)?;
//!
//! // Find all callers of a method
//! for caller in call_graph.callers(method_token) {
//!     println!("Called by: {}", module.method_name(caller));
//! }
//!
//! let stats = call_graph.stats();
//! println!("{:.0}% of call sites resolved", stats.resolution_rate() * 100.0);
//! ```

mod graph;
mod node;
mod resolution;
mod site;

pub use graph::{CallGraph, CallGraphStats};
pub use node::CallGraphNode;
pub use resolution::{InheritanceGraph, ResolverStats};
pub use site::{CallKind, CallSite, CallTarget, CallType};
