//! Generic directed graph infrastructure.
//!
//! - [`DirectedGraph`] - Adjacency-list graph with typed node and edge data
//! - [`NodeId`], [`EdgeId`] - Strongly-typed indices
//! - [`GraphBase`], [`Successors`], [`Predecessors`] - Traits the algorithms are written against
//! - [`algorithms`] - SCC decomposition and reachability

mod directed;
mod node;
mod traits;

pub mod algorithms;

pub use directed::DirectedGraph;
pub use node::{EdgeId, NodeId};
pub use traits::{GraphBase, Predecessors, Successors};
