//! Graph algorithms over the [`crate::utils::graph`] traits.
//!
//! - [`strongly_connected_components`] / [`component_map`] - Tarjan SCC decomposition
//! - [`reachable`] - Forward reachability from a set of roots

mod scc;
mod traversal;

pub use scc::{component_map, strongly_connected_components};
pub use traversal::reachable;
