//! Node and edge identifiers for directed graphs.
//!
//! [`NodeId`] and [`EdgeId`] are strongly-typed indices that prevent accidental confusion
//! between node indices, edge indices and other integer values.

use std::fmt;

/// A strongly-typed identifier for nodes within a directed graph.
///
/// Node IDs are assigned sequentially starting from 0 by
/// [`DirectedGraph::add_node`](crate::utils::graph::DirectedGraph::add_node) and can be used to
/// index per-node vectors.
///
/// # Examples
///
/// ```rust,ignore
/// use ctxweave::utils::graph::{DirectedGraph, NodeId};
///
/// let mut graph: DirectedGraph<&str, ()> = DirectedGraph::new();
/// let node_a: NodeId = graph.add_node("A");
/// let node_b: NodeId = graph.add_node("B");
/// assert_ne!(node_a, node_b);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Creates a new `NodeId` from a raw index value.
    ///
    /// # Arguments
    ///
    /// * `index` - The raw node index (0-based)
    #[must_use]
    #[inline]
    pub const fn new(index: usize) -> Self {
        NodeId(index)
    }

    /// Returns the raw index value of this node identifier.
    #[must_use]
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl From<usize> for NodeId {
    #[inline]
    fn from(index: usize) -> Self {
        NodeId(index)
    }
}

/// A strongly-typed identifier for edges within a directed graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeId(pub(crate) usize);

impl EdgeId {
    /// Creates a new `EdgeId` from a raw index value.
    #[must_use]
    #[inline]
    pub const fn new(index: usize) -> Self {
        EdgeId(index)
    }

    /// Returns the raw index value of this edge identifier.
    #[must_use]
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EdgeId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_node_id_index_and_display() {
        let node = NodeId::new(5);
        assert_eq!(node.index(), 5);
        assert_eq!(format!("{node}"), "n5");
        assert_eq!(format!("{node:?}"), "NodeId(5)");
        assert_eq!(NodeId::from(5), node);
    }

    #[test]
    fn test_ids_as_keys() {
        let mut data: HashMap<NodeId, &str> = HashMap::new();
        data.insert(NodeId::new(0), "entry");
        assert_eq!(data.get(&NodeId::new(0)), Some(&"entry"));
        assert!(EdgeId::new(1) > EdgeId::new(0));
    }
}
