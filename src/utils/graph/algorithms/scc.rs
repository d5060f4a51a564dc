//! Strongly Connected Components (SCC) using Tarjan's algorithm.
//!
//! A strongly connected component is a maximal set of vertices such that there is a path from
//! every vertex to every other vertex in the set.
//!
//! # Use Cases
//!
//! - **Recursive object shapes**: Types that reach each other through fields form an SCC
//! - **Call graph analysis**: Finding mutually recursive method groups

use crate::utils::graph::{NodeId, Successors};

/// Computes the strongly connected components of a directed graph.
///
/// Uses Tarjan's algorithm with a single DFS pass. The DFS is driven by an explicit frame stack
/// rather than recursion, so deep type or call chains cannot overflow the native stack.
///
/// # Arguments
///
/// * `graph` - The directed graph to analyze
///
/// # Returns
///
/// A vector of SCCs, where each SCC is a vector of `NodeId`s. The SCCs are returned in
/// **reverse topological order** (if there's an edge from SCC A to SCC B, then A appears after B
/// in the result).
///
/// # Complexity
///
/// - Time: O(V + E)
/// - Space: O(V)
///
/// # Examples
///
/// ```rust,ignore
/// use ctxweave::utils::graph::{DirectedGraph, algorithms::strongly_connected_components};
///
/// // Simple cycle: A -> B -> C -> A
/// let mut graph: DirectedGraph<char, ()> = DirectedGraph::new();
/// let a = graph.add_node('A');
/// let b = graph.add_node('B');
/// let c = graph.add_node('C');
/// graph.add_edge(a, b, ())?;
/// graph.add_edge(b, c, ())?;
/// graph.add_edge(c, a, ())?;
///
/// let sccs = strongly_connected_components(&graph);
/// assert_eq!(sccs.len(), 1);
/// assert_eq!(sccs[0].len(), 3);
/// # Ok::<(), ctxweave::Error>(())
/// ```
pub fn strongly_connected_components<G>(graph: &G) -> Vec<Vec<NodeId>>
where
    G: Successors,
{
    let node_count = graph.node_count();
    if node_count == 0 {
        return Vec::new();
    }

    let mut state = TarjanState::new(node_count);
    for i in 0..node_count {
        if state.index[i].is_none() {
            state.strongconnect(graph, NodeId::new(i));
        }
    }
    state.sccs
}

/// Maps every node to the index of its component in `sccs`.
///
/// # Arguments
///
/// * `node_count` - Number of nodes in the graph the components were computed for
/// * `sccs` - The SCCs as returned by [`strongly_connected_components`]
#[must_use]
pub fn component_map(node_count: usize, sccs: &[Vec<NodeId>]) -> Vec<usize> {
    let mut node_to_scc = vec![0; node_count];
    for (scc_idx, scc) in sccs.iter().enumerate() {
        for &node in scc {
            node_to_scc[node.index()] = scc_idx;
        }
    }
    node_to_scc
}

/// Internal state for Tarjan's algorithm.
struct TarjanState {
    /// Discovery index for each node (None if not yet visited)
    index: Vec<Option<usize>>,
    /// Lowlink value for each node
    lowlink: Vec<usize>,
    /// Whether a node is currently on the stack
    on_stack: Vec<bool>,
    /// The component stack
    stack: Vec<NodeId>,
    /// Current index counter
    current_index: usize,
    /// Collected SCCs
    sccs: Vec<Vec<NodeId>>,
}

impl TarjanState {
    fn new(n: usize) -> Self {
        Self {
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            current_index: 0,
            sccs: Vec::new(),
        }
    }

    fn visit(&mut self, v: NodeId) {
        self.index[v.index()] = Some(self.current_index);
        self.lowlink[v.index()] = self.current_index;
        self.current_index += 1;
        self.stack.push(v);
        self.on_stack[v.index()] = true;
    }

    fn strongconnect<G: Successors>(&mut self, graph: &G, root: NodeId) {
        // Each frame holds a node and its not-yet-explored successors.
        let mut frames: Vec<(NodeId, Vec<NodeId>)> = Vec::new();
        self.visit(root);
        frames.push((root, graph.successors(root).collect()));

        while let Some((v, pending)) = frames.last_mut() {
            let v = *v;
            if let Some(w) = pending.pop() {
                match self.index[w.index()] {
                    None => {
                        self.visit(w);
                        frames.push((w, graph.successors(w).collect()));
                    }
                    Some(w_index) if self.on_stack[w.index()] => {
                        self.lowlink[v.index()] = self.lowlink[v.index()].min(w_index);
                    }
                    Some(_) => {}
                }
                continue;
            }

            frames.pop();
            if let Some((parent, _)) = frames.last() {
                let parent = parent.index();
                self.lowlink[parent] = self.lowlink[parent].min(self.lowlink[v.index()]);
            }

            if Some(self.lowlink[v.index()]) == self.index[v.index()] {
                let mut scc = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w.index()] = false;
                    scc.push(w);
                    if w == v {
                        break;
                    }
                }
                self.sccs.push(scc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::utils::graph::{
        algorithms::scc::{component_map, strongly_connected_components},
        DirectedGraph, NodeId,
    };

    #[test]
    fn test_scc_empty_graph() {
        let graph: DirectedGraph<(), ()> = DirectedGraph::new();
        assert!(strongly_connected_components(&graph).is_empty());
    }

    #[test]
    fn test_scc_simple_cycle() {
        let mut graph: DirectedGraph<char, ()> = DirectedGraph::new();
        let a = graph.add_node('A');
        let b = graph.add_node('B');
        let c = graph.add_node('C');
        graph.add_edge(a, b, ()).unwrap();
        graph.add_edge(b, c, ()).unwrap();
        graph.add_edge(c, a, ()).unwrap();

        let sccs = strongly_connected_components(&graph);
        assert_eq!(sccs.len(), 1);
        let members: HashSet<NodeId> = sccs[0].iter().copied().collect();
        assert_eq!(members, HashSet::from([a, b, c]));
    }

    #[test]
    fn test_scc_chain_is_reverse_topological() {
        let mut graph: DirectedGraph<char, ()> = DirectedGraph::new();
        let a = graph.add_node('A');
        let b = graph.add_node('B');
        let c = graph.add_node('C');
        graph.add_edge(a, b, ()).unwrap();
        graph.add_edge(b, c, ()).unwrap();

        let sccs = strongly_connected_components(&graph);
        assert_eq!(sccs, vec![vec![c], vec![b], vec![a]]);
    }

    #[test]
    fn test_scc_two_cycles_joined() {
        // A <-> B -> C <-> D, E alone with a self loop
        let mut graph: DirectedGraph<char, ()> = DirectedGraph::new();
        let a = graph.add_node('A');
        let b = graph.add_node('B');
        let c = graph.add_node('C');
        let d = graph.add_node('D');
        let e = graph.add_node('E');
        graph.add_edge(a, b, ()).unwrap();
        graph.add_edge(b, a, ()).unwrap();
        graph.add_edge(b, c, ()).unwrap();
        graph.add_edge(c, d, ()).unwrap();
        graph.add_edge(d, c, ()).unwrap();
        graph.add_edge(e, e, ()).unwrap();

        let sccs = strongly_connected_components(&graph);
        assert_eq!(sccs.len(), 3);
        let map = component_map(graph.node_count(), &sccs);
        assert_eq!(map[a.index()], map[b.index()]);
        assert_eq!(map[c.index()], map[d.index()]);
        assert_ne!(map[a.index()], map[c.index()]);
        // {C, D} is discovered before {A, B} is closed.
        assert!(map[c.index()] < map[a.index()]);
    }

    #[test]
    fn test_scc_deep_chain_does_not_recurse() {
        let mut graph: DirectedGraph<usize, ()> = DirectedGraph::new();
        let nodes: Vec<NodeId> = (0..50_000).map(|i| graph.add_node(i)).collect();
        for pair in nodes.windows(2) {
            graph.add_edge(pair[0], pair[1], ()).unwrap();
        }
        graph.add_edge(nodes[nodes.len() - 1], nodes[0], ()).unwrap();
        let sccs = strongly_connected_components(&graph);
        assert_eq!(sccs.len(), 1);
        assert_eq!(sccs[0].len(), 50_000);
    }
}
