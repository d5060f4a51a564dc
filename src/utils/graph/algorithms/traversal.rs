//! Breadth-first reachability.

use std::collections::VecDeque;

use crate::utils::graph::{NodeId, Successors};

/// Computes every node reachable from `roots`, including the roots, in BFS order.
///
/// Roots outside the graph are ignored.
///
/// # Complexity
///
/// - Time: O(V + E)
/// - Space: O(V)
pub fn reachable<G: Successors>(graph: &G, roots: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
    let node_count = graph.node_count();
    let mut visited = vec![false; node_count];
    let mut queue = VecDeque::new();
    let mut order = Vec::new();

    for root in roots {
        if root.index() < node_count && !visited[root.index()] {
            visited[root.index()] = true;
            queue.push_back(root);
        }
    }

    while let Some(node) = queue.pop_front() {
        order.push(node);
        for next in graph.successors(node) {
            if !visited[next.index()] {
                visited[next.index()] = true;
                queue.push_back(next);
            }
        }
    }
    order
}
