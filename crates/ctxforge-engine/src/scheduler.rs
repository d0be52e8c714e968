//! Topological ordering of a graph's nodes.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use ctxforge_core::error::{CtxError, Result};
use ctxforge_core::graph::{Graph, GraphEdge, GraphNode};

/// Kahn's algorithm. Among nodes that are ready at the same time, the one
/// declared first runs first, so identical graphs always schedule identically.
///
/// Fails with `CycleDetected` naming the first declared node that could not
/// be scheduled, or `InvalidGraph` if an edge names an unknown node.
pub fn order(nodes: &[GraphNode], edges: &[GraphEdge]) -> Result<Vec<String>> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for edge in edges {
        let (Some(&from), Some(&to)) = (
            index.get(edge.source.as_str()),
            index.get(edge.target.as_str()),
        ) else {
            return Err(CtxError::InvalidGraph(format!(
                "edge {} -> {} references an unknown node",
                edge.source, edge.target
            )));
        };
        successors[from].push(to);
        in_degree[to] += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut result = Vec::with_capacity(nodes.len());
    while let Some(Reverse(i)) = ready.pop() {
        result.push(nodes[i].id.clone());
        for &next in &successors[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if result.len() < nodes.len() {
        let stuck = in_degree
            .iter()
            .position(|d| *d > 0)
            .map(|i| nodes[i].id.clone())
            .unwrap_or_default();
        return Err(CtxError::CycleDetected { node_id: stuck });
    }

    Ok(result)
}

/// Validate, then order.
pub fn order_graph(graph: &Graph) -> Result<Vec<String>> {
    graph.validate()?;
    order(&graph.nodes, &graph.edges)
}
