//! Execution Ordering
//!
//! Linearizes a workflow graph into the sequence the engine walks.
//!
//! The order is a topological sort with these rules:
//! - ready nodes are taken top-to-bottom, then left-to-right on the canvas
//! - exact position ties keep the original node order
//! - when only cycles remain, one node is forced into the queue, preferring
//!   a node entered from an already placed node, then the body entry of a
//!   loop node (so the loop closes its cycle), then the top-most remaining
//!   node
//!
//! Every node appears exactly once and the same graph always yields the
//! same order.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use log::debug;

use super::model::{Edge, Node, NodeKind};

/// Computes the execution order of a graph.
///
/// Edges whose endpoints are missing are ignored.
///
/// # Arguments
///
/// * `nodes` - Nodes in their stored order
/// * `edges` - Directed edges, possibly forming cycles
///
/// # Returns
///
/// Node IDs in execution order
///
/// # Example
///
/// ```
/// use novelflow::workflow::model::{GenerationSpec, Node, NodeKind, WorkflowGraph};
/// use novelflow::workflow::orderer::order_nodes;
///
/// let mut graph = WorkflowGraph::new();
/// graph.add_node(Node::new("b", NodeKind::Chapter(GenerationSpec::default()))).unwrap();
/// graph.add_node(Node::new("a", NodeKind::Outline(GenerationSpec::default()))).unwrap();
/// graph.connect("a", "b");
///
/// assert_eq!(order_nodes(&graph.nodes, &graph.edges), vec!["a", "b"]);
/// ```
pub fn order_nodes(nodes: &[Node], edges: &[Edge]) -> Vec<String> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut members: Vec<usize> = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        if !index.contains_key(node.id.as_str()) {
            index.insert(node.id.as_str(), i);
            members.push(i);
        }
    }

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree: Vec<usize> = vec![0; nodes.len()];

    for edge in edges {
        match (index.get(edge.source.as_str()), index.get(edge.target.as_str())) {
            (Some(&source), Some(&target)) => {
                adjacency[source].push(target);
                reverse[target].push(source);
                in_degree[target] += 1;
            }
            _ => debug!("Ignoring edge {} with a missing endpoint", edge.id),
        }
    }

    let by_position = |a: &usize, b: &usize| compare_position(&nodes[*a], &nodes[*b], *a, *b);

    let mut sorted_members = members.clone();
    sorted_members.sort_by(by_position);

    let mut placed = vec![false; nodes.len()];
    let mut order: Vec<String> = Vec::with_capacity(members.len());

    let mut ready: VecDeque<usize> = sorted_members
        .iter()
        .copied()
        .filter(|i| in_degree[*i] == 0)
        .collect();

    while order.len() < members.len() {
        while let Some(current) = ready.pop_front() {
            if placed[current] {
                continue;
            }
            placed[current] = true;
            order.push(nodes[current].id.clone());

            let mut released = Vec::new();
            for &next in &adjacency[current] {
                if placed[next] || in_degree[next] == 0 {
                    continue;
                }
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    released.push(next);
                }
            }
            released.sort_by(by_position);
            released.dedup();
            ready.extend(released);
        }

        if order.len() == members.len() {
            break;
        }

        let unplaced = || sorted_members.iter().copied().filter(|i| !placed[*i]);

        let entered = unplaced().find(|i| reverse[*i].iter().any(|source| placed[*source]));
        // break at the loop's back edge so the loop node follows its body
        let looped = || {
            unplaced()
                .find(|i| matches!(nodes[*i].kind, NodeKind::LoopNode(_)))
                .map(|l| {
                    adjacency[l]
                        .iter()
                        .copied()
                        .find(|&t| t != l && !placed[t] && reaches(&adjacency, &placed, t, l))
                        .unwrap_or(l)
                })
        };

        let Some(seed) = entered.or_else(looped).or_else(|| unplaced().next()) else {
            break;
        };

        debug!("Breaking cycle at node '{}'", nodes[seed].id);
        in_degree[seed] = 0;
        ready.push_back(seed);
    }

    order
}

/// Maps each node ID to its position in an order.
pub fn positions(order: &[String]) -> HashMap<&str, usize> {
    order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect()
}

/// Whether `to` can be reached from `from` through unplaced nodes.
fn reaches(adjacency: &[Vec<usize>], placed: &[bool], from: usize, to: usize) -> bool {
    let mut seen = vec![false; adjacency.len()];
    let mut stack = vec![from];
    while let Some(current) = stack.pop() {
        if current == to {
            return true;
        }
        if seen[current] {
            continue;
        }
        seen[current] = true;
        stack.extend(adjacency[current].iter().copied().filter(|n| !placed[*n]));
    }
    false
}

fn compare_position(a: &Node, b: &Node, a_index: usize, b_index: usize) -> Ordering {
    a.position
        .y
        .total_cmp(&b.position.y)
        .then(a.position.x.total_cmp(&b.position.x))
        .then(a_index.cmp(&b_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{GenerationSpec, LoopSpec, WorkflowGraph};

    fn step(id: &str, x: f64, y: f64) -> Node {
        Node::new(id, NodeKind::Chapter(GenerationSpec::new("write"))).at(x, y)
    }

    fn looper(id: &str, x: f64, y: f64) -> Node {
        Node::new(id, NodeKind::LoopNode(LoopSpec::default())).at(x, y)
    }

    fn graph(nodes: Vec<Node>, edges: &[(&str, &str)]) -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        for node in nodes {
            graph.add_node(node).unwrap();
        }
        for (source, target) in edges {
            graph.connect(*source, *target);
        }
        graph
    }

    fn order(graph: &WorkflowGraph) -> Vec<String> {
        order_nodes(&graph.nodes, &graph.edges)
    }

    #[test]
    fn test_linear_chain() {
        let g = graph(
            vec![step("c", 0.0, 0.0), step("a", 0.0, 0.0), step("b", 0.0, 0.0)],
            &[("a", "b"), ("b", "c")],
        );
        assert_eq!(order(&g), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ready_nodes_sorted_by_position() {
        let g = graph(
            vec![
                step("low", 0.0, 200.0),
                step("right", 50.0, 10.0),
                step("left", 0.0, 10.0),
                step("tie", 0.0, 10.0),
            ],
            &[],
        );
        assert_eq!(order(&g), vec!["left", "tie", "right", "low"]);
    }

    #[test]
    fn test_released_nodes_sorted_by_position() {
        let g = graph(
            vec![
                step("root", 0.0, 0.0),
                step("far", 0.0, 300.0),
                step("near", 0.0, 100.0),
            ],
            &[("root", "far"), ("root", "near")],
        );
        assert_eq!(order(&g), vec!["root", "near", "far"]);
    }

    #[test]
    fn test_acyclic_edges_respected() {
        let g = graph(
            vec![
                step("e", 0.0, 0.0),
                step("d", 10.0, 0.0),
                step("c", 20.0, 0.0),
                step("b", 30.0, 0.0),
                step("a", 40.0, 0.0),
            ],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("d", "e")],
        );
        let result = order(&g);
        let pos = positions(&result);

        for edge in &g.edges {
            assert!(pos[edge.source.as_str()] < pos[edge.target.as_str()]);
        }
    }

    #[test]
    fn test_order_is_deterministic() {
        let g = graph(
            vec![
                step("a", 5.0, 5.0),
                step("b", 5.0, 5.0),
                looper("l", 0.0, 9.0),
                step("c", 1.0, 2.0),
            ],
            &[("a", "b"), ("b", "l"), ("l", "a"), ("c", "b")],
        );
        let first = order(&g);
        for _ in 0..10 {
            assert_eq!(order(&g), first);
        }
    }

    #[test]
    fn test_covers_every_node_with_cycles() {
        let g = graph(
            vec![
                step("a", 0.0, 0.0),
                step("b", 0.0, 1.0),
                step("c", 0.0, 2.0),
                step("d", 0.0, 3.0),
            ],
            &[("a", "b"), ("b", "a"), ("c", "d"), ("d", "c"), ("d", "d")],
        );
        let mut result = order(&g);
        result.sort();
        assert_eq!(result, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cycle_entered_from_placed_node() {
        let g = graph(
            vec![
                step("s", 0.0, 0.0),
                step("a", 0.0, 100.0),
                step("b", 0.0, 200.0),
                looper("l", 0.0, 300.0),
            ],
            &[("s", "a"), ("a", "b"), ("b", "l"), ("l", "a")],
        );
        assert_eq!(order(&g), vec!["s", "a", "b", "l"]);
    }

    #[test]
    fn test_pure_cycle_breaks_at_loop_back_edge() {
        let g = graph(
            vec![
                looper("l", 0.0, 0.0),
                step("a", 0.0, 100.0),
                step("b", 0.0, 200.0),
            ],
            &[("a", "b"), ("b", "l"), ("l", "a")],
        );
        assert_eq!(order(&g), vec!["a", "b", "l"]);
    }

    #[test]
    fn test_loop_outside_cycle_keeps_its_edges() {
        let g = graph(
            vec![
                step("x", 0.0, 0.0),
                step("y", 0.0, 10.0),
                looper("l", 0.0, 20.0),
                step("z", 0.0, 30.0),
            ],
            &[("x", "y"), ("y", "x"), ("x", "l"), ("l", "z")],
        );
        let result = order(&g);
        let pos = positions(&result);
        assert!(pos["l"] < pos["z"]);
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_cycle_without_loop_seeds_top_node() {
        let g = graph(
            vec![step("low", 0.0, 50.0), step("high", 0.0, 10.0)],
            &[("low", "high"), ("high", "low")],
        );
        assert_eq!(order(&g), vec!["high", "low"]);
    }

    #[test]
    fn test_dangling_edges_ignored() {
        let g = graph(
            vec![step("a", 0.0, 0.0), step("b", 0.0, 1.0)],
            &[("ghost", "a"), ("a", "b"), ("b", "nowhere")],
        );
        assert_eq!(order(&g), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_graph() {
        assert!(order_nodes(&[], &[]).is_empty());
    }
}
