//! Immutable per-sequence template graphs.
//!
//! A template records one sequence's nodes between two sentinel nodes
//! (begin/end), the dependency edges between them, and the set of args the
//! sequence provably produces on every path through it. Templates are
//! compiled once per spec load by the [`grapher`] and consumed by the
//! resolver at request time.

use std::collections::{BTreeMap, BTreeSet};

use crate::proto::NOOP_JOB_TYPE;
use crate::spec::NodeSpec;

mod grapher;
mod id;

pub use grapher::{create_templates, GraphError, Templates};
pub use id::{IdGen, IdGenFactory};

/// One vertex of a template graph. Sentinel nodes carry a synthetic
/// no-op spec so every vertex can be treated uniformly.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: String,
    pub spec: NodeSpec,
}

impl Node {
    pub fn is_sentinel(&self) -> bool {
        self.spec.node_type == NOOP_JOB_TYPE
    }
}

/// The compiled, validated form of a sequence's graph.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Graph {
    /// Name of the sequence this template was compiled from.
    pub sequence: String,
    /// Id of the begin sentinel.
    pub first: String,
    /// Id of the end sentinel.
    pub last: String,
    /// Node id -> node.
    pub nodes: BTreeMap<String, Node>,
    /// Node id -> ids of nodes that depend on it.
    pub edges: BTreeMap<String, Vec<String>>,
    /// Node id -> ids of nodes it depends on.
    pub rev_edges: BTreeMap<String, Vec<String>>,
    /// Args produced by every path through this sequence.
    pub(crate) sets: BTreeSet<String>,
}

impl Graph {
    /// Creates a graph holding only the two sentinels, begin wired to end.
    pub(crate) fn new(sequence: &str, idgen: &mut IdGen) -> Self {
        let begin_name = format!("{sequence}_begin");
        let end_name = format!("{sequence}_end");
        let first = idgen.id(&begin_name);
        let last = idgen.id(&end_name);

        let sentinel = |name: String| NodeSpec {
            name,
            node_type: NOOP_JOB_TYPE.to_string(),
            ..NodeSpec::default()
        };

        let mut graph = Graph {
            sequence: sequence.to_string(),
            first: first.clone(),
            last: last.clone(),
            ..Graph::default()
        };
        graph.nodes.insert(
            first.clone(),
            Node {
                id: first.clone(),
                spec: sentinel(begin_name),
            },
        );
        graph.nodes.insert(
            last.clone(),
            Node {
                id: last.clone(),
                spec: sentinel(end_name),
            },
        );
        graph.add_edge(&first, &last);
        graph
    }

    /// The args this sequence produces on all paths.
    pub fn sets(&self) -> &BTreeSet<String> {
        &self.sets
    }

    pub(crate) fn add_node(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        let next = self.edges.entry(from.to_string()).or_default();
        if !next.iter().any(|id| id == to) {
            next.push(to.to_string());
        }
        let prev = self.rev_edges.entry(to.to_string()).or_default();
        if !prev.iter().any(|id| id == from) {
            prev.push(from.to_string());
        }
    }

    fn remove_edge(&mut self, from: &str, to: &str) {
        if let Some(next) = self.edges.get_mut(from) {
            next.retain(|id| id != to);
        }
        if let Some(prev) = self.rev_edges.get_mut(to) {
            prev.retain(|id| id != from);
        }
    }

    /// Inserts `node_id` between `prev_id` and the end sentinel: the direct
    /// `prev -> end` shortcut, if present, is replaced by the path through
    /// the node. Called once per dependency of the node.
    pub(crate) fn insert_after(&mut self, node_id: &str, prev_id: &str) {
        self.remove_edge(prev_id, &self.last.clone());
        self.add_edge(prev_id, node_id);
        self.add_edge(node_id, &self.last.clone());
    }

    /// Ids of the nodes immediately downstream of `id`.
    pub fn next(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Ids of the nodes `id` depends on.
    pub fn prev(&self, id: &str) -> &[String] {
        self.rev_edges.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Structural sanity: the begin sentinel has no inbound edges and every
    /// other node has at least one; symmetrically for the end sentinel and
    /// outbound edges; and no edge names an unknown node.
    pub(crate) fn is_valid(&self) -> bool {
        for (from, next) in &self.edges {
            if !self.nodes.contains_key(from) {
                return false;
            }
            if next.iter().any(|to| !self.nodes.contains_key(to)) {
                return false;
            }
        }
        if !self.prev(&self.first).is_empty() || !self.next(&self.last).is_empty() {
            return false;
        }
        self.nodes.keys().all(|id| {
            (id == &self.first || !self.prev(id).is_empty())
                && (id == &self.last || !self.next(id).is_empty())
        })
    }

    /// Node ids in dependency order: a node appears only after everything
    /// it depends on.
    pub fn topo_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        while order.len() < self.nodes.len() {
            let mut progressed = false;
            for id in self.nodes.keys() {
                if placed.contains(id.as_str()) {
                    continue;
                }
                if self.prev(id).iter().all(|prev| placed.contains(prev.as_str())) {
                    placed.insert(id);
                    order.push(id.clone());
                    progressed = true;
                }
            }
            if !progressed {
                // Graphs are validated acyclic at construction
                break;
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            spec: NodeSpec {
                name: id.to_string(),
                node_type: "t".to_string(),
                ..NodeSpec::default()
            },
        }
    }

    #[test]
    fn test_new_graph_wires_sentinels() {
        let mut idgen = IdGenFactory::default().make();
        let graph = Graph::new("seq-a", &mut idgen);
        assert_eq!(graph.next(&graph.first), [graph.last.clone()]);
        assert!(graph.is_valid());
    }

    #[test]
    fn test_insert_single_node() {
        let mut idgen = IdGenFactory::default().make();
        let mut graph = Graph::new("seq-a", &mut idgen);
        let first = graph.first.clone();
        graph.add_node(node("only"));
        graph.insert_after("only", &first);

        // start -> node -> end, no shortcut left
        assert_eq!(graph.next(&graph.first), ["only".to_string()]);
        assert_eq!(graph.next("only"), [graph.last.clone()]);
        assert!(graph.is_valid());
        assert_eq!(
            graph.topo_order(),
            vec![graph.first.clone(), "only".to_string(), graph.last.clone()]
        );
    }

    #[test]
    fn test_insert_diamond() {
        let mut idgen = IdGenFactory::default().make();
        let mut graph = Graph::new("seq-a", &mut idgen);
        let first = graph.first.clone();
        for id in ["a", "b", "c", "d"] {
            graph.add_node(node(id));
        }
        graph.insert_after("a", &first);
        graph.insert_after("b", "a");
        graph.insert_after("c", "a");
        graph.insert_after("d", "b");
        graph.insert_after("d", "c");

        assert_eq!(graph.next("a"), ["b".to_string(), "c".to_string()]);
        assert_eq!(graph.next("b"), ["d".to_string()]);
        assert_eq!(graph.next("c"), ["d".to_string()]);
        assert_eq!(graph.next("d"), [graph.last.clone()]);
        assert_eq!(graph.prev("d"), ["b".to_string(), "c".to_string()]);
        assert!(graph.is_valid());
    }
}
