//! Graph vertices and the arena that stores them.
//!
//! An edge `a -> b` in the arena means "a depends on b". A node's dependencies
//! are its outgoing neighbours and its dependents are its incoming ones, so
//! both directions are read from the same edge and cannot disagree.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};

use crate::task::Task;

/// A vertex of the dependency graph: one task and the name it registered under.
#[derive(Debug, Clone)]
pub struct TaskNode {
    name: String,
    task: Arc<dyn Task>,
}

impl TaskNode {
    pub(crate) fn new(name: String, task: Arc<dyn Task>) -> Self {
        Self { name, task }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }
}

impl PartialEq for TaskNode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for TaskNode {}

impl Hash for TaskNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// Registry of nodes keyed by name, with adjacency stored by integer id.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    graph: StableDiGraph<TaskNode, ()>,
    index: HashMap<String, NodeIndex>,
}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a node unless one with the same name exists.
    /// Returns the node id and whether it was newly inserted.
    pub(crate) fn insert(&mut self, node: TaskNode) -> (NodeIndex, bool) {
        if let Some(&idx) = self.index.get(node.name()) {
            return (idx, false);
        }
        let name = node.name.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(name, idx);
        (idx, true)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    pub(crate) fn node(&self, idx: NodeIndex) -> Option<&TaskNode> {
        self.graph.node_weight(idx)
    }

    pub(crate) fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// All node ids in registration order.
    pub(crate) fn indices(&self) -> Vec<NodeIndex> {
        let mut indices: Vec<NodeIndex> = self.graph.node_indices().collect();
        indices.sort();
        indices
    }

    /// Record that `from` depends on `to`. Returns false if the edge existed.
    pub(crate) fn add_dependency(&mut self, from: NodeIndex, to: NodeIndex) -> bool {
        if self.graph.find_edge(from, to).is_some() {
            return false;
        }
        self.graph.add_edge(from, to, ());
        true
    }

    /// Drop the edge `from` depends on `to`. Returns false if there was none.
    pub(crate) fn remove_dependency(&mut self, from: NodeIndex, to: NodeIndex) -> bool {
        match self.graph.find_edge(from, to) {
            Some(edge) => {
                self.graph.remove_edge(edge);
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of the nodes `idx` depends on, in registration order.
    pub(crate) fn dependencies(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(idx, Direction::Outgoing)
    }

    /// Point-in-time copy of the nodes depending on `idx`, in registration order.
    pub(crate) fn dependents(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(idx, Direction::Incoming)
    }

    pub(crate) fn names(&self, indices: &[NodeIndex]) -> Vec<String> {
        indices
            .iter()
            .filter_map(|&idx| self.node(idx))
            .map(|node| node.name.clone())
            .collect()
    }

    fn neighbors(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        out.sort();
        out
    }
}
