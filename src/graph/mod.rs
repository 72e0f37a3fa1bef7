//! Desired resource graph.
//!
//! The graph is a DAG whose edges point from a dependent to its
//! dependency. It is built fresh for every planning cycle by
//! [`GraphBuilder`] and never mutated afterwards.

mod builder;
mod expr;
mod node;

pub use builder::GraphBuilder;
pub use expr::{Expr, Fragment, ParseContext, Reference};
pub use node::{Lifecycle, ResourceNode};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use crate::resource::ResourceId;

/// A validated, acyclic graph of resource nodes.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    /// Edge structure; edges go dependent -> dependency.
    graph: DiGraph<ResourceId, ()>,
    /// Index of each node in `graph`.
    indices: BTreeMap<ResourceId, NodeIndex>,
    /// Node payloads.
    nodes: BTreeMap<ResourceId, ResourceNode>,
    /// Dependencies-first order.
    order: Vec<ResourceId>,
    /// Output expressions.
    outputs: BTreeMap<String, Expr>,
}

impl ResourceGraph {
    /// Assembles a graph from parts already checked by the builder.
    pub(crate) fn from_parts(
        graph: DiGraph<ResourceId, ()>,
        indices: BTreeMap<ResourceId, NodeIndex>,
        nodes: BTreeMap<ResourceId, ResourceNode>,
        order: Vec<ResourceId>,
        outputs: BTreeMap<String, Expr>,
    ) -> Self {
        Self {
            graph,
            indices,
            nodes,
            order,
            outputs,
        }
    }

    /// Returns an empty graph (used for teardown).
    #[must_use]
    pub fn empty() -> Self {
        Self::from_parts(
            DiGraph::new(),
            BTreeMap::new(),
            BTreeMap::new(),
            Vec::new(),
            BTreeMap::new(),
        )
    }

    /// Returns the node with the given id.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Returns true if the graph contains the node.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in dependency order: every node appears after all of its
    /// dependencies.
    #[must_use]
    pub fn topological_order(&self) -> &[ResourceId] {
        &self.order
    }

    /// Nodes in dependency order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Direct dependencies of a node.
    #[must_use]
    pub fn dependencies(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        self.indices
            .get(id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .map(|n| self.graph[n].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Output expressions declared by the document.
    #[must_use]
    pub const fn outputs(&self) -> &BTreeMap<String, Expr> {
        &self.outputs
    }

    /// Renders the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph resources {\n  rankdir = \"RL\";\n");

        for id in &self.order {
            let _ = writeln!(out, "  \"{id}\";");
        }

        for node in self.nodes() {
            for dep in &node.dependencies {
                let _ = writeln!(out, "  \"{}\" -> \"{dep}\";", node.id);
            }
        }

        out.push_str("}\n");
        out
    }
}
