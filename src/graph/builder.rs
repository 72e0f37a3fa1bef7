//! Resource graph construction.
//!
//! Turns a parsed document into a validated [`ResourceGraph`]: evaluates
//! `enabled` predicates, substitutes variables, infers edges from
//! references and `depends_on` hints, and rejects cycles and dangling
//! references. Building is a pure transformation with no side effects.

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;

use crate::config::{InfraConfig, ResourceConfig, VariableValues};
use crate::error::{GraphError, Result};
use crate::resource::ResourceId;

use super::expr::{Expr, ParseContext};
use super::node::{Lifecycle, ResourceNode};
use super::ResourceGraph;

/// Builds resource graphs from documents.
#[derive(Debug)]
pub struct GraphBuilder<'a> {
    /// Resolved input variables.
    variables: &'a VariableValues,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder using the given variable values.
    #[must_use]
    pub const fn new(variables: &'a VariableValues) -> Self {
        Self { variables }
    }

    /// Builds the desired graph for a document.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] when dependencies form a cycle,
    /// [`GraphError::UnresolvedReference`] when an expression or hint names
    /// a resource or variable that does not exist, and other graph errors
    /// for malformed expressions or duplicate resources.
    pub fn build(&self, config: &InfraConfig) -> Result<ResourceGraph> {
        let mut nodes: BTreeMap<ResourceId, ResourceNode> = BTreeMap::new();
        let mut disabled = BTreeSet::new();

        for resource in &config.resources {
            let id = resource.id();

            if nodes.contains_key(&id) || disabled.contains(&id) {
                return Err(GraphError::DuplicateResource { id: id.to_string() }.into());
            }

            if !self.is_enabled(resource)? {
                debug!("Resource {id} is disabled");
                disabled.insert(id);
                continue;
            }

            let node = self.build_node(resource)?;
            nodes.insert(id, node);
        }

        for node in nodes.values() {
            for dep in &node.dependencies {
                if !nodes.contains_key(dep) {
                    return Err(GraphError::UnresolvedReference {
                        from: node.id.to_string(),
                        reference: dep.to_string(),
                    }
                    .into());
                }
            }
        }

        let mut graph = DiGraph::new();
        let indices: BTreeMap<ResourceId, NodeIndex> = nodes
            .keys()
            .map(|id| (id.clone(), graph.add_node(id.clone())))
            .collect();

        for node in nodes.values() {
            for dep in &node.dependencies {
                graph.add_edge(indices[&node.id], indices[dep], ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| GraphError::Cycle {
            cycle: find_cycle(&graph, cycle_start(&graph, cycle.node_id())),
        })?;

        // toposort puts dependents first; edges point at dependencies
        let order: Vec<ResourceId> = sorted.into_iter().rev().map(|idx| graph[idx].clone()).collect();

        let outputs = self.build_outputs(config, &nodes)?;

        debug!("Built resource graph with {} nodes", nodes.len());

        Ok(ResourceGraph::from_parts(graph, indices, nodes, order, outputs))
    }

    /// Evaluates the `enabled` predicate once.
    fn is_enabled(&self, resource: &ResourceConfig) -> Result<bool> {
        let Some(predicate) = &resource.enabled else {
            return Ok(true);
        };

        let from = resource.id().to_string();
        let expr = Expr::parse(
            predicate,
            ParseContext {
                from: &from,
                variables: self.variables,
            },
        )?;

        let invalid = |reason: &str| GraphError::InvalidExpression {
            from: from.clone(),
            expression: predicate.to_string(),
            reason: reason.to_string(),
        };

        match expr {
            Expr::Literal(Value::Bool(b)) => Ok(b),
            Expr::Literal(Value::Number(n)) => Ok(n.as_f64().is_some_and(|n| n != 0.0)),
            Expr::Literal(Value::String(s)) => s
                .parse::<bool>()
                .map_err(|_| invalid("enabled must evaluate to a boolean").into()),
            Expr::Literal(_) => Err(invalid("enabled must evaluate to a boolean").into()),
            _ => Err(invalid("enabled may only use variables").into()),
        }
    }

    /// Parses attributes and collects dependency edges for one resource.
    fn build_node(&self, resource: &ResourceConfig) -> Result<ResourceNode> {
        let id = resource.id();
        let from = id.to_string();
        let ctx = ParseContext {
            from: &from,
            variables: self.variables,
        };

        let attributes = resource
            .attributes
            .iter()
            .map(|(name, value)| Ok((name.clone(), Expr::parse(value, ctx)?)))
            .collect::<std::result::Result<BTreeMap<_, _>, GraphError>>()?;

        let mut dependencies: BTreeSet<ResourceId> = attributes
            .values()
            .flat_map(Expr::references)
            .map(|r| r.target.clone())
            .collect();

        for hint in &resource.depends_on {
            let target = ResourceId::parse(hint).map_err(|_| GraphError::UnresolvedReference {
                from: from.clone(),
                reference: hint.clone(),
            })?;
            dependencies.insert(target);
        }

        Ok(ResourceNode {
            id,
            attributes,
            dependencies,
            lifecycle: Lifecycle::from(&resource.lifecycle),
        })
    }

    /// Parses output expressions; references must name graph nodes.
    fn build_outputs(
        &self,
        config: &InfraConfig,
        nodes: &BTreeMap<ResourceId, ResourceNode>,
    ) -> Result<BTreeMap<String, Expr>> {
        let mut outputs = BTreeMap::new();

        for (name, output) in &config.outputs {
            let from = format!("output.{name}");
            let expr = Expr::parse(
                &output.value,
                ParseContext {
                    from: &from,
                    variables: self.variables,
                },
            )?;

            if let Some(missing) = expr.references().into_iter().find(|r| !nodes.contains_key(&r.target)) {
                return Err(GraphError::UnresolvedReference {
                    from,
                    reference: missing.to_string(),
                }
                .into());
            }

            outputs.insert(name.clone(), expr);
        }

        Ok(outputs)
    }
}

/// Picks a node that lies on a cycle, preferring `hint`.
fn cycle_start(graph: &DiGraph<ResourceId, ()>, hint: NodeIndex) -> NodeIndex {
    let on_cycle = |component: &[NodeIndex]| {
        component.len() > 1 || graph.contains_edge(component[0], component[0])
    };

    let components = tarjan_scc(graph);
    if components.iter().any(|c| c.contains(&hint) && on_cycle(c)) {
        return hint;
    }

    components
        .iter()
        .filter(|c| on_cycle(c))
        .filter_map(|c| c.iter().min_by_key(|idx| &graph[**idx]).copied())
        .next()
        .unwrap_or(hint)
}

/// Finds a cycle through `start`, returned with `start` repeated at the end.
fn find_cycle(graph: &DiGraph<ResourceId, ()>, start: NodeIndex) -> Vec<String> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(current) = queue.pop_front() {
        for next in graph.neighbors(current) {
            if next == start {
                let mut path = vec![current];
                let mut cursor = current;
                while let Some(&p) = parent.get(&cursor) {
                    path.push(p);
                    cursor = p;
                }
                path.reverse();
                if path.first() != Some(&start) {
                    path.insert(0, start);
                }
                path.push(start);
                return path.into_iter().map(|idx| graph[idx].to_string()).collect();
            }
            if !parent.contains_key(&next) {
                parent.insert(next, current);
                queue.push_back(next);
            }
        }
    }

    vec![graph[start].to_string()]
}
