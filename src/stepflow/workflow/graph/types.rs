//! Compiled graph types
//!
//! A `WorkflowGraph` is the immutable structure the engine executes: the node
//! registry, the edge list in declaration order, the payload schema and the
//! set of nodes that suspend the run before they are dispatched.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::adk::error::WorkflowError;
use crate::adk::node::Node;
use crate::stepflow::workflow::condition::{self, Expression};
use crate::stepflow::workflow::registry::{NodeDescriptor, NodeRegistry};
use crate::stepflow::workflow::state::{Payload, StateSchema};

/// Parsed edge predicate, kept with its source text for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub source: String,
    pub expr: Expression,
}

/// Transition out of a node
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub from: String,
    pub to: Vec<String>,
    /// Absent predicate always matches
    pub predicate: Option<Predicate>,
    /// Matching fan-out edges schedule all their targets in parallel
    pub fan_out: bool,
}

impl Edge {
    /// Unconditional edge to a single successor
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: vec![to.into()],
            predicate: None,
            fan_out: false,
        }
    }

    /// Edge scheduling several successors at once
    pub fn fan_out<I, S>(from: impl Into<String>, to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            from: from.into(),
            to: to.into_iter().map(Into::into).collect(),
            predicate: None,
            fan_out: true,
        }
    }

    /// Guard the edge with a predicate
    pub fn when(mut self, condition: &str) -> Result<Self, WorkflowError> {
        let expr = condition::parse(condition).map_err(|e| WorkflowError::InvalidCondition {
            from: self.from.clone(),
            condition: condition.to_string(),
            message: e.to_string(),
        })?;
        self.predicate = Some(Predicate {
            source: condition.to_string(),
            expr,
        });
        Ok(self)
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        self.predicate
            .as_ref()
            .map_or(true, |p| condition::evaluate(&p.expr, payload))
    }
}

/// Executable workflow graph
#[derive(Clone)]
pub struct WorkflowGraph {
    pub name: String,
    pub registry: NodeRegistry,
    pub edges: Vec<Edge>,
    pub schema: StateSchema,
    /// Nodes before which a run is suspended awaiting external input
    pub interrupt_before: BTreeSet<String>,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: NodeRegistry::new(),
            edges: Vec::new(),
            schema: StateSchema::default(),
            interrupt_before: BTreeSet::new(),
        }
    }

    pub fn node(
        mut self,
        descriptor: NodeDescriptor,
        node: Arc<dyn Node>,
    ) -> Result<Self, WorkflowError> {
        self.registry.register(descriptor, node)?;
        Ok(self)
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn interrupt_before(mut self, node: impl Into<String>) -> Self {
        self.interrupt_before.insert(node.into());
        self
    }

    /// Outgoing edges of a node in declaration order
    pub fn outgoing<'a>(&'a self, from: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == from)
    }

    /// A node without outgoing edges ends the run
    pub fn is_terminal(&self, node: &str) -> bool {
        self.outgoing(node).next().is_none()
    }

    /// Check that every edge and interrupt refers to a registered node
    pub fn validate(&self) -> Result<(), WorkflowError> {
        for edge in &self.edges {
            if !self.registry.contains(&edge.from) {
                return Err(WorkflowError::UnknownNode(edge.from.clone()));
            }
            if !edge.fan_out && edge.to.len() != 1 {
                return Err(WorkflowError::AmbiguousEdge(edge.from.clone()));
            }
            if let Some(to) = edge.to.iter().find(|to| !self.registry.contains(to)) {
                return Err(WorkflowError::InvalidEdge {
                    from: edge.from.clone(),
                    to: to.clone(),
                });
            }
        }
        if let Some(node) = self
            .interrupt_before
            .iter()
            .find(|n| !self.registry.contains(n))
        {
            return Err(WorkflowError::UnknownNode(node.clone()));
        }
        Ok(())
    }
}
