// SPDX-License-Identifier: MIT

//! Node capability interface
//!
//! A node is an opaque unit of work. The engine hands it a view of the
//! payload restricted to the node's declared input fields and expects back a
//! fragment containing the node's declared output fields.

use async_trait::async_trait;

use crate::adk::error::NodeError;
use crate::stepflow::workflow::state::{Payload, RunId};

/// Input handed to a node invocation
#[derive(Debug, Clone)]
pub struct NodeInput {
    pub run_id: RunId,
    /// Name of the graph node being invoked
    pub node: String,
    /// 1-based attempt number (retries increment it)
    pub attempt: u32,
    /// Declared input fields present in the payload
    pub fields: Payload,
}

impl NodeInput {
    /// Get a field as a string slice
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    /// Get a required field or fail the invocation
    pub fn require(&self, key: &str) -> Result<&serde_json::Value, NodeError> {
        self.fields
            .get(key)
            .ok_or_else(|| NodeError::unrecoverable(format!("missing input field '{}'", key)))
    }
}

/// Core trait for every executable graph node
#[async_trait]
pub trait Node: Send + Sync {
    /// Run the node against its input view and return its output fragment
    async fn invoke(&self, input: NodeInput) -> Result<Payload, NodeError>;

    /// Whether an invocation occupies a slot of the shared concurrency limit.
    /// Nodes that only wait on workers drawing from the same limit return false.
    fn uses_slot(&self) -> bool {
        true
    }
}

/// Adapter turning a plain closure into a node
pub struct FnNode<F> {
    func: F,
}

impl<F> FnNode<F>
where
    F: Fn(NodeInput) -> Result<Payload, NodeError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Node for FnNode<F>
where
    F: Fn(NodeInput) -> Result<Payload, NodeError> + Send + Sync,
{
    async fn invoke(&self, input: NodeInput) -> Result<Payload, NodeError> {
        (self.func)(input)
    }
}
