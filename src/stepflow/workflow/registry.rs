// SPDX-License-Identifier: MIT

//! Node and handler registries
//!
//! `NodeRegistry` is the compiled, immutable view the engine executes
//! against: node name to descriptor plus implementation. `HandlerRegistry`
//! is the mutable lookup table that YAML `handler:` and `workers:` names are
//! resolved against while building a graph.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::adk::error::WorkflowError;
use crate::adk::node::Node;
use crate::adk::worker::Worker;
use crate::stepflow::config::RetryPolicy;
use crate::stepflow::workflow::state::{is_extension_field, Payload, StateSchema};

/// Static description of a node's contract
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDescriptor {
    pub name: String,
    /// Fields that must be present before the node is invoked
    pub inputs: Vec<String>,
    /// Fields passed through when present
    pub optional_inputs: Vec<String>,
    /// Fields the node must produce
    pub outputs: Vec<String>,
    /// Safe to invoke again after a crash mid-invocation
    pub idempotent: bool,
    /// Per-invocation timeout; the engine default applies when unset
    pub timeout_ms: Option<u64>,
    /// Retry policy override
    pub retry: Option<RetryPolicy>,
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            optional_inputs: Vec::new(),
            outputs: Vec::new(),
            idempotent: true,
            timeout_ms: None,
            retry: None,
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_optional_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the node as unsafe to re-invoke after a crash
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Required inputs absent from the payload
    pub fn missing_inputs(&self, payload: &Payload) -> Vec<String> {
        self.inputs
            .iter()
            .filter(|field| !payload.contains(field))
            .cloned()
            .collect()
    }

    /// The view of the payload handed to the node
    pub fn input_view(&self, payload: &Payload) -> Payload {
        payload.restrict(self.inputs.iter().chain(self.optional_inputs.iter()))
    }

    /// Validate an output fragment against the declared outputs and field types
    pub fn check_output(&self, output: &Payload, schema: &StateSchema) -> Result<(), String> {
        if let Some(missing) = self.outputs.iter().find(|field| !output.contains(field)) {
            return Err(format!(
                "node '{}' did not produce declared output '{}'",
                self.name, missing
            ));
        }

        for (key, value) in output.iter() {
            if !is_extension_field(key) && !self.outputs.contains(key) {
                return Err(format!(
                    "node '{}' wrote undeclared field '{}'",
                    self.name, key
                ));
            }
            schema.check(key, value)?;
        }
        Ok(())
    }
}

/// A node contract together with its implementation
#[derive(Clone)]
pub struct RegisteredNode {
    pub descriptor: NodeDescriptor,
    pub node: Arc<dyn Node>,
}

/// Compiled node set of a graph
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, RegisteredNode>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node; names must be unique
    pub fn register(
        &mut self,
        descriptor: NodeDescriptor,
        node: Arc<dyn Node>,
    ) -> Result<(), WorkflowError> {
        if self.nodes.contains_key(&descriptor.name) {
            return Err(WorkflowError::DuplicateNode(descriptor.name));
        }
        self.nodes
            .insert(descriptor.name.clone(), RegisteredNode { descriptor, node });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(name).map(|n| &n.descriptor)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Named node handlers and workers available to graph definitions
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn Node>>>>,
    workers: Arc<RwLock<HashMap<String, Arc<dyn Worker>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn Node>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(name.into(), handler);
    }

    pub async fn handler(&self, name: &str) -> Option<Arc<dyn Node>> {
        let handlers = self.handlers.read().await;
        handlers.get(name).cloned()
    }

    pub async fn register_worker(&self, worker: Arc<dyn Worker>) {
        let mut workers = self.workers.write().await;
        workers.insert(worker.name().to_string(), worker);
    }

    pub async fn worker(&self, name: &str) -> Option<Arc<dyn Worker>> {
        let workers = self.workers.read().await;
        workers.get(name).cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adk::error::NodeError;
    use crate::adk::node::{FnNode, NodeInput};
    use crate::stepflow::workflow::coordinator::SubTask;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    fn noop() -> Arc<dyn Node> {
        Arc::new(FnNode::new(|_: NodeInput| Ok(Payload::new())))
    }

    struct MockWorker {
        name: String,
    }

    #[async_trait]
    impl Worker for MockWorker {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, task: &SubTask) -> Result<Value, NodeError> {
            Ok(task.spec.clone())
        }
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = NodeRegistry::new();
        registry
            .register(NodeDescriptor::new("Analyze"), noop())
            .unwrap();

        let err = registry
            .register(NodeDescriptor::new("Analyze"), noop())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateNode(name) if name == "Analyze"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_input_view_and_missing_inputs() {
        let descriptor = NodeDescriptor::new("Decompose")
            .with_inputs(["taskText"])
            .with_optional_inputs(["hints"]);
        let payload =
            Payload::from_pairs([("taskText", json!("X")), ("complexity", json!("high"))]);

        let view = descriptor.input_view(&payload);
        assert_eq!(
            view.key_set().into_iter().collect::<Vec<_>>(),
            vec!["taskText"]
        );
        assert!(descriptor.missing_inputs(&payload).is_empty());
        assert_eq!(descriptor.missing_inputs(&Payload::new()), vec!["taskText"]);
    }

    #[test]
    fn test_check_output_contract() {
        let descriptor = NodeDescriptor::new("Analyze").with_outputs(["complexity"]);
        let schema = StateSchema::default();

        let ok = Payload::from_pairs([("complexity", json!("low")), ("x-trace", json!(1))]);
        assert!(descriptor.check_output(&ok, &schema).is_ok());

        let missing = Payload::new();
        assert!(descriptor
            .check_output(&missing, &schema)
            .unwrap_err()
            .contains("did not produce"));

        let undeclared = Payload::from_pairs([
            ("complexity", json!("low")),
            ("taskText", json!("rewritten")),
        ]);
        assert!(descriptor
            .check_output(&undeclared, &schema)
            .unwrap_err()
            .contains("undeclared"));
    }

    #[test]
    fn test_check_output_enforces_types() {
        let schema: StateSchema = serde_yaml::from_str("complexity:\n  type: string\n").unwrap();
        let descriptor = NodeDescriptor::new("Analyze").with_outputs(["complexity"]);

        let wrong = Payload::from_pairs([("complexity", json!(3))]);
        assert!(descriptor.check_output(&wrong, &schema).is_err());
    }

    #[tokio::test]
    async fn test_handler_registry_is_shared_between_clones() {
        let registry = HandlerRegistry::new();
        let cloned = registry.clone();

        cloned.register_handler("analyzer", noop()).await;
        cloned
            .register_worker(Arc::new(MockWorker {
                name: "echo".to_string(),
            }))
            .await;

        assert!(registry.handler("analyzer").await.is_some());
        assert!(registry.handler("missing").await.is_none());
        assert_eq!(registry.worker("echo").await.unwrap().name(), "echo");
    }
}
