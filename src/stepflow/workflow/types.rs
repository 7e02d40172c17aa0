// SPDX-License-Identifier: MIT

//! YAML schema types for graph definitions
//!
//! This module contains the data structures a graph file is parsed into.
//! They are compiled into a `WorkflowGraph` by the `Builder`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::stepflow::config::{EngineConfig, RetryPolicy};
use crate::stepflow::workflow::coordinator::PartialFailurePolicy;
use crate::stepflow::workflow::state::StateSchema;

/// Top-level graph definition
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct GraphDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Node a run starts at unless the submission names another
    pub entry: String,
    /// Engine settings; defaults apply for anything omitted
    #[serde(default)]
    pub engine: EngineConfig,
    /// Payload field types and reducers
    #[serde(default)]
    pub state: StateSchema,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
    /// Nodes before which runs suspend for external input
    #[serde(default)]
    pub interrupt_before: Vec<String>,
}

/// A node in the graph
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub kind: NodeKind,
    /// Registered handler implementing the node (handler nodes only)
    pub handler: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub optional_inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    pub timeout_ms: Option<u64>,
    pub retry: Option<RetryPolicy>,
    /// Required for coordinator nodes
    pub coordinator: Option<CoordinatorConfig>,
}

fn default_idempotent() -> bool {
    true
}

/// How a node is implemented
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A handler from the handler registry
    #[default]
    Handler,
    /// Built-in sub-task coordinator over registered workers
    Coordinator,
}

/// Coordinator node settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct CoordinatorConfig {
    /// Worker names; repeat a name to give the pool more instances of it
    pub workers: Vec<String>,
    /// Aggregation policy for partially failed batches (required)
    pub policy: PartialFailurePolicy,
    /// Payload field holding the sub-task array
    #[serde(default = "default_batch_field")]
    pub batch_field: String,
    /// Field turned into a one-element batch when the batch field is absent
    pub fallback_field: Option<String>,
    #[serde(default = "default_results_field")]
    pub results_field: String,
    #[serde(default = "default_failures_field")]
    pub failures_field: String,
    /// Per sub-task retry policy; the engine default applies when unset
    pub retry: Option<RetryPolicy>,
    /// Per sub-task invocation timeout
    pub timeout_ms: Option<u64>,
}

fn default_batch_field() -> String {
    "subtasks".to_string()
}

fn default_results_field() -> String {
    "results".to_string()
}

fn default_failures_field() -> String {
    "failures".to_string()
}

/// Transition between nodes
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct EdgeConfig {
    pub from: String,
    pub to: EdgeTargets,
    /// Predicate over the payload, e.g. `complexity == 'low'`
    pub when: Option<String>,
    /// Schedule every target in parallel
    #[serde(default)]
    pub fan_out: bool,
}

/// Edge target specification (single string or array)
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum EdgeTargets {
    Single(String),
    Multiple(Vec<String>),
}

impl EdgeTargets {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            EdgeTargets::Single(s) => vec![s.clone()],
            EdgeTargets::Multiple(v) => v.clone(),
        }
    }
}
