// SPDX-License-Identifier: MIT

//! Reference agents for the Analyze → Decompose → Coordinator → Done pipeline
//!
//! These are deterministic text heuristics so the pipeline can run end to end
//! without any model behind it. Real deployments register their own handlers
//! under the same names.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::adk::error::NodeError;
use crate::adk::node::{Node, NodeInput};
use crate::adk::worker::Worker;
use crate::stepflow::workflow::coordinator::SubTask;
use crate::stepflow::workflow::registry::HandlerRegistry;
use crate::stepflow::workflow::state::Payload;

fn sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Rates a task `high` when it spans several sentences, `low` otherwise
pub struct TaskAnalyzer {
    field: String,
    min_sentences: usize,
}

impl TaskAnalyzer {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            min_sentences: 2,
        }
    }

    pub fn with_min_sentences(mut self, min_sentences: usize) -> Self {
        self.min_sentences = min_sentences.max(1);
        self
    }
}

#[async_trait]
impl Node for TaskAnalyzer {
    async fn invoke(&self, input: NodeInput) -> Result<Payload, NodeError> {
        let text = input
            .require(&self.field)?
            .as_str()
            .ok_or_else(|| NodeError::unrecoverable(format!("'{}' must be text", self.field)))?;

        let count = sentences(text).len();
        let complexity = if count >= self.min_sentences {
            "high"
        } else {
            "low"
        };
        log::debug!(
            "Run {}: {} sentences, complexity {}",
            input.run_id,
            count,
            complexity
        );
        Ok(Payload::from_pairs([("complexity", json!(complexity))]))
    }
}

/// Splits a task into one sub-task per sentence
pub struct SentenceDecomposer {
    field: String,
}

impl SentenceDecomposer {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

#[async_trait]
impl Node for SentenceDecomposer {
    async fn invoke(&self, input: NodeInput) -> Result<Payload, NodeError> {
        let text = input.require(&self.field)?.as_str().unwrap_or_default();
        let subtasks: Vec<Value> = sentences(text).into_iter().map(Value::String).collect();
        if subtasks.is_empty() {
            return Err(NodeError::unrecoverable("nothing to decompose"));
        }
        Ok(Payload::from_pairs([("subtasks", Value::Array(subtasks))]))
    }
}

/// Worker that acknowledges each sub-task
pub struct EchoWorker {
    name: String,
}

impl EchoWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Worker for EchoWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: &SubTask) -> Result<Value, NodeError> {
        let text = match &task.spec {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(json!({ "task": text, "worker": self.name }))
    }
}

/// Summarises coordinator results into a `summary` field
pub struct Finalizer;

#[async_trait]
impl Node for Finalizer {
    async fn invoke(&self, input: NodeInput) -> Result<Payload, NodeError> {
        let results = input
            .fields
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let failed = input
            .fields
            .get("failures")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);

        let summary = format!(
            "{} of {} sub-tasks completed",
            results.len() - failed.min(results.len()),
            results.len()
        );
        Ok(Payload::from_pairs([("summary", json!(summary))]))
    }
}

/// Register the reference agents under their default names:
/// handlers `analyzer`, `decomposer`, `finalizer` and worker `echo`
pub async fn register_defaults(registry: &HandlerRegistry) {
    registry
        .register_handler("analyzer", Arc::new(TaskAnalyzer::new("taskText")))
        .await;
    registry
        .register_handler("decomposer", Arc::new(SentenceDecomposer::new("taskText")))
        .await;
    registry
        .register_handler("finalizer", Arc::new(Finalizer))
        .await;
    registry
        .register_worker(Arc::new(EchoWorker::new("echo")))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stepflow::workflow::state::RunId;

    fn input(fields: Payload) -> NodeInput {
        NodeInput {
            run_id: RunId::from("run-1"),
            node: "Test".to_string(),
            attempt: 1,
            fields,
        }
    }

    fn text(s: &str) -> Payload {
        Payload::from_pairs([("taskText", json!(s))])
    }

    #[tokio::test]
    async fn test_analyzer_rates_complexity() {
        let analyzer = TaskAnalyzer::new("taskText");
        let low = analyzer.invoke(input(text("Fix the typo"))).await.unwrap();
        assert_eq!(low.get("complexity"), Some(&json!("low")));

        let high = analyzer
            .invoke(input(text("Fetch data. Clean it. Plot it.")))
            .await
            .unwrap();
        assert_eq!(high.get("complexity"), Some(&json!("high")));
    }

    #[tokio::test]
    async fn test_analyzer_requires_text() {
        let err = TaskAnalyzer::new("taskText")
            .invoke(input(Payload::new()))
            .await
            .unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_decomposer_splits_sentences() {
        let output = SentenceDecomposer::new("taskText")
            .invoke(input(text("Fetch data. Clean it!  Plot it?")))
            .await
            .unwrap();
        assert_eq!(
            output.get("subtasks"),
            Some(&json!(["Fetch data", "Clean it", "Plot it"]))
        );
    }

    #[tokio::test]
    async fn test_echo_worker_and_finalizer() {
        let worker = EchoWorker::new("echo");
        let result = worker
            .execute(&SubTask {
                index: 0,
                spec: json!("Plot it"),
            })
            .await
            .unwrap();
        assert_eq!(result["task"], "Plot it");

        let fields = Payload::from_pairs([
            ("results", json!([result, null])),
            ("failures", json!([{"index": 1}])),
        ]);
        let output = Finalizer.invoke(input(fields)).await.unwrap();
        assert_eq!(
            output.get("summary"),
            Some(&json!("1 of 2 sub-tasks completed"))
        );
    }

    #[tokio::test]
    async fn test_register_defaults() {
        let registry = HandlerRegistry::new();
        register_defaults(&registry).await;
        assert!(registry.handler("analyzer").await.is_some());
        assert!(registry.handler("decomposer").await.is_some());
        assert!(registry.handler("finalizer").await.is_some());
        assert!(registry.worker("echo").await.is_some());
    }
}
