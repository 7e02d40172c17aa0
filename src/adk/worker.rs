// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use serde_json::Value;

use crate::adk::error::NodeError;
use crate::stepflow::workflow::coordinator::SubTask;

/// Trait for interchangeable worker agents that execute coordinator sub-tasks
#[async_trait]
pub trait Worker: Send + Sync {
    /// Worker identity, used for logging
    fn name(&self) -> &str;

    /// Execute one sub-task and return its result value
    async fn execute(&self, task: &SubTask) -> Result<Value, NodeError>;
}
