// SPDX-License-Identifier: MIT

//! Typed error handling for stepflow-rs
//!
//! Every layer of the engine reports through one of these enums.
//! `StepflowError` is the top-level type returned by the public engine API.

use thiserror::Error;

use crate::stepflow::workflow::state::RunId;

/// Top-level error type for stepflow-rs
#[derive(Debug, Error)]
pub enum StepflowError {
    /// Configuration errors (missing env vars, invalid engine config)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Graph definition and build errors
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Checkpoint store errors that could not be retried away
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Resume was rejected
    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// A spawned run task panicked or was aborted
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Graph definition, build and lookup errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Two nodes share a name
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// A node name that the registry does not know
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// The entry node of a submission is not registered
    #[error("Unknown entry node: {0}")]
    UnknownEntry(String),

    /// Edge refers to a node that does not exist
    #[error("Edge {from} -> {to} refers to an unknown node")]
    InvalidEdge { from: String, to: String },

    /// Plain (non fan-out) edges must name exactly one target
    #[error("Edge from {0} has several targets but is not marked fan_out")]
    AmbiguousEdge(String),

    /// Edge predicate did not parse
    #[error("Invalid condition '{condition}' on edge from {from}: {message}")]
    InvalidCondition {
        from: String,
        condition: String,
        message: String,
    },

    /// YAML names a handler or worker that was never registered
    #[error("No handler registered under '{0}'")]
    MissingHandler(String),

    /// Coordinator node configured without its required section
    #[error("Coordinator node '{0}' is missing its coordinator section")]
    MissingCoordinator(String),

    /// No checkpoint exists for the run
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    /// Operation requires a non-terminal run
    #[error("Run {0} already reached a terminal status")]
    RunFinished(RunId),
}

/// Errors raised by a node invocation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NodeError {
    /// Transient failure; retried per the retry policy
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// Non-retryable failure; fails the run immediately
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// Invocation exceeded its time budget; treated as recoverable
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

impl NodeError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable(message.into())
    }

    /// Whether the retry policy applies to this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, NodeError::Recoverable(_) | NodeError::Timeout { .. })
    }
}

/// Routing failures; both surface as a graph configuration error
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoutingError {
    /// Non-terminal node whose outgoing predicates all evaluated false
    #[error("graph configuration error: no edge from '{node}' matched")]
    NoMatch { node: String },

    /// Edge points at a node the registry does not know
    #[error("graph configuration error: edge from '{from}' targets unknown node '{to}'")]
    UnknownTarget { from: String, to: String },
}

/// Checkpoint store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// A checkpoint with this sequence number already exists
    #[error("Checkpoint {step_seq} already exists for run {run_id}")]
    SeqCollision { run_id: RunId, step_seq: u64 },

    /// Another holder owns an unexpired lease on the run
    #[error("Run {run_id} is leased by {holder}")]
    LeaseHeld { run_id: RunId, holder: String },

    /// Our lease was released or taken over
    #[error("Lease on run {0} is no longer held")]
    LeaseLost(RunId),

    /// Backend temporarily unreachable; safe to retry
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// I/O errors from file-backed stores
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Corrupt or unreadable record
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Transient errors are retried by the engine without re-invoking nodes
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Reasons a resume request is rejected
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Run not found: {0}")]
    NotFound(RunId),

    /// Another resume or live engine holds the run
    #[error("Run {0} is already claimed")]
    AlreadyClaimed(RunId),

    #[error("Run {0} already completed")]
    AlreadyCompleted(RunId),

    #[error("Run {run_id} failed permanently: {reason}")]
    PermanentlyFailed { run_id: RunId, reason: String },

    /// Non-idempotent nodes were in flight at crash time
    #[error("Run {run_id} needs manual review of nodes {nodes:?}")]
    ManualReview { run_id: RunId, nodes: Vec<String> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coordinator aggregation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinatorError {
    /// Batch specification could not be read from the payload
    #[error("Invalid sub-task batch: {0}")]
    InvalidBatch(String),

    /// Policy rejected a batch with failed sub-tasks
    #[error("{failed} of {total} sub-tasks failed")]
    PartialFailure { failed: usize, total: usize },

    /// A coordinator needs at least one worker
    #[error("Coordinator has no workers")]
    NoWorkers,
}

impl StepflowError {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<CoordinatorError> for NodeError {
    fn from(err: CoordinatorError) -> Self {
        NodeError::Unrecoverable(err.to_string())
    }
}
