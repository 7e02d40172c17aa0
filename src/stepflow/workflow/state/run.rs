// SPDX-License-Identifier: MIT

//! Run-level workflow state

use serde::{Deserialize, Serialize};
use std::fmt;

use super::payload::Payload;

/// Opaque run identifier, immutable for the run's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "Running",
            RunStatus::Suspended => "Suspended",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Why a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Recoverable errors outlasted the retry budget
    RetriesExhausted,
    /// Node reported a non-retryable error
    Unrecoverable,
    /// Node output violated its declared fields or types
    OutputContract,
    /// No matching edge, or an edge to an unknown node
    GraphConfiguration,
    /// Explicit cancel request
    Cancelled,
    /// Run exceeded the configured step bound
    StepLimit,
}

impl FailureKind {
    /// Whether the Recovery Manager may resume a run failed for this reason
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::RetriesExhausted)
    }
}

/// Diagnosis attached to a Failed checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub kind: FailureKind,
    /// Node that triggered the failure, if any
    pub node: Option<String>,
    pub attempts: u32,
    pub message: String,
    /// Input fields the node saw when it failed
    pub payload_snapshot: Payload,
    pub retryable: bool,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            node: None,
            attempts: 0,
            message: message.into(),
            payload_snapshot: Payload::new(),
            retryable: kind.is_retryable(),
        }
    }

    pub fn at_node(mut self, node: impl Into<String>, attempts: u32, snapshot: Payload) -> Self {
        self.node = Some(node.into());
        self.attempts = attempts;
        self.payload_snapshot = snapshot;
        self
    }

    /// Human readable reason, e.g. "graph configuration error: ..."
    pub fn reason(&self) -> String {
        match self.kind {
            FailureKind::Cancelled => "cancelled".to_string(),
            _ => self.message.clone(),
        }
    }
}

/// The single mutable document threaded through a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub run_id: RunId,
    pub step_seq: u64,
    pub status: RunStatus,
    /// Completed node names, append-only
    pub history: Vec<String>,
    pub payload: Payload,
    /// Nodes scheduled for the next step, sorted by name
    #[serde(default)]
    pub pending: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    /// Non-idempotent nodes awaiting manual review
    #[serde(default)]
    pub review: Vec<String>,
}

impl WorkflowState {
    /// Initial state at submission
    pub fn initial(run_id: RunId, entry: impl Into<String>, payload: Payload) -> Self {
        Self {
            run_id,
            step_seq: 0,
            status: RunStatus::Running,
            history: Vec::new(),
            payload,
            pending: vec![entry.into()],
            failure: None,
            review: Vec::new(),
        }
    }

    /// Successor state for the next checkpoint
    pub fn next(&self) -> Self {
        let mut next = self.clone();
        next.step_seq += 1;
        next
    }

    /// Mark failed with a diagnosis
    pub fn fail(&mut self, failure: FailureRecord) {
        self.status = RunStatus::Failed;
        self.failure = Some(failure);
    }

    /// Whether the Recovery Manager may pick this state up
    pub fn is_resumable(&self) -> bool {
        match self.status {
            RunStatus::Suspended | RunStatus::Running => true,
            RunStatus::Failed => self.failure.as_ref().is_some_and(|f| f.retryable),
            RunStatus::Completed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initial_state() {
        let state = WorkflowState::initial(
            RunId::from("r1"),
            "Analyze",
            Payload::from_pairs([("taskText", json!("X"))]),
        );
        assert_eq!(state.step_seq, 0);
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.history.is_empty());
        assert_eq!(state.pending, vec!["Analyze"]);
    }

    #[test]
    fn test_next_increments_step_seq_only() {
        let state = WorkflowState::initial(RunId::from("r1"), "A", Payload::new());
        let next = state.next();
        assert_eq!(next.step_seq, 1);
        assert_eq!(next.run_id, state.run_id);
        assert_eq!(next.pending, state.pending);
    }

    #[test]
    fn test_resumable_statuses() {
        let mut state = WorkflowState::initial(RunId::from("r1"), "A", Payload::new());
        state.status = RunStatus::Suspended;
        assert!(state.is_resumable());

        state.fail(FailureRecord::new(FailureKind::RetriesExhausted, "flaky"));
        assert!(state.is_resumable());

        state.fail(FailureRecord::new(FailureKind::Unrecoverable, "broken"));
        assert!(!state.is_resumable());

        state.status = RunStatus::Completed;
        state.failure = None;
        assert!(!state.is_resumable());
    }

    #[test]
    fn test_cancelled_reason() {
        let failure = FailureRecord::new(FailureKind::Cancelled, "cancel requested");
        assert_eq!(failure.reason(), "cancelled");
        assert!(!failure.retryable);
    }

    #[test]
    fn test_record_uses_camel_case() {
        let state = WorkflowState::initial(RunId::from("r1"), "A", Payload::new());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["stepSeq"], 0);
        assert_eq!(json["status"], "Running");
    }

    #[test]
    fn test_generated_run_ids_are_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
    }
}
