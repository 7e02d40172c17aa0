// SPDX-License-Identifier: MIT

//! Recovery Manager
//!
//! Resume is decided from the latest checkpoint alone, under the run lease:
//! Suspended, retryable Failed and ownerless Running runs continue from their
//! pending node set. Completed and permanently Failed runs are final. If the
//! lease that was taken over recorded non-idempotent nodes mid-invocation,
//! they are flagged for review and never invoked again automatically.

use std::sync::Arc;
use std::time::Duration;

use crate::adk::error::{RecoveryError, StoreError};
use crate::stepflow::checkpoint::{Checkpoint, CheckpointStore, Lease};
use crate::stepflow::workflow::graph::{ActiveRun, WorkflowGraph};
use crate::stepflow::workflow::state::{Payload, RunId, RunStatus, WorkflowState};

pub struct RecoveryManager {
    store: Arc<dyn CheckpointStore>,
    graph: Arc<WorkflowGraph>,
    lease_ttl: Duration,
}

impl RecoveryManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        graph: Arc<WorkflowGraph>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            graph,
            lease_ttl,
        }
    }

    /// Claim a run and prepare it to continue, merging optional external input
    pub async fn resume(
        &self,
        run_id: &RunId,
        input: Option<Payload>,
    ) -> Result<ActiveRun, RecoveryError> {
        if self.store.load_latest(run_id).await?.is_none() {
            return Err(RecoveryError::NotFound(run_id.clone()));
        }

        let lease = self.claim(run_id).await?;
        match self.prepare(run_id, &lease, input).await {
            Ok(run) => Ok(run),
            Err(e) => {
                self.store.release(&lease).await?;
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
        run_id: &RunId,
        lease: &Lease,
        input: Option<Payload>,
    ) -> Result<ActiveRun, RecoveryError> {
        // Re-read under the lease; the earlier read only checked existence
        let latest = self
            .store
            .load_latest(run_id)
            .await?
            .ok_or_else(|| RecoveryError::NotFound(run_id.clone()))?
            .state;

        match latest.status {
            RunStatus::Completed => return Err(RecoveryError::AlreadyCompleted(run_id.clone())),
            RunStatus::Failed if !latest.is_resumable() => {
                return Err(RecoveryError::PermanentlyFailed {
                    run_id: run_id.clone(),
                    reason: latest
                        .failure
                        .as_ref()
                        .map(|f| f.reason())
                        .unwrap_or_else(|| "unknown".to_string()),
                })
            }
            _ => {}
        }

        if !latest.review.is_empty() {
            return Err(RecoveryError::ManualReview {
                run_id: run_id.clone(),
                nodes: latest.review.clone(),
            });
        }

        let orphans = self.orphaned_nodes(&latest, lease);
        if !orphans.is_empty() {
            log::error!(
                "Run {} crashed while non-idempotent nodes {:?} were running; flagging for review",
                run_id,
                orphans
            );
            let mut flagged = latest.next();
            flagged.status = RunStatus::Suspended;
            flagged.review = orphans.clone();
            self.store.save(&Checkpoint::capture(&flagged)).await?;
            return Err(RecoveryError::ManualReview {
                run_id: run_id.clone(),
                nodes: orphans,
            });
        }

        let resumed_from = latest.status;
        let mut state = latest;
        state.status = RunStatus::Running;
        state.failure = None;
        if let Some(input) = input {
            for (key, value) in input {
                let reducer = self.graph.schema.reducer_for(&key);
                state.payload.apply(&key, value, reducer);
            }
        }

        log::info!(
            "Resuming run {} from step {} ({}), pending {:?}",
            run_id,
            state.step_seq,
            resumed_from,
            state.pending
        );
        let mut run = ActiveRun::new(state, lease.clone());
        run.interrupt_released = resumed_from == RunStatus::Suspended;
        Ok(run)
    }

    /// Pending non-idempotent nodes the previous lease holder had dispatched
    /// from the latest checkpoint
    fn orphaned_nodes(&self, state: &WorkflowState, lease: &Lease) -> Vec<String> {
        if state.status != RunStatus::Running {
            return Vec::new();
        }
        lease
            .recovered_in_flight
            .outstanding(state.step_seq)
            .iter()
            .filter(|node| state.pending.contains(node))
            .filter(|node| {
                self.graph
                    .registry
                    .descriptor(node)
                    .is_some_and(|d| !d.idempotent)
            })
            .cloned()
            .collect()
    }

    /// Acknowledge a manual review so the run can be resumed again
    pub async fn clear_review(&self, run_id: &RunId) -> Result<WorkflowState, RecoveryError> {
        let lease = self.claim(run_id).await?;
        let result = async {
            let latest = self
                .store
                .load_latest(run_id)
                .await?
                .ok_or_else(|| RecoveryError::NotFound(run_id.clone()))?
                .state;
            if latest.review.is_empty() {
                return Ok(latest);
            }

            let mut cleared = latest.next();
            log::info!("Run {}: review of {:?} cleared", run_id, cleared.review);
            cleared.review.clear();
            self.store.save(&Checkpoint::capture(&cleared)).await?;
            Ok::<_, RecoveryError>(cleared)
        }
        .await;
        self.store.release(&lease).await?;
        result
    }

    async fn claim(&self, run_id: &RunId) -> Result<Lease, RecoveryError> {
        match self.store.claim(run_id, self.lease_ttl).await {
            Ok(lease) => Ok(lease),
            Err(StoreError::LeaseHeld { .. }) => Err(RecoveryError::AlreadyClaimed(run_id.clone())),
            Err(e) => Err(e.into()),
        }
    }
}
