// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::{renew, take_over, Checkpoint, CheckpointStore, InFlight, Lease};
use crate::adk::error::StoreError;
use crate::stepflow::workflow::state::RunId;

/// Process-local checkpoint store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    checkpoints: RwLock<HashMap<RunId, BTreeMap<u64, Checkpoint>>>,
    leases: Mutex<HashMap<RunId, Lease>>,
    failing_saves: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` saves fail with `Unavailable`
    pub fn inject_save_failures(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let injected = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected save failure".to_string()));
        }

        let mut checkpoints = self.checkpoints.write().await;
        let run = checkpoints.entry(checkpoint.run_id().clone()).or_default();
        if run.contains_key(&checkpoint.step_seq()) {
            return Err(StoreError::SeqCollision {
                run_id: checkpoint.run_id().clone(),
                step_seq: checkpoint.step_seq(),
            });
        }
        run.insert(checkpoint.step_seq(), checkpoint.clone());
        Ok(())
    }

    async fn load_latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>, StoreError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .get(run_id)
            .and_then(|run| run.values().next_back().cloned()))
    }

    async fn load_all(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, StoreError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .get(run_id)
            .map(|run| run.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, StoreError> {
        let checkpoints = self.checkpoints.read().await;
        let mut runs: Vec<RunId> = checkpoints.keys().cloned().collect();
        runs.sort();
        Ok(runs)
    }

    async fn claim(&self, run_id: &RunId, ttl: Duration) -> Result<Lease, StoreError> {
        let mut leases = self.leases.lock().await;
        let lease = take_over(leases.get(run_id).cloned(), run_id, ttl)?;
        leases.insert(run_id.clone(), lease.clone());
        Ok(lease)
    }

    async fn heartbeat(
        &self,
        lease: &mut Lease,
        in_flight: &InFlight,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().await;
        renew(leases.get_mut(&lease.run_id), lease, in_flight, ttl)
    }

    async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().await;
        if leases
            .get(&lease.run_id)
            .is_some_and(|current| current.token == lease.token)
        {
            leases.remove(&lease.run_id);
        }
        Ok(())
    }
}
