// SPDX-License-Identifier: MIT

//! Checkpoint persistence
//!
//! The store is append-only: a checkpoint is never rewritten, and a second
//! checkpoint with the same `(run_id, step_seq)` is rejected. Runs are also
//! leased here so that only one engine or recovery attempt drives a run at a
//! time.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::adk::error::StoreError;
use crate::stepflow::workflow::state::{RunId, WorkflowState};

/// Immutable snapshot of a run at one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(flatten)]
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshot the given state
    pub fn capture(state: &WorkflowState) -> Self {
        Self {
            state: state.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.state.run_id
    }

    pub fn step_seq(&self) -> u64 {
        self.state.step_seq
    }
}

/// Nodes dispatched from the checkpoint at `base_seq`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlight {
    pub base_seq: u64,
    pub nodes: Vec<String>,
}

impl InFlight {
    pub fn new<I, S>(base_seq: u64, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            base_seq,
            nodes: nodes.into_iter().map(Into::into).collect(),
        }
    }

    /// Nothing dispatched
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes still unaccounted for when `latest_seq` is the newest checkpoint.
    /// A newer checkpoint means their step was already recorded.
    pub fn outstanding(&self, latest_seq: u64) -> &[String] {
        if self.base_seq == latest_seq {
            self.nodes.as_slice()
        } else {
            &[]
        }
    }
}

/// Exclusive claim on a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub run_id: RunId,
    /// Identifies the holder; heartbeats and releases must present it
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Nodes dispatched under this lease whose step is not yet checkpointed
    #[serde(default)]
    pub in_flight: InFlight,
    /// In-flight set left behind by an expired lease this claim replaced
    #[serde(skip)]
    pub recovered_in_flight: InFlight,
}

impl Lease {
    fn fresh(run_id: &RunId, ttl: Duration) -> Self {
        Self {
            run_id: run_id.clone(),
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: expiry(ttl),
            in_flight: InFlight::none(),
            recovered_in_flight: InFlight::none(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64)
}

/// Decide a claim against the currently stored lease
fn take_over(existing: Option<Lease>, run_id: &RunId, ttl: Duration) -> Result<Lease, StoreError> {
    match existing {
        Some(current) if !current.is_expired() => Err(StoreError::LeaseHeld {
            run_id: run_id.clone(),
            holder: current.token,
        }),
        Some(expired) => {
            log::warn!(
                "Taking over expired lease on run {} (in flight from step {}: {:?})",
                run_id,
                expired.in_flight.base_seq,
                expired.in_flight.nodes
            );
            let mut lease = Lease::fresh(run_id, ttl);
            lease.recovered_in_flight = expired.in_flight;
            Ok(lease)
        }
        None => Ok(Lease::fresh(run_id, ttl)),
    }
}

/// Renew a stored lease on behalf of its holder
fn renew(
    stored: Option<&mut Lease>,
    lease: &mut Lease,
    in_flight: &InFlight,
    ttl: Duration,
) -> Result<(), StoreError> {
    match stored {
        Some(current) if current.token == lease.token => {
            current.expires_at = expiry(ttl);
            current.in_flight = in_flight.clone();
            lease.expires_at = current.expires_at;
            lease.in_flight = current.in_flight.clone();
            Ok(())
        }
        _ => Err(StoreError::LeaseLost(lease.run_id.clone())),
    }
}

/// Durable checkpoint storage contract
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint; fails with `SeqCollision` if the step exists
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Latest checkpoint of a run, if any
    async fn load_latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>, StoreError>;

    /// Every checkpoint of a run ordered by `step_seq`
    async fn load_all(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, StoreError>;

    /// Runs that have at least one checkpoint
    async fn list_runs(&self) -> Result<Vec<RunId>, StoreError>;

    /// Acquire the exclusive lease on a run
    async fn claim(&self, run_id: &RunId, ttl: Duration) -> Result<Lease, StoreError>;

    /// Renew a lease and record which nodes are currently dispatched
    async fn heartbeat(
        &self,
        lease: &mut Lease,
        in_flight: &InFlight,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Give up a lease; releasing a lease that was taken over is a no-op
    async fn release(&self, lease: &Lease) -> Result<(), StoreError>;
}
