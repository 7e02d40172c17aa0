// SPDX-License-Identifier: MIT

//! Coordinator sub-protocol
//!
//! A coordinator takes a batch of sub-task specs, hands them to a pool of
//! interchangeable workers, collects every outcome by index and aggregates
//! them according to an explicit partial-failure policy. Because outcomes are
//! keyed by index, the aggregate does not depend on completion order.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::adk::error::{CoordinatorError, NodeError};
use crate::adk::node::{Node, NodeInput};
use crate::adk::worker::Worker;
use crate::stepflow::config::RetryPolicy;
use crate::stepflow::workflow::state::Payload;

/// One unit of work with its stable position in the batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub index: usize,
    pub spec: Value,
}

/// Ordered sub-task specs
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubTaskBatch {
    tasks: Vec<SubTask>,
}

impl SubTaskBatch {
    pub fn new<I>(specs: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Self {
            tasks: specs
                .into_iter()
                .enumerate()
                .map(|(index, spec)| SubTask { index, spec })
                .collect(),
        }
    }

    /// Batch of exactly one spec
    pub fn single(spec: Value) -> Self {
        Self::new([spec])
    }

    /// Read a batch from a payload value, which must be an array
    pub fn from_value(value: &Value) -> Result<Self, CoordinatorError> {
        match value {
            Value::Array(items) => Ok(Self::new(items.iter().cloned())),
            other => Err(CoordinatorError::InvalidBatch(format!(
                "expected an array of sub-tasks, got {}",
                other
            ))),
        }
    }

    pub fn tasks(&self) -> &[SubTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// How to aggregate a batch in which some sub-tasks failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// Any failed sub-task fails the aggregate
    FailFast,
    /// Failed sub-tasks yield `null` results and are listed in `failures`
    BestEffort,
    /// Best effort provided at least `count` sub-tasks succeeded
    MinSuccess { count: usize },
}

/// A sub-task whose retry budget ran out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskFailure {
    pub index: usize,
    pub attempts: u32,
    pub error: String,
}

/// Outcomes of a dispatched batch, keyed by sub-task index
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResults {
    total: usize,
    outcomes: BTreeMap<usize, Result<Value, SubTaskFailure>>,
}

impl BatchResults {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, index: usize, outcome: Result<Value, SubTaskFailure>) {
        self.outcomes.insert(index, outcome);
    }

    /// Every index has a result or a failure
    pub fn is_complete(&self) -> bool {
        (0..self.total).all(|i| self.outcomes.contains_key(&i))
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_ok()).count()
    }

    pub fn failures(&self) -> Vec<&SubTaskFailure> {
        self.outcomes
            .values()
            .filter_map(|o| o.as_ref().err())
            .collect()
    }
}

/// Idle workers handed out one sub-task at a time
struct WorkerPool {
    idle: StdMutex<VecDeque<Arc<dyn Worker>>>,
    available: Semaphore,
}

/// A worker on loan from the pool, handed back when dropped
struct PooledWorker<'a> {
    pool: &'a WorkerPool,
    worker: Option<Arc<dyn Worker>>,
    _slot: SemaphorePermit<'a>,
}

impl Drop for PooledWorker<'_> {
    fn drop(&mut self) {
        // Runs before `_slot` is released, so a woken waiter always finds a worker
        if let Some(worker) = self.worker.take() {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(worker);
        }
    }
}

impl WorkerPool {
    fn new(workers: Vec<Arc<dyn Worker>>) -> Self {
        Self {
            available: Semaphore::new(workers.len()),
            idle: StdMutex::new(workers.into()),
        }
    }

    async fn checkout(&self) -> Result<PooledWorker<'_>, NodeError> {
        let slot = self
            .available
            .acquire()
            .await
            .map_err(|_| NodeError::unrecoverable("worker pool closed"))?;
        let worker = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| NodeError::unrecoverable("worker pool exhausted"))?;
        Ok(PooledWorker {
            pool: self,
            worker: Some(worker),
            _slot: slot,
        })
    }

    /// Execute a sub-task on an idle worker, waiting for one if needed.
    /// The worker returns to the pool even if this future is dropped mid-call.
    async fn with_worker(
        &self,
        task: &SubTask,
        timeout_ms: Option<u64>,
    ) -> Result<Value, NodeError> {
        let loan = self.checkout().await?;
        let worker = loan
            .worker
            .clone()
            .ok_or_else(|| NodeError::unrecoverable("worker pool exhausted"))?;

        log::debug!(
            "Sub-task {} assigned to worker {}",
            task.index,
            worker.name()
        );
        let result = match timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), worker.execute(task))
                .await
                .unwrap_or(Err(NodeError::Timeout { after_ms: ms })),
            None => worker.execute(task).await,
        };
        drop(loan);
        result
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Dispatches sub-task batches to workers and aggregates their results
pub struct Coordinator {
    pool: WorkerPool,
    retry: RetryPolicy,
    policy: PartialFailurePolicy,
    limiter: Arc<Semaphore>,
    timeout_ms: Option<u64>,
}

impl Coordinator {
    pub fn new(
        workers: Vec<Arc<dyn Worker>>,
        retry: RetryPolicy,
        policy: PartialFailurePolicy,
        limiter: Arc<Semaphore>,
    ) -> Result<Self, CoordinatorError> {
        if workers.is_empty() {
            return Err(CoordinatorError::NoWorkers);
        }
        Ok(Self {
            pool: WorkerPool::new(workers),
            retry,
            policy,
            limiter,
            timeout_ms: None,
        })
    }

    /// Per sub-task invocation timeout
    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn policy(&self) -> PartialFailurePolicy {
        self.policy
    }

    /// Run every sub-task to a result or an exhausted retry budget
    pub async fn dispatch(&self, batch: &SubTaskBatch) -> BatchResults {
        let mut results = BatchResults::new(batch.len());
        let mut pending: FuturesUnordered<_> = batch
            .tasks()
            .iter()
            .map(|task| async move { (task.index, self.run_sub_task(task).await) })
            .collect();

        while let Some((index, outcome)) = pending.next().await {
            if let Err(failure) = &outcome {
                log::warn!("Sub-task {} failed: {}", index, failure.error);
            }
            results.record(index, outcome);
        }
        results
    }

    async fn run_sub_task(&self, task: &SubTask) -> Result<Value, SubTaskFailure> {
        let attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.limiter.acquire().await {
                Ok(_permit) => self.pool.with_worker(task, self.timeout_ms).await,
                Err(_) => Err(NodeError::unrecoverable("concurrency limiter closed")),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_recoverable() && attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    log::debug!(
                        "Sub-task {} attempt {} failed: {}; retrying in {:?}",
                        task.index,
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(SubTaskFailure {
                        index: task.index,
                        attempts: attempt,
                        error: e.to_string(),
                    })
                }
            }
        }
    }

    /// Combine batch outcomes into `results` and `failures` fields
    pub fn aggregate(&self, results: BatchResults) -> Result<Payload, CoordinatorError> {
        if !results.is_complete() {
            return Err(CoordinatorError::InvalidBatch(format!(
                "{} of {} sub-tasks reported",
                results.outcomes.len(),
                results.total
            )));
        }

        let failed = results.total - results.succeeded();
        let rejected = match self.policy {
            PartialFailurePolicy::FailFast => failed > 0,
            PartialFailurePolicy::BestEffort => false,
            PartialFailurePolicy::MinSuccess { count } => results.succeeded() < count,
        };
        if rejected {
            return Err(CoordinatorError::PartialFailure {
                failed,
                total: results.total,
            });
        }

        let mut values = Vec::with_capacity(results.total);
        let mut failures = Vec::new();
        for outcome in results.outcomes.into_values() {
            match outcome {
                Ok(value) => values.push(value),
                Err(failure) => {
                    values.push(Value::Null);
                    failures.push(json!(failure));
                }
            }
        }

        Ok(Payload::from_pairs([
            ("results", Value::Array(values)),
            ("failures", Value::Array(failures)),
        ]))
    }
}

/// Graph node running the coordinator protocol over a payload field
pub struct CoordinatorNode {
    coordinator: Coordinator,
    batch_field: String,
    fallback_field: Option<String>,
    results_field: String,
    failures_field: String,
}

impl CoordinatorNode {
    pub fn new(coordinator: Coordinator, batch_field: impl Into<String>) -> Self {
        Self {
            coordinator,
            batch_field: batch_field.into(),
            fallback_field: None,
            results_field: "results".to_string(),
            failures_field: "failures".to_string(),
        }
    }

    /// Field used as a one-element batch when the batch field is absent
    pub fn with_fallback(mut self, field: impl Into<String>) -> Self {
        self.fallback_field = Some(field.into());
        self
    }

    pub fn with_output_fields(
        mut self,
        results: impl Into<String>,
        failures: impl Into<String>,
    ) -> Self {
        self.results_field = results.into();
        self.failures_field = failures.into();
        self
    }

    fn batch_from(&self, fields: &Payload) -> Result<SubTaskBatch, CoordinatorError> {
        match fields.get(&self.batch_field) {
            Some(value) if !value.is_null() => SubTaskBatch::from_value(value),
            _ => {
                let fallback = self
                    .fallback_field
                    .as_ref()
                    .and_then(|f| fields.get(f))
                    .ok_or_else(|| {
                        CoordinatorError::InvalidBatch(format!(
                            "field '{}' is missing and no fallback is set",
                            self.batch_field
                        ))
                    })?;
                Ok(SubTaskBatch::single(fallback.clone()))
            }
        }
    }
}

#[async_trait]
impl Node for CoordinatorNode {
    async fn invoke(&self, input: NodeInput) -> Result<Payload, NodeError> {
        let batch = self.batch_from(&input.fields)?;
        log::info!(
            "Coordinator {} dispatching {} sub-tasks",
            input.node,
            batch.len()
        );

        let results = self.coordinator.dispatch(&batch).await;
        let mut aggregate = self.coordinator.aggregate(results)?;

        let mut output = Payload::new();
        output.insert(
            self.results_field.clone(),
            aggregate.remove("results").unwrap_or(Value::Null),
        );
        output.insert(
            self.failures_field.clone(),
            aggregate.remove("failures").unwrap_or(Value::Null),
        );
        Ok(output)
    }

    fn uses_slot(&self) -> bool {
        false
    }
}
