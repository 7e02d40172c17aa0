//! Graph workflow executor
//!
//! A run advances one step at a time. A step dispatches every pending node as
//! its own task, waits for all of them, merges their outputs in node-name
//! order, routes to the next node set and writes a checkpoint. Nothing of the
//! next step is dispatched before that checkpoint is durable.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use super::router::Router;
use super::types::WorkflowGraph;
use crate::adk::error::{NodeError, RoutingError, StepflowError, StoreError, WorkflowError};
use crate::adk::node::NodeInput;
use crate::stepflow::checkpoint::{Checkpoint, CheckpointStore, InFlight, Lease};
use crate::stepflow::config::EngineConfig;
use crate::stepflow::events::{EventBus, EventStream, StepEvent};
use crate::stepflow::workflow::recovery::RecoveryManager;
use crate::stepflow::workflow::registry::RegisteredNode;
use crate::stepflow::workflow::state::{
    FailureKind, FailureRecord, Payload, RunId, RunStatus, WorkflowState,
};

/// Cancel and suspend requests for a live run
#[derive(Debug, Default)]
pub struct RunControl {
    cancel: AtomicBool,
    suspend: AtomicBool,
}

impl RunControl {
    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn take_suspend(&self) -> bool {
        self.suspend.swap(false, Ordering::SeqCst)
    }
}

/// A run this process holds the lease for
pub struct ActiveRun {
    pub state: WorkflowState,
    pub lease: Lease,
    /// Dispatch pending interrupt nodes instead of suspending again
    pub interrupt_released: bool,
    control: Arc<RunControl>,
}

impl ActiveRun {
    pub fn new(state: WorkflowState, lease: Lease) -> Self {
        Self {
            state,
            lease,
            interrupt_released: false,
            control: Arc::new(RunControl::default()),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.state.run_id
    }
}

/// Result of one step
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// State as checkpointed at the end of the step
    pub state: WorkflowState,
    /// Nodes scheduled for the following step
    pub next_nodes: Vec<String>,
    /// The run left the Running status
    pub done: bool,
}

/// Handle to a run driven in the background
pub struct RunHandle {
    pub run_id: RunId,
    pub status: RunStatus,
    join: JoinHandle<Result<WorkflowState, StepflowError>>,
}

impl RunHandle {
    /// Wait for the run to stop driving and return its final state
    pub async fn wait(self) -> Result<WorkflowState, StepflowError> {
        self.join.await?
    }
}

/// Externally visible summary of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub step_seq: u64,
    pub history: Vec<String>,
    pub pending: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub review: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl RunReport {
    fn from_state(state: WorkflowState, include_payload: bool) -> Self {
        Self {
            run_id: state.run_id,
            status: state.status,
            step_seq: state.step_seq,
            history: state.history,
            pending: state.pending,
            failure: state.failure,
            review: state.review,
            payload: include_payload.then_some(state.payload),
        }
    }
}

/// What happened to one scheduled node
enum Invocation {
    Completed {
        node: String,
        output: Payload,
    },
    Failed(FailureRecord),
    /// Not started, or stopped retrying, because a sibling failed
    Halted,
}

/// Everything a node task needs, cheap to clone into it
#[derive(Clone)]
struct DispatchContext {
    graph: Arc<WorkflowGraph>,
    config: Arc<EngineConfig>,
    limiter: Arc<Semaphore>,
    halt: Arc<AtomicBool>,
}

/// State-graph execution engine
#[derive(Clone)]
pub struct Engine {
    graph: Arc<WorkflowGraph>,
    store: Arc<dyn CheckpointStore>,
    config: Arc<EngineConfig>,
    limiter: Arc<Semaphore>,
    events: EventBus,
    controls: Arc<Mutex<HashMap<RunId, Arc<RunControl>>>>,
}

impl Engine {
    pub fn new(
        graph: WorkflowGraph,
        store: Arc<dyn CheckpointStore>,
        config: EngineConfig,
    ) -> Result<Self, StepflowError> {
        config.validate()?;
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_invocations));
        Ok(Self {
            graph: Arc::new(graph),
            store,
            events: EventBus::new(config.event_buffer),
            config: Arc::new(config),
            limiter,
            controls: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Share a concurrency limiter with coordinator workers
    pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn CheckpointStore> {
        self.store.clone()
    }

    pub fn recovery(&self) -> RecoveryManager {
        RecoveryManager::new(
            self.store.clone(),
            self.graph.clone(),
            self.config.lease_ttl(),
        )
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Create a run and write its initial checkpoint, without driving it
    pub async fn start(&self, entry: &str, payload: Payload) -> Result<ActiveRun, StepflowError> {
        if !self.graph.registry.contains(entry) {
            return Err(WorkflowError::UnknownEntry(entry.to_string()).into());
        }

        let run_id = RunId::generate();
        let lease = self.store.claim(&run_id, self.config.lease_ttl()).await?;
        let mut run = ActiveRun::new(WorkflowState::initial(run_id, entry, payload), lease);
        self.persist(&mut run.lease, &run.state).await?;

        log::info!(
            "Run {} started at {} on graph {}",
            run.run_id(),
            entry,
            self.graph.name
        );
        Ok(run)
    }

    /// Start a run and drive it in the background
    pub async fn submit(&self, entry: &str, payload: Payload) -> Result<RunHandle, StepflowError> {
        let run = self.start(entry, payload).await?;
        Ok(self.spawn(run).await)
    }

    /// Start a run and drive it to completion
    pub async fn run(&self, entry: &str, payload: Payload) -> Result<WorkflowState, StepflowError> {
        self.submit(entry, payload).await?.wait().await
    }

    /// Resume a run through the Recovery Manager and drive it to completion
    pub async fn resume(
        &self,
        run_id: &RunId,
        input: Option<Payload>,
    ) -> Result<WorkflowState, StepflowError> {
        let run = self.recovery().resume(run_id, input).await?;
        self.spawn(run).await.wait().await
    }

    /// Clear manual review flags on a run
    pub async fn clear_review(&self, run_id: &RunId) -> Result<WorkflowState, StepflowError> {
        Ok(self.recovery().clear_review(run_id).await?)
    }

    async fn spawn(&self, run: ActiveRun) -> RunHandle {
        self.track(&run).await;
        let run_id = run.run_id().clone();
        let status = run.state.status;
        let engine = self.clone();
        let join = tokio::spawn(async move { engine.drive(run).await });
        RunHandle {
            run_id,
            status,
            join,
        }
    }

    async fn track(&self, run: &ActiveRun) {
        let mut controls = self.controls.lock().await;
        controls.insert(run.run_id().clone(), run.control.clone());
    }

    /// Step a run until it leaves Running, then release its lease
    pub async fn drive(&self, mut run: ActiveRun) -> Result<WorkflowState, StepflowError> {
        self.track(&run).await;
        let result = loop {
            match self.step(&mut run).await {
                Ok(outcome) if outcome.done => break Ok(outcome.state),
                Ok(_) => continue,
                Err(e) => break Err(e),
            }
        };
        self.controls.lock().await.remove(run.run_id());

        match result {
            Ok(state) => {
                self.store.release(&run.lease).await?;
                log::info!(
                    "Run {} stopped at step {} with status {}",
                    state.run_id,
                    state.step_seq,
                    state.status
                );
                Ok(state)
            }
            Err(e) => {
                // The lease is left to expire so recovery sees what was in flight
                log::error!("Run {} aborted: {}", run.run_id(), e);
                Err(e)
            }
        }
    }

    /// Execute one step of a run
    pub async fn step(&self, run: &mut ActiveRun) -> Result<StepOutcome, StepflowError> {
        if run.state.status != RunStatus::Running {
            return Ok(StepOutcome {
                state: run.state.clone(),
                next_nodes: Vec::new(),
                done: true,
            });
        }

        if run.control.cancel_requested() {
            let mut next = run.state.next();
            next.fail(FailureRecord::new(FailureKind::Cancelled, "cancelled"));
            log::info!(
                "Run {} cancelled before step {}",
                run.run_id(),
                next.step_seq
            );
            return self.commit(run, next, Vec::new()).await;
        }

        if run.state.step_seq >= self.config.max_steps {
            let mut next = run.state.next();
            next.fail(FailureRecord::new(
                FailureKind::StepLimit,
                format!("run exceeded {} steps", self.config.max_steps),
            ));
            log::error!("Run {} exceeded the step limit", run.run_id());
            return self.commit(run, next, Vec::new()).await;
        }

        if run.state.pending.is_empty() {
            let mut next = run.state.next();
            next.status = RunStatus::Completed;
            return self.commit(run, next, Vec::new()).await;
        }

        let interrupted = !run.interrupt_released
            && run
                .state
                .pending
                .iter()
                .any(|n| self.graph.interrupt_before.contains(n));
        if run.control.take_suspend() || interrupted {
            let mut next = run.state.next();
            next.status = RunStatus::Suspended;
            log::info!(
                "Run {} suspended before {:?}",
                run.run_id(),
                run.state.pending
            );
            return self.commit(run, next, Vec::new()).await;
        }
        run.interrupt_released = false;

        let scheduled = run.state.pending.clone();
        let ttl = self.config.lease_ttl();
        let in_flight = InFlight::new(run.state.step_seq, scheduled.iter().cloned());
        self.store
            .heartbeat(&mut run.lease, &in_flight, ttl)
            .await?;
        log::info!(
            "Run {} step {}: dispatching {:?}",
            run.run_id(),
            run.state.step_seq + 1,
            scheduled
        );

        // Keep the lease alive for as long as the nodes run
        let halt = Arc::new(AtomicBool::new(false));
        let invocations = {
            let dispatch = self.dispatch(&run.state, &scheduled, halt.clone());
            tokio::pin!(dispatch);
            let mut renewal = tokio::time::interval(self.config.lease_renewal());
            renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
            renewal.tick().await;
            let invocations = loop {
                tokio::select! {
                    invocations = &mut dispatch => break invocations,
                    _ = renewal.tick() => {
                        if let Err(e) = self.store.heartbeat(&mut run.lease, &in_flight, ttl).await {
                            halt.store(true, Ordering::SeqCst);
                            log::error!(
                                "Run {} lost its lease during step {}: {}",
                                run.state.run_id,
                                run.state.step_seq + 1,
                                e
                            );
                            return Err(e.into());
                        }
                    }
                }
            };
            invocations
        };

        let mut outputs = BTreeMap::new();
        let mut failures = Vec::new();
        for invocation in invocations {
            match invocation {
                Invocation::Completed { node, output } => {
                    outputs.insert(node, output);
                }
                Invocation::Failed(record) => failures.push(record),
                Invocation::Halted => {}
            }
        }

        let mut next = run.state.next();
        if !failures.is_empty() {
            failures.sort_by(|a, b| a.node.cmp(&b.node));
            let record = failures.remove(0);
            log::error!(
                "Run {} failed at {:?}: {}",
                run.run_id(),
                record.node,
                record.message
            );
            next.fail(record);
            return self.commit(run, next, scheduled).await;
        }

        for (node, output) in &outputs {
            for (key, value) in output.iter() {
                next.payload
                    .apply(key, value.clone(), self.graph.schema.reducer_for(key));
            }
            next.history.push(node.clone());
        }

        let completed = &next.history[run.state.history.len()..];
        let routed = Router::new(&self.graph).route(completed, &next.payload);

        if run.control.cancel_requested() {
            next.pending = routed.unwrap_or_default();
            next.fail(FailureRecord::new(FailureKind::Cancelled, "cancelled"));
            log::info!(
                "Run {} cancelled after step {}",
                run.run_id(),
                next.step_seq
            );
            return self.commit(run, next, scheduled).await;
        }

        match routed {
            Ok(pending) if pending.is_empty() => {
                next.pending = pending;
                next.status = RunStatus::Completed;
            }
            Ok(pending) => next.pending = pending,
            Err(e) => {
                log::error!("Run {} routing failed: {}", run.run_id(), e);
                let node = match &e {
                    RoutingError::NoMatch { node } => node.clone(),
                    RoutingError::UnknownTarget { from, .. } => from.clone(),
                };
                next.pending.clear();
                next.fail(
                    FailureRecord::new(FailureKind::GraphConfiguration, e.to_string()).at_node(
                        node,
                        1,
                        next.payload.clone(),
                    ),
                );
            }
        }

        self.commit(run, next, scheduled).await
    }

    /// Run every scheduled node as its own task and collect the results
    ///
    /// Dropping the returned future aborts every node task still running.
    async fn dispatch(
        &self,
        state: &WorkflowState,
        scheduled: &[String],
        halt: Arc<AtomicBool>,
    ) -> Vec<Invocation> {
        let ctx = DispatchContext {
            graph: self.graph.clone(),
            config: self.config.clone(),
            limiter: self.limiter.clone(),
            halt,
        };

        let mut tasks = JoinSet::new();
        let mut invocations = Vec::with_capacity(scheduled.len());
        for name in scheduled {
            let Some(registered) = self.graph.registry.get(name).cloned() else {
                ctx.halt.store(true, Ordering::SeqCst);
                invocations.push(Invocation::Failed(
                    FailureRecord::new(
                        FailureKind::GraphConfiguration,
                        format!(
                            "graph configuration error: node '{}' is not registered",
                            name
                        ),
                    )
                    .at_node(name.clone(), 0, Payload::new()),
                ));
                continue;
            };
            let fields = registered.descriptor.input_view(&state.payload);
            tasks.spawn(invoke_node(
                ctx.clone(),
                registered,
                state.run_id.clone(),
                fields,
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(invocation) => invocations.push(invocation),
                Err(e) => {
                    ctx.halt.store(true, Ordering::SeqCst);
                    invocations.push(Invocation::Failed(FailureRecord::new(
                        FailureKind::Unrecoverable,
                        format!("node task aborted: {}", e),
                    )));
                }
            }
        }
        invocations
    }

    /// Checkpoint the step result, clear the in-flight set and notify observers
    async fn commit(
        &self,
        run: &mut ActiveRun,
        next: WorkflowState,
        nodes: Vec<String>,
    ) -> Result<StepOutcome, StepflowError> {
        self.persist(&mut run.lease, &next).await?;

        self.events.publish(StepEvent {
            run_id: next.run_id.clone(),
            step_seq: next.step_seq,
            nodes,
            status: next.status,
        });

        run.state = next;
        let done = run.state.status != RunStatus::Running;
        Ok(StepOutcome {
            state: run.state.clone(),
            next_nodes: if done {
                Vec::new()
            } else {
                run.state.pending.clone()
            },
            done,
        })
    }

    /// Save a checkpoint, retrying transient store errors without re-running nodes
    async fn persist(&self, lease: &mut Lease, state: &WorkflowState) -> Result<(), StepflowError> {
        let checkpoint = Checkpoint::capture(state);
        let policy = &self.config.checkpoint_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.save(&checkpoint).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < policy.attempts() => {
                    log::warn!(
                        "Checkpoint {} of run {} not saved (attempt {}): {}",
                        state.step_seq,
                        state.run_id,
                        attempt,
                        e
                    );
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.store
            .heartbeat(lease, &InFlight::none(), self.config.lease_ttl())
            .await?;
        Ok(())
    }

    /// Request cancellation of a run
    ///
    /// A run driven by this engine stops at the next step boundary. A run no
    /// engine is driving is claimed and its cancelled checkpoint written here.
    pub async fn cancel(&self, run_id: &RunId) -> Result<(), StepflowError> {
        if let Some(control) = self.controls.lock().await.get(run_id) {
            control.cancel.store(true, Ordering::SeqCst);
            log::info!("Cancel requested for live run {}", run_id);
            return Ok(());
        }

        let latest = self
            .store
            .load_latest(run_id)
            .await?
            .ok_or_else(|| WorkflowError::RunNotFound(run_id.clone()))?;
        if latest.state.status.is_terminal() {
            return Err(WorkflowError::RunFinished(run_id.clone()).into());
        }

        let mut lease = self.store.claim(run_id, self.config.lease_ttl()).await?;
        let result = async {
            let current = self
                .store
                .load_latest(run_id)
                .await?
                .ok_or_else(|| StoreError::LeaseLost(run_id.clone()))?;
            let mut next = current.state.next();
            next.fail(FailureRecord::new(FailureKind::Cancelled, "cancelled"));
            self.persist(&mut lease, &next).await?;
            self.events.publish(StepEvent {
                run_id: next.run_id.clone(),
                step_seq: next.step_seq,
                nodes: Vec::new(),
                status: next.status,
            });
            Ok::<_, StepflowError>(())
        }
        .await;
        self.store.release(&lease).await?;
        log::info!("Run {} cancelled while idle", run_id);
        result
    }

    /// Ask a live run to suspend at its next step boundary
    ///
    /// Returns false when this engine is not driving the run.
    pub async fn suspend(&self, run_id: &RunId) -> bool {
        match self.controls.lock().await.get(run_id) {
            Some(control) => {
                control.suspend.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Current status from the latest checkpoint
    pub async fn status(
        &self,
        run_id: &RunId,
        include_payload: bool,
    ) -> Result<RunReport, StepflowError> {
        let latest = self
            .store
            .load_latest(run_id)
            .await?
            .ok_or_else(|| WorkflowError::RunNotFound(run_id.clone()))?;
        Ok(RunReport::from_state(latest.state, include_payload))
    }

    /// Every checkpoint of a run in order
    pub async fn checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, StepflowError> {
        Ok(self.store.load_all(run_id).await?)
    }
}

/// Invoke one node with timeout, retry and the shared concurrency limit
async fn invoke_node(
    ctx: DispatchContext,
    registered: RegisteredNode,
    run_id: RunId,
    fields: Payload,
) -> Invocation {
    let descriptor = &registered.descriptor;
    let policy = descriptor
        .retry
        .clone()
        .unwrap_or_else(|| ctx.config.retry.clone());
    let timeout_ms = descriptor.timeout_ms.or(ctx.config.node_timeout_ms);
    let fail = |kind: FailureKind, attempts: u32, message: String| {
        ctx.halt.store(true, Ordering::SeqCst);
        Invocation::Failed(FailureRecord::new(kind, message).at_node(
            descriptor.name.clone(),
            attempts,
            fields.clone(),
        ))
    };

    let missing = descriptor.missing_inputs(&fields);
    if !missing.is_empty() {
        return fail(
            FailureKind::Unrecoverable,
            0,
            format!("missing required input fields {:?}", missing),
        );
    }

    let mut attempt = 0;
    loop {
        attempt += 1;

        let permit = if registered.node.uses_slot() {
            match ctx.limiter.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return fail(
                        FailureKind::Unrecoverable,
                        attempt - 1,
                        "concurrency limiter closed".to_string(),
                    )
                }
            }
        } else {
            None
        };
        if ctx.halt.load(Ordering::SeqCst) {
            log::debug!("Node {} halted before attempt {}", descriptor.name, attempt);
            return Invocation::Halted;
        }

        let input = NodeInput {
            run_id: run_id.clone(),
            node: descriptor.name.clone(),
            attempt,
            fields: fields.clone(),
        };
        let result = match timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), registered.node.invoke(input))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::Timeout { after_ms: ms }),
                }
            }
            None => registered.node.invoke(input).await,
        };

        // A terminal outcome raises `halt` before the slot is released, so a
        // sibling waiting on the limiter never starts after a failure
        match result {
            Ok(output) => {
                return match descriptor.check_output(&output, &ctx.graph.schema) {
                    Ok(()) => {
                        log::debug!("Node {} completed on attempt {}", descriptor.name, attempt);
                        Invocation::Completed {
                            node: descriptor.name.clone(),
                            output,
                        }
                    }
                    Err(message) => fail(FailureKind::OutputContract, attempt, message),
                };
            }
            Err(e) if e.is_recoverable() && attempt < policy.attempts() => {
                if ctx.halt.load(Ordering::SeqCst) {
                    return Invocation::Halted;
                }
                drop(permit);
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "Node {} attempt {} failed: {}; retrying in {:?}",
                    descriptor.name,
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_recoverable() => {
                return fail(
                    FailureKind::RetriesExhausted,
                    attempt,
                    format!("retries exhausted: {}", e),
                );
            }
            Err(e) => return fail(FailureKind::Unrecoverable, attempt, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adk::error::RecoveryError;
    use crate::adk::node::{FnNode, Node};
    use crate::stepflow::checkpoint::InMemoryStore;
    use crate::stepflow::config::RetryPolicy;
    use crate::stepflow::workflow::graph::types::Edge;
    use crate::stepflow::workflow::registry::NodeDescriptor;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Node that fails recoverably a fixed number of times before succeeding
    struct FlakyNode {
        failures: u32,
        calls: Arc<AtomicU32>,
        output: &'static str,
    }

    #[async_trait]
    impl Node for FlakyNode {
        async fn invoke(&self, input: NodeInput) -> Result<Payload, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if input.attempt <= self.failures {
                return Err(NodeError::recoverable("transient"));
            }
            Ok(Payload::from_pairs([(self.output, json!(input.attempt))]))
        }
    }

    /// Node that never finishes in time
    struct SlowNode;

    #[async_trait]
    impl Node for SlowNode {
        async fn invoke(&self, _input: NodeInput) -> Result<Payload, NodeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Payload::new())
        }
    }

    /// Node that sleeps, then either fails for good or records that it finished
    struct Sleeper {
        delay: Duration,
        fail: bool,
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Node for Sleeper {
        async fn invoke(&self, _input: NodeInput) -> Result<Payload, NodeError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(NodeError::unrecoverable("declined"));
            }
            self.finished.store(true, Ordering::SeqCst);
            Ok(Payload::new())
        }
    }

    fn sleeper(ms: u64, finished: &Arc<AtomicBool>) -> Arc<dyn Node> {
        Arc::new(Sleeper {
            delay: Duration::from_millis(ms),
            fail: false,
            finished: finished.clone(),
        })
    }

    fn short_lease_config() -> EngineConfig {
        EngineConfig {
            lease_ttl_ms: 90,
            node_timeout_ms: None,
            ..fast_config()
        }
    }

    fn constant(field: &'static str, value: serde_json::Value) -> Arc<dyn Node> {
        Arc::new(FnNode::new(move |_: NodeInput| {
            Ok(Payload::from_pairs([(field, value.clone())]))
        }))
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy::immediate(3),
            checkpoint_retry: RetryPolicy::immediate(3),
            ..EngineConfig::default()
        }
    }

    fn engine(graph: WorkflowGraph) -> (Engine, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let engine = Engine::new(graph, store.clone(), fast_config()).unwrap();
        (engine, store)
    }

    fn two_step_graph() -> WorkflowGraph {
        WorkflowGraph::new("two-step")
            .node(
                NodeDescriptor::new("A").with_outputs(["a"]),
                constant("a", json!(1)),
            )
            .unwrap()
            .node(
                NodeDescriptor::new("B")
                    .with_inputs(["a"])
                    .with_outputs(["b"]),
                constant("b", json!(2)),
            )
            .unwrap()
            .edge(Edge::new("A", "B"))
    }

    #[tokio::test]
    async fn test_step_by_step() {
        let (engine, store) = engine(two_step_graph());
        let mut run = engine.start("A", Payload::new()).await.unwrap();

        let first = engine.step(&mut run).await.unwrap();
        assert!(!first.done);
        assert_eq!(first.next_nodes, vec!["B"]);
        assert_eq!(first.state.step_seq, 1);
        assert_eq!(first.state.history, vec!["A"]);

        let second = engine.step(&mut run).await.unwrap();
        assert!(second.done);
        assert_eq!(second.state.status, RunStatus::Completed);
        assert_eq!(second.state.payload.get("b"), Some(&json!(2)));

        let saved = store.load_all(run.run_id()).await.unwrap();
        assert_eq!(saved.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_entry_rejected() {
        let (engine, _) = engine(two_step_graph());
        let err = engine.start("Nope", Payload::new()).await.err().unwrap();
        assert!(matches!(
            err,
            StepflowError::Workflow(WorkflowError::UnknownEntry(_))
        ));
    }

    #[tokio::test]
    async fn test_recoverable_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let graph = WorkflowGraph::new("flaky")
            .node(
                NodeDescriptor::new("A").with_outputs(["a"]),
                Arc::new(FlakyNode {
                    failures: 2,
                    calls: calls.clone(),
                    output: "a",
                }),
            )
            .unwrap();
        let (engine, _) = engine(graph);

        let state = engine.run("A", Payload::new()).await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.payload.get("a"), Some(&json!(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let graph = WorkflowGraph::new("flaky")
            .node(
                NodeDescriptor::new("A").with_outputs(["a"]),
                Arc::new(FlakyNode {
                    failures: 10,
                    calls: calls.clone(),
                    output: "a",
                }),
            )
            .unwrap();
        let (engine, _) = engine(graph);

        let state = engine.run("A", Payload::new()).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        let failure = state.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::RetriesExhausted);
        assert_eq!(failure.attempts, 3);
        assert!(failure.retryable);
        assert_eq!(state.pending, vec!["A"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_recoverable() {
        let graph = WorkflowGraph::new("slow")
            .node(
                NodeDescriptor::new("Slow")
                    .with_timeout_ms(10)
                    .with_retry(RetryPolicy::immediate(2)),
                Arc::new(SlowNode),
            )
            .unwrap();
        let (engine, _) = engine(graph);

        let state = engine.run("Slow", Payload::new()).await.unwrap();
        let failure = state.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::RetriesExhausted);
        assert_eq!(failure.attempts, 2);
        assert!(failure.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_unrecoverable_error_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let graph = WorkflowGraph::new("broken")
            .node(
                NodeDescriptor::new("A"),
                Arc::new(FnNode::new(move |_: NodeInput| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(NodeError::unrecoverable("bad input"))
                })),
            )
            .unwrap();
        let (engine, _) = engine(graph);

        let state = engine
            .run("A", Payload::from_pairs([("taskText", json!("X"))]))
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(
            state.failure.as_ref().unwrap().kind,
            FailureKind::Unrecoverable
        );
        assert!(!state.is_resumable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_output_contract_violation_merges_nothing() {
        let graph = WorkflowGraph::new("contract")
            .node(
                NodeDescriptor::new("A").with_outputs(["a"]),
                constant("taskText", json!("overwritten")),
            )
            .unwrap();
        let (engine, _) = engine(graph);

        let state = engine
            .run("A", Payload::from_pairs([("taskText", json!("X"))]))
            .await
            .unwrap();
        assert_eq!(
            state.failure.as_ref().unwrap().kind,
            FailureKind::OutputContract
        );
        assert_eq!(state.payload.get("taskText"), Some(&json!("X")));
        assert!(state.history.is_empty());
    }

    #[tokio::test]
    async fn test_missing_required_input_fails() {
        let (engine, _) = engine(two_step_graph());
        let mut run = engine.start("B", Payload::new()).await.unwrap();

        let outcome = engine.step(&mut run).await.unwrap();
        let failure = outcome.state.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Unrecoverable);
        assert!(failure.message.contains("missing required input"));
    }

    #[tokio::test]
    async fn test_max_steps_stops_cycles() {
        let graph = WorkflowGraph::new("loop")
            .node(
                NodeDescriptor::new("A"),
                Arc::new(FnNode::new(|_: NodeInput| Ok(Payload::new()))),
            )
            .unwrap()
            .edge(Edge::new("A", "A"));
        let store = Arc::new(InMemoryStore::new());
        let config = EngineConfig {
            max_steps: 5,
            ..fast_config()
        };
        let engine = Engine::new(graph, store, config).unwrap();

        let state = engine.run("A", Payload::new()).await.unwrap();
        assert_eq!(state.failure.unwrap().kind, FailureKind::StepLimit);
        assert_eq!(state.history.len(), 5);
        assert_eq!(state.step_seq, 6);
    }

    #[tokio::test]
    async fn test_interrupt_before_suspends() {
        let graph = two_step_graph().interrupt_before("B");
        let (engine, _) = engine(graph);

        let state = engine.run("A", Payload::new()).await.unwrap();
        assert_eq!(state.status, RunStatus::Suspended);
        assert_eq!(state.pending, vec!["B"]);
        assert_eq!(state.history, vec!["A"]);

        let resumed = engine.resume(&state.run_id, None).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.history, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_reducer_applied_on_merge() {
        let schema = serde_yaml::from_str("notes:\n  type: array\n  reducer: append\n").unwrap();
        let graph = WorkflowGraph::new("reduce")
            .with_schema(schema)
            .node(
                NodeDescriptor::new("A").with_outputs(["notes"]),
                constant("notes", json!(["second"])),
            )
            .unwrap();
        let (engine, _) = engine(graph);

        let state = engine
            .run("A", Payload::from_pairs([("notes", json!(["first"]))]))
            .await
            .unwrap();
        assert_eq!(
            state.payload.get("notes"),
            Some(&json!(["first", "second"]))
        );
    }

    #[tokio::test]
    async fn test_checkpoint_retry_does_not_rerun_nodes() {
        let calls = Arc::new(AtomicU32::new(0));
        let graph = WorkflowGraph::new("store-flaky")
            .node(
                NodeDescriptor::new("A").with_outputs(["a"]),
                Arc::new(FlakyNode {
                    failures: 0,
                    calls: calls.clone(),
                    output: "a",
                }),
            )
            .unwrap();
        let (engine, store) = engine(graph);

        let mut run = engine.start("A", Payload::new()).await.unwrap();
        store.inject_save_failures(2);
        let outcome = engine.step(&mut run).await.unwrap();

        assert_eq!(outcome.state.status, RunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.load_all(run.run_id()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fatal_store_error_surfaces() {
        let (engine, store) = engine(two_step_graph());
        let mut run = engine.start("A", Payload::new()).await.unwrap();

        store.inject_save_failures(10);
        let err = engine.step(&mut run).await.unwrap_err();
        assert!(matches!(
            err,
            StepflowError::Store(StoreError::Unavailable(_))
        ));
        assert_eq!(run.state.step_seq, 0);
    }

    #[tokio::test]
    async fn test_status_report() {
        let (engine, _) = engine(two_step_graph());
        let state = engine.run("A", Payload::new()).await.unwrap();

        let report = engine.status(&state.run_id, false).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.history, vec!["A", "B"]);
        assert!(report.payload.is_none());

        let full = engine.status(&state.run_id, true).await.unwrap();
        assert_eq!(full.payload.unwrap().get("a"), Some(&json!(1)));

        assert!(engine.status(&RunId::from("missing"), false).await.is_err());
    }

    #[tokio::test]
    async fn test_lease_is_renewed_while_nodes_run() {
        let finished = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        let graph = WorkflowGraph::new("long")
            .node(NodeDescriptor::new("Long"), sleeper(400, &finished))
            .unwrap()
            .node(
                NodeDescriptor::new("After").with_outputs(["after"]),
                Arc::new(FlakyNode {
                    failures: 0,
                    calls: calls.clone(),
                    output: "after",
                }),
            )
            .unwrap()
            .edge(Edge::new("Long", "After"));
        let store = Arc::new(InMemoryStore::new());
        let engine = Engine::new(graph, store, short_lease_config()).unwrap();

        let handle = engine.submit("Long", Payload::new()).await.unwrap();
        // Well past the ttl, with Long still running
        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = engine.recovery().resume(&handle.run_id, None).await;
        assert!(matches!(second, Err(RecoveryError::AlreadyClaimed(_))));

        let state = handle.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lost_lease_aborts_the_step() {
        let finished = Arc::new(AtomicBool::new(false));
        let graph = WorkflowGraph::new("long")
            .node(NodeDescriptor::new("Long"), sleeper(300, &finished))
            .unwrap();
        let store = Arc::new(InMemoryStore::new());
        let engine = Engine::new(graph, store.clone(), short_lease_config()).unwrap();
        let mut run = engine.start("Long", Payload::new()).await.unwrap();

        // Another owner's release drops the lease out from under the step
        let lease = run.lease.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.release(&lease).await.unwrap();
        });

        let err = engine.step(&mut run).await.unwrap_err();
        assert!(matches!(
            err,
            StepflowError::Store(StoreError::LeaseLost(_))
        ));
        assert_eq!(run.state.step_seq, 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_branch_stops_siblings_waiting_for_a_slot() {
        let unused = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        let graph = WorkflowGraph::new("narrow")
            .node(
                NodeDescriptor::new("Split").with_outputs(["go"]),
                constant("go", json!(true)),
            )
            .unwrap()
            .node(
                NodeDescriptor::new("Bad"),
                Arc::new(Sleeper {
                    delay: Duration::from_millis(30),
                    fail: true,
                    finished: unused,
                }),
            )
            .unwrap()
            .node(
                NodeDescriptor::new("Good").with_outputs(["good"]),
                Arc::new(FlakyNode {
                    failures: 0,
                    calls: calls.clone(),
                    output: "good",
                }),
            )
            .unwrap()
            .edge(Edge::fan_out("Split", ["Bad", "Good"]));
        let config = EngineConfig {
            max_concurrent_invocations: 1,
            ..fast_config()
        };
        let engine = Engine::new(graph, Arc::new(InMemoryStore::new()), config).unwrap();

        let state = engine.run("Split", Payload::new()).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        let failure = state.failure.unwrap();
        assert_eq!(failure.node.as_deref(), Some("Bad"));
        assert_eq!(failure.kind, FailureKind::Unrecoverable);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
