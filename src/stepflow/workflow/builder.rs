// SPDX-License-Identifier: MIT

//! Workflow builder - orchestrates graph construction
//!
//! This module provides the high-level Builder that loads graph definitions
//! and compiles them into executable graphs bound to registered handlers
//! and workers.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::adk::error::{StepflowError, WorkflowError};
use crate::adk::node::Node;
use crate::adk::worker::Worker;
use crate::stepflow::checkpoint::CheckpointStore;
use crate::stepflow::config::EngineConfig;
use crate::stepflow::workflow::coordinator::{Coordinator, CoordinatorNode};
use crate::stepflow::workflow::graph::{Edge, Engine, WorkflowGraph};
use crate::stepflow::workflow::loader::WorkflowLoader;
use crate::stepflow::workflow::registry::{HandlerRegistry, NodeDescriptor};
use crate::stepflow::workflow::types::{
    CoordinatorConfig, EdgeConfig, GraphDefinition, NodeConfig, NodeKind,
};

/// A validated graph together with the settings it runs under
pub struct CompiledWorkflow {
    pub graph: WorkflowGraph,
    pub config: EngineConfig,
    /// Default entry node
    pub entry: String,
    /// Concurrency limit shared by node invocations and coordinator workers
    pub limiter: Arc<Semaphore>,
}

impl CompiledWorkflow {
    /// Bind the graph to a checkpoint store
    pub fn into_engine(self, store: Arc<dyn CheckpointStore>) -> Result<Engine, StepflowError> {
        Ok(Engine::new(self.graph, store, self.config)?.with_limiter(self.limiter))
    }
}

/// High-level builder for constructing graphs from YAML definitions
pub struct Builder {
    loader: WorkflowLoader,
    registry: HandlerRegistry,
}

impl Builder {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            loader: WorkflowLoader::new(),
            registry,
        }
    }

    /// Build a graph from a YAML file path
    pub async fn build_from_file<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<CompiledWorkflow, StepflowError> {
        let def = self.loader.load_workflow(path)?;
        self.build(&def).await
    }

    /// Build a graph from a parsed definition
    pub async fn build(&self, def: &GraphDefinition) -> Result<CompiledWorkflow, StepflowError> {
        let config = def.engine.clone().with_env_overrides()?;
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_invocations));

        let mut graph = WorkflowGraph::new(def.name.clone()).with_schema(def.state.clone());
        for node_config in &def.nodes {
            let (descriptor, node) = self.compile_node(node_config, &config, &limiter).await?;
            graph = graph.node(descriptor, node)?;
        }
        for edge_config in &def.edges {
            graph = graph.edge(compile_edge(edge_config)?);
        }
        for name in &def.interrupt_before {
            graph = graph.interrupt_before(name.clone());
        }

        if !graph.registry.contains(&def.entry) {
            return Err(WorkflowError::UnknownEntry(def.entry.clone()).into());
        }
        graph.validate()?;

        log::info!(
            "Built graph '{}' with {} nodes and {} edges",
            def.name,
            graph.registry.len(),
            graph.edges.len()
        );

        Ok(CompiledWorkflow {
            graph,
            config,
            entry: def.entry.clone(),
            limiter,
        })
    }

    async fn compile_node(
        &self,
        node_config: &NodeConfig,
        config: &EngineConfig,
        limiter: &Arc<Semaphore>,
    ) -> Result<(NodeDescriptor, Arc<dyn Node>), StepflowError> {
        let mut descriptor = NodeDescriptor::new(node_config.name.clone())
            .with_inputs(node_config.inputs.iter().cloned())
            .with_optional_inputs(node_config.optional_inputs.iter().cloned());
        if !node_config.idempotent {
            descriptor = descriptor.non_idempotent();
        }
        if let Some(timeout_ms) = node_config.timeout_ms {
            descriptor = descriptor.with_timeout_ms(timeout_ms);
        }
        if let Some(retry) = &node_config.retry {
            descriptor = descriptor.with_retry(retry.clone());
        }

        match node_config.kind {
            NodeKind::Handler => {
                let handler_name = node_config.handler.as_deref().unwrap_or(&node_config.name);
                let node = self
                    .registry
                    .handler(handler_name)
                    .await
                    .ok_or_else(|| WorkflowError::MissingHandler(handler_name.to_string()))?;
                let descriptor = descriptor.with_outputs(node_config.outputs.iter().cloned());
                Ok((descriptor, node))
            }
            NodeKind::Coordinator => {
                let section = node_config
                    .coordinator
                    .as_ref()
                    .ok_or_else(|| WorkflowError::MissingCoordinator(node_config.name.clone()))?;
                let node = self
                    .compile_coordinator(&node_config.name, section, config, limiter)
                    .await?;

                let mut optional = node_config.optional_inputs.clone();
                optional.push(section.batch_field.clone());
                optional.extend(section.fallback_field.clone());
                let descriptor = descriptor.with_optional_inputs(optional).with_outputs([
                    section.results_field.clone(),
                    section.failures_field.clone(),
                ]);
                Ok((descriptor, node))
            }
        }
    }

    async fn compile_coordinator(
        &self,
        name: &str,
        section: &CoordinatorConfig,
        config: &EngineConfig,
        limiter: &Arc<Semaphore>,
    ) -> Result<Arc<dyn Node>, StepflowError> {
        let mut workers: Vec<Arc<dyn Worker>> = Vec::with_capacity(section.workers.len());
        for worker_name in &section.workers {
            let worker = self.registry.worker(worker_name).await.ok_or_else(|| {
                StepflowError::config(format!(
                    "Coordinator '{}' references unregistered worker '{}'",
                    name, worker_name
                ))
            })?;
            workers.push(worker);
        }

        let retry = section
            .retry
            .clone()
            .unwrap_or_else(|| config.retry.clone());
        let coordinator = Coordinator::new(workers, retry, section.policy, limiter.clone())
            .map_err(|e| StepflowError::config(format!("Coordinator '{}': {}", name, e)))?
            .with_timeout_ms(section.timeout_ms.or(config.node_timeout_ms));

        let mut node = CoordinatorNode::new(coordinator, section.batch_field.clone())
            .with_output_fields(
                section.results_field.clone(),
                section.failures_field.clone(),
            );
        if let Some(fallback) = &section.fallback_field {
            node = node.with_fallback(fallback.clone());
        }
        log::debug!(
            "Coordinator '{}' built with {} workers ({:?})",
            name,
            section.workers.len(),
            section.policy
        );
        Ok(Arc::new(node))
    }
}

fn compile_edge(edge_config: &EdgeConfig) -> Result<Edge, StepflowError> {
    // Plain edges keep every listed target so validation can reject ambiguity
    let edge = Edge {
        from: edge_config.from.clone(),
        to: edge_config.to.to_vec(),
        predicate: None,
        fan_out: edge_config.fan_out,
    };
    match &edge_config.when {
        Some(condition) => Ok(edge.when(condition)?),
        None => Ok(edge),
    }
}
