// SPDX-License-Identifier: MIT

//! Graph-based workflow execution
//!
//! This module provides the graph model, the router that picks the next
//! node set after each step, and the engine that drives runs step by step.

pub mod executor;
pub mod router;
pub mod types;

pub use executor::{ActiveRun, Engine, RunControl, RunHandle, RunReport, StepOutcome};
pub use router::Router;
pub use types::{Edge, Predicate, WorkflowGraph};
