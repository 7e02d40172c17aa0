// SPDX-License-Identifier: MIT

//! State management for graph workflows
//!
//! This module provides:
//! - `WorkflowState` - the run document persisted in every checkpoint
//! - `Payload` - ordered field map with reducer-based merging
//! - `StateSchema` - declared field types and reducers

mod payload;
mod run;
mod schema;

pub use payload::{is_extension_field, Payload, EXTENSION_PREFIX};
pub use run::{FailureKind, FailureRecord, RunId, RunStatus, WorkflowState};
pub use schema::{FieldType, ReducerType, StateFieldDef, StateSchema};
