// SPDX-License-Identifier: MIT

pub mod builder;
pub mod condition;
pub mod coordinator;
pub mod graph;
pub mod loader;
pub mod recovery;
pub mod registry;
pub mod state;
pub mod types;
