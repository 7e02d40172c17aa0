// SPDX-License-Identifier: MIT

pub mod checkpoint;
pub mod config;
pub mod events;
pub mod workflow;
