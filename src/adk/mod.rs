// SPDX-License-Identifier: MIT

pub mod agents;
pub mod error;
pub mod node;
pub mod worker;
