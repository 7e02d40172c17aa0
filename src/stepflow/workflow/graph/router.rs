// SPDX-License-Identifier: MIT

//! Edge evaluation
//!
//! For each node that just completed, outgoing edges are checked in
//! declaration order. The first matching plain edge picks that node's
//! successor; every matching fan-out edge adds all of its targets. The
//! union over all completed nodes is deduplicated, so fan-in schedules a
//! shared successor once.

use std::collections::BTreeSet;

use super::types::WorkflowGraph;
use crate::adk::error::RoutingError;
use crate::stepflow::workflow::state::Payload;

pub struct Router<'g> {
    graph: &'g WorkflowGraph,
}

impl<'g> Router<'g> {
    pub fn new(graph: &'g WorkflowGraph) -> Self {
        Self { graph }
    }

    /// Next node set, sorted by name; empty when every completed node is terminal
    pub fn route(
        &self,
        completed: &[String],
        payload: &Payload,
    ) -> Result<Vec<String>, RoutingError> {
        let mut next: BTreeSet<String> = BTreeSet::new();

        for node in completed {
            if self.graph.is_terminal(node) {
                log::debug!("Node {} is terminal", node);
                continue;
            }

            let mut matched = false;
            let mut plain_taken = false;
            for edge in self.graph.outgoing(node) {
                if edge.fan_out {
                    if edge.matches(payload) {
                        matched = true;
                        next.extend(self.checked_targets(node, &edge.to)?.iter().cloned());
                    }
                } else if !plain_taken && edge.matches(payload) {
                    matched = true;
                    plain_taken = true;
                    next.extend(self.checked_targets(node, &edge.to)?.iter().cloned());
                }
            }

            if !matched {
                return Err(RoutingError::NoMatch { node: node.clone() });
            }
        }

        Ok(next.into_iter().collect())
    }

    fn checked_targets<'a>(
        &self,
        from: &str,
        targets: &'a [String],
    ) -> Result<&'a [String], RoutingError> {
        match targets.iter().find(|t| !self.graph.registry.contains(t)) {
            Some(unknown) => Err(RoutingError::UnknownTarget {
                from: from.to_string(),
                to: unknown.clone(),
            }),
            None => Ok(targets),
        }
    }
}
