// SPDX-License-Identifier: MIT

//! Engine configuration
//!
//! Values come from the `engine:` section of a graph file, fall back to the
//! defaults below, and can be overridden with `STEPFLOW_*` environment
//! variables (a `.env` file is honoured by the binary).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::adk::error::StepflowError;

/// Exponential backoff retry policy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy with the given attempt bound and no sleeping between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Attempt bound, never below one
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the attempt following `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let millis = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis((millis as u64).min(self.max_delay_ms))
    }
}

/// Runtime knobs for the execution engine
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    /// Default retry policy for node invocations
    pub retry: RetryPolicy,
    /// Retry policy for checkpoint writes that hit a transient store error
    pub checkpoint_retry: RetryPolicy,
    /// Default per-invocation timeout; descriptors may override it
    pub node_timeout_ms: Option<u64>,
    /// Concurrent node and worker invocations across all runs
    pub max_concurrent_invocations: usize,
    /// Steps after which a run is failed as a suspected cycle
    pub max_steps: u64,
    /// Lease time-to-live; renewed on every step
    pub lease_ttl_ms: u64,
    /// Capacity of the step event channel
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            checkpoint_retry: RetryPolicy {
                max_attempts: 5,
                ..RetryPolicy::default()
            },
            node_timeout_ms: Some(300_000),
            max_concurrent_invocations: 16,
            max_steps: 100,
            lease_ttl_ms: 60_000,
            event_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Apply `STEPFLOW_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self, StepflowError> {
        if let Some(v) = env_number("STEPFLOW_MAX_CONCURRENCY")? {
            self.max_concurrent_invocations = v as usize;
        }
        if let Some(v) = env_number("STEPFLOW_MAX_STEPS")? {
            self.max_steps = v;
        }
        if let Some(v) = env_number("STEPFLOW_LEASE_TTL_MS")? {
            self.lease_ttl_ms = v;
        }
        if let Some(v) = env_number("STEPFLOW_NODE_TIMEOUT_MS")? {
            self.node_timeout_ms = Some(v);
        }
        if let Some(v) = env_number("STEPFLOW_RETRY_ATTEMPTS")? {
            self.retry.max_attempts = v as u32;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), StepflowError> {
        if self.max_concurrent_invocations == 0 {
            return Err(StepflowError::config(
                "max_concurrent_invocations must be at least 1",
            ));
        }
        if self.event_buffer == 0 {
            return Err(StepflowError::config("event_buffer must be at least 1"));
        }
        if self.max_steps == 0 {
            return Err(StepflowError::config("max_steps must be at least 1"));
        }
        // Leases are renewed every third of the ttl while nodes run
        if self.lease_ttl_ms < MIN_LEASE_TTL_MS {
            return Err(StepflowError::config(format!(
                "lease_ttl_ms must be at least {}",
                MIN_LEASE_TTL_MS
            )));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// How often a step in progress renews its lease
    pub fn lease_renewal(&self) -> Duration {
        Duration::from_millis((self.lease_ttl_ms / 3).max(1))
    }
}

const MIN_LEASE_TTL_MS: u64 = 30;

fn env_number(key: &str) -> Result<Option<u64>, StepflowError> {
    match std::env::var(key) {
        Ok(raw) => {
            raw.trim().parse::<u64>().map(Some).map_err(|_| {
                StepflowError::config(format!("{} must be a number, got '{}'", key, raw))
            })
        }
        Err(_) => Ok(None),
    }
}
