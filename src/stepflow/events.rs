// SPDX-License-Identifier: MIT

//! Step event stream
//!
//! The engine publishes one `StepEvent` per checkpoint written by a step.
//! Delivery is at-least-once from an observer's point of view (a resumed run
//! may replay a step), so consumers deduplicate on `(run_id, step_seq)`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;

use crate::stepflow::workflow::state::{RunId, RunStatus};

/// Notification that a step was checkpointed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub run_id: RunId,
    pub step_seq: u64,
    /// Nodes invoked during the step
    pub nodes: Vec<String>,
    pub status: RunStatus,
}

impl StepEvent {
    /// Deduplication key
    pub fn key(&self) -> (RunId, u64) {
        (self.run_id.clone(), self.step_seq)
    }
}

/// Broadcast channel for step events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StepEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: StepEvent) {
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            log::trace!("Step event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.sender.subscribe()),
        }
    }
}

/// Stream of step events; lagged gaps are logged and skipped
pub struct EventStream {
    inner: BroadcastStream<StepEvent>,
}

impl Stream for EventStream {
    type Item = StepEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    log::warn!("Event subscriber lagged, {} events missed", missed);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Tracks which steps an observer already handled
#[derive(Debug, Default)]
pub struct SeenSteps {
    seen: HashSet<(RunId, u64)>,
}

impl SeenSteps {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time an event's key is observed
    pub fn first_time(&mut self, event: &StepEvent) -> bool {
        self.seen.insert(event.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn event(seq: u64) -> StepEvent {
        StepEvent {
            run_id: RunId::from("run-1"),
            step_seq: seq,
            nodes: vec!["Analyze".to_string()],
            status: RunStatus::Running,
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut stream = bus.subscribe();

        bus.publish(event(1));
        bus.publish(event(2));

        assert_eq!(stream.next().await.unwrap().step_seq, 1);
        assert_eq!(stream.next().await.unwrap().step_seq, 2);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_gap() {
        let bus = EventBus::new(2);
        let mut stream = bus.subscribe();

        for seq in 1..=5 {
            bus.publish(event(seq));
        }

        // Oldest events were overwritten; the stream resumes at what is left
        assert_eq!(stream.next().await.unwrap().step_seq, 4);
        assert_eq!(stream.next().await.unwrap().step_seq, 5);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(1);
        bus.publish(event(1));
    }

    #[test]
    fn test_seen_steps_deduplicates() {
        let mut seen = SeenSteps::new();
        assert!(seen.first_time(&event(1)));
        assert!(!seen.first_time(&event(1)));
        assert!(seen.first_time(&event(2)));
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(event(3)).unwrap();
        assert_eq!(json["runId"], "run-1");
        assert_eq!(json["stepSeq"], 3);
        assert_eq!(json["status"], "Running");
    }
}
