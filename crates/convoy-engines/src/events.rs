// crates/convoy-engines/src/events.rs

//! Step event sinks
//!
//! The step runner reports `step:start` / `step:complete` / `step:error`
//! through an [`EventSink`]. The channel sink fans events out to any number
//! of subscribers (dashboards, tests); the log sink writes them to the log.

use async_trait::async_trait;
use convoy_core::traits::EventSink;
use convoy_core::types::{StepEvent, StepEventKind};
use log::{debug, warn};
use tokio::sync::broadcast;

/// Sink that drops all events.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn emit(&self, _event: StepEvent) {}
}

/// Sink that writes events to the process log.
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn emit(&self, event: StepEvent) {
        match event.kind {
            StepEventKind::Error => warn!(
                "{} job={} step={} task={} error={}",
                event.kind,
                event.job_id,
                event.step_id,
                event.task,
                event.error.as_deref().unwrap_or("-")
            ),
            _ => debug!(
                "{} job={} step={} task={}",
                event.kind, event.job_id, event.step_id, event.task
            ),
        }
    }
}

/// Sink that broadcasts events to subscribers.
pub struct ChannelEventSink {
    sender: broadcast::Sender<StepEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: StepEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
