// crates/convoy-core/src/traits.rs

//! Contracts between the execution core and its collaborators
//!
//! Backends forward resolved tasks to remote compute services; the other
//! traits are injection seams so the step runner, effect dispatcher and
//! worker pool can be assembled and tested independently.

use crate::error::Result;
use crate::types::{Job, RemoteTaskStatus, ResourcePool, StepEvent, TaskRequest};
use async_trait::async_trait;
use serde_json::Value;

/// Adapter forwarding a single task to an external compute service.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Forward the task and return its raw result. Must fail with a typed
    /// error carrying the remote message on non-2xx or an error body.
    async fn execute(&self, task: &TaskRequest) -> Result<Value>;

    /// Retrieve remote execution state for a previously submitted task.
    async fn get_status(&self, task_id: &str) -> Result<RemoteTaskStatus>;

    /// Lightweight liveness probe; callers time it out at 5 seconds.
    async fn is_healthy(&self) -> bool;

    /// Advertised capacity, when the service exposes it.
    async fn get_resources(&self) -> Option<ResourcePool> {
        None
    }

    /// Best-effort remote cancellation.
    async fn cancel(&self, _task_id: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Submission handle used by the `enqueue` effect to chain child jobs.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<String>;
}

/// Receiver for step lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: StepEvent);
}

/// Sink for pipeline progress ticks (0-100).
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, progress: u8);
}

/// Progress reporter that discards ticks.
pub struct NoopProgress;

#[async_trait]
impl ProgressReporter for NoopProgress {
    async fn report(&self, _progress: u8) {}
}

/// Pluggable sender backing the `notify` effect's email channel.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, message: &str) -> Result<()>;
}

/// Optional hook that transparently splits a single-task payload into parts
/// and merges the per-part results. Returning `None` from `split` leaves the
/// task untouched.
#[async_trait]
pub trait ChunkingHook: Send + Sync {
    async fn split(&self, task: &TaskRequest) -> Option<Vec<TaskRequest>>;
    async fn merge(&self, parts: Vec<Value>) -> Result<Value>;
}
