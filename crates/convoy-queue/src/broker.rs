// crates/convoy-queue/src/broker.rs

//! Queue broker contract
//!
//! The queue core codes against this trait; the broker is the single source
//! of truth for persistent job state and must expose atomic state
//! transitions. Outer retries (the whole job re-run) are the broker's
//! responsibility: `fail` either reschedules the job with the configured
//! backoff or records it as terminally failed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::error::Result;
use convoy_core::types::{BackoffKind, Job, TaskState, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;

/// Enqueue options derived from the submitted job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: i32,
    /// Outer attempts for the whole job, including the first run
    pub attempts: u32,
    pub backoff: Option<BackoffSpec>,
    /// Deferred start in milliseconds
    pub delay_ms: u64,
    /// Cron pattern for repeating jobs
    pub repeat: Option<String>,
}

impl JobOptions {
    /// Derive options from a job's queue-facing fields.
    pub fn from_job(job: &Job) -> Self {
        Self {
            priority: job.priority.unwrap_or(0),
            attempts: job.retry.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1),
            backoff: job.retry.as_ref().map(|r| BackoffSpec {
                kind: r.backoff,
                delay_ms: r.delay,
            }),
            delay_ms: job.delay.unwrap_or(0),
            repeat: job.cron.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSpec {
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl BackoffSpec {
    /// Wait before outer retry `n` (1-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let millis = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => self
                .delay_ms
                .saturating_mul(1u64 << retry.saturating_sub(1).min(32)),
        };
        Duration::from_millis(millis)
    }
}

/// Internal broker state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerState {
    Waiting,
    Delayed,
    Paused,
    Active,
    Completed,
    Failed,
    Stuck,
}

impl BrokerState {
    /// Map to the public status vocabulary.
    pub fn to_task_state(self) -> TaskState {
        match self {
            BrokerState::Completed => TaskState::Completed,
            BrokerState::Failed | BrokerState::Stuck => TaskState::Failed,
            BrokerState::Active => TaskState::Running,
            BrokerState::Waiting | BrokerState::Delayed | BrokerState::Paused => TaskState::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BrokerState::Completed | BrokerState::Failed | BrokerState::Stuck)
    }
}

/// A job as tracked by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerJob {
    pub id: String,
    pub lane: String,
    pub job: Job,
    pub opts: JobOptions,
    pub state: BrokerState,
    /// Outer attempts consumed so far
    pub attempts_made: u32,
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Best-effort cancellation flag observed by workers
    pub cancel_requested: bool,
}

impl BrokerJob {
    /// Public status record for this job.
    pub fn to_status(&self) -> TaskStatus {
        TaskStatus {
            id: self.id.clone(),
            status: self.state.to_task_state(),
            result: self.result.clone(),
            error: self.error.clone(),
            progress: Some(self.progress),
            started_at: self.started_at,
            completed_at: self.completed_at,
            job_type: Some(self.job.job_type.clone()),
            queue: Some(self.lane.clone()),
        }
    }
}

/// What the broker decided after a failed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Another outer attempt was scheduled after the given delay
    Retried { delay: Duration },
    /// The failure is terminal
    Terminal,
}

/// State-change notification for dashboards and tests
#[derive(Debug, Clone)]
pub struct StateChange {
    pub lane: String,
    pub job_id: String,
    pub state: BrokerState,
}

/// Durable queue contract. Implementations must make every state
/// transition atomic with respect to concurrent workers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a job and make it claimable (or delayed). Returns the job id.
    async fn enqueue(&self, lane: &str, job: Job, opts: JobOptions) -> Result<String>;

    /// Atomically claim the next ready job in a lane, moving it to Active.
    async fn claim(&self, lane: &str) -> Result<Option<BrokerJob>>;

    /// Park until work may be available in the lane (bounded wait).
    async fn wait_for_work(&self, lane: &str);

    /// Record a successful run.
    async fn complete(&self, lane: &str, job_id: &str, result: Value) -> Result<()>;

    /// Record a failed run; reschedules when outer attempts remain.
    async fn fail(&self, lane: &str, job_id: &str, error: &str) -> Result<RetryDisposition>;

    async fn set_progress(&self, lane: &str, job_id: &str, progress: u8) -> Result<()>;

    async fn get_job(&self, lane: &str, job_id: &str) -> Result<Option<BrokerJob>>;

    /// Jobs in the given states, newest first, capped at `limit`.
    async fn get_jobs(
        &self,
        lane: &str,
        states: &[BrokerState],
        limit: usize,
    ) -> Result<Vec<BrokerJob>>;

    /// Request cancellation. Returns false when the job is already terminal.
    async fn request_cancel(&self, lane: &str, job_id: &str) -> Result<bool>;

    fn subscribe(&self) -> broadcast::Receiver<StateChange>;

    /// Release broker resources without losing in-flight job state.
    async fn close(&self) -> Result<()>;
}
