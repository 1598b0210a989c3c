// crates/convoy-core/src/types.rs

//! Core types for the Convoy orchestrator
//!
//! This module defines the declarative job description accepted on
//! submission, the pipeline step shape, and the runtime records produced
//! while a job executes. All submitted documents use camelCase field
//! names; payloads, step inputs, step results and effect records are
//! arbitrary JSON trees.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// A declarative job submission
///
/// A job is either a single task (no `steps`) routed directly to a backend,
/// or a pipeline of steps executed by the DAG or sequential executor.
///
/// # Examples
///
/// ```rust
/// use convoy_core::types::Job;
///
/// let job: Job = serde_json::from_value(serde_json::json!({
///     "type": "transcribe",
///     "payload": { "url": "https://example.com/a.wav" },
///     "queue": "gpu"
/// })).unwrap();
/// assert!(job.steps.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Opaque task identifier; also the routing key for single-task jobs
    #[serde(rename = "type")]
    pub job_type: String,
    /// Caller-provided data, referenced from templates as `payload.*`
    pub payload: Value,
    /// Backend hint: a registered backend name or "auto"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Routing lane: `default`, `cpu` or `gpu`
    #[serde(default = "default_lane")]
    pub queue: String,
    /// Higher priority runs sooner within a lane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Deferred start, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Cron pattern for repeating jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Outer retry policy; also inherited by steps that omit their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Advisory resource hints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceHint>,
    /// Pipeline steps; presence makes the job a pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,
    /// Effects fired when the job is accepted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_pending: Vec<Value>,
    /// Effects fired on each progress tick
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_progress: Vec<Value>,
    /// Effects fired with the final result on completion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<Value>,
    /// Effects fired with the error message on failure
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<Value>,
}

fn default_lane() -> String {
    "default".to_string()
}

impl Job {
    /// Whether this job is a pipeline (has at least one step).
    pub fn is_pipeline(&self) -> bool {
        self.steps.as_ref().map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// A pipeline with any named steps or dependencies runs in DAG mode.
    pub fn is_dag(&self) -> bool {
        self.steps
            .as_ref()
            .map(|steps| steps.iter().any(|s| s.id.is_some() || !s.depends_on.is_empty()))
            .unwrap_or(false)
    }
}

/// A node in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Task identifier passed to the backend
    pub task: String,
    /// Step id; missing ids are synthesized as `step_<index>` in DAG mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Predecessor step ids that must resolve before this step may run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Field -> value-or-template map; becomes the child task's payload
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input: Map<String, Value>,
    /// Template that must resolve to a sequence; the step runs once per element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<String>,
    /// Maximum parallel executions inside a forEach (default: unbounded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each_concurrency: Option<usize>,
    /// If true, a failed attempt is reclassified as skipped
    #[serde(default)]
    pub optional: bool,
    /// Template evaluated against the context before readiness; falsy skips the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_when: Option<String>,
    /// Per-step timeout in seconds, covering the whole attempt set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Overrides the parent job's retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Overrides the parent job's resource hints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceHint>,
}

impl Step {
    /// The id used at runtime: the declared id, or `step_<index>`.
    pub fn effective_id(&self, index: usize) -> String {
        self.id.clone().unwrap_or_else(|| format!("step_{}", index))
    }
}

/// Retry policy applied to single-task jobs and individual steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Backoff strategy between attempts
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Base delay between attempts, in milliseconds
    #[serde(default)]
    pub delay: u64,
}

fn default_attempts() -> u32 {
    1
}

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Advisory resource metadata; the core does not enforce limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Per-step runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    /// Whether the step has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed | StepState::Skipped)
    }

    /// Whether dependents may treat this step as a resolved predecessor.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, StepState::Completed | StepState::Skipped)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepState::Pending => write!(f, "pending"),
            StepState::Running => write!(f, "running"),
            StepState::Completed => write!(f, "completed"),
            StepState::Failed => write!(f, "failed"),
            StepState::Skipped => write!(f, "skipped"),
        }
    }
}

/// Observability record for one step execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    pub id: String,
    pub task: String,
    pub status: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl StepStatus {
    pub fn pending(id: &str, task: &str) -> Self {
        Self {
            id: id.to_string(),
            task: task.to_string(),
            status: StepState::Pending,
            started_at: None,
            completed_at: None,
            duration: None,
            error: None,
            result: None,
        }
    }
}

/// Aggregate result of a successful pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// Raw step results in declaration order
    pub steps: Vec<Value>,
    /// Step id -> raw result
    pub step_results: Map<String, Value>,
    /// Per-step status snapshots in declaration order
    pub step_status: Vec<StepStatus>,
    /// Result of the last declared step
    pub final_result: Value,
    /// Elapsed milliseconds since the scheduler started
    pub total_duration: u64,
    /// Id sets launched together in one scheduling iteration
    pub parallel_groups: Vec<Vec<String>>,
}

/// Public job state, mapped from the broker's internal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// Status record returned by the queue for a job id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub id: String,
    pub status: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

/// A single resolved task forwarded to a backend
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_type: String,
    pub payload: Value,
    /// Backend hint carried from the enclosing job
    pub backend: Option<String>,
    pub resources: Option<ResourceHint>,
    /// Abort signal; backends must drop the in-flight call when cancelled
    pub cancel: CancellationToken,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            backend: None,
            resources: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Remote execution state reported by a backend's status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTaskStatus {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Capacity advertised by a backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcePool {
    #[serde(default)]
    pub gpus: Vec<String>,
    #[serde(default)]
    pub ram: u64,
    #[serde(default)]
    pub vram: u64,
}

/// Step lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepEventKind {
    Start,
    Complete,
    Error,
}

impl fmt::Display for StepEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepEventKind::Start => write!(f, "step:start"),
            StepEventKind::Complete => write!(f, "step:complete"),
            StepEventKind::Error => write!(f, "step:error"),
        }
    }
}

/// Fine-grained step observability event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub kind: StepEventKind,
    pub job_id: String,
    pub step_id: String,
    pub task: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on step:error when the failure was absorbed as a skip
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StepEvent {
    pub fn new(kind: StepEventKind, job_id: &str, step_id: &str, task: &str) -> Self {
        Self {
            kind,
            job_id: job_id.to_string(),
            step_id: step_id.to_string(),
            task: task.to_string(),
            timestamp: Utc::now(),
            error: None,
            optional: false,
            duration_ms: None,
        }
    }
}

/// Resolution context handed to the template resolver
///
/// `steps` holds completed step results: keyed by id (and declaration index)
/// in DAG mode, by index and `step_<i>` in sequential mode. Inside a forEach
/// iteration `item` and `index` are additionally set. `extras` carries
/// context roots used by effect interpolation (`result`, `error`, `jobId`).
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub payload: Value,
    pub steps: Map<String, Value>,
    pub item: Option<Value>,
    pub index: Option<usize>,
    pub extras: Map<String, Value>,
}

impl JobContext {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            steps: Map::new(),
            item: None,
            index: None,
            extras: Map::new(),
        }
    }

    /// Derive an iteration context with `item` and `index` bound.
    pub fn with_iteration(&self, item: Value, index: usize) -> Self {
        let mut ctx = self.clone();
        ctx.item = Some(item);
        ctx.index = Some(index);
        ctx
    }

    /// Resolve the root segment of a dotted path to a value.
    pub fn root(&self, segment: &str) -> Option<Value> {
        match segment {
            "payload" => Some(self.payload.clone()),
            "steps" => Some(Value::Object(self.steps.clone())),
            "item" => self.item.clone(),
            "index" => self.index.map(|i| Value::from(i as u64)),
            other => self.extras.get(other).cloned(),
        }
    }
}
