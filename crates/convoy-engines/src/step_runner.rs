// crates/convoy-engines/src/step_runner.rs

//! Step runner
//!
//! Executes one pipeline step: resolves its templates against the job
//! context, fans out `forEach` iterations under a bounded-concurrency
//! semaphore, routes each resolved task through backend selection and the
//! retry executor, and classifies the outcome as completed, skipped or
//! failed. Step lifecycle events are emitted along the way.

use crate::registry::BackendRegistry;
use crate::retry;
use chrono::Utc;
use convoy_core::error::{ConvoyError, Result};
use convoy_core::template;
use convoy_core::traits::EventSink;
use convoy_core::types::{
    Job, JobContext, RetryPolicy, Step, StepEvent, StepEventKind, StepState, StepStatus,
    TaskRequest,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Result of running one step. `outcome` is `Ok` for both completed and
/// skipped steps (the skip marker lives in the value); only a non-optional
/// failure is an `Err`.
#[derive(Debug)]
pub struct StepReport {
    pub id: String,
    pub status: StepStatus,
    pub outcome: Result<Value>,
}

pub struct StepRunner {
    registry: Arc<BackendRegistry>,
    events: Arc<dyn EventSink>,
}

impl StepRunner {
    pub fn new(registry: Arc<BackendRegistry>, events: Arc<dyn EventSink>) -> Self {
        Self { registry, events }
    }

    /// Execute one step to a terminal state.
    pub async fn run_step(
        &self,
        job: Arc<Job>,
        job_id: String,
        step: Step,
        step_id: String,
        ctx: JobContext,
        cancel: CancellationToken,
    ) -> StepReport {
        let mut status = StepStatus::pending(&step_id, &step.task);
        status.status = StepState::Running;
        status.started_at = Some(Utc::now());
        let started = std::time::Instant::now();

        self.events
            .emit(StepEvent::new(StepEventKind::Start, &job_id, &step_id, &step.task))
            .await;

        // Conditional steps resolve before anything else runs.
        if let Some(condition) = &step.run_when {
            if !template::evaluate_condition(condition, &ctx) {
                let result = json!({"skipped": true, "reason": "condition-false"});
                status.status = StepState::Skipped;
                status.completed_at = Some(Utc::now());
                status.duration = Some(started.elapsed().as_millis() as u64);
                status.result = Some(result.clone());
                let mut event =
                    StepEvent::new(StepEventKind::Complete, &job_id, &step_id, &step.task);
                event.duration_ms = status.duration;
                self.events.emit(event).await;
                return StepReport {
                    id: step_id,
                    status,
                    outcome: Ok(result),
                };
            }
        }

        let body = self.execute_body(&job, &step, &ctx, &cancel);
        let outcome = match step.timeout {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), body).await {
                Ok(result) => result,
                Err(_) => Err(ConvoyError::backend_execution(format!(
                    "timed out after {}s",
                    secs
                ))),
            },
            None => body.await,
        };

        match outcome {
            Ok(result) => {
                status.status = StepState::Completed;
                status.completed_at = Some(Utc::now());
                status.duration = Some(started.elapsed().as_millis() as u64);
                status.result = Some(result.clone());
                let mut event =
                    StepEvent::new(StepEventKind::Complete, &job_id, &step_id, &step.task);
                event.duration_ms = status.duration;
                self.events.emit(event).await;
                StepReport {
                    id: step_id,
                    status,
                    outcome: Ok(result),
                }
            }
            Err(e) => {
                let message = e.to_string();
                let mut event = StepEvent::new(StepEventKind::Error, &job_id, &step_id, &step.task);
                event.error = Some(message.clone());
                event.optional = step.optional;
                event.duration_ms = Some(started.elapsed().as_millis() as u64);
                self.events.emit(event).await;

                if step.optional {
                    // Absorbed as a skip; dependents still run.
                    let result = json!({"skipped": true, "error": message.clone()});
                    status.status = StepState::Skipped;
                    status.completed_at = Some(Utc::now());
                    status.duration = Some(started.elapsed().as_millis() as u64);
                    status.error = Some(message);
                    status.result = Some(result.clone());
                    StepReport {
                        id: step_id,
                        status,
                        outcome: Ok(result),
                    }
                } else {
                    status.status = StepState::Failed;
                    status.completed_at = Some(Utc::now());
                    status.duration = Some(started.elapsed().as_millis() as u64);
                    status.error = Some(message.clone());
                    StepReport {
                        id: step_id.clone(),
                        status,
                        outcome: Err(ConvoyError::step_failure(step_id, message)),
                    }
                }
            }
        }
    }

    async fn execute_body(
        &self,
        job: &Arc<Job>,
        step: &Step,
        ctx: &JobContext,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let retry_policy = step.retry.clone().or_else(|| job.retry.clone());
        let resources = step.resources.clone().or_else(|| job.resources.clone());

        match &step.for_each {
            Some(template_str) => {
                let resolved = template::resolve_value(&Value::String(template_str.clone()), ctx);
                let items = match resolved {
                    Some(Value::Array(items)) => items,
                    Some(other) => {
                        return Err(ConvoyError::validation(format!(
                            "forEach template '{}' resolved to {}, expected a sequence",
                            template_str,
                            value_kind(&other)
                        )))
                    }
                    None => {
                        return Err(ConvoyError::validation(format!(
                            "forEach template '{}' did not resolve, expected a sequence",
                            template_str
                        )))
                    }
                };

                if items.is_empty() {
                    return Ok(Value::Array(Vec::new()));
                }

                let cap = step.for_each_concurrency.unwrap_or(items.len()).max(1);
                let semaphore = Arc::new(Semaphore::new(cap));
                let mut handles = Vec::with_capacity(items.len());

                for (index, item) in items.into_iter().enumerate() {
                    let semaphore = semaphore.clone();
                    let registry = self.registry.clone();
                    let item_ctx = ctx.with_iteration(item, index);
                    let input = step.input.clone();
                    let task_type = step.task.clone();
                    let backend = job.backend.clone();
                    let resources = resources.clone();
                    let retry_policy = retry_policy.clone();
                    let cancel = cancel.clone();

                    handles.push(tokio::spawn(async move {
                        let _permit = semaphore.acquire_owned().await.map_err(|_| {
                            ConvoyError::backend_execution("forEach semaphore closed")
                        })?;
                        let payload = Value::Object(template::resolve_input(&input, &item_ctx));
                        let task = TaskRequest {
                            task_type,
                            payload,
                            backend,
                            resources,
                            cancel,
                        };
                        execute_task(registry, task, retry_policy).await
                    }));
                }

                // Join in item order so the result sequence is positional.
                let mut results = Vec::with_capacity(handles.len());
                let mut first_error: Option<ConvoyError> = None;
                for handle in handles {
                    match handle.await {
                        Ok(Ok(value)) => results.push(value),
                        Ok(Err(e)) => {
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                        }
                        Err(e) => {
                            if first_error.is_none() {
                                first_error = Some(ConvoyError::backend_execution(format!(
                                    "forEach task panicked: {}",
                                    e
                                )));
                            }
                        }
                    }
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(Value::Array(results)),
                }
            }
            None => {
                let payload = Value::Object(template::resolve_input(&step.input, ctx));
                let task = TaskRequest {
                    task_type: step.task.clone(),
                    payload,
                    backend: job.backend.clone(),
                    resources,
                    cancel: cancel.clone(),
                };
                execute_task(self.registry.clone(), task, retry_policy).await
            }
        }
    }
}

/// Select a backend and execute one resolved task under the retry policy.
async fn execute_task(
    registry: Arc<BackendRegistry>,
    task: TaskRequest,
    retry_policy: Option<RetryPolicy>,
) -> Result<Value> {
    retry::execute_with_retry(retry_policy.as_ref(), || {
        let registry = registry.clone();
        let task = task.clone();
        async move {
            let (_name, backend) = registry.select(task.backend.as_deref()).await?;
            backend.execute(&task).await
        }
    })
    .await
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use async_trait::async_trait;
    use convoy_core::traits::Backend;
    use convoy_core::types::RemoteTaskStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    /// Echoes the resolved payload back as the task result.
    #[derive(Debug)]
    struct EchoBackend;

    #[async_trait]
    impl Backend for EchoBackend {
        async fn execute(&self, task: &TaskRequest) -> Result<Value> {
            Ok(task.payload.clone())
        }

        async fn get_status(&self, task_id: &str) -> Result<RemoteTaskStatus> {
            Ok(RemoteTaskStatus {
                id: task_id.to_string(),
                status: "completed".to_string(),
                result: None,
                error: None,
            })
        }

        async fn is_healthy(&self) -> bool {
            true
        }
    }

    /// Sleeps per call and records peak concurrency.
    #[derive(Debug)]
    struct SleeperBackend {
        active: AtomicI64,
        peak: AtomicI64,
    }

    impl SleeperBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                active: AtomicI64::new(0),
                peak: AtomicI64::new(0),
            })
        }
    }

    #[async_trait]
    impl Backend for SleeperBackend {
        async fn execute(&self, task: &TaskRequest) -> Result<Value> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(task.payload.clone())
        }

        async fn get_status(&self, task_id: &str) -> Result<RemoteTaskStatus> {
            Ok(RemoteTaskStatus {
                id: task_id.to_string(),
                status: "completed".to_string(),
                result: None,
                error: None,
            })
        }

        async fn is_healthy(&self) -> bool {
            true
        }
    }

    /// Fails a configured number of times before succeeding.
    #[derive(Debug)]
    struct FlakyBackend {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn execute(&self, task: &TaskRequest) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ConvoyError::backend_execution("transient failure"));
            }
            Ok(task.payload.clone())
        }

        async fn get_status(&self, task_id: &str) -> Result<RemoteTaskStatus> {
            Ok(RemoteTaskStatus {
                id: task_id.to_string(),
                status: "completed".to_string(),
                result: None,
                error: None,
            })
        }

        async fn is_healthy(&self) -> bool {
            true
        }
    }

    async fn runner_with(backend: Arc<dyn Backend>) -> StepRunner {
        let registry = Arc::new(BackendRegistry::new());
        registry.register("test", backend).await;
        StepRunner::new(registry, Arc::new(NullEventSink))
    }

    fn pipeline_job(payload: Value, steps: Value) -> Arc<Job> {
        Arc::new(
            serde_json::from_value(json!({
                "type": "p",
                "payload": payload,
                "backend": "test",
                "steps": steps,
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn resolves_input_templates() {
        let runner = runner_with(Arc::new(EchoBackend)).await;
        let job = pipeline_job(json!({"x": "A"}), json!([{"task": "echo"}]));
        let step: Step =
            serde_json::from_value(json!({"task": "echo", "input": {"v": "{{payload.x}}"}}))
                .unwrap();
        let ctx = JobContext::new(job.payload.clone());

        let report = runner
            .run_step(job, "j".into(), step, "s".into(), ctx, CancellationToken::new())
            .await;

        assert_eq!(report.status.status, StepState::Completed);
        assert_eq!(report.outcome.unwrap(), json!({"v": "A"}));
    }

    #[tokio::test]
    async fn for_each_preserves_order_and_caps_concurrency() {
        let sleeper = SleeperBackend::new();
        let runner = runner_with(sleeper.clone()).await;
        let job = pipeline_job(json!({"items": [1, 2, 3, 4, 5, 6]}), json!([{"task": "sleeper"}]));
        let step: Step = serde_json::from_value(json!({
            "task": "sleeper",
            "forEach": "{{payload.items}}",
            "forEachConcurrency": 2,
            "input": {"v": "{{item}}", "i": "{{index}}"}
        }))
        .unwrap();
        let ctx = JobContext::new(job.payload.clone());

        let report = runner
            .run_step(job, "j".into(), step, "p".into(), ctx, CancellationToken::new())
            .await;

        let results = match report.outcome.unwrap() {
            Value::Array(items) => items,
            other => panic!("expected sequence, got {:?}", other),
        };
        assert_eq!(results.len(), 6);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result["v"], json!(i as u64 + 1));
            assert_eq!(result["i"], json!(i as u64));
        }
        assert!(sleeper.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn for_each_requires_a_sequence() {
        let runner = runner_with(Arc::new(EchoBackend)).await;
        let job = pipeline_job(json!({"items": "oops"}), json!([{"task": "echo"}]));
        let step: Step =
            serde_json::from_value(json!({"task": "echo", "forEach": "{{payload.items}}"}))
                .unwrap();
        let ctx = JobContext::new(job.payload.clone());

        let report = runner
            .run_step(job, "j".into(), step, "s".into(), ctx, CancellationToken::new())
            .await;

        assert_eq!(report.status.status, StepState::Failed);
        let err = report.outcome.unwrap_err();
        assert!(err.to_string().contains("expected a sequence"));
        assert!(err.to_string().contains("string"));
    }

    #[tokio::test]
    async fn optional_failure_is_reclassified_as_skip() {
        let runner = runner_with(Arc::new(FlakyBackend {
            failures: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        }))
        .await;
        let job = pipeline_job(json!({}), json!([{"task": "fails"}]));
        let step: Step =
            serde_json::from_value(json!({"task": "fails", "optional": true})).unwrap();
        let ctx = JobContext::new(json!({}));

        let report = runner
            .run_step(job, "j".into(), step, "s".into(), ctx, CancellationToken::new())
            .await;

        assert_eq!(report.status.status, StepState::Skipped);
        let result = report.outcome.unwrap();
        assert_eq!(result["skipped"], json!(true));
        assert!(result["error"].as_str().unwrap().contains("transient failure"));
    }

    #[tokio::test]
    async fn retry_policy_recovers_transient_failures() {
        let backend = Arc::new(FlakyBackend {
            failures: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let runner = runner_with(backend.clone()).await;
        let job = pipeline_job(json!({}), json!([{"task": "flaky"}]));
        let step: Step = serde_json::from_value(json!({
            "task": "flaky",
            "retry": {"attempts": 3, "backoff": "fixed", "delay": 5},
            "input": {"ok": true}
        }))
        .unwrap();
        let ctx = JobContext::new(json!({}));

        let report = runner
            .run_step(job, "j".into(), step, "s".into(), ctx, CancellationToken::new())
            .await;

        assert_eq!(report.status.status, StepState::Completed);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_when_false_skips_without_backend_calls() {
        let backend = Arc::new(FlakyBackend {
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let runner = runner_with(backend.clone()).await;
        let job = pipeline_job(json!({"go": false}), json!([{"task": "t"}]));
        let step: Step =
            serde_json::from_value(json!({"task": "t", "runWhen": "{{payload.go}}"})).unwrap();
        let ctx = JobContext::new(job.payload.clone());

        let report = runner
            .run_step(job, "j".into(), step, "s".into(), ctx, CancellationToken::new())
            .await;

        assert_eq!(report.status.status, StepState::Skipped);
        assert_eq!(report.outcome.unwrap()["reason"], json!("condition-false"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn step_timeout_fails_the_step() {
        let runner = runner_with(SleeperBackend::new()).await;
        let job = pipeline_job(json!({}), json!([{"task": "sleep"}]));
        let mut step: Step = serde_json::from_value(json!({"task": "sleep"})).unwrap();
        step.timeout = Some(0);
        let ctx = JobContext::new(json!({}));

        let report = runner
            .run_step(job, "j".into(), step, "s".into(), ctx, CancellationToken::new())
            .await;

        assert_eq!(report.status.status, StepState::Failed);
        assert!(report.outcome.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn events_follow_the_step_lifecycle() {
        let sink = Arc::new(crate::events::ChannelEventSink::new(16));
        let registry = Arc::new(BackendRegistry::new());
        registry.register("test", Arc::new(EchoBackend)).await;
        let runner = StepRunner::new(registry, sink.clone());
        let mut rx = sink.subscribe();

        let job = pipeline_job(json!({}), json!([{"task": "echo"}]));
        let step: Step = serde_json::from_value(json!({"task": "echo"})).unwrap();
        runner
            .run_step(
                job,
                "j".into(),
                step,
                "s".into(),
                JobContext::new(json!({})),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(rx.recv().await.unwrap().kind, StepEventKind::Start);
        assert_eq!(rx.recv().await.unwrap().kind, StepEventKind::Complete);
    }
}
