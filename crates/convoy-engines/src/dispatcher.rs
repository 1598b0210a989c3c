// crates/convoy-engines/src/dispatcher.rs

//! Dispatcher entry point
//!
//! Routes an accepted job to the right execution path: the DAG scheduler
//! when any step declares an id or dependencies, the sequential executor
//! when plain steps are present, and the single-task path otherwise. The
//! single-task path selects a backend and runs under the job's retry
//! policy, with an optional chunking hook that may transparently split the
//! payload and merge per-part results.

use crate::dag_executor::DagExecutor;
use crate::registry::BackendRegistry;
use crate::retry;
use crate::sequential::SequentialExecutor;
use crate::step_runner::StepRunner;
use convoy_core::error::Result;
use convoy_core::traits::{ChunkingHook, EventSink, ProgressReporter};
use convoy_core::types::{Job, TaskRequest};
use log::debug;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    dag: DagExecutor,
    sequential: SequentialExecutor,
    chunking: Option<Arc<dyn ChunkingHook>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<BackendRegistry>, events: Arc<dyn EventSink>) -> Self {
        let runner = Arc::new(StepRunner::new(registry.clone(), events));
        Self {
            registry,
            dag: DagExecutor::new(runner.clone()),
            sequential: SequentialExecutor::new(runner),
            chunking: None,
        }
    }

    pub fn with_chunking_hook(mut self, hook: Arc<dyn ChunkingHook>) -> Self {
        self.chunking = Some(hook);
        self
    }

    /// Execute a job to completion and return its raw result. Pipelines
    /// return a serialized [`PipelineResult`](convoy_core::types::PipelineResult).
    pub async fn dispatch(
        &self,
        job: Arc<Job>,
        job_id: &str,
        progress: Arc<dyn ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<Value> {
        if job.is_pipeline() {
            if job.is_dag() {
                debug!("job {} routed to the dag scheduler", job_id);
                let result = self.dag.execute(job, job_id, progress, cancel).await?;
                Ok(serde_json::to_value(result)?)
            } else {
                debug!("job {} routed to the sequential executor", job_id);
                let result = self.sequential.execute(job, job_id, progress, cancel).await?;
                Ok(serde_json::to_value(result)?)
            }
        } else {
            debug!("job {} routed as a single task", job_id);
            self.execute_single(&job, cancel).await
        }
    }

    async fn execute_single(&self, job: &Job, cancel: CancellationToken) -> Result<Value> {
        let task = TaskRequest {
            task_type: job.job_type.clone(),
            payload: job.payload.clone(),
            backend: job.backend.clone(),
            resources: job.resources.clone(),
            cancel,
        };

        if let Some(hook) = &self.chunking {
            if let Some(parts) = hook.split(&task).await {
                debug!("chunking hook split task '{}' into {} parts", task.task_type, parts.len());
                let mut results = Vec::with_capacity(parts.len());
                for part in parts {
                    results.push(self.execute_task(part, job).await?);
                }
                return hook.merge(results).await;
            }
        }
        self.execute_task(task, job).await
    }

    async fn execute_task(&self, task: TaskRequest, job: &Job) -> Result<Value> {
        retry::execute_with_retry(job.retry.as_ref(), || {
            let registry = self.registry.clone();
            let task = task.clone();
            async move {
                let (name, backend) = registry.select(task.backend.as_deref()).await?;
                debug!("task '{}' executing on backend '{}'", task.task_type, name);
                backend.execute(&task).await
            }
        })
        .await
    }
}
