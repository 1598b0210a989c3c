// crates/convoy-engines/src/sequential.rs

//! Sequential executor
//!
//! Legacy pipeline path used when no step declares an id or dependencies.
//! Steps run strictly in declaration order; each result is exposed to later
//! steps both by numeric index (`steps.0.field`) and under a generated
//! `step_<i>` key. Retry, optional handling and event emission are shared
//! with the DAG path through the step runner.

use crate::step_runner::StepRunner;
use convoy_core::error::{ConvoyError, Result};
use convoy_core::traits::ProgressReporter;
use convoy_core::types::{Job, JobContext, PipelineResult, StepStatus};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct SequentialExecutor {
    runner: Arc<StepRunner>,
}

impl SequentialExecutor {
    pub fn new(runner: Arc<StepRunner>) -> Self {
        Self { runner }
    }

    pub async fn execute(
        &self,
        job: Arc<Job>,
        job_id: &str,
        progress: Arc<dyn ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<PipelineResult> {
        let steps = job
            .steps
            .clone()
            .ok_or_else(|| ConvoyError::validation("job has no steps"))?;
        let started = Instant::now();
        let total = steps.len();

        let mut results: Map<String, Value> = Map::new();
        let mut ordered: Vec<Value> = Vec::with_capacity(total);
        let mut statuses: Vec<StepStatus> = Vec::with_capacity(total);

        for (index, step) in steps.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ConvoyError::queue(format!("job {} cancelled", job_id)));
            }
            progress.report(((index * 100) / total) as u8).await;

            let mut ctx = JobContext::new(job.payload.clone());
            for (i, value) in ordered.iter().enumerate() {
                ctx.steps.insert(i.to_string(), value.clone());
                ctx.steps.insert(format!("step_{}", i), value.clone());
            }

            let step_id = step.effective_id(index);
            let report = self
                .runner
                .run_step(
                    job.clone(),
                    job_id.to_string(),
                    step,
                    step_id.clone(),
                    ctx,
                    cancel.clone(),
                )
                .await;

            statuses.push(report.status);
            match report.outcome {
                Ok(value) => {
                    results.insert(step_id, value.clone());
                    ordered.push(value);
                }
                Err(e) => return Err(e),
            }
        }

        let final_result = ordered.last().cloned().unwrap_or(Value::Null);
        Ok(PipelineResult {
            steps: ordered,
            step_results: results,
            step_status: statuses,
            final_result,
            total_duration: started.elapsed().as_millis() as u64,
            parallel_groups: Vec::new(),
        })
    }
}
