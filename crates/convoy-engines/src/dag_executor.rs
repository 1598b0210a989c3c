// crates/convoy-engines/src/dag_executor.rs

//! DAG scheduler
//!
//! Runs a pipeline whose steps declare ids and dependencies. Each iteration
//! computes the set of runnable steps (all predecessors completed or
//! skipped), launches them concurrently as one group, and awaits the group
//! before the next iteration. Groups with more than one step are recorded
//! in `parallelGroups`. If no step is runnable while pending steps remain,
//! the pipeline is deadlocked and fails with the pending step ids. The
//! first non-optional failure aborts the pipeline after its group has been
//! awaited; siblings are not cancelled.

use crate::step_runner::{StepReport, StepRunner};
use convoy_core::error::{ConvoyError, Result};
use convoy_core::traits::ProgressReporter;
use convoy_core::types::{Job, JobContext, PipelineResult, StepState, StepStatus};
use log::debug;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct DagExecutor {
    runner: Arc<StepRunner>,
}

impl DagExecutor {
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

        let ids: Vec<String> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| s.effective_id(i))
            .collect();
        let index_of: HashMap<String, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();

        let mut states: Vec<StepState> = vec![StepState::Pending; total];
        let mut statuses: Vec<StepStatus> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepStatus::pending(&ids[i], &s.task))
            .collect();
        let mut results: Map<String, Value> = Map::new();
        let mut parallel_groups: Vec<Vec<String>> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Err(ConvoyError::queue(format!("job {} cancelled", job_id)));
            }

            let runnable: Vec<usize> = (0..total)
                .filter(|&i| {
                    states[i] == StepState::Pending
                        && steps[i].depends_on.iter().all(|dep| {
                            index_of
                                .get(dep)
                                .map(|&d| states[d].satisfies_dependents())
                                .unwrap_or(false)
                        })
                })
                .collect();

            if runnable.is_empty() {
                if states.iter().all(StepState::is_terminal) {
                    break;
                }
                // Launch groups are awaited as a whole, so nothing is still
                // running here: the remaining pending steps are unsatisfiable.
                let pending: Vec<String> = (0..total)
                    .filter(|&i| states[i] == StepState::Pending)
                    .map(|i| ids[i].clone())
                    .collect();
                return Err(ConvoyError::Deadlock { steps: pending });
            }

            if runnable.len() > 1 {
                parallel_groups.push(runnable.iter().map(|&i| ids[i].clone()).collect());
            }
            debug!(
                "job {} scheduling group {:?}",
                job_id,
                runnable.iter().map(|&i| ids[i].as_str()).collect::<Vec<_>>()
            );

            let ctx = self.context_snapshot(&job, &ids, &results);
            let mut group = JoinSet::new();
            for &i in &runnable {
                states[i] = StepState::Running;
                let runner = self.runner.clone();
                let job = job.clone();
                let job_id = job_id.to_string();
                let step = steps[i].clone();
                let step_id = ids[i].clone();
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                group.spawn(async move {
                    runner.run_step(job, job_id, step, step_id, ctx, cancel).await
                });
            }

            let mut reports: Vec<StepReport> = Vec::with_capacity(runnable.len());
            while let Some(joined) = group.join_next().await {
                match joined {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        return Err(ConvoyError::queue(format!(
                            "step task aborted: {}",
                            e
                        )))
                    }
                }
            }

            // Apply reports; when several steps in a group fail, surface the
            // one declared first so the job error is deterministic.
            let mut failure: Option<(usize, ConvoyError)> = None;
            for report in reports {
                let i = index_of[&report.id];
                states[i] = report.status.status;
                statuses[i] = report.status;
                match report.outcome {
                    Ok(value) => {
                        results.insert(report.id, value);
                    }
                    Err(e) => {
                        if failure.as_ref().map(|(fi, _)| i < *fi).unwrap_or(true) {
                            failure = Some((i, e));
                        }
                    }
                }
            }

            let resolved = states.iter().filter(|s| s.satisfies_dependents()).count();
            progress.report(((resolved * 100) / total) as u8).await;

            if let Some((_, e)) = failure {
                return Err(e);
            }
        }

        let ordered: Vec<Value> = ids
            .iter()
            .map(|id| results.get(id).cloned().unwrap_or(Value::Null))
            .collect();
        let final_result = ordered.last().cloned().unwrap_or(Value::Null);

        Ok(PipelineResult {
            steps: ordered,
            step_results: results,
            step_status: statuses,
            final_result,
            total_duration: started.elapsed().as_millis() as u64,
            parallel_groups,
        })
    }

    /// Context visible to the next group: completed results keyed by id and
    /// by declaration index.
    fn context_snapshot(
        &self,
        job: &Job,
        ids: &[String],
        results: &Map<String, Value>,
    ) -> JobContext {
        let mut ctx = JobContext::new(job.payload.clone());
        for (index, id) in ids.iter().enumerate() {
            if let Some(value) = results.get(id) {
                ctx.steps.insert(id.clone(), value.clone());
                ctx.steps.insert(index.to_string(), value.clone());
            }
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::registry::BackendRegistry;
    use async_trait::async_trait;
    use convoy_core::error::Result;
    use convoy_core::traits::{Backend, NoopProgress};
    use convoy_core::types::{RemoteTaskStatus, TaskRequest};
    use serde_json::json;
    use std::time::Duration;

    /// Echo backend with a per-task configurable delay and failure switch.
    #[derive(Debug)]
    struct ScriptedBackend;

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn execute(&self, task: &TaskRequest) -> Result<Value> {
            if let Some(ms) = task.payload.get("sleepMs").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if task.payload.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                return Err(ConvoyError::backend_execution("scripted failure"));
            }
            Ok(json!({"task": task.task_type, "input": task.payload}))
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

    async fn executor() -> DagExecutor {
        let registry = Arc::new(BackendRegistry::new());
        registry.register("scripted", Arc::new(ScriptedBackend)).await;
        DagExecutor::new(Arc::new(StepRunner::new(registry, Arc::new(NullEventSink))))
    }

    fn job(steps: Value) -> Arc<Job> {
        Arc::new(
            serde_json::from_value(json!({
                "type": "p",
                "payload": {},
                "backend": "scripted",
                "steps": steps,
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn diamond_runs_middle_steps_in_parallel() {
        let executor = executor().await;
        let job = job(json!([
            {"task": "a", "id": "a"},
            {"task": "b", "id": "b", "dependsOn": ["a"], "input": {"sleepMs": 50}},
            {"task": "c", "id": "c", "dependsOn": ["a"], "input": {"sleepMs": 50}},
            {"task": "d", "id": "d", "dependsOn": ["b", "c"]},
        ]));

        let started = Instant::now();
        let result = executor
            .execute(job, "j", Arc::new(NoopProgress), CancellationToken::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(
            elapsed < Duration::from_millis(120),
            "diamond took {:?}, b and c did not overlap",
            elapsed
        );
        assert_eq!(result.parallel_groups.len(), 1);
        let mut group = result.parallel_groups[0].clone();
        group.sort();
        assert_eq!(group, vec!["b", "c"]);
        assert_eq!(result.step_status.len(), 4);
        assert!(result
            .step_status
            .iter()
            .all(|s| s.status == StepState::Completed));
    }

    #[tokio::test]
    async fn dependents_observe_predecessor_results() {
        let executor = executor().await;
        let job = job(json!([
            {"task": "first", "id": "first", "input": {"v": 41}},
            {"task": "second", "id": "second", "dependsOn": ["first"],
             "input": {"prev": "{{steps.first.input.v}}"}},
        ]));

        let result = executor
            .execute(job, "j", Arc::new(NoopProgress), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.step_results["second"]["input"]["prev"], json!(41));
        assert_eq!(result.final_result["task"], json!("second"));
    }

    #[tokio::test]
    async fn happens_before_holds_for_dependencies() {
        let executor = executor().await;
        let job = job(json!([
            {"task": "a", "id": "a", "input": {"sleepMs": 10}},
            {"task": "b", "id": "b", "dependsOn": ["a"]},
        ]));

        let result = executor
            .execute(job, "j", Arc::new(NoopProgress), CancellationToken::new())
            .await
            .unwrap();

        let a = &result.step_status[0];
        let b = &result.step_status[1];
        assert!(a.completed_at.unwrap() <= b.started_at.unwrap());
    }

    #[tokio::test]
    async fn optional_failure_skips_and_dependents_run() {
        let executor = executor().await;
        let job = job(json!([
            {"task": "ok", "id": "x"},
            {"task": "fails", "id": "y", "optional": true, "dependsOn": ["x"],
             "input": {"fail": true}},
            {"task": "ok", "id": "z", "dependsOn": ["y"]},
        ]));

        let result = executor
            .execute(job, "j", Arc::new(NoopProgress), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.step_status[1].status, StepState::Skipped);
        assert_eq!(result.step_status[2].status, StepState::Completed);
        assert_eq!(result.final_result["task"], json!("ok"));
        assert_eq!(result.step_results["y"]["skipped"], json!(true));
    }

    #[tokio::test]
    async fn required_failure_stops_downstream_steps() {
        let executor = executor().await;
        let job = job(json!([
            {"task": "boom", "id": "a", "input": {"fail": true}},
            {"task": "never", "id": "b", "dependsOn": ["a"]},
        ]));

        let err = executor
            .execute(job, "j", Arc::new(NoopProgress), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ConvoyError::StepFailure { .. }));
        assert!(err.to_string().contains("scripted failure"));
    }

    #[tokio::test]
    async fn runtime_deadlock_names_pending_steps() {
        // Validation would reject this up front; drive the scheduler directly
        // to exercise the runtime check.
        let executor = executor().await;
        let job = job(json!([
            {"task": "t", "id": "a", "dependsOn": ["b"]},
            {"task": "t", "id": "b", "dependsOn": ["a"]},
        ]));

        let err = executor
            .execute(job, "j", Arc::new(NoopProgress), CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ConvoyError::Deadlock { mut steps } => {
                steps.sort();
                assert_eq!(steps, vec!["a", "b"]);
            }
            other => panic!("expected deadlock, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn declaration_order_round_trip() {
        let executor = executor().await;
        let job = job(json!([
            {"task": "one", "id": "first"},
            {"task": "two", "id": "second", "dependsOn": ["first"]},
        ]));

        let result = executor
            .execute(job, "j", Arc::new(NoopProgress), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.steps[0], result.step_results["first"]);
        assert_eq!(result.steps[1], result.step_results["second"]);
    }
}
