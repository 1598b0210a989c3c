// crates/convoy-queue/src/queue.rs

//! Public queue façade
//!
//! Owns the three lanes and their worker pools, derives broker options from
//! submitted jobs, fires `onPending` effects at acceptance, answers status
//! lookups in the public state vocabulary, and shuts the pools down
//! cooperatively. The façade is also the [`Enqueuer`] behind the `enqueue`
//! effect, so completed jobs can chain children through the same path.

use crate::broker::{Broker, JobOptions, StateChange};
use crate::worker;
use async_trait::async_trait;
use convoy_core::config::Settings;
use convoy_core::error::{ConvoyError, Result};
use convoy_core::traits::Enqueuer;
use convoy_core::types::{Job, TaskStatus};
use convoy_core::validation;
use convoy_engines::effects::{EffectContext, EffectDispatcher};
use convoy_engines::events::LogEventSink;
use convoy_engines::{BackendRegistry, Dispatcher};
use log::info;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The named lanes, in worker start order.
pub const LANES: [&str; 3] = ["default", "cpu", "gpu"];

pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    dispatcher: Arc<Dispatcher>,
    effects: Arc<EffectDispatcher>,
    settings: Settings,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl TaskQueue {
    /// Build a queue over the process-wide backend registry.
    pub fn new(broker: Arc<dyn Broker>, settings: Settings) -> Arc<Self> {
        Self::with_registry(broker, settings, BackendRegistry::global())
    }

    /// Build a queue over an explicit backend registry (used by tests).
    pub fn with_registry(
        broker: Arc<dyn Broker>,
        settings: Settings,
        registry: Arc<BackendRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<TaskQueue>| {
            let enqueuer: Arc<dyn Enqueuer> = Arc::new(WeakEnqueuer(weak.clone()));
            let effects = Arc::new(EffectDispatcher::new(&settings, Some(enqueuer)));
            let dispatcher = Arc::new(Dispatcher::new(registry, Arc::new(LogEventSink)));
            TaskQueue {
                broker,
                dispatcher,
                effects,
                settings,
                workers: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }
        })
    }

    /// Validate and enqueue a job; fires its `onPending` effects.
    pub async fn enqueue(&self, job: Job) -> Result<String> {
        validation::validate_job_struct(&job)?;
        let lane = job.queue.clone();
        let opts = JobOptions::from_job(&job);
        let pending_effects = job.on_pending.clone();
        let effect_source = job.clone();

        let id = self.broker.enqueue(&lane, job, opts).await?;
        info!("job {} accepted on lane '{}'", id, lane);

        let ctx = EffectContext::new(&id, &effect_source);
        self.effects.dispatch(&pending_effects, &ctx).await;
        Ok(id)
    }

    /// Public status for a job id, searching one lane or all of them.
    pub async fn status(&self, id: &str, lane: Option<&str>) -> Result<Option<TaskStatus>> {
        for lane in self.lanes_to_search(lane) {
            if let Some(job) = self.broker.get_job(lane, id).await? {
                return Ok(Some(job.to_status()));
            }
        }
        Ok(None)
    }

    /// List jobs on a lane, optionally filtered to public states.
    pub async fn list(&self, lane: &str, limit: usize) -> Result<Vec<TaskStatus>> {
        let jobs = self.broker.get_jobs(lane, &[], limit).await?;
        Ok(jobs.iter().map(|j| j.to_status()).collect())
    }

    /// Request cancellation. Returns false when the job is unknown or
    /// already terminal.
    pub async fn cancel(&self, id: &str, lane: Option<&str>) -> Result<bool> {
        for lane in self.lanes_to_search(lane) {
            if self.broker.get_job(lane, id).await?.is_some() {
                return self.broker.request_cancel(lane, id).await;
            }
        }
        Ok(false)
    }

    /// Start worker pools for every lane.
    pub fn start_workers(&self) {
        let mut workers = self.workers.lock().expect("worker lock poisoned");
        if !workers.is_empty() {
            return;
        }
        for lane in LANES {
            let count = self.settings.lane_concurrency(lane);
            info!("starting {} worker(s) on lane '{}'", count, lane);
            workers.extend(worker::spawn_lane_workers(
                self.broker.clone(),
                lane,
                count,
                self.dispatcher.clone(),
                self.effects.clone(),
                self.shutdown.clone(),
            ));
        }
    }

    /// Stop worker loops and close the broker. In-flight state stays with
    /// the broker's own atomic transitions.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker lock poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.broker.close().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.broker.subscribe()
    }

    pub fn effects(&self) -> Arc<EffectDispatcher> {
        self.effects.clone()
    }

    fn lanes_to_search<'a>(&self, lane: Option<&'a str>) -> Vec<&'a str> {
        match lane {
            Some(lane) => vec![lane],
            None => LANES.to_vec(),
        }
    }
}

/// Enqueuer handle that does not keep the queue alive.
struct WeakEnqueuer(Weak<TaskQueue>);

#[async_trait]
impl Enqueuer for WeakEnqueuer {
    async fn enqueue(&self, job: Job) -> Result<String> {
        let queue = self
            .0
            .upgrade()
            .ok_or_else(|| ConvoyError::queue("queue is shut down"))?;
        queue.enqueue(job).await
    }
}

#[async_trait]
impl Enqueuer for TaskQueue {
    async fn enqueue(&self, job: Job) -> Result<String> {
        TaskQueue::enqueue(self, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerState;
    use crate::memory::MemoryBroker;
    use async_trait::async_trait;
    use convoy_core::traits::Backend;
    use convoy_core::types::{RemoteTaskStatus, TaskRequest, TaskState};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct EchoBackend {
        calls: AtomicU32,
        fail_first_runs: AtomicU32,
    }

    #[async_trait]
    impl Backend for EchoBackend {
        async fn execute(&self, task: &TaskRequest) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_runs.load(Ordering::SeqCst) > 0 {
                self.fail_first_runs.fetch_sub(1, Ordering::SeqCst);
                return Err(ConvoyError::backend_execution("not ready"));
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

    async fn queue_with(backend: Arc<EchoBackend>) -> Arc<TaskQueue> {
        let registry = Arc::new(BackendRegistry::new());
        registry.register("echo", backend).await;
        let settings = Settings {
            worker_concurrency: 2,
            gpu_worker_concurrency: 1,
            ..Settings::default()
        };
        let queue = TaskQueue::with_registry(Arc::new(MemoryBroker::new()), settings, registry);
        queue.start_workers();
        queue
    }

    async fn wait_terminal(queue: &TaskQueue, id: &str) -> TaskStatus {
        for _ in 0..200 {
            if let Some(status) = queue.status(id, None).await.unwrap() {
                if matches!(status.status, TaskState::Completed | TaskState::Failed) {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} never reached a terminal state", id);
    }

    fn job(doc: Value) -> Job {
        serde_json::from_value(doc).unwrap()
    }

    #[tokio::test]
    async fn single_task_job_completes_through_the_pool() {
        let backend = Arc::new(EchoBackend {
            calls: AtomicU32::new(0),
            fail_first_runs: AtomicU32::new(0),
        });
        let queue = queue_with(backend).await;
        let id = queue
            .enqueue(job(json!({
                "type": "echo",
                "payload": {"v": 7},
                "backend": "echo",
            })))
            .await
            .unwrap();

        let status = wait_terminal(&queue, &id).await;
        assert_eq!(status.status, TaskState::Completed);
        assert_eq!(status.result, Some(json!({"v": 7})));
        assert_eq!(status.progress, Some(100));
        assert_eq!(status.job_type.as_deref(), Some("echo"));
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn pipeline_job_reports_pipeline_result() {
        let backend = Arc::new(EchoBackend {
            calls: AtomicU32::new(0),
            fail_first_runs: AtomicU32::new(0),
        });
        let queue = queue_with(backend).await;
        let id = queue
            .enqueue(job(json!({
                "type": "p",
                "payload": {"x": "A"},
                "backend": "echo",
                "steps": [
                    {"task": "echo", "input": {"v": "{{payload.x}}"}},
                    {"task": "echo", "input": {"prev": "{{steps.0.v}}"}},
                ],
            })))
            .await
            .unwrap();

        let status = wait_terminal(&queue, &id).await;
        assert_eq!(status.status, TaskState::Completed);
        let result = status.result.unwrap();
        assert_eq!(result["finalResult"], json!({"prev": "A"}));
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn outer_retry_restarts_the_whole_pipeline() {
        // The backend fails every call of the first run (2 steps would be 1
        // failing call), then succeeds; the outer retry re-runs from step 0.
        let backend = Arc::new(EchoBackend {
            calls: AtomicU32::new(0),
            fail_first_runs: AtomicU32::new(1),
        });
        let queue = queue_with(backend.clone()).await;
        let id = queue
            .enqueue(job(json!({
                "type": "p",
                "payload": {},
                "backend": "echo",
                "retry": {"attempts": 2, "backoff": "fixed", "delay": 10},
                "steps": [
                    {"task": "echo", "input": {"n": 1}},
                    {"task": "echo", "input": {"n": 2}},
                ],
            })))
            .await
            .unwrap();

        let status = wait_terminal(&queue, &id).await;
        assert_eq!(status.status, TaskState::Completed);
        // Run 1: step 0 fails once. Run 2: both steps succeed.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn terminal_failure_records_the_step_error() {
        let backend = Arc::new(EchoBackend {
            calls: AtomicU32::new(0),
            fail_first_runs: AtomicU32::new(u32::MAX),
        });
        let queue = queue_with(backend).await;
        let mut events = convoy_engines::effects::subscribe_custom_events();
        let id = queue
            .enqueue(job(json!({
                "type": "p",
                "payload": {},
                "backend": "echo",
                "steps": [{"task": "echo"}],
                "onError": [{"$event": "emit", "event": "failed", "data": {"msg": "{{error}}"}}],
            })))
            .await
            .unwrap();

        let status = wait_terminal(&queue, &id).await;
        assert_eq!(status.status, TaskState::Failed);
        // The failing step's message is preserved verbatim, with no
        // "step '...' failed" wrapper around it.
        assert_eq!(
            status.error.as_deref(),
            Some("backend execution failed: not ready")
        );

        // The onError effect context carries the same verbatim message.
        let event = loop {
            let event = events.recv().await.unwrap();
            if event.job_id == id {
                break event;
            }
        };
        assert_eq!(event.data["msg"], json!("backend execution failed: not ready"));
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_jobs() {
        let backend = Arc::new(EchoBackend {
            calls: AtomicU32::new(0),
            fail_first_runs: AtomicU32::new(0),
        });
        let queue = queue_with(backend).await;
        let err = queue
            .enqueue(job(json!({
                "type": "p",
                "payload": {},
                "queue": "tpu",
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvoyError::Validation(_)));
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_effect_chains_a_child_job() {
        let backend = Arc::new(EchoBackend {
            calls: AtomicU32::new(0),
            fail_first_runs: AtomicU32::new(0),
        });
        let queue = queue_with(backend).await;
        let mut changes = queue.subscribe();
        let parent = queue
            .enqueue(job(json!({
                "type": "parent",
                "payload": {"next": "publish"},
                "backend": "echo",
                "onSuccess": [{
                    "$event": "enqueue",
                    "task": {
                        "type": "{{payload.next}}",
                        "payload": {"from": "{{jobId}}"},
                        "backend": "echo",
                    },
                }],
            })))
            .await
            .unwrap();

        wait_terminal(&queue, &parent).await;

        // A second job id shows up and completes.
        let child_id = loop {
            let change = changes.recv().await.unwrap();
            if change.job_id != parent && change.state == BrokerState::Completed {
                break change.job_id;
            }
        };
        let child = queue.status(&child_id, None).await.unwrap().unwrap();
        assert_eq!(child.job_type.as_deref(), Some("publish"));
        assert_eq!(child.result.unwrap()["from"], json!(parent));
        queue.shutdown().await.unwrap();
    }
}
