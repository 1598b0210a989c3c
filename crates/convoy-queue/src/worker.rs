// crates/convoy-queue/src/worker.rs

//! Worker pool
//!
//! Each lane gets an independent set of long-lived worker tasks. A worker
//! claims one job at a time, runs it through the dispatcher with a progress
//! reporter that writes broker progress and fires `onProgress` effects, and
//! records the terminal state. Failures are re-thrown to the broker, which
//! schedules another outer attempt when the job's retry policy allows;
//! outer retries restart the entire pipeline from scratch. Shutdown is
//! cooperative through a cancellation token.

use crate::broker::{Broker, BrokerJob, RetryDisposition};
use async_trait::async_trait;
use convoy_core::traits::ProgressReporter;
use convoy_engines::effects::{EffectContext, EffectDispatcher};
use convoy_engines::Dispatcher;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Spawn `count` workers for one lane.
pub fn spawn_lane_workers(
    broker: Arc<dyn Broker>,
    lane: &str,
    count: usize,
    dispatcher: Arc<Dispatcher>,
    effects: Arc<EffectDispatcher>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let broker = broker.clone();
            let lane = lane.to_string();
            let dispatcher = dispatcher.clone();
            let effects = effects.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                debug!("worker {}#{} started", lane, index);
                worker_loop(broker, &lane, dispatcher, effects, shutdown).await;
                debug!("worker {}#{} stopped", lane, index);
            })
        })
        .collect()
}

async fn worker_loop(
    broker: Arc<dyn Broker>,
    lane: &str,
    dispatcher: Arc<Dispatcher>,
    effects: Arc<EffectDispatcher>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match broker.claim(lane).await {
            Ok(Some(job)) => {
                process_job(&broker, &dispatcher, &effects, job, &shutdown).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = broker.wait_for_work(lane) => {}
                }
            }
            Err(e) => {
                error!("worker claim on lane '{}' failed: {}", lane, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
            }
        }
    }
}

/// Run one claimed job to a terminal broker state.
async fn process_job(
    broker: &Arc<dyn Broker>,
    dispatcher: &Arc<Dispatcher>,
    effects: &Arc<EffectDispatcher>,
    claimed: BrokerJob,
    shutdown: &CancellationToken,
) {
    let lane = claimed.lane.clone();
    let job_id = claimed.id.clone();
    let job = Arc::new(claimed.job.clone());
    info!(
        "job {} (type '{}') started on lane '{}', attempt {}",
        job_id, job.job_type, lane, claimed.attempts_made
    );

    if let Err(e) = broker.set_progress(&lane, &job_id, 0).await {
        warn!("job {}: progress reset failed: {}", job_id, e);
    }

    // Best-effort cancellation: a poller flips the job token when the broker
    // records a cancel request, which stops further backend calls.
    let cancel = shutdown.child_token();
    let watcher = spawn_cancel_watcher(broker.clone(), lane.clone(), job_id.clone(), cancel.clone());

    let reporter = Arc::new(BrokerProgressReporter {
        broker: broker.clone(),
        effects: effects.clone(),
        lane: lane.clone(),
        job_id: job_id.clone(),
        base: EffectContext::new(&job_id, &job),
        on_progress: job.on_progress.clone(),
    });

    let outcome = dispatcher
        .dispatch(job.clone(), &job_id, reporter, cancel.clone())
        .await;
    watcher.abort();

    match outcome {
        Ok(result) => {
            if let Err(e) = broker.set_progress(&lane, &job_id, 100).await {
                warn!("job {}: final progress update failed: {}", job_id, e);
            }
            let ctx = EffectContext::new(&job_id, &job).with_result(result.clone());
            effects.dispatch(&job.on_success, &ctx).await;
            if let Err(e) = broker.complete(&lane, &job_id, result).await {
                error!("job {}: completion record failed: {}", job_id, e);
            }
            info!("job {} completed", job_id);
        }
        Err(e) => {
            // A step failure is reported with the step's own message
            // verbatim, not the wrapped step-name rendering.
            let message = e.job_error();
            let ctx = EffectContext::new(&job_id, &job).with_error(message.clone());
            effects.dispatch(&job.on_error, &ctx).await;
            match broker.fail(&lane, &job_id, &message).await {
                Ok(RetryDisposition::Retried { delay }) => {
                    info!(
                        "job {} failed ({}); outer retry scheduled in {:?}",
                        job_id, message, delay
                    );
                }
                Ok(RetryDisposition::Terminal) => {
                    info!("job {} failed terminally: {}", job_id, message);
                }
                Err(broker_err) => {
                    error!("job {}: failure record failed: {}", job_id, broker_err);
                }
            }
        }
    }
}

fn spawn_cancel_watcher(
    broker: Arc<dyn Broker>,
    lane: String,
    job_id: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
            match broker.get_job(&lane, &job_id).await {
                Ok(Some(job)) if job.cancel_requested => {
                    info!("job {}: cancel requested, aborting in-flight work", job_id);
                    cancel.cancel();
                    break;
                }
                Ok(Some(_)) => {}
                _ => break,
            }
        }
    })
}

/// Progress sink wired to the broker and the job's `onProgress` effects.
struct BrokerProgressReporter {
    broker: Arc<dyn Broker>,
    effects: Arc<EffectDispatcher>,
    lane: String,
    job_id: String,
    base: EffectContext,
    on_progress: Vec<Value>,
}

#[async_trait]
impl ProgressReporter for BrokerProgressReporter {
    async fn report(&self, progress: u8) {
        if let Err(e) = self.broker.set_progress(&self.lane, &self.job_id, progress).await {
            warn!("job {}: progress update failed: {}", self.job_id, e);
        }
        if !self.on_progress.is_empty() {
            let ctx = self.base.clone().with_progress(progress);
            self.effects.dispatch(&self.on_progress, &ctx).await;
        }
    }
}
