// crates/convoy-queue/src/memory.rs

//! In-memory reference broker
//!
//! Single-process implementation of the broker contract used by tests and
//! single-node deployments. All lane state lives behind one mutex, which
//! makes every state transition trivially atomic; workers park on a
//! per-lane notifier with a bounded wait so delayed jobs are promoted
//! promptly.

use crate::broker::{
    BackoffSpec, Broker, BrokerJob, BrokerState, JobOptions, RetryDisposition, StateChange,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use convoy_core::error::{ConvoyError, Result};
use convoy_core::types::Job;
use cron::Schedule;
use log::{debug, warn};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

const WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    job_id: String,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then FIFO within a priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct DelayedEntry {
    ready_at: DateTime<Utc>,
    entry: ReadyEntry,
}

#[derive(Default)]
struct LaneState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: Vec<DelayedEntry>,
    jobs: HashMap<String, BrokerJob>,
}

#[derive(Default)]
struct Inner {
    lanes: HashMap<String, LaneState>,
    seq: u64,
}

pub struct MemoryBroker {
    inner: Mutex<Inner>,
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
    changes: broadcast::Sender<StateChange>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notifiers: Mutex::new(HashMap::new()),
            changes: broadcast::channel(256).0,
        }
    }

    fn notifier(&self, lane: &str) -> Arc<Notify> {
        let mut notifiers = self.notifiers.lock().expect("notifier lock poisoned");
        notifiers
            .entry(lane.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn publish(&self, lane: &str, job_id: &str, state: BrokerState) {
        let _ = self.changes.send(StateChange {
            lane: lane.to_string(),
            job_id: job_id.to_string(),
            state,
        });
    }

    /// Move due delayed entries into the ready heap. Caller holds the lock.
    fn promote_due(lane: &mut LaneState, now: DateTime<Utc>) {
        let mut still_delayed = Vec::with_capacity(lane.delayed.len());
        for delayed in lane.delayed.drain(..) {
            if delayed.ready_at <= now {
                if let Some(job) = lane.jobs.get_mut(&delayed.entry.job_id) {
                    if job.state == BrokerState::Delayed {
                        job.state = BrokerState::Waiting;
                    }
                }
                lane.ready.push(delayed.entry);
            } else {
                still_delayed.push(delayed);
            }
        }
        lane.delayed = still_delayed;
    }

    /// Schedule the next occurrence of a repeating job as a fresh delayed
    /// job with its own id and a clean attempt counter.
    fn schedule_repeat(&self, inner: &mut Inner, lane_name: &str, source: &BrokerJob) {
        let Some(pattern) = source.opts.repeat.clone() else {
            return;
        };
        let next = match next_occurrence(&pattern) {
            Ok(next) => next,
            Err(e) => {
                warn!(
                    "job {}: dropping repeat pattern '{}': {}",
                    source.id, pattern, e
                );
                return;
            }
        };

        inner.seq += 1;
        let seq = inner.seq;
        let id = Uuid::new_v4().to_string();
        let repeated = BrokerJob {
            id: id.clone(),
            lane: lane_name.to_string(),
            job: source.job.clone(),
            opts: source.opts.clone(),
            state: BrokerState::Delayed,
            attempts_made: 0,
            progress: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancel_requested: false,
        };
        let lane = inner.lanes.entry(lane_name.to_string()).or_default();
        lane.delayed.push(DelayedEntry {
            ready_at: next,
            entry: ReadyEntry {
                priority: repeated.opts.priority,
                seq,
                job_id: id.clone(),
            },
        });
        lane.jobs.insert(id.clone(), repeated);
        debug!("scheduled repeat of job {} as {} at {}", source.id, id, next);
        self.publish(lane_name, &id, BrokerState::Delayed);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Next fire time for a cron pattern. Five-field patterns get a seconds
/// column prepended, so standard crontab syntax works as-is.
pub fn next_occurrence(pattern: &str) -> Result<DateTime<Utc>> {
    let normalized = if pattern.split_whitespace().count() == 5 {
        format!("0 {}", pattern)
    } else {
        pattern.to_string()
    };
    let schedule = Schedule::from_str(&normalized)
        .map_err(|e| ConvoyError::validation(format!("bad cron pattern '{}': {}", pattern, e)))?;
    schedule
        .upcoming(Utc)
        .next()
        .ok_or_else(|| ConvoyError::validation(format!("cron pattern '{}' never fires", pattern)))
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, lane_name: &str, job: Job, opts: JobOptions) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let delayed = opts.delay_ms > 0;
        let state = if delayed {
            BrokerState::Delayed
        } else {
            BrokerState::Waiting
        };
        let record = BrokerJob {
            id: id.clone(),
            lane: lane_name.to_string(),
            job,
            opts,
            state,
            attempts_made: 0,
            progress: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancel_requested: false,
        };

        {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            inner.seq += 1;
            let seq = inner.seq;
            let entry = ReadyEntry {
                priority: record.opts.priority,
                seq,
                job_id: id.clone(),
            };
            let lane = inner.lanes.entry(lane_name.to_string()).or_default();
            if delayed {
                let ready_at =
                    Utc::now() + ChronoDuration::milliseconds(record.opts.delay_ms as i64);
                lane.delayed.push(DelayedEntry { ready_at, entry });
            } else {
                lane.ready.push(entry);
            }
            lane.jobs.insert(id.clone(), record);
        }

        self.publish(lane_name, &id, state);
        self.notifier(lane_name).notify_waiters();
        Ok(id)
    }

    async fn claim(&self, lane_name: &str) -> Result<Option<BrokerJob>> {
        let claimed = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            let Some(lane) = inner.lanes.get_mut(lane_name) else {
                return Ok(None);
            };
            Self::promote_due(lane, Utc::now());

            let mut claimed = None;
            while let Some(entry) = lane.ready.pop() {
                match lane.jobs.get_mut(&entry.job_id) {
                    Some(job) if job.state == BrokerState::Waiting => {
                        if job.cancel_requested {
                            job.state = BrokerState::Failed;
                            job.error = Some("cancelled".to_string());
                            job.completed_at = Some(Utc::now());
                            continue;
                        }
                        job.state = BrokerState::Active;
                        job.attempts_made += 1;
                        job.started_at = Some(Utc::now());
                        claimed = Some(job.clone());
                        break;
                    }
                    // Stale heap entry for a job that moved on; drop it.
                    _ => continue,
                }
            }
            claimed
        };

        if let Some(job) = &claimed {
            self.publish(lane_name, &job.id, BrokerState::Active);
        }
        Ok(claimed)
    }

    async fn wait_for_work(&self, lane: &str) {
        let notify = self.notifier(lane);
        // Bounded wait: delayed promotion needs an occasional wakeup even
        // when nothing is enqueued.
        let _ = tokio::time::timeout(WAIT_SLICE, notify.notified()).await;
    }

    async fn complete(&self, lane_name: &str, job_id: &str, result: Value) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            let lane = inner
                .lanes
                .get_mut(lane_name)
                .ok_or_else(|| ConvoyError::queue(format!("unknown lane '{}'", lane_name)))?;
            let job = lane
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| ConvoyError::queue(format!("unknown job '{}'", job_id)))?;
            job.state = BrokerState::Completed;
            job.result = Some(result);
            job.progress = 100;
            job.completed_at = Some(Utc::now());
            let snapshot = job.clone();
            self.schedule_repeat(&mut inner, lane_name, &snapshot);
        }
        self.publish(lane_name, job_id, BrokerState::Completed);
        self.notifier(lane_name).notify_waiters();
        Ok(())
    }

    async fn fail(&self, lane_name: &str, job_id: &str, error: &str) -> Result<RetryDisposition> {
        let disposition = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            inner.seq += 1;
            let seq = inner.seq;
            let lane = inner
                .lanes
                .get_mut(lane_name)
                .ok_or_else(|| ConvoyError::queue(format!("unknown lane '{}'", lane_name)))?;
            let job = lane
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| ConvoyError::queue(format!("unknown job '{}'", job_id)))?;
            job.error = Some(error.to_string());

            if job.attempts_made < job.opts.attempts && !job.cancel_requested {
                let retry_index = job.attempts_made;
                let delay = job
                    .opts
                    .backoff
                    .clone()
                    .unwrap_or(BackoffSpec {
                        kind: convoy_core::types::BackoffKind::Fixed,
                        delay_ms: 0,
                    })
                    .delay_for(retry_index);
                job.state = BrokerState::Delayed;
                job.progress = 0;
                let entry = ReadyEntry {
                    priority: job.opts.priority,
                    seq,
                    job_id: job_id.to_string(),
                };
                lane.delayed.push(DelayedEntry {
                    ready_at: Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default(),
                    entry,
                });
                RetryDisposition::Retried { delay }
            } else {
                job.state = BrokerState::Failed;
                job.completed_at = Some(Utc::now());
                let snapshot = job.clone();
                self.schedule_repeat(&mut inner, lane_name, &snapshot);
                RetryDisposition::Terminal
            }
        };

        let state = match disposition {
            RetryDisposition::Retried { .. } => BrokerState::Delayed,
            RetryDisposition::Terminal => BrokerState::Failed,
        };
        self.publish(lane_name, job_id, state);
        self.notifier(lane_name).notify_waiters();
        Ok(disposition)
    }

    async fn set_progress(&self, lane_name: &str, job_id: &str, progress: u8) -> Result<()> {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        let job = inner
            .lanes
            .get_mut(lane_name)
            .and_then(|lane| lane.jobs.get_mut(job_id))
            .ok_or_else(|| ConvoyError::queue(format!("unknown job '{}'", job_id)))?;
        job.progress = progress.min(100);
        Ok(())
    }

    async fn get_job(&self, lane_name: &str, job_id: &str) -> Result<Option<BrokerJob>> {
        let inner = self.inner.lock().expect("broker lock poisoned");
        Ok(inner
            .lanes
            .get(lane_name)
            .and_then(|lane| lane.jobs.get(job_id))
            .cloned())
    }

    async fn get_jobs(
        &self,
        lane_name: &str,
        states: &[BrokerState],
        limit: usize,
    ) -> Result<Vec<BrokerJob>> {
        let inner = self.inner.lock().expect("broker lock poisoned");
        let Some(lane) = inner.lanes.get(lane_name) else {
            return Ok(Vec::new());
        };
        let mut jobs: Vec<BrokerJob> = lane
            .jobs
            .values()
            .filter(|job| states.is_empty() || states.contains(&job.state))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn request_cancel(&self, lane_name: &str, job_id: &str) -> Result<bool> {
        let outcome = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            let Some(job) = inner
                .lanes
                .get_mut(lane_name)
                .and_then(|lane| lane.jobs.get_mut(job_id))
            else {
                return Ok(false);
            };
            if job.state.is_terminal() {
                return Ok(false);
            }
            job.cancel_requested = true;
            if matches!(job.state, BrokerState::Waiting | BrokerState::Delayed) {
                job.state = BrokerState::Failed;
                job.error = Some("cancelled".to_string());
                job.completed_at = Some(Utc::now());
                Some(BrokerState::Failed)
            } else {
                None
            }
        };
        if let Some(state) = outcome {
            self.publish(lane_name, job_id, state);
        }
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    async fn close(&self) -> Result<()> {
        // Nothing to flush; wake any parked workers so they observe shutdown.
        let notifiers = self.notifiers.lock().expect("notifier lock poisoned");
        for notify in notifiers.values() {
            notify.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(doc: Value) -> Job {
        serde_json::from_value(doc).unwrap()
    }

    fn plain_job() -> Job {
        job(json!({"type": "t", "payload": {}}))
    }

    #[tokio::test]
    async fn claim_returns_jobs_by_priority_then_fifo() {
        let broker = MemoryBroker::new();
        let low = broker
            .enqueue("default", plain_job(), JobOptions { priority: 0, attempts: 1, ..Default::default() })
            .await
            .unwrap();
        let high = broker
            .enqueue("default", plain_job(), JobOptions { priority: 5, attempts: 1, ..Default::default() })
            .await
            .unwrap();
        let low2 = broker
            .enqueue("default", plain_job(), JobOptions { priority: 0, attempts: 1, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(broker.claim("default").await.unwrap().unwrap().id, high);
        assert_eq!(broker.claim("default").await.unwrap().unwrap().id, low);
        assert_eq!(broker.claim("default").await.unwrap().unwrap().id, low2);
        assert!(broker.claim("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_claimable_until_due() {
        let broker = MemoryBroker::new();
        let id = broker
            .enqueue(
                "default",
                plain_job(),
                JobOptions { delay_ms: 40, attempts: 1, ..Default::default() },
            )
            .await
            .unwrap();

        assert!(broker.claim("default").await.unwrap().is_none());
        let status = broker.get_job("default", &id).await.unwrap().unwrap();
        assert_eq!(status.state, BrokerState::Delayed);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let claimed = broker.claim("default").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, BrokerState::Active);
    }

    #[tokio::test]
    async fn fail_reschedules_until_attempts_exhausted() {
        let broker = MemoryBroker::new();
        let id = broker
            .enqueue(
                "default",
                plain_job(),
                JobOptions {
                    attempts: 2,
                    backoff: Some(BackoffSpec {
                        kind: convoy_core::types::BackoffKind::Fixed,
                        delay_ms: 10,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = broker.claim("default").await.unwrap().unwrap();
        assert_eq!(first.attempts_made, 1);
        let disposition = broker.fail("default", &id, "boom").await.unwrap();
        assert_eq!(
            disposition,
            RetryDisposition::Retried { delay: Duration::from_millis(10) }
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = broker.claim("default").await.unwrap().unwrap();
        assert_eq!(second.attempts_made, 2);
        let disposition = broker.fail("default", &id, "boom again").await.unwrap();
        assert_eq!(disposition, RetryDisposition::Terminal);

        let job = broker.get_job("default", &id).await.unwrap().unwrap();
        assert_eq!(job.state, BrokerState::Failed);
        assert_eq!(job.error.as_deref(), Some("boom again"));
        assert_eq!(job.to_status().status, convoy_core::types::TaskState::Failed);
    }

    #[tokio::test]
    async fn complete_records_result_and_progress() {
        let broker = MemoryBroker::new();
        let id = broker
            .enqueue("default", plain_job(), JobOptions { attempts: 1, ..Default::default() })
            .await
            .unwrap();
        broker.claim("default").await.unwrap().unwrap();
        broker
            .complete("default", &id, json!({"out": 1}))
            .await
            .unwrap();

        let job = broker.get_job("default", &id).await.unwrap().unwrap();
        assert_eq!(job.state, BrokerState::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result, Some(json!({"out": 1})));
    }

    #[tokio::test]
    async fn cancel_before_start_fails_the_job() {
        let broker = MemoryBroker::new();
        let id = broker
            .enqueue("default", plain_job(), JobOptions { attempts: 1, ..Default::default() })
            .await
            .unwrap();

        assert!(broker.request_cancel("default", &id).await.unwrap());
        assert!(broker.claim("default").await.unwrap().is_none());
        let job = broker.get_job("default", &id).await.unwrap().unwrap();
        assert_eq!(job.state, BrokerState::Failed);
        assert_eq!(job.error.as_deref(), Some("cancelled"));

        // A second cancel reports the job already terminal.
        assert!(!broker.request_cancel("default", &id).await.unwrap());
    }

    #[tokio::test]
    async fn completion_schedules_cron_repeat() {
        let broker = MemoryBroker::new();
        let id = broker
            .enqueue(
                "default",
                plain_job(),
                JobOptions {
                    attempts: 1,
                    repeat: Some("*/5 * * * *".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        broker.claim("default").await.unwrap().unwrap();
        broker.complete("default", &id, json!(null)).await.unwrap();

        let delayed = broker
            .get_jobs("default", &[BrokerState::Delayed], 10)
            .await
            .unwrap();
        assert_eq!(delayed.len(), 1);
        assert_ne!(delayed[0].id, id);
        assert_eq!(delayed[0].opts.repeat.as_deref(), Some("*/5 * * * *"));
    }

    #[tokio::test]
    async fn state_changes_are_broadcast() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe();
        let id = broker
            .enqueue("default", plain_job(), JobOptions { attempts: 1, ..Default::default() })
            .await
            .unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.job_id, id);
        assert_eq!(change.state, BrokerState::Waiting);
    }

    #[test]
    fn five_field_cron_patterns_are_accepted() {
        assert!(next_occurrence("*/5 * * * *").is_ok());
        assert!(next_occurrence("0 0 * * * *").is_ok());
        assert!(next_occurrence("not a cron").is_err());
    }

    #[tokio::test]
    async fn lanes_are_isolated() {
        let broker = MemoryBroker::new();
        broker
            .enqueue("gpu", plain_job(), JobOptions { attempts: 1, ..Default::default() })
            .await
            .unwrap();

        assert!(broker.claim("default").await.unwrap().is_none());
        assert!(broker.claim("gpu").await.unwrap().is_some());
    }
}
