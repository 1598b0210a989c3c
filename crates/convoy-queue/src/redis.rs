// crates/convoy-queue/src/redis.rs

//! Redis-backed broker (`redis-backend` feature)
//!
//! Maps the broker contract onto a Redis-compatible store: one hash entry
//! per job, a per-lane sorted set of ready jobs (scored so higher priority
//! pops first, FIFO within a priority), and a per-lane sorted set of
//! delayed jobs scored by their due time. Claiming uses `ZPOPMIN`, which is
//! atomic, so concurrent workers never take the same job. State-change
//! notifications are per-process; cross-process dashboards should watch the
//! store directly.

use crate::broker::{
    BackoffSpec, Broker, BrokerJob, BrokerState, JobOptions, RetryDisposition, StateChange,
};
use async_trait::async_trait;
use chrono::Utc;
use convoy_core::error::{ConvoyError, Result};
use convoy_core::types::Job;
use log::{debug, warn};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

const WAIT_SLICE: Duration = Duration::from_millis(250);

pub struct RedisBroker {
    manager: ConnectionManager,
    prefix: String,
    changes: broadcast::Sender<StateChange>,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ConvoyError::queue(format!("bad redis url: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| ConvoyError::queue(format!("redis connect failed: {}", e)))?;
        Ok(Self {
            manager,
            prefix: "convoy".to_string(),
            changes: broadcast::channel(256).0,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn jobs_key(&self, lane: &str) -> String {
        format!("{}:{}:jobs", self.prefix, lane)
    }

    fn ready_key(&self, lane: &str) -> String {
        format!("{}:{}:ready", self.prefix, lane)
    }

    fn delayed_key(&self, lane: &str) -> String {
        format!("{}:{}:delayed", self.prefix, lane)
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.prefix)
    }

    /// Ready-set score: lower pops first. Priority dominates, the sequence
    /// number breaks ties FIFO.
    fn ready_score(priority: i32, seq: u64) -> f64 {
        -(priority as f64) * 1e12 + seq as f64
    }

    fn publish(&self, lane: &str, job_id: &str, state: BrokerState) {
        let _ = self.changes.send(StateChange {
            lane: lane.to_string(),
            job_id: job_id.to_string(),
            state,
        });
    }

    async fn load(&self, lane: &str, job_id: &str) -> Result<Option<BrokerJob>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .hget(self.jobs_key(lane), job_id)
            .await
            .map_err(|e| ConvoyError::queue(format!("redis hget failed: {}", e)))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, lane: &str, job: &BrokerJob) -> Result<()> {
        let mut conn = self.manager.clone();
        let raw = serde_json::to_string(job)?;
        let _: () = conn
            .hset(self.jobs_key(lane), &job.id, raw)
            .await
            .map_err(|e| ConvoyError::queue(format!("redis hset failed: {}", e)))?;
        Ok(())
    }

    async fn next_seq(&self) -> Result<u64> {
        let mut conn = self.manager.clone();
        conn.incr(self.seq_key(), 1u64)
            .await
            .map_err(|e| ConvoyError::queue(format!("redis incr failed: {}", e)))
    }

    /// Move due delayed jobs into the ready set.
    async fn promote_due(&self, lane: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let now = Utc::now().timestamp_millis() as f64;
        let due: Vec<String> = conn
            .zrangebyscore(self.delayed_key(lane), f64::MIN, now)
            .await
            .map_err(|e| ConvoyError::queue(format!("redis zrangebyscore failed: {}", e)))?;

        for job_id in due {
            let removed: i64 = conn
                .zrem(self.delayed_key(lane), &job_id)
                .await
                .map_err(|e| ConvoyError::queue(format!("redis zrem failed: {}", e)))?;
            // Another worker promoted it first.
            if removed == 0 {
                continue;
            }
            if let Some(mut job) = self.load(lane, &job_id).await? {
                if job.state == BrokerState::Delayed {
                    job.state = BrokerState::Waiting;
                    self.store(lane, &job).await?;
                }
                let seq = self.next_seq().await?;
                let _: () = conn
                    .zadd(
                        self.ready_key(lane),
                        &job_id,
                        Self::ready_score(job.opts.priority, seq),
                    )
                    .await
                    .map_err(|e| ConvoyError::queue(format!("redis zadd failed: {}", e)))?;
            }
        }
        Ok(())
    }

    async fn push_delayed(&self, lane: &str, job_id: &str, due_ms: i64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .zadd(self.delayed_key(lane), job_id, due_ms as f64)
            .await
            .map_err(|e| ConvoyError::queue(format!("redis zadd failed: {}", e)))?;
        Ok(())
    }

    async fn schedule_repeat(&self, lane: &str, source: &BrokerJob) -> Result<()> {
        let Some(pattern) = source.opts.repeat.clone() else {
            return Ok(());
        };
        let next = match crate::memory::next_occurrence(&pattern) {
            Ok(next) => next,
            Err(e) => {
                warn!(
                    "job {}: dropping repeat pattern '{}': {}",
                    source.id, pattern, e
                );
                return Ok(());
            }
        };
        let id = Uuid::new_v4().to_string();
        let repeated = BrokerJob {
            id: id.clone(),
            lane: lane.to_string(),
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
        self.store(lane, &repeated).await?;
        self.push_delayed(lane, &id, next.timestamp_millis()).await?;
        debug!("scheduled repeat of job {} as {} at {}", source.id, id, next);
        self.publish(lane, &id, BrokerState::Delayed);
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, lane: &str, job: Job, opts: JobOptions) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let delayed = opts.delay_ms > 0;
        let record = BrokerJob {
            id: id.clone(),
            lane: lane.to_string(),
            job,
            opts,
            state: if delayed {
                BrokerState::Delayed
            } else {
                BrokerState::Waiting
            },
            attempts_made: 0,
            progress: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancel_requested: false,
        };

        self.store(lane, &record).await?;
        if delayed {
            let due = Utc::now().timestamp_millis() + record.opts.delay_ms as i64;
            self.push_delayed(lane, &id, due).await?;
        } else {
            let seq = self.next_seq().await?;
            let mut conn = self.manager.clone();
            let _: () = conn
                .zadd(
                    self.ready_key(lane),
                    &id,
                    Self::ready_score(record.opts.priority, seq),
                )
                .await
                .map_err(|e| ConvoyError::queue(format!("redis zadd failed: {}", e)))?;
        }
        self.publish(lane, &id, record.state);
        Ok(id)
    }

    async fn claim(&self, lane: &str) -> Result<Option<BrokerJob>> {
        self.promote_due(lane).await?;
        let mut conn = self.manager.clone();
        loop {
            // ZPOPMIN is atomic: exactly one worker gets each entry.
            let popped: Vec<(String, f64)> = conn
                .zpopmin(self.ready_key(lane), 1)
                .await
                .map_err(|e| ConvoyError::queue(format!("redis zpopmin failed: {}", e)))?;
            let Some((job_id, _)) = popped.into_iter().next() else {
                return Ok(None);
            };
            let Some(mut job) = self.load(lane, &job_id).await? else {
                continue;
            };
            if job.state != BrokerState::Waiting {
                continue;
            }
            if job.cancel_requested {
                job.state = BrokerState::Failed;
                job.error = Some("cancelled".to_string());
                job.completed_at = Some(Utc::now());
                self.store(lane, &job).await?;
                self.publish(lane, &job_id, BrokerState::Failed);
                continue;
            }
            job.state = BrokerState::Active;
            job.attempts_made += 1;
            job.started_at = Some(Utc::now());
            self.store(lane, &job).await?;
            self.publish(lane, &job_id, BrokerState::Active);
            return Ok(Some(job));
        }
    }

    async fn wait_for_work(&self, _lane: &str) {
        tokio::time::sleep(WAIT_SLICE).await;
    }

    async fn complete(&self, lane: &str, job_id: &str, result: Value) -> Result<()> {
        let mut job = self
            .load(lane, job_id)
            .await?
            .ok_or_else(|| ConvoyError::queue(format!("unknown job '{}'", job_id)))?;
        job.state = BrokerState::Completed;
        job.result = Some(result);
        job.progress = 100;
        job.completed_at = Some(Utc::now());
        self.store(lane, &job).await?;
        self.schedule_repeat(lane, &job).await?;
        self.publish(lane, job_id, BrokerState::Completed);
        Ok(())
    }

    async fn fail(&self, lane: &str, job_id: &str, error: &str) -> Result<RetryDisposition> {
        let mut job = self
            .load(lane, job_id)
            .await?
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
            self.store(lane, &job).await?;
            let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            self.push_delayed(lane, job_id, due).await?;
            self.publish(lane, job_id, BrokerState::Delayed);
            Ok(RetryDisposition::Retried { delay })
        } else {
            job.state = BrokerState::Failed;
            job.completed_at = Some(Utc::now());
            self.store(lane, &job).await?;
            self.schedule_repeat(lane, &job).await?;
            self.publish(lane, job_id, BrokerState::Failed);
            Ok(RetryDisposition::Terminal)
        }
    }

    async fn set_progress(&self, lane: &str, job_id: &str, progress: u8) -> Result<()> {
        let mut job = self
            .load(lane, job_id)
            .await?
            .ok_or_else(|| ConvoyError::queue(format!("unknown job '{}'", job_id)))?;
        job.progress = progress.min(100);
        self.store(lane, &job).await
    }

    async fn get_job(&self, lane: &str, job_id: &str) -> Result<Option<BrokerJob>> {
        self.load(lane, job_id).await
    }

    async fn get_jobs(
        &self,
        lane: &str,
        states: &[BrokerState],
        limit: usize,
    ) -> Result<Vec<BrokerJob>> {
        let mut conn = self.manager.clone();
        let raw: Vec<String> = conn
            .hvals(self.jobs_key(lane))
            .await
            .map_err(|e| ConvoyError::queue(format!("redis hvals failed: {}", e)))?;
        let mut jobs = Vec::new();
        for entry in raw {
            match serde_json::from_str::<BrokerJob>(&entry) {
                Ok(job) if states.is_empty() || states.contains(&job.state) => jobs.push(job),
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable job record: {}", e),
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn request_cancel(&self, lane: &str, job_id: &str) -> Result<bool> {
        let Some(mut job) = self.load(lane, job_id).await? else {
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
            self.store(lane, &job).await?;
            self.publish(lane, job_id, BrokerState::Failed);
        } else {
            self.store(lane, &job).await?;
        }
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager owns no background resources that need flushing;
        // in-flight state lives in the store.
        Ok(())
    }
}
