// crates/convoy-engines/src/effects.rs

//! Effect dispatcher
//!
//! Effects are declarative lifecycle hooks attached to a job (`onPending`,
//! `onProgress`, `onSuccess`, `onError`). Each record is a tagged object
//! whose `$event` field selects a handler from a registry populated once at
//! construction. Handlers run in declaration order and each is awaited
//! before the next; failures are logged and swallowed so effects can never
//! change a job's outcome. Unknown `$event` kinds produce a warning.

use async_trait::async_trait;
use convoy_core::config::Settings;
use convoy_core::error::{ConvoyError, Result};
use convoy_core::template;
use convoy_core::traits::{EmailSender, Enqueuer};
use convoy_core::types::{Job, JobContext};
use convoy_core::validation;
use log::{debug, warn};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Context handed to every effect handler
#[derive(Debug, Clone)]
pub struct EffectContext {
    pub job_id: String,
    pub job_type: String,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub progress: Option<u8>,
}

impl EffectContext {
    pub fn new(job_id: &str, job: &Job) -> Self {
        Self {
            job_id: job_id.to_string(),
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            result: None,
            error: None,
            progress: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Template context for interpolating effect strings.
    fn template_context(&self) -> JobContext {
        let mut ctx = JobContext::new(self.payload.clone());
        let mut extras = Map::new();
        extras.insert("jobId".to_string(), Value::String(self.job_id.clone()));
        extras.insert("task".to_string(), Value::String(self.job_type.clone()));
        if let Some(result) = &self.result {
            extras.insert("result".to_string(), result.clone());
        }
        if let Some(error) = &self.error {
            extras.insert("error".to_string(), Value::String(error.clone()));
        }
        if let Some(progress) = self.progress {
            extras.insert("progress".to_string(), Value::from(progress));
        }
        ctx.extras = extras;
        ctx
    }
}

/// One effect kind's implementation.
#[async_trait]
pub trait EffectHandler: Send + Sync {
    /// The `$event` discriminant this handler consumes.
    fn kind(&self) -> &'static str;

    async fn handle(&self, record: &Value, ctx: &EffectContext) -> Result<()>;
}

/// `$event`-keyed handler registry.
pub struct EffectDispatcher {
    handlers: HashMap<String, Arc<dyn EffectHandler>>,
}

impl EffectDispatcher {
    /// Build a dispatcher with the built-in handlers registered.
    /// The `enqueue` handler is only present when an [`Enqueuer`] is given.
    pub fn new(settings: &Settings, enqueuer: Option<Arc<dyn Enqueuer>>) -> Self {
        let client = Client::new();
        let mut dispatcher = Self {
            handlers: HashMap::new(),
        };
        dispatcher.register(Arc::new(ToastHandler));
        dispatcher.register(Arc::new(InvalidateHandler));
        dispatcher.register(Arc::new(EmitHandler));
        dispatcher.register(Arc::new(WebhookHandler {
            client: client.clone(),
        }));
        dispatcher.register(Arc::new(NotifyHandler {
            client,
            slack_url: settings.slack_webhook_url.clone(),
            discord_url: settings.discord_webhook_url.clone(),
            email: None,
        }));
        if let Some(enqueuer) = enqueuer {
            dispatcher.register(Arc::new(EnqueueHandler { enqueuer }));
        }
        dispatcher
    }

    /// Register (or replace) a handler for its `$event` kind.
    pub fn register(&mut self, handler: Arc<dyn EffectHandler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    /// Invoke handlers for each record in declaration order. Best-effort:
    /// individual failures are logged and the remaining effects still run.
    pub async fn dispatch(&self, effects: &[Value], ctx: &EffectContext) {
        if effects.is_empty() {
            return;
        }
        let template_ctx = ctx.template_context();
        for record in effects {
            let Some(kind) = record.get("$event").and_then(Value::as_str) else {
                warn!("effect record without $event discriminant: {}", record);
                continue;
            };
            let Some(handler) = self.handlers.get(kind) else {
                warn!("no handler registered for effect '{}'", kind);
                continue;
            };
            let resolved = template::resolve_tree(record, &template_ctx);
            if let Err(e) = handler.handle(&resolved, ctx).await {
                warn!("effect '{}' failed for job {}: {}", kind, ctx.job_id, e);
            }
        }
    }
}

// === In-process channels ===

/// UI notification record published by the `toast` effect.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToastNotice {
    pub message: String,
    pub kind: String,
    pub job_id: String,
}

/// Cache-invalidation record published by the `invalidate` effect.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InvalidationNotice {
    pub path: Option<String>,
    pub tags: Option<Vec<String>>,
    pub task_id: String,
}

/// Custom named event published by the `emit` effect.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CustomEvent {
    pub event: String,
    pub data: Value,
    pub job_id: String,
}

static TOASTS: Lazy<broadcast::Sender<ToastNotice>> = Lazy::new(|| broadcast::channel(64).0);
static INVALIDATIONS: Lazy<broadcast::Sender<InvalidationNotice>> =
    Lazy::new(|| broadcast::channel(64).0);
static CUSTOM_EVENTS: Lazy<broadcast::Sender<CustomEvent>> = Lazy::new(|| broadcast::channel(64).0);

pub fn subscribe_toasts() -> broadcast::Receiver<ToastNotice> {
    TOASTS.subscribe()
}

pub fn subscribe_invalidations() -> broadcast::Receiver<InvalidationNotice> {
    INVALIDATIONS.subscribe()
}

pub fn subscribe_custom_events() -> broadcast::Receiver<CustomEvent> {
    CUSTOM_EVENTS.subscribe()
}

// === Built-in handlers ===

#[derive(Deserialize)]
struct ToastRecord {
    message: String,
    #[serde(default)]
    kind: Option<String>,
}

struct ToastHandler;

#[async_trait]
impl EffectHandler for ToastHandler {
    fn kind(&self) -> &'static str {
        "toast"
    }

    async fn handle(&self, record: &Value, ctx: &EffectContext) -> Result<()> {
        let record: ToastRecord = serde_json::from_value(record.clone())?;
        // Lossy send: no subscriber means no I/O.
        let _ = TOASTS.send(ToastNotice {
            message: record.message,
            kind: record.kind.unwrap_or_else(|| "info".to_string()),
            job_id: ctx.job_id.clone(),
        });
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvalidateRecord {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

struct InvalidateHandler;

#[async_trait]
impl EffectHandler for InvalidateHandler {
    fn kind(&self) -> &'static str {
        "invalidate"
    }

    async fn handle(&self, record: &Value, ctx: &EffectContext) -> Result<()> {
        let record: InvalidateRecord = serde_json::from_value(record.clone())?;
        let _ = INVALIDATIONS.send(InvalidationNotice {
            path: record.path,
            tags: record.tags,
            task_id: ctx.job_id.clone(),
        });
        Ok(())
    }
}

#[derive(Deserialize)]
struct EmitRecord {
    event: String,
    #[serde(default)]
    data: Option<Value>,
}

struct EmitHandler;

#[async_trait]
impl EffectHandler for EmitHandler {
    fn kind(&self) -> &'static str {
        "emit"
    }

    async fn handle(&self, record: &Value, ctx: &EffectContext) -> Result<()> {
        let record: EmitRecord = serde_json::from_value(record.clone())?;
        let _ = CUSTOM_EVENTS.send(CustomEvent {
            event: record.event,
            data: record.data.unwrap_or(Value::Null),
            job_id: ctx.job_id.clone(),
        });
        Ok(())
    }
}

#[derive(Deserialize)]
struct WebhookRecord {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Option<HashMap<String, String>>,
}

struct WebhookHandler {
    client: Client,
}

#[async_trait]
impl EffectHandler for WebhookHandler {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn handle(&self, record: &Value, ctx: &EffectContext) -> Result<()> {
        let record: WebhookRecord = serde_json::from_value(record.clone())?;
        let method = record
            .method
            .as_deref()
            .map(|m| reqwest::Method::from_bytes(m.to_uppercase().as_bytes()))
            .transpose()
            .map_err(|e| ConvoyError::validation(format!("bad webhook method: {}", e)))?
            .unwrap_or(reqwest::Method::POST);

        let body = json!({
            "task": ctx.job_type,
            "result": ctx.result,
            "error": ctx.error,
            "jobId": ctx.job_id,
        });

        let mut request = self
            .client
            .request(method, &record.url)
            .header("Content-Type", "application/json");
        if let Some(headers) = &record.headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| ConvoyError::backend_execution(format!("webhook failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(ConvoyError::backend_execution(format!(
                "webhook {} returned {}",
                record.url,
                response.status()
            )));
        }
        debug!("webhook delivered to {}", record.url);
        Ok(())
    }
}

#[derive(Deserialize)]
struct NotifyRecord {
    channel: String,
    message: String,
    #[serde(default)]
    to: Option<String>,
}

struct NotifyHandler {
    client: Client,
    slack_url: Option<String>,
    discord_url: Option<String>,
    email: Option<Arc<dyn EmailSender>>,
}

impl NotifyHandler {
    async fn post_json(&self, url: &str, body: Value) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ConvoyError::backend_execution(format!("notify failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(ConvoyError::backend_execution(format!(
                "notify endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EffectHandler for NotifyHandler {
    fn kind(&self) -> &'static str {
        "notify"
    }

    async fn handle(&self, record: &Value, _ctx: &EffectContext) -> Result<()> {
        let record: NotifyRecord = serde_json::from_value(record.clone())?;
        match record.channel.as_str() {
            "slack" => {
                let url = self.slack_url.as_deref().ok_or_else(|| {
                    ConvoyError::validation("SLACK_WEBHOOK_URL is not configured")
                })?;
                self.post_json(url, json!({"text": record.message})).await
            }
            "discord" => {
                let url = self.discord_url.as_deref().ok_or_else(|| {
                    ConvoyError::validation("DISCORD_WEBHOOK_URL is not configured")
                })?;
                self.post_json(url, json!({"content": record.message})).await
            }
            "email" => {
                let sender = self
                    .email
                    .as_ref()
                    .ok_or_else(|| ConvoyError::validation("no email sender installed"))?;
                let to = record
                    .to
                    .as_deref()
                    .ok_or_else(|| ConvoyError::validation("email notify requires 'to'"))?;
                sender.send(to, &record.message).await
            }
            other => Err(ConvoyError::validation(format!(
                "unknown notify channel '{}'",
                other
            ))),
        }
    }
}

#[derive(Deserialize)]
struct EnqueueRecord {
    task: Value,
}

struct EnqueueHandler {
    enqueuer: Arc<dyn Enqueuer>,
}

#[async_trait]
impl EffectHandler for EnqueueHandler {
    fn kind(&self) -> &'static str {
        "enqueue"
    }

    async fn handle(&self, record: &Value, ctx: &EffectContext) -> Result<()> {
        // The record was already deep-interpolated by the dispatcher; the
        // child must still be a well-formed job after substitution.
        let record: EnqueueRecord = serde_json::from_value(record.clone())?;
        let job = validation::validate_job(&record.task)?;
        let child_id = self.enqueuer.enqueue(job).await?;
        debug!("job {} enqueued child job {}", ctx.job_id, child_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::types::Job;
    use std::sync::Mutex;

    fn job(effects_field: &str, effects: Vec<Value>) -> (Job, Vec<Value>) {
        let mut doc = json!({"type": "demo", "payload": {"name": "clip"}});
        doc[effects_field] = Value::Array(effects.clone());
        (serde_json::from_value(doc).unwrap(), effects)
    }

    // The channels are process-wide, so receive loops filter by job id to
    // stay independent of toasts sent by concurrently running tests.
    async fn recv_toast_for(rx: &mut broadcast::Receiver<ToastNotice>, job_id: &str) -> ToastNotice {
        loop {
            let notice = rx.recv().await.unwrap();
            if notice.job_id == job_id {
                return notice;
            }
        }
    }

    #[tokio::test]
    async fn toast_reaches_subscribers_with_interpolation() {
        let mut rx = subscribe_toasts();
        let (job, effects) = job(
            "onSuccess",
            vec![json!({"$event": "toast", "message": "done: {{payload.name}}"})],
        );
        let dispatcher = EffectDispatcher::new(&Settings::default(), None);
        let ctx = EffectContext::new("job-1", &job).with_result(json!({"ok": true}));
        dispatcher.dispatch(&effects, &ctx).await;

        let notice = recv_toast_for(&mut rx, "job-1").await;
        assert_eq!(notice.message, "done: clip");
        assert_eq!(notice.kind, "info");
    }

    #[tokio::test]
    async fn unknown_event_is_skipped() {
        let (job, effects) = job(
            "onSuccess",
            vec![
                json!({"$event": "hologram", "message": "?"}),
                json!({"$event": "toast", "message": "still runs"}),
            ],
        );
        let mut rx = subscribe_toasts();
        let dispatcher = EffectDispatcher::new(&Settings::default(), None);
        dispatcher
            .dispatch(&effects, &EffectContext::new("job-2", &job))
            .await;

        let notice = recv_toast_for(&mut rx, "job-2").await;
        assert_eq!(notice.message, "still runs");
    }

    struct FailingHandler;

    #[async_trait]
    impl EffectHandler for FailingHandler {
        fn kind(&self) -> &'static str {
            "explode"
        }

        async fn handle(&self, _record: &Value, _ctx: &EffectContext) -> Result<()> {
            Err(ConvoyError::backend_execution("handler blew up"))
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_later_effects() {
        let (job, effects) = job(
            "onError",
            vec![
                json!({"$event": "explode"}),
                json!({"$event": "emit", "event": "after-failure"}),
            ],
        );
        let mut rx = subscribe_custom_events();
        let dispatcher = {
            let mut d = EffectDispatcher::new(&Settings::default(), None);
            d.register(Arc::new(FailingHandler));
            d
        };
        dispatcher
            .dispatch(&effects, &EffectContext::new("job-3", &job).with_error("bad"))
            .await;

        let event = loop {
            let event = rx.recv().await.unwrap();
            if event.job_id == "job-3" {
                break event;
            }
        };
        assert_eq!(event.event, "after-failure");
    }

    struct RecordingEnqueuer {
        jobs: Mutex<Vec<Job>>,
    }

    #[async_trait]
    impl Enqueuer for RecordingEnqueuer {
        async fn enqueue(&self, job: Job) -> Result<String> {
            self.jobs.lock().unwrap().push(job);
            Ok("child-1".to_string())
        }
    }

    #[tokio::test]
    async fn enqueue_builds_interpolated_child_job() {
        let enqueuer = Arc::new(RecordingEnqueuer {
            jobs: Mutex::new(Vec::new()),
        });
        let (job, effects) = job(
            "onSuccess",
            vec![json!({
                "$event": "enqueue",
                "task": {
                    "type": "publish",
                    "payload": {"source": "{{result.url}}", "label": "from {{payload.name}}"}
                }
            })],
        );
        let dispatcher = EffectDispatcher::new(&Settings::default(), Some(enqueuer.clone()));
        let ctx = EffectContext::new("job-4", &job).with_result(json!({"url": "s3://out/a.mp4"}));
        dispatcher.dispatch(&effects, &ctx).await;

        let jobs = enqueuer.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, "publish");
        assert_eq!(jobs[0].payload["source"], json!("s3://out/a.mp4"));
        assert_eq!(jobs[0].payload["label"], json!("from clip"));
    }

    #[tokio::test]
    async fn invalidate_carries_task_id() {
        let (job, effects) = job(
            "onSuccess",
            vec![json!({"$event": "invalidate", "tags": ["media"], "path": "/videos"})],
        );
        let mut rx = subscribe_invalidations();
        let dispatcher = EffectDispatcher::new(&Settings::default(), None);
        dispatcher
            .dispatch(&effects, &EffectContext::new("job-5", &job))
            .await;

        let notice = loop {
            let notice = rx.recv().await.unwrap();
            if notice.task_id == "job-5" {
                break notice;
            }
        };
        assert_eq!(notice.path.as_deref(), Some("/videos"));
        assert_eq!(notice.tags, Some(vec!["media".to_string()]));
    }
}
