// crates/convoy-cli/src/cli.rs

//! Command implementations

use crate::args::{Cli, Command};
use anyhow::{anyhow, bail, Context};
use clap::Parser;
use convoy_core::config::Settings;
use convoy_core::types::TaskState;
use convoy_core::validation;
use convoy_queue::broker::Broker;
use convoy_queue::{BrokerState, MemoryBroker, TaskQueue};
use log::info;
use serde_json::Value;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Command::Run { file, pretty } => run_job(&settings, &file, pretty).await,
        Command::Submit { file } => submit_job(&settings, &file).await,
        Command::Status { id, queue } => show_status(&settings, &id, queue.as_deref()).await,
        Command::Cancel { id, queue } => cancel_job(&settings, &id, queue.as_deref()).await,
        Command::Worker => run_workers(&settings).await,
        Command::Validate { file } => validate_file(&file),
    }
}

/// Read a job document from a JSON or YAML file, or stdin for "-".
fn load_job_document(file: &str) -> anyhow::Result<Value> {
    let (contents, is_yaml) = if file == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read job from stdin")?;
        (buffer, false)
    } else {
        let path = Path::new(file);
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read job file '{}'", file))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        (contents, is_yaml)
    };

    if is_yaml {
        let value: serde_yaml::Value =
            serde_yaml::from_str(&contents).context("job file is not valid yaml")?;
        serde_json::to_value(value).context("yaml job could not be converted to json")
    } else {
        serde_json::from_str(&contents).context("job file is not valid json")
    }
}

async fn broker_from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn Broker>> {
    #[cfg(feature = "redis-backend")]
    if let Some(url) = &settings.redis_url {
        let broker = convoy_queue::RedisBroker::connect(url).await?;
        info!("using redis broker at {}", url);
        return Ok(Arc::new(broker));
    }
    #[cfg(not(feature = "redis-backend"))]
    if settings.redis_url.is_some() {
        log::warn!(
            "REDIS_URL is set but this build lacks the redis-backend feature; using the in-memory broker"
        );
    }
    Ok(Arc::new(MemoryBroker::new()))
}

async fn run_job(settings: &Settings, file: &str, pretty: bool) -> anyhow::Result<()> {
    let doc = load_job_document(file)?;
    let job = validation::validate_job(&doc)?;

    convoy_engines::register_from_settings(settings).await?;
    let queue = TaskQueue::new(Arc::new(MemoryBroker::new()), settings.clone());
    queue.start_workers();

    let mut changes = queue.subscribe();
    let id = queue.enqueue(job).await?;
    info!("job {} accepted, waiting for completion", id);

    // The broker broadcasts every transition; wait for this job's terminal one.
    loop {
        let change = tokio::time::timeout(Duration::from_secs(3600), changes.recv())
            .await
            .context("timed out waiting for the job to finish")??;
        if change.job_id == id
            && matches!(change.state, BrokerState::Completed | BrokerState::Failed)
        {
            break;
        }
    }

    let status = queue
        .status(&id, None)
        .await?
        .ok_or_else(|| anyhow!("job {} vanished from the broker", id))?;
    queue.shutdown().await?;

    match status.status {
        TaskState::Completed => {
            let result = status.result.unwrap_or(Value::Null);
            let rendered = if pretty {
                serde_json::to_string_pretty(&result)?
            } else {
                serde_json::to_string(&result)?
            };
            println!("{}", rendered);
            Ok(())
        }
        _ => bail!(
            "job {} failed: {}",
            id,
            status.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

async fn submit_job(settings: &Settings, file: &str) -> anyhow::Result<()> {
    let doc = load_job_document(file)?;
    let job = validation::validate_job(&doc)?;
    let lane = job.queue.clone();

    let broker = broker_from_settings(settings).await?;
    let queue = TaskQueue::new(broker, settings.clone());
    let id = queue.enqueue(job).await?;

    println!(
        "{}",
        serde_json::json!({"taskId": id, "status": "queued", "queue": lane})
    );
    Ok(())
}

async fn show_status(settings: &Settings, id: &str, lane: Option<&str>) -> anyhow::Result<()> {
    let broker = broker_from_settings(settings).await?;
    let queue = TaskQueue::new(broker, settings.clone());
    match queue.status(id, lane).await? {
        Some(status) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        None => bail!("no job found with id '{}'", id),
    }
}

async fn cancel_job(settings: &Settings, id: &str, lane: Option<&str>) -> anyhow::Result<()> {
    let broker = broker_from_settings(settings).await?;
    let queue = TaskQueue::new(broker, settings.clone());
    if queue.cancel(id, lane).await? {
        println!("cancel requested for job {}", id);
        Ok(())
    } else {
        bail!("job '{}' is unknown or already finished", id);
    }
}

async fn run_workers(settings: &Settings) -> anyhow::Result<()> {
    convoy_engines::register_from_settings(settings).await?;
    let registered = convoy_engines::registry::BackendRegistry::global()
        .names()
        .await;
    if registered.is_empty() {
        log::warn!("no backends configured; set MODAL_URL and/or RAY_URL");
    } else {
        info!("backends: {}", registered.join(", "));
    }

    let broker = broker_from_settings(settings).await?;
    let queue = TaskQueue::new(broker, settings.clone());
    queue.start_workers();
    info!("workers running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    queue.shutdown().await?;
    Ok(())
}

fn validate_file(file: &str) -> anyhow::Result<()> {
    let doc = load_job_document(file)?;
    let job = validation::validate_job(&doc)?;
    let kind = if job.is_pipeline() {
        if job.is_dag() {
            "pipeline (dag)"
        } else {
            "pipeline (sequential)"
        }
    } else {
        "single task"
    };
    println!(
        "ok: {} job '{}' on lane '{}'",
        kind, job.job_type, job.queue
    );
    Ok(())
}
