// crates/convoy-engines/src/ray.rs

//! Ray backend adapter
//!
//! Same task-service wire protocol as the Modal adapter (`/run_task`,
//! `/status/<id>`) against a Ray Serve deployment. Ray clusters expose
//! `/health` directly, and a secondary head-node URL can be configured as a
//! fallback for execution.

use async_trait::async_trait;
use convoy_core::config::BackendConfig;
use convoy_core::error::{ConvoyError, Result};
use convoy_core::traits::Backend;
use convoy_core::types::{RemoteTaskStatus, TaskRequest};
use log::debug;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_EXECUTE_TIMEOUT_SECS: u64 = 120;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct RayBackend {
    config: BackendConfig,
    client: Client,
}

impl RayBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn endpoint(&self, base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }

    async fn run_task(&self, base: &str, task: &TaskRequest) -> Result<Value> {
        let url = self.endpoint(base, "run_task");
        let timeout_secs = task
            .resources
            .as_ref()
            .and_then(|r| r.timeout_seconds)
            .unwrap_or(DEFAULT_EXECUTE_TIMEOUT_SECS);

        debug!("ray execute {} -> {}", task.task_type, url);
        let request = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(timeout_secs))
            .header("Content-Type", "application/json")
            .json(&json!({
                "task_type": task.task_type,
                "payload": task.payload,
            }));

        let response = tokio::select! {
            _ = task.cancel.cancelled() => {
                return Err(ConvoyError::backend_execution(format!(
                    "task '{}' cancelled before the ray call completed",
                    task.task_type
                )));
            }
            result = request.send() => result.map_err(|e| {
                ConvoyError::backend_execution(format!("ray request failed: {}", e))
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ConvoyError::backend_execution(format!(
                "ray returned {}: {}",
                status, text
            )));
        }
        let body: Value = response.json().await.map_err(|e| {
            ConvoyError::backend_execution(format!("ray returned invalid json: {}", e))
        })?;
        if let Some(error) = body.get("error") {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(ConvoyError::backend_execution(message));
        }
        Ok(body.get("result").cloned().unwrap_or(body))
    }
}

#[async_trait]
impl Backend for RayBackend {
    async fn execute(&self, task: &TaskRequest) -> Result<Value> {
        match self.run_task(&self.config.url, task).await {
            Ok(result) => Ok(result),
            Err(primary_err) => match &self.config.fallback_url {
                Some(fallback) => {
                    debug!("ray primary failed ({}), trying fallback", primary_err);
                    self.run_task(fallback, task).await
                }
                None => Err(primary_err),
            },
        }
    }

    async fn get_status(&self, task_id: &str) -> Result<RemoteTaskStatus> {
        let url = self.endpoint(&self.config.url, &format!("status/{}", task_id));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ConvoyError::backend_execution(format!("ray status failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(ConvoyError::backend_execution(format!(
                "ray status returned {}",
                response.status()
            )));
        }
        response.json().await.map_err(|e| {
            ConvoyError::backend_execution(format!("ray status returned invalid json: {}", e))
        })
    }

    async fn is_healthy(&self) -> bool {
        let url = self.endpoint(&self.config.url, "health");
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("ray probe {} failed: {}", url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_base_and_path() {
        let backend = RayBackend::new(BackendConfig::new("http://ray-head:8000/"));
        assert_eq!(
            backend.endpoint(&backend.config.url, "health"),
            "http://ray-head:8000/health"
        );
    }
}
