// crates/convoy-engines/src/modal.rs

//! Modal backend adapter
//!
//! Forwards a resolved task to a Modal-hosted task service:
//! POST `<url>/run_task` with `{task_type, payload}` and bearer auth,
//! status at `<url>/status/<id>`, health at `<url>/health_check` with a
//! fallback to `<url>/health`.

use async_trait::async_trait;
use convoy_core::config::BackendConfig;
use convoy_core::error::{ConvoyError, Result};
use convoy_core::traits::Backend;
use convoy_core::types::{RemoteTaskStatus, ResourcePool, TaskRequest};
use log::{debug, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_EXECUTE_TIMEOUT_SECS: u64 = 120;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ModalBackend {
    config: BackendConfig,
    client: Client,
}

impl ModalBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn probe_endpoint(&self, path: &str) -> bool {
        let url = self.endpoint(path);
        match self
            .authorize(self.client.get(&url).timeout(HEALTH_TIMEOUT))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("modal probe {} failed: {}", url, e);
                false
            }
        }
    }
}

/// Extract the task result from a remote response body: the `result` field
/// when present, otherwise the whole body.
fn unwrap_result(body: Value) -> Result<Value> {
    if let Some(error) = body.get("error") {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(ConvoyError::backend_execution(message));
    }
    Ok(body.get("result").cloned().unwrap_or(body))
}

#[async_trait]
impl Backend for ModalBackend {
    async fn execute(&self, task: &TaskRequest) -> Result<Value> {
        let url = self.endpoint("run_task");
        let body = json!({
            "task_type": task.task_type,
            "payload": task.payload,
        });
        let timeout_secs = task
            .resources
            .as_ref()
            .and_then(|r| r.timeout_seconds)
            .unwrap_or(DEFAULT_EXECUTE_TIMEOUT_SECS);

        debug!("modal execute {} -> {}", task.task_type, url);
        let request = self
            .authorize(self.client.post(&url))
            .timeout(Duration::from_secs(timeout_secs))
            .header("Content-Type", "application/json")
            .json(&body);

        let response = tokio::select! {
            _ = task.cancel.cancelled() => {
                return Err(ConvoyError::backend_execution(format!(
                    "task '{}' cancelled before the modal call completed",
                    task.task_type
                )));
            }
            result = request.send() => result.map_err(|e| {
                ConvoyError::backend_execution(format!("modal request failed: {}", e))
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ConvoyError::backend_execution(format!(
                "modal returned {}: {}",
                status, text
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            ConvoyError::backend_execution(format!("modal returned invalid json: {}", e))
        })?;
        unwrap_result(body)
    }

    async fn get_status(&self, task_id: &str) -> Result<RemoteTaskStatus> {
        let url = self.endpoint(&format!("status/{}", task_id));
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ConvoyError::backend_execution(format!("modal status failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ConvoyError::backend_execution(format!(
                "modal status returned {}",
                response.status()
            )));
        }
        response.json().await.map_err(|e| {
            ConvoyError::backend_execution(format!("modal status returned invalid json: {}", e))
        })
    }

    async fn is_healthy(&self) -> bool {
        if self.probe_endpoint("health_check").await {
            return true;
        }
        self.probe_endpoint("health").await
    }

    async fn get_resources(&self) -> Option<ResourcePool> {
        let url = self.endpoint("resources");
        let response = self
            .authorize(self.client.get(&url).timeout(HEALTH_TIMEOUT))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }

    async fn cancel(&self, task_id: &str) -> Result<bool> {
        let url = self.endpoint(&format!("cancel/{}", task_id));
        match self.authorize(self.client.post(&url)).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                warn!("modal cancel for '{}' failed: {}", task_id, e);
                Ok(false)
            }
        }
    }
}
