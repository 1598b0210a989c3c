// crates/convoy-engines/src/registry.rs

//! Backend registry and selector
//!
//! A registry is a name -> adapter mapping with insertion order preserved.
//! Registration happens at startup; selection during dispatch only reads.
//! Selection rules: an explicit hint must name a registered, healthy
//! backend; `"auto"` (or no hint) picks the first registered backend whose
//! health probe passes. Probes are capped at five seconds.

use convoy_core::error::{ConvoyError, Result};
use convoy_core::traits::Backend;
use log::{debug, warn};
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Name -> adapter mapping with insertion order preserved.
pub struct BackendRegistry {
    entries: RwLock<Vec<(String, Arc<dyn Backend>)>>,
}

static GLOBAL: Lazy<Arc<BackendRegistry>> = Lazy::new(|| Arc::new(BackendRegistry::new()));

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// The process-wide registry used when no explicit registry is injected.
    pub fn global() -> Arc<BackendRegistry> {
        GLOBAL.clone()
    }

    /// Register an adapter. Re-registering a name replaces the adapter in place.
    pub async fn register(&self, name: &str, backend: Arc<dyn Backend>) {
        let mut entries = self.entries.write().await;
        if let Some(slot) = entries.iter_mut().find(|(n, _)| n == name) {
            slot.1 = backend;
        } else {
            entries.push((name.to_string(), backend));
        }
        debug!("registered backend '{}'", name);
    }

    /// Remove all adapters. Test helper.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn names(&self) -> Vec<String> {
        self.entries.read().await.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Pick an adapter for a task based on the hint.
    pub async fn select(&self, hint: Option<&str>) -> Result<(String, Arc<dyn Backend>)> {
        match hint {
            Some(name) if name != "auto" => {
                let backend = {
                    let entries = self.entries.read().await;
                    entries
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|(_, b)| b.clone())
                };
                let backend = backend.ok_or_else(|| {
                    ConvoyError::backend_unavailable(name, "not registered")
                })?;
                if !probe(name, &backend).await {
                    return Err(ConvoyError::backend_unavailable(
                        name,
                        "health probe failed",
                    ));
                }
                Ok((name.to_string(), backend))
            }
            _ => {
                let entries: Vec<(String, Arc<dyn Backend>)> =
                    self.entries.read().await.clone();
                if entries.is_empty() {
                    return Err(ConvoyError::backend_unavailable(
                        "auto",
                        "no backends registered",
                    ));
                }
                for (name, backend) in &entries {
                    if probe(name, backend).await {
                        return Ok((name.clone(), backend.clone()));
                    }
                }
                Err(ConvoyError::backend_unavailable(
                    "auto",
                    "no healthy backend available",
                ))
            }
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn probe(name: &str, backend: &Arc<dyn Backend>) -> bool {
    match timeout(HEALTH_PROBE_TIMEOUT, backend.is_healthy()).await {
        Ok(healthy) => healthy,
        Err(_) => {
            warn!("health probe for backend '{}' timed out", name);
            false
        }
    }
}

/// Register on the process-wide registry.
pub async fn register(name: &str, backend: Arc<dyn Backend>) {
    BackendRegistry::global().register(name, backend).await;
}

/// Clear the process-wide registry. Test helper.
pub async fn clear() {
    BackendRegistry::global().clear().await;
}

/// Select from the process-wide registry.
pub async fn select(hint: Option<&str>) -> Result<(String, Arc<dyn Backend>)> {
    BackendRegistry::global().select(hint).await
}
