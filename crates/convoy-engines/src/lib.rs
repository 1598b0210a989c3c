//! Convoy Engines Library
//!
//! Execution core of the Convoy orchestrator: backend adapters and the
//! registry/selector that routes tasks to them, the retry executor, the
//! effect dispatcher for declarative lifecycle hooks, the step runner, and
//! the DAG and sequential pipeline executors behind the dispatcher entry
//! point.
//!
//! # Supported backends
//!
//! - **Modal** - task services deployed on Modal, bearer-token auth
//! - **Ray** - Ray Serve deployments, optional fallback head-node URL
//!
//! # Examples
//!
//! ```rust,no_run
//! use convoy_engines::{create_backend, BackendKind};
//! use convoy_core::config::BackendConfig;
//!
//! # async fn example() -> convoy_core::Result<()> {
//! let backend = create_backend(BackendKind::Modal, BackendConfig::new("http://modal.internal"))?;
//! convoy_engines::registry::register("modal", backend.into()).await;
//! # Ok(())
//! # }
//! ```

use convoy_core::config::{BackendConfig, Settings};
use convoy_core::error::{ConvoyError, Result};
use convoy_core::traits::Backend;
use log::info;
use std::str::FromStr;
use strum::{Display, EnumString};

pub mod dag_executor;
pub mod dispatcher;
pub mod effects;
pub mod events;
pub mod modal;
pub mod ray;
pub mod registry;
pub mod retry;
pub mod sequential;
pub mod step_runner;

pub use dispatcher::Dispatcher;
pub use effects::{EffectContext, EffectDispatcher, EffectHandler};
pub use registry::BackendRegistry;

/// Known backend adapter kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum BackendKind {
    #[strum(ascii_case_insensitive, to_string = "modal")]
    Modal,
    #[strum(ascii_case_insensitive, to_string = "ray")]
    Ray,
}

/// Construct a backend adapter from its kind and connection config.
pub fn create_backend(kind: BackendKind, config: BackendConfig) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match kind {
        BackendKind::Modal => Box::new(modal::ModalBackend::new(config)),
        BackendKind::Ray => Box::new(ray::RayBackend::new(config)),
    };
    Ok(backend)
}

/// Parse a backend kind name and construct the adapter.
pub fn create_backend_by_name(name: &str, config: BackendConfig) -> Result<Box<dyn Backend>> {
    let kind = BackendKind::from_str(name)
        .map_err(|_| ConvoyError::validation(format!("unknown backend kind: {}", name)))?;
    create_backend(kind, config)
}

/// Register adapters on the global registry for every backend configured in
/// the environment, in the order the selector should try them.
pub async fn register_from_settings(settings: &Settings) -> Result<()> {
    if let Some(config) = &settings.modal {
        let backend = create_backend(BackendKind::Modal, config.clone())?;
        registry::register("modal", backend.into()).await;
        info!("registered modal backend at {}", config.url);
    }
    if let Some(config) = &settings.ray {
        let backend = create_backend(BackendKind::Ray, config.clone())?;
        registry::register("ray", backend.into()).await;
        info!("registered ray backend at {}", config.url);
    }
    Ok(())
}
