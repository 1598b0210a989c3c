// crates/convoy-core/src/config.rs

//! Environment-derived settings
//!
//! All knobs come from the environment so the same binary runs as a worker,
//! a submitter, or both. Backend entries are only present when the matching
//! URL variable is set.

use std::env;
use std::str::FromStr;

/// Connection details for one backend adapter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendConfig {
    pub url: String,
    pub token: Option<String>,
    /// Secondary URL tried when the primary is unreachable
    pub fallback_url: Option<String>,
}

impl BackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            fallback_url: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_fallback_url(mut self, url: impl Into<String>) -> Self {
        self.fallback_url = Some(url.into());
        self
    }
}

/// Process-wide settings resolved once at startup
#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: Option<String>,
    pub modal: Option<BackendConfig>,
    pub ray: Option<BackendConfig>,
    pub port: u16,
    /// Worker count for the default and cpu lanes
    pub worker_concurrency: usize,
    /// Worker count for the gpu lane
    pub gpu_worker_concurrency: usize,
    pub slack_webhook_url: Option<String>,
    pub discord_webhook_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: None,
            modal: None,
            ray: None,
            port: 3000,
            worker_concurrency: 5,
            gpu_worker_concurrency: 2,
            slack_webhook_url: None,
            discord_webhook_url: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let modal = env_opt("MODAL_URL").map(|url| BackendConfig {
            url,
            token: env_opt("MODAL_TOKEN"),
            fallback_url: None,
        });
        let ray = env_opt("RAY_URL").map(|url| BackendConfig {
            url,
            token: None,
            fallback_url: env_opt("RAY_FALLBACK_URL"),
        });

        Self {
            redis_url: env_opt("REDIS_URL"),
            modal,
            ray,
            port: env_parse("PORT", 3000),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 5),
            gpu_worker_concurrency: env_parse("GPU_WORKER_CONCURRENCY", 2),
            slack_webhook_url: env_opt("SLACK_WEBHOOK_URL"),
            discord_webhook_url: env_opt("DISCORD_WEBHOOK_URL"),
        }
    }

    /// Worker count for a lane; the gpu lane is sized separately.
    pub fn lane_concurrency(&self, lane: &str) -> usize {
        if lane == "gpu" {
            self.gpu_worker_concurrency
        } else {
            self.worker_concurrency
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
