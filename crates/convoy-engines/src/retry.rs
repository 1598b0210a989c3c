// crates/convoy-engines/src/retry.rs

//! Retry executor
//!
//! Wraps a single attempt in a configurable retry policy. Every failure is
//! retried uniformly; classifying transient vs. permanent failures is the
//! backend's concern. With no policy (or `attempts <= 1`) the first error
//! propagates unchanged with no wait.

use convoy_core::error::{ConvoyError, Result};
use convoy_core::types::{BackoffKind, RetryPolicy};
use log::warn;
use std::future::Future;
use std::time::Duration;

/// Wait before retry `n` (1-indexed): `delay` for fixed backoff,
/// `delay * 2^(n-1)` for exponential.
pub fn backoff_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let base = policy.delay;
    let millis = match policy.backoff {
        BackoffKind::Fixed => base,
        BackoffKind::Exponential => base.saturating_mul(1u64 << retry.saturating_sub(1).min(32)),
    };
    Duration::from_millis(millis)
}

/// Run `op` up to `attempts` times, sleeping the policy delay between
/// attempts and preserving the last error across them.
pub async fn execute_with_retry<T, F, Fut>(policy: Option<&RetryPolicy>, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.map(|p| p.attempts.max(1)).unwrap_or(1);
    let mut last_error: Option<ConvoyError> = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            // Only reachable with a policy present.
            if let Some(policy) = policy {
                let wait = backoff_delay(policy, attempt - 1);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < attempts {
                    warn!("attempt {}/{} failed: {}; retrying", attempt, attempts, e);
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ConvoyError::backend_execution("retry executor ran zero attempts")))
}
