//! Target service calls with retry
//!
//! Transient failures (timeouts, connection errors) are retried with
//! exponential backoff and jitter. Everything else fails on the first attempt.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::http::{ServiceError, ServiceResponse, TargetService};
use crate::models::TestCase;

/// Retry configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Backoff before retry number `retry` (1-based), without jitter
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        apply_jitter(self.base_backoff(retry), self.jitter_factor)
    }
}

/// Random variation of +/- `jitter_factor`
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }
    let jitter = rand::rng().random_range(-jitter_factor..=jitter_factor);
    let ms = (duration.as_millis() as f64 * (1.0 + jitter)).max(0.0);
    Duration::from_millis(ms as u64)
}

/// Result of one test case call, after retries
#[derive(Debug)]
pub struct CallOutcome {
    pub result: Result<ServiceResponse, ServiceError>,
    pub attempts: u32,
    pub elapsed: Duration,
    /// A stop arrived while a retry was still due. The case has no result.
    pub interrupted: bool,
}

/// Call `service` for `case`, retrying transient errors.
///
/// Each attempt is bounded by `timeout`. Cancellation is checked between
/// attempts only, an in-flight call always runs to completion or timeout.
/// A stop that cuts off a pending retry marks the outcome interrupted.
pub async fn call_with_retry(
    service: &dyn TargetService,
    case: &TestCase,
    timeout: Duration,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> CallOutcome {
    let start = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let result = match tokio::time::timeout(timeout, service.execute(case, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(timeout.as_secs_f64())),
        };

        let err = match result {
            Ok(response) => {
                return CallOutcome {
                    result: Ok(response),
                    attempts,
                    elapsed: start.elapsed(),
                    interrupted: false,
                }
            }
            Err(err) => err,
        };

        if !err.is_transient() || attempts > policy.max_retries {
            return CallOutcome {
                result: Err(err),
                attempts,
                elapsed: start.elapsed(),
                interrupted: false,
            };
        }
        if cancel.is_cancelled() {
            debug!("Stopped before retrying {}", case);
            return CallOutcome {
                result: Err(err),
                attempts,
                elapsed: start.elapsed(),
                interrupted: true,
            };
        }

        let sleep = policy.backoff(attempts);
        warn!(
            "Transient error for {}: {}, retry {}/{} in {:?}",
            case, err, attempts, policy.max_retries, sleep
        );

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = cancel.cancelled() => {
                debug!("Cancelled while backing off for {}", case);
                return CallOutcome {
                    result: Err(err),
                    attempts,
                    elapsed: start.elapsed(),
                    interrupted: true,
                };
            }
        }
    }
}
