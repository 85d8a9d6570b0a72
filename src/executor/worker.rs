//! Test case runner
//!
//! Runs test cases against the target service and appends one result per
//! case to storage. Shared by local mode and by batch workers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{call_with_retry, RetryPolicy};
use crate::http::TargetService;
use crate::models::{Batch, BatchReport, TestCase, TestResult};
use crate::storage::{PersistenceAdapter, StorageError};

/// Per-call settings handed to every worker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub request_timeout_secs: f64,
    pub inter_request_delay_secs: f64,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs.max(0.001))
    }

    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_secs_f64(self.inter_request_delay_secs.max(0.0))
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60.0,
            inter_request_delay_secs: 5.0,
            retry: RetryPolicy::default(),
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns false on cancellation.
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Runs cases and records their results
#[derive(Clone)]
pub struct CaseRunner {
    service: Arc<dyn TargetService>,
    store: Arc<dyn PersistenceAdapter>,
    settings: WorkerSettings,
}

impl CaseRunner {
    pub fn new(
        service: Arc<dyn TargetService>,
        store: Arc<dyn PersistenceAdapter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            service,
            store,
            settings,
        }
    }

    /// Same service and store, different per-call settings
    pub fn with_settings(&self, settings: WorkerSettings) -> Self {
        Self {
            service: Arc::clone(&self.service),
            store: Arc::clone(&self.store),
            settings,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.service.endpoint()
    }

    /// Execute one case and persist its result. Returns `None` when a stop
    /// cut off a pending retry; nothing is recorded for the case then.
    pub async fn run_case(
        &self,
        execution_id: &str,
        case: &TestCase,
        batch_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<TestResult>, StorageError> {
        let outcome = call_with_retry(
            self.service.as_ref(),
            case,
            self.settings.request_timeout(),
            &self.settings.retry,
            cancel,
        )
        .await;

        if outcome.interrupted {
            info!("{} left unrecorded after stop during retry", case);
            return Ok(None);
        }

        let mut result = match outcome.result {
            Ok(response) => {
                let mut result = TestResult::success(
                    execution_id,
                    case.clone(),
                    response.response_time_secs,
                    response.response_chars,
                );
                if let Some(metadata) = response.metadata {
                    result = result.with_metadata(metadata);
                }
                result
            }
            Err(err) => TestResult::failure(
                execution_id,
                case.clone(),
                outcome.elapsed.as_secs_f64(),
                err.kind(),
                err.to_string(),
            ),
        }
        .with_attempts(outcome.attempts);

        if let Some(batch_id) = batch_id {
            result = result.with_batch(batch_id);
        }

        if result.success {
            debug!("{}", result);
        } else {
            warn!("{}", result);
        }

        if !self.store.save_test_result(&result).await? {
            debug!("Result for {} was already recorded", case);
        }
        Ok(Some(result))
    }

    /// Run a whole batch in order, stopping between cases on cancellation
    pub async fn run_batch(
        &self,
        execution_id: &str,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, StorageError> {
        let start = Instant::now();
        let delay = self.settings.inter_request_delay();
        let mut completed = 0;
        let mut failed = 0;

        info!(
            "Worker {} starting {} ({} cases)",
            batch.worker_index,
            batch.batch_id,
            batch.len()
        );

        for (i, case) in batch.test_cases.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Worker {} stopped after {} cases", batch.worker_index, i);
                break;
            }

            let Some(result) = self
                .run_case(execution_id, case, Some(&batch.batch_id), cancel)
                .await?
            else {
                info!("Worker {} stopped after {} cases", batch.worker_index, i);
                break;
            };
            if result.success {
                completed += 1;
            } else {
                failed += 1;
            }

            if i + 1 < batch.len() && !pause(delay, cancel).await {
                info!("Worker {} stopped after {} cases", batch.worker_index, i + 1);
                break;
            }
        }

        let report = BatchReport {
            batch_id: batch.batch_id.clone(),
            worker_index: batch.worker_index,
            success: failed == 0 && completed == batch.len(),
            completed,
            failed,
            duration_secs: start.elapsed().as_secs_f64(),
            error: None,
        };

        info!(
            "Worker {} finished {}: {} ok, {} failed in {:.1}s",
            report.worker_index, report.batch_id, report.completed, report.failed, report.duration_secs
        );
        Ok(report)
    }
}
