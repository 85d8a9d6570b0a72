//! Parallel batch executor contract
//!
//! A batch executor runs one batch per worker on behalf of the dispatcher.
//! The contract has four calls: `prepare`, `execute_batch`, `log` and
//! `finalize`. `LocalWorkflowExecutor` implements it with tokio tasks so
//! parallel mode works without an external workflow engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{CaseRunner, DispatchError, WorkerSettings};
use crate::models::{Batch, BatchReport, ExecutionStatus, ProgressEvent};

/// Announce an execution before any batch is dispatched
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub execution_id: String,
    pub config_name: String,
    pub worker_count: usize,
    pub batches: Vec<Batch>,
}

/// Readiness answer with the batch list the executor will run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub success: bool,
    pub error: Option<String>,
    pub batches: Vec<Batch>,
}

impl PrepareResponse {
    pub fn ready(batches: Vec<Batch>) -> Self {
        Self {
            success: true,
            error: None,
            batches,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            batches: Vec::new(),
        }
    }
}

/// One worker's assignment. Only the execution id and the service endpoint
/// are shared between workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteBatchRequest {
    pub execution_id: String,
    pub endpoint: String,
    pub batch: Batch,
    pub worker: WorkerSettings,
}

/// Overall outcome, sent once at the end
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub completed_tests: usize,
    pub failed_tests: usize,
    pub duration_secs: f64,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait BatchExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn prepare(&self, request: PrepareRequest) -> Result<PrepareResponse, DispatchError>;

    /// Run one batch. Must stop between test cases once `cancel` fires and
    /// report what was done so far.
    async fn execute_batch(
        &self,
        request: ExecuteBatchRequest,
        cancel: CancellationToken,
    ) -> Result<BatchReport, DispatchError>;

    async fn log(&self, event: ProgressEvent) -> Result<(), DispatchError>;

    async fn finalize(&self, request: FinalizeRequest) -> Result<(), DispatchError>;
}

/// In-process executor, one tokio task per batch
pub struct LocalWorkflowExecutor {
    runner: CaseRunner,
    max_workers: usize,
}

impl LocalWorkflowExecutor {
    pub fn new(runner: CaseRunner) -> Self {
        Self {
            runner,
            max_workers: 64,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }
}

#[async_trait]
impl BatchExecutor for LocalWorkflowExecutor {
    fn name(&self) -> &str {
        "local-workflow"
    }

    async fn prepare(&self, request: PrepareRequest) -> Result<PrepareResponse, DispatchError> {
        if request.worker_count != request.batches.len() {
            return Ok(PrepareResponse::rejected(format!(
                "worker_count {} does not match {} batches",
                request.worker_count,
                request.batches.len()
            )));
        }
        if request.worker_count > self.max_workers {
            return Ok(PrepareResponse::rejected(format!(
                "{} workers requested, at most {} supported",
                request.worker_count, self.max_workers
            )));
        }
        if let Some(empty) = request.batches.iter().find(|b| b.is_empty()) {
            return Ok(PrepareResponse::rejected(format!("{} is empty", empty.batch_id)));
        }

        info!(
            "Prepared execution {} ({}) with {} workers",
            request.execution_id, request.config_name, request.worker_count
        );
        Ok(PrepareResponse::ready(request.batches))
    }

    async fn execute_batch(
        &self,
        request: ExecuteBatchRequest,
        cancel: CancellationToken,
    ) -> Result<BatchReport, DispatchError> {
        if request.endpoint != self.runner.endpoint() {
            warn!(
                "Batch {} targets {}, worker is bound to {}",
                request.batch.batch_id,
                request.endpoint,
                self.runner.endpoint()
            );
        }

        let runner = self.runner.with_settings(request.worker);
        runner
            .run_batch(&request.execution_id, &request.batch, &cancel)
            .await
            .map_err(|e| DispatchError::BatchFailed {
                batch_id: request.batch.batch_id.clone(),
                reason: e.to_string(),
            })
    }

    async fn log(&self, event: ProgressEvent) -> Result<(), DispatchError> {
        debug!("workflow log: {}", event);
        Ok(())
    }

    async fn finalize(&self, request: FinalizeRequest) -> Result<(), DispatchError> {
        info!(
            "Workflow finalized {}: {} ({} ok, {} failed, {:.1}s)",
            request.execution_id,
            request.status,
            request.completed_tests,
            request.failed_tests,
            request.duration_secs
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RetryPolicy;
    use crate::storage::{DocumentStore, PersistenceAdapter};
    use crate::testing::{config_with_cases, ScriptedService};
    use std::sync::Arc;

    fn executor(dir: &std::path::Path) -> (LocalWorkflowExecutor, Arc<dyn PersistenceAdapter>) {
        let store: Arc<dyn PersistenceAdapter> = Arc::new(DocumentStore::open(dir).unwrap());
        let runner = CaseRunner::new(
            Arc::new(ScriptedService::always_ok()),
            store.clone(),
            WorkerSettings::default(),
        );
        (LocalWorkflowExecutor::new(runner).with_max_workers(4), store)
    }

    fn worker() -> WorkerSettings {
        WorkerSettings {
            request_timeout_secs: 1.0,
            inter_request_delay_secs: 0.0,
            retry: RetryPolicy::none(),
        }
    }

    #[tokio::test]
    async fn test_prepare_echoes_batches() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _) = executor(dir.path());
        let cases = config_with_cases("p", 4).test_cases().unwrap();
        let batches = crate::planner::partition(&cases, 2);

        let response = executor
            .prepare(PrepareRequest {
                execution_id: "e".into(),
                config_name: "p".into(),
                worker_count: 2,
                batches: batches.clone(),
            })
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.batches, batches);
    }

    #[tokio::test]
    async fn test_prepare_rejects_too_many_workers() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _) = executor(dir.path());
        let cases = config_with_cases("p", 10).test_cases().unwrap();

        let response = executor
            .prepare(PrepareRequest {
                execution_id: "e".into(),
                config_name: "p".into(),
                worker_count: 5,
                batches: crate::planner::partition(&cases, 5),
            })
            .await
            .unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("at most 4"));
    }

    #[tokio::test]
    async fn test_execute_batch_records_results() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, store) = executor(dir.path());
        let cases = config_with_cases("p", 3).test_cases().unwrap();

        let report = executor
            .execute_batch(
                ExecuteBatchRequest {
                    execution_id: "exec-1".into(),
                    endpoint: "mock://graph-rag".into(),
                    batch: Batch::new(1, cases),
                    worker: worker(),
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.completed, 3);
        assert_eq!(store.list_test_results("exec-1").await.unwrap().len(), 3);
    }
}
