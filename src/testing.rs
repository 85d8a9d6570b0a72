//! Shared test doubles

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::executor::DispatchError;
use crate::http::{ServiceError, ServiceResponse, TargetService};
use crate::models::{BatchReport, ProgressEvent, TestCase, TestConfiguration};
use crate::workflow::{
    BatchExecutor, ExecuteBatchRequest, FinalizeRequest, PrepareRequest, PrepareResponse,
};

type Responder = dyn Fn(usize, &TestCase) -> Result<ServiceResponse, ServiceError> + Send + Sync;
type Hook = dyn Fn(usize) + Send + Sync;

/// In-memory target service driven by a closure over (call index, case)
pub struct ScriptedService {
    responder: Box<Responder>,
    after_call: Option<Box<Hook>>,
    latency: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<TestCase>>,
}

impl ScriptedService {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(usize, &TestCase) -> Result<ServiceResponse, ServiceError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            after_call: None,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(|_, _| Ok(Self::ok(0.5)))
    }

    pub fn ok(secs: f64) -> ServiceResponse {
        ServiceResponse {
            response_time_secs: secs,
            response_chars: 42,
            metadata: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Run `hook` with the number of calls made so far, after each call
    pub fn with_hook<H>(mut self, hook: H) -> Self
    where
        H: Fn(usize) + Send + Sync + 'static,
    {
        self.after_call = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<TestCase> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetService for ScriptedService {
    async fn execute(
        &self,
        case: &TestCase,
        _timeout: Duration,
    ) -> Result<ServiceResponse, ServiceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(case.clone());
        let result = (self.responder)(index, case);
        if let Some(hook) = &self.after_call {
            hook(index + 1);
        }
        result
    }

    fn endpoint(&self) -> &str {
        "mock://graph-rag"
    }
}

pub fn sample_case() -> TestCase {
    TestCase {
        model: "gemini-2.0-flash".to_string(),
        user_type: "business".to_string(),
        think_mode: false,
        question: "What types of claims are supported?".to_string(),
        repetition: 0,
    }
}

/// 2 models x 1 user type x 2 think modes x 3 questions = 12 cases
pub fn twelve_case_config(name: &str) -> TestConfiguration {
    TestConfiguration::new(
        name,
        vec!["model-a".to_string(), "model-b".to_string()],
        vec!["business".to_string()],
        vec![true, false],
        vec!["q1".to_string(), "q2".to_string(), "q3".to_string()],
    )
    .with_delay_secs(0.0)
}

/// `n` cases with one model and one user type
pub fn config_with_cases(name: &str, n: usize) -> TestConfiguration {
    TestConfiguration::new(
        name,
        vec!["model-a".to_string()],
        vec!["business".to_string()],
        vec![false],
        (1..=n).map(|i| format!("question {i}")).collect(),
    )
    .with_delay_secs(0.0)
}

/// How a worker misbehaves
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// execute-batch returns an error
    Error,
    /// execute-batch never returns
    Hang,
}

/// Batch executor with per-worker faults. Healthy batches go to `inner`,
/// or get a synthetic all-success report when there is none.
pub struct FaultyExecutor {
    inner: Option<Arc<dyn BatchExecutor>>,
    faults: HashMap<usize, Fault>,
    reject_with: Option<String>,
    logged: Mutex<Vec<ProgressEvent>>,
    finalized: Mutex<Vec<FinalizeRequest>>,
}

impl FaultyExecutor {
    pub fn synthetic() -> Self {
        Self {
            inner: None,
            faults: HashMap::new(),
            reject_with: None,
            logged: Mutex::new(Vec::new()),
            finalized: Mutex::new(Vec::new()),
        }
    }

    pub fn wrapping(inner: Arc<dyn BatchExecutor>) -> Self {
        Self {
            inner: Some(inner),
            ..Self::synthetic()
        }
    }

    pub fn with_fault(mut self, worker_index: usize, fault: Fault) -> Self {
        self.faults.insert(worker_index, fault);
        self
    }

    pub fn rejecting(mut self, reason: &str) -> Self {
        self.reject_with = Some(reason.to_string());
        self
    }

    pub fn logged(&self) -> Vec<ProgressEvent> {
        self.logged.lock().unwrap().clone()
    }

    pub fn finalized(&self) -> Vec<FinalizeRequest> {
        self.finalized.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchExecutor for FaultyExecutor {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn prepare(&self, request: PrepareRequest) -> Result<PrepareResponse, DispatchError> {
        if let Some(reason) = &self.reject_with {
            return Ok(PrepareResponse::rejected(reason.clone()));
        }
        match &self.inner {
            Some(inner) => inner.prepare(request).await,
            None => Ok(PrepareResponse::ready(request.batches)),
        }
    }

    async fn execute_batch(
        &self,
        request: ExecuteBatchRequest,
        cancel: CancellationToken,
    ) -> Result<BatchReport, DispatchError> {
        match self.faults.get(&request.batch.worker_index) {
            Some(Fault::Error) => {
                return Err(DispatchError::BatchFailed {
                    batch_id: request.batch.batch_id.clone(),
                    reason: format!("worker {} crashed", request.batch.worker_index),
                })
            }
            Some(Fault::Hang) => std::future::pending::<()>().await,
            None => {}
        }
        match &self.inner {
            Some(inner) => inner.execute_batch(request, cancel).await,
            None => Ok(BatchReport {
                batch_id: request.batch.batch_id.clone(),
                worker_index: request.batch.worker_index,
                success: true,
                completed: request.batch.len(),
                failed: 0,
                duration_secs: 0.01,
                error: None,
            }),
        }
    }

    async fn log(&self, event: ProgressEvent) -> Result<(), DispatchError> {
        self.logged.lock().unwrap().push(event);
        Ok(())
    }

    async fn finalize(&self, request: FinalizeRequest) -> Result<(), DispatchError> {
        self.finalized.lock().unwrap().push(request);
        Ok(())
    }
}
