//! Execution engine
//!
//! Owns the lifecycle of one execution: plan it, pass admission, run it
//! locally or through the parallel dispatcher, then settle on a terminal
//! status. Progress events go to storage, to the log and to broadcast
//! subscribers.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::dispatcher::{
    DispatchError, DispatchJob, DispatchMessage, DispatchOutcome, DispatchSettings, Inbox,
    LostBatch, ParallelDispatcher, ReportHandler,
};
use super::registry::{AdmissionError, ExecutionRegistry, ExecutionTicket};
use super::worker::{pause, CaseRunner, WorkerSettings};
use crate::http::TargetService;
use crate::models::{
    BatchReport, EventKind, Execution, ExecutionMode, ExecutionStatus, ProgressEvent, StateError,
    ValidationError,
};
use crate::planner::{Plan, WorkloadPlanner};
use crate::storage::{PersistenceAdapter, StorageError};
use crate::workflow::{BatchExecutor, FinalizeRequest};

const EVENT_BUFFER: usize = 256;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration not found: {0}")]
    ConfigNotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Settings shared by every execution the engine runs
#[derive(Clone, Debug, Default)]
pub struct EngineSettings {
    /// Request timeout and retry policy. The inter-request delay is taken
    /// from each configuration instead.
    pub worker: WorkerSettings,
    pub dispatch: DispatchSettings,
}

/// A planned execution that has not started yet
#[derive(Debug)]
pub struct PreparedExecution {
    pub execution: Execution,
    pub plan: Plan,
    pub worker: WorkerSettings,
}

impl PreparedExecution {
    pub fn execution_id(&self) -> &str {
        &self.execution.execution_id
    }
}

pub struct ExecutionEngine {
    store: Arc<dyn PersistenceAdapter>,
    service: Arc<dyn TargetService>,
    executor: Arc<dyn BatchExecutor>,
    registry: Arc<ExecutionRegistry>,
    planner: WorkloadPlanner,
    settings: EngineSettings,
    events: broadcast::Sender<ProgressEvent>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn PersistenceAdapter>,
        service: Arc<dyn TargetService>,
        executor: Arc<dyn BatchExecutor>,
        registry: Arc<ExecutionRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store,
            service,
            executor,
            registry,
            planner: WorkloadPlanner::default(),
            settings: EngineSettings::default(),
            events,
        }
    }

    pub fn with_planner(mut self, planner: WorkloadPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Progress events of every execution run by this engine
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Load and plan a configuration, persisting a pending execution.
    /// Planning errors leave a failed execution behind.
    pub async fn prepare(&self, config_name: &str) -> Result<PreparedExecution, EngineError> {
        let config = self
            .store
            .get_configuration(config_name)
            .await?
            .ok_or_else(|| EngineError::ConfigNotFound(config_name.to_string()))?;

        let mut execution = Execution::new(&config.name);
        self.store.save_execution(&execution).await?;

        let plan = match self.planner.plan(&config) {
            Ok(plan) => plan,
            Err(e) => {
                error!("Planning {} failed: {}", config.name, e);
                execution.fail(e.to_string())?;
                self.store.update_execution_progress(&execution).await?;
                self.emit(ProgressEvent::new(
                    &execution.execution_id,
                    EventKind::ExecutionFinished,
                    format!("failed: {e}"),
                ))
                .await;
                return Err(e.into());
            }
        };

        let execution = execution.with_plan(plan.total_tests(), plan.mode, plan.worker_count());
        self.store.update_execution_progress(&execution).await?;

        let worker = WorkerSettings {
            inter_request_delay_secs: config.delay_between_tests_secs,
            ..self.settings.worker.clone()
        };

        Ok(PreparedExecution {
            execution,
            plan,
            worker,
        })
    }

    /// Pass admission, then run to a terminal state
    pub async fn execute(&self, prepared: PreparedExecution) -> Result<Execution, EngineError> {
        let PreparedExecution {
            mut execution,
            plan,
            worker,
        } = prepared;

        let ticket = match self.registry.register(&execution.execution_id, plan.mode).await {
            Ok(ticket) => ticket,
            Err(e) => {
                match &e {
                    AdmissionError::Cancelled(_) => {
                        execution.transition(ExecutionStatus::Stopped)?;
                        execution.error_message = Some(e.to_string());
                    }
                    _ => execution.fail(e.to_string())?,
                }
                self.store.update_execution_progress(&execution).await?;
                self.finished(&execution).await;
                return Err(e.into());
            }
        };

        execution.transition(ExecutionStatus::Running)?;
        self.store.update_execution_progress(&execution).await?;
        self.emit(ProgressEvent::new(
            &execution.execution_id,
            EventKind::ExecutionStarted,
            format!("{} tests from '{}'", execution.total_tests, execution.config_name),
        ))
        .await;
        self.emit(ProgressEvent::new(
            &execution.execution_id,
            EventKind::ModeSelected,
            format!(
                "{} with {} batch(es), estimated {:.1} min",
                plan.mode,
                plan.worker_count(),
                plan.estimated_minutes()
            ),
        ))
        .await;

        let started = Instant::now();
        let run = match plan.mode {
            ExecutionMode::Local => self.run_local(&mut execution, &plan, &worker, &ticket).await,
            ExecutionMode::ParallelWorkflow => {
                self.run_parallel(&mut execution, plan, worker, &ticket, started)
                    .await
            }
        };

        if let Err(e) = run {
            error!("Execution {} aborted: {}", execution.execution_id, e);
            if !execution.status.is_terminal() {
                execution.fail(e.to_string())?;
            }
            self.store.update_execution_progress(&execution).await?;
            self.finished(&execution).await;
            return Err(e);
        }

        self.finished(&execution).await;
        Ok(execution)
    }

    /// Prepare and execute in the current task
    pub async fn run(&self, config_name: &str) -> Result<Execution, EngineError> {
        let prepared = self.prepare(config_name).await?;
        self.execute(prepared).await
    }

    /// Prepare, then execute on a spawned task. Returns the execution id.
    pub async fn start(self: &Arc<Self>, config_name: &str) -> Result<String, EngineError> {
        let prepared = self.prepare(config_name).await?;
        let execution_id = prepared.execution_id().to_string();

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.execute(prepared).await {
                warn!("Background execution ended with error: {}", e);
            }
        });
        Ok(execution_id)
    }

    /// Request a stop. Completed results are kept.
    pub async fn stop(&self, execution_id: &str) -> bool {
        if !self.registry.stop(execution_id) {
            return false;
        }
        self.emit(ProgressEvent::new(
            execution_id,
            EventKind::StopRequested,
            "stop requested",
        ))
        .await;
        true
    }

    /// Inbound batch report from an external executor
    pub fn on_batch_report(&self, execution_id: &str, report: BatchReport) -> bool {
        self.registry
            .deliver(execution_id, DispatchMessage::Report(report))
    }

    /// Inbound finalize call. Ends report collection for the execution.
    pub fn on_finalize(&self, execution_id: &str, request: FinalizeRequest) -> bool {
        self.registry
            .deliver(execution_id, DispatchMessage::Finalize(Some(request)))
    }

    /// Inbound log call
    pub fn on_log(&self, execution_id: &str, event: ProgressEvent) -> bool {
        self.registry.deliver(execution_id, DispatchMessage::Log(event))
    }

    async fn run_local(
        &self,
        execution: &mut Execution,
        plan: &Plan,
        worker: &WorkerSettings,
        ticket: &ExecutionTicket,
    ) -> Result<(), EngineError> {
        let cancel = ticket.cancel_token();
        let runner = CaseRunner::new(
            Arc::clone(&self.service),
            Arc::clone(&self.store),
            worker.clone(),
        );
        let delay = worker.inter_request_delay();
        let total = plan.test_cases.len();

        for (i, case) in plan.test_cases.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let Some(result) = runner
                .run_case(&execution.execution_id, case, None, &cancel)
                .await?
            else {
                break;
            };
            execution.record_outcome(result.success)?;
            self.store.update_execution_progress(execution).await?;

            let kind = if result.success {
                EventKind::CaseCompleted
            } else {
                EventKind::CaseFailed
            };
            self.emit(ProgressEvent::new(
                &execution.execution_id,
                kind,
                format!("[{}/{}] {}", i + 1, total, result),
            ))
            .await;

            if i + 1 < total && !pause(delay, &cancel).await {
                break;
            }
        }

        let status = if cancel.is_cancelled() {
            ExecutionStatus::Stopped
        } else {
            ExecutionStatus::Completed
        };
        self.settle(execution, status, None).await
    }

    async fn run_parallel(
        &self,
        execution: &mut Execution,
        plan: Plan,
        worker: WorkerSettings,
        ticket: &ExecutionTicket,
        started: Instant,
    ) -> Result<(), EngineError> {
        let cancel = ticket.cancel_token();
        let inbox = Inbox::new();
        self.registry
            .attach_inbox(&execution.execution_id, inbox.tx.clone());

        let dispatcher =
            ParallelDispatcher::new(Arc::clone(&self.executor), self.settings.dispatch.clone());
        let job = DispatchJob {
            execution_id: execution.execution_id.clone(),
            config_name: execution.config_name.clone(),
            endpoint: self.service.endpoint().to_string(),
            batches: plan.batches,
            worker,
        };

        let dispatched = {
            let mut progress = Progress {
                engine: self,
                execution: &mut *execution,
            };
            dispatcher.run(job, inbox, cancel.clone(), &mut progress).await
        };

        let (status, message) = match dispatched {
            Err(e) => {
                error!("Dispatch for {} failed: {}", execution.execution_id, e);
                (ExecutionStatus::Failed, Some(e.to_string()))
            }
            Ok(_) if cancel.is_cancelled() => (ExecutionStatus::Stopped, None),
            Ok(outcome) => parallel_status(&outcome),
        };

        self.settle(execution, status, message).await?;

        let request = FinalizeRequest {
            execution_id: execution.execution_id.clone(),
            status: execution.status,
            completed_tests: execution.completed_tests,
            failed_tests: execution.failed_tests,
            duration_secs: started.elapsed().as_secs_f64(),
            error_message: execution.error_message.clone(),
        };
        if let Err(e) = dispatcher.finalize(request).await {
            warn!("Finalize call for {} failed: {}", execution.execution_id, e);
        }
        Ok(())
    }

    /// Bring counters in line with stored results, then move to `status`
    async fn settle(
        &self,
        execution: &mut Execution,
        status: ExecutionStatus,
        message: Option<String>,
    ) -> Result<(), EngineError> {
        self.reconcile(execution).await?;
        match (status, message) {
            (ExecutionStatus::Failed, Some(message)) => execution.fail(message)?,
            (status, message) => {
                execution.transition(status)?;
                if message.is_some() {
                    execution.error_message = message;
                }
            }
        }
        self.store.update_execution_progress(execution).await?;
        Ok(())
    }

    /// Raise counters to what storage holds. Never lowers them.
    async fn reconcile(&self, execution: &mut Execution) -> Result<(), EngineError> {
        let results = self
            .store
            .list_test_results(&execution.execution_id)
            .await?;

        let mut seen = HashSet::new();
        let (mut ok, mut failed) = (0usize, 0usize);
        for result in results.iter().filter(|r| seen.insert(r.result_key())) {
            if result.success {
                ok += 1;
            } else {
                failed += 1;
            }
        }

        let add_ok = usize::min(
            ok.saturating_sub(execution.completed_tests),
            execution.remaining(),
        );
        let add_failed = usize::min(
            failed.saturating_sub(execution.failed_tests),
            execution.remaining() - add_ok,
        );
        if add_ok + add_failed > 0 {
            info!(
                "Reconciled {} with storage: +{} ok, +{} failed",
                execution.execution_id, add_ok, add_failed
            );
            execution.record_counts(add_ok, add_failed)?;
        }
        Ok(())
    }

    async fn finished(&self, execution: &Execution) {
        let mut message = format!(
            "{}: {} ok, {} failed of {}",
            execution.status, execution.completed_tests, execution.failed_tests, execution.total_tests
        );
        if let Some(error) = &execution.error_message {
            message.push_str(&format!(" ({error})"));
        }
        self.emit(ProgressEvent::new(
            &execution.execution_id,
            EventKind::ExecutionFinished,
            message,
        ))
        .await;
    }

    async fn emit(&self, event: ProgressEvent) {
        record_event(self.store.as_ref(), &self.events, event).await;
    }
}

async fn record_event(
    store: &dyn PersistenceAdapter,
    events: &broadcast::Sender<ProgressEvent>,
    event: ProgressEvent,
) {
    info!("{} {}", event.execution_id, event);
    if let Err(e) = store.save_event(&event).await {
        warn!("Failed to persist event for {}: {}", event.execution_id, e);
    }
    // no subscribers is fine
    let _ = events.send(event);
}

/// Terminal status after a dispatch that ran to the end
fn parallel_status(outcome: &DispatchOutcome) -> (ExecutionStatus, Option<String>) {
    if outcome.is_total_failure() {
        let message = DispatchError::TotalFailure(outcome.lost.len()).to_string();
        return (ExecutionStatus::Failed, Some(message));
    }
    if !outcome.lost.is_empty() {
        warn!(
            "{} of {} batches lost, summary will show a shortfall",
            outcome.lost.len(),
            outcome.expected
        );
    }
    (ExecutionStatus::Completed, None)
}

/// Applies accepted batch reports to the running execution
struct Progress<'a> {
    engine: &'a ExecutionEngine,
    execution: &'a mut Execution,
}

#[async_trait]
impl ReportHandler for Progress<'_> {
    async fn on_report(&mut self, report: &BatchReport) {
        let remaining = self.execution.remaining();
        let completed = report.completed.min(remaining);
        let failed = report.failed.min(remaining - completed);
        if completed + failed < report.total() {
            warn!(
                "Report for {} claims {} tests, only {} remain",
                report.batch_id,
                report.total(),
                remaining
            );
        }

        if let Err(e) = self.execution.record_counts(completed, failed) {
            warn!("{}", e);
            return;
        }
        if let Err(e) = self.engine.store.update_execution_progress(self.execution).await {
            warn!(
                "Failed to persist progress for {}: {}",
                self.execution.execution_id, e
            );
        }
    }

    async fn on_lost(&mut self, lost: &LostBatch) {
        warn!(
            "Execution {} lost {} (worker {})",
            self.execution.execution_id, lost.batch_id, lost.worker_index
        );
    }

    async fn on_event(&mut self, event: ProgressEvent) {
        record_event(self.engine.store.as_ref(), &self.engine.events, event).await;
    }
}
