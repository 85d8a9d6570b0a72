//! Parallel batch dispatch
//!
//! Drives a [`BatchExecutor`] through one execution: prepare, run every
//! batch concurrently under its own timeout, then collect reports until each
//! batch has either reported or been declared lost. Reports arrive through a
//! single channel and are applied by one collector loop, so concurrent
//! deliveries never touch the partial result set directly.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::WorkerSettings;

/// How long in-flight batches get to report once the execution is stopped
const STOP_GRACE: Duration = Duration::from_secs(2);
use crate::models::{Batch, BatchReport, EventKind, ProgressEvent};
use crate::workflow::{BatchExecutor, ExecuteBatchRequest, FinalizeRequest, PrepareRequest};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Batch executor rejected preparation: {0}")]
    PrepareRejected(String),

    #[error("Batch executor returned {got} batches, expected {expected}")]
    BatchCountMismatch { expected: usize, got: usize },

    #[error("Batch executor altered the batch list: {0}")]
    BatchMismatch(String),

    #[error("Batch {batch_id} failed: {reason}")]
    BatchFailed { batch_id: String, reason: String },

    #[error("Invalid dispatch settings: {0}")]
    InvalidSettings(String),

    #[error("Total failure: no batch results were returned ({0} batches lost)")]
    TotalFailure(usize),
}

/// A batch that will not report
#[derive(Clone, Debug, PartialEq)]
pub struct LostBatch {
    pub batch_id: String,
    pub worker_index: usize,
    pub reason: String,
}

/// Everything the collector loop accepts
#[derive(Clone, Debug)]
pub enum DispatchMessage {
    Report(BatchReport),
    Lost(LostBatch),
    Log(ProgressEvent),
    /// External finalize call. Ends collection early.
    Finalize(Option<FinalizeRequest>),
}

/// Time limits for parallel dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Hard ceiling on one execute-batch call
    pub batch_timeout_secs: f64,
    /// Longest single call the executing platform allows
    pub platform_limit_secs: f64,
    /// How long to wait for all reports after dispatch
    pub max_wait_secs: f64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_timeout_secs: 3000.0,
            platform_limit_secs: 3600.0,
            max_wait_secs: 3300.0,
        }
    }
}

impl DispatchSettings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.batch_timeout_secs.max(0.0))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_secs.max(0.0))
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.batch_timeout_secs <= 0.0 {
            return Err(DispatchError::InvalidSettings(
                "batch_timeout_secs must be positive".to_string(),
            ));
        }
        if self.batch_timeout_secs >= self.platform_limit_secs {
            return Err(DispatchError::InvalidSettings(format!(
                "batch_timeout_secs ({}) must be below platform_limit_secs ({})",
                self.batch_timeout_secs, self.platform_limit_secs
            )));
        }
        if self.max_wait_secs < self.batch_timeout_secs {
            return Err(DispatchError::InvalidSettings(format!(
                "max_wait_secs ({}) must be at least batch_timeout_secs ({})",
                self.max_wait_secs, self.batch_timeout_secs
            )));
        }
        Ok(())
    }
}

/// Result of offering a report to the collector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acceptance {
    New,
    Duplicate,
    Unknown,
}

/// Tracks which batches have reported. Idempotent per batch id.
#[derive(Debug, Default)]
pub struct ReportCollector {
    expected: BTreeMap<String, usize>,
    reports: BTreeMap<String, BatchReport>,
    lost: BTreeMap<String, LostBatch>,
}

impl ReportCollector {
    pub fn new(batches: &[Batch]) -> Self {
        Self {
            expected: batches
                .iter()
                .map(|b| (b.batch_id.clone(), b.worker_index))
                .collect(),
            ..Default::default()
        }
    }

    /// A late report for a batch already declared lost is still taken
    pub fn accept_report(&mut self, report: &BatchReport) -> Acceptance {
        if !self.expected.contains_key(&report.batch_id) {
            return Acceptance::Unknown;
        }
        if self.reports.contains_key(&report.batch_id) {
            return Acceptance::Duplicate;
        }
        self.lost.remove(&report.batch_id);
        self.reports.insert(report.batch_id.clone(), report.clone());
        Acceptance::New
    }

    /// Returns false if the batch already reported or was already lost
    pub fn mark_lost(&mut self, lost: &LostBatch) -> bool {
        if !self.expected.contains_key(&lost.batch_id)
            || self.reports.contains_key(&lost.batch_id)
            || self.lost.contains_key(&lost.batch_id)
        {
            return false;
        }
        self.lost.insert(lost.batch_id.clone(), lost.clone());
        true
    }

    pub fn is_complete(&self) -> bool {
        self.reports.len() + self.lost.len() >= self.expected.len()
    }

    /// Batches with neither a report nor a loss
    pub fn missing(&self) -> Vec<(String, usize)> {
        self.expected
            .iter()
            .filter(|(id, _)| !self.reports.contains_key(*id) && !self.lost.contains_key(*id))
            .map(|(id, worker)| (id.clone(), *worker))
            .collect()
    }

    pub fn expected(&self) -> usize {
        self.expected.len()
    }

    fn into_parts(self) -> (Vec<BatchReport>, Vec<LostBatch>) {
        let mut reports: Vec<_> = self.reports.into_values().collect();
        reports.sort_by_key(|r| r.worker_index);
        let mut lost: Vec<_> = self.lost.into_values().collect();
        lost.sort_by_key(|l| l.worker_index);
        (reports, lost)
    }
}

/// Receives accepted reports from the collector loop, one at a time
#[async_trait]
pub trait ReportHandler: Send {
    async fn on_report(&mut self, report: &BatchReport);

    async fn on_lost(&mut self, lost: &LostBatch);

    async fn on_event(&mut self, event: ProgressEvent);
}

/// What one execution's batches will run with
#[derive(Clone, Debug)]
pub struct DispatchJob {
    pub execution_id: String,
    pub config_name: String,
    pub endpoint: String,
    pub batches: Vec<Batch>,
    pub worker: WorkerSettings,
}

/// Both ends of the collector channel. The sender is also handed to the
/// registry so external callbacks land in the same queue.
pub struct Inbox {
    pub tx: mpsc::UnboundedSender<DispatchMessage>,
    pub rx: mpsc::UnboundedReceiver<DispatchMessage>,
}

impl Inbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default)]
pub struct DispatchOutcome {
    pub expected: usize,
    /// Accepted reports ordered by worker index
    pub reports: Vec<BatchReport>,
    pub lost: Vec<LostBatch>,
    pub duplicates: usize,
    pub timed_out: bool,
    pub stopped: bool,
    pub finalized_externally: bool,
}

impl DispatchOutcome {
    pub fn is_total_failure(&self) -> bool {
        self.expected > 0 && self.reports.is_empty()
    }

    pub fn reported_cases(&self) -> usize {
        self.reports.iter().map(|r| r.total()).sum()
    }
}

/// Runs batches on a batch executor and collects their reports
pub struct ParallelDispatcher {
    executor: Arc<dyn BatchExecutor>,
    settings: DispatchSettings,
}

impl ParallelDispatcher {
    pub fn new(executor: Arc<dyn BatchExecutor>, settings: DispatchSettings) -> Self {
        Self { executor, settings }
    }

    /// Ask the executor to get ready. It must hand back the same batches.
    pub async fn prepare(&self, job: &DispatchJob) -> Result<(), DispatchError> {
        let response = self
            .executor
            .prepare(PrepareRequest {
                execution_id: job.execution_id.clone(),
                config_name: job.config_name.clone(),
                worker_count: job.batches.len(),
                batches: job.batches.clone(),
            })
            .await?;

        if !response.success {
            return Err(DispatchError::PrepareRejected(
                response
                    .error
                    .unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        if response.batches.len() != job.batches.len() {
            return Err(DispatchError::BatchCountMismatch {
                expected: job.batches.len(),
                got: response.batches.len(),
            });
        }
        for (planned, echoed) in job.batches.iter().zip(&response.batches) {
            if planned != echoed {
                return Err(DispatchError::BatchMismatch(format!(
                    "{} differs from the planned batch",
                    planned.batch_id
                )));
            }
        }

        debug!(
            "Executor {} ready for {} batches",
            self.executor.name(),
            job.batches.len()
        );
        Ok(())
    }

    /// Prepare, dispatch every batch and collect until all have reported,
    /// been lost, or the wait limit passes
    pub async fn run(
        &self,
        job: DispatchJob,
        inbox: Inbox,
        cancel: CancellationToken,
        handler: &mut dyn ReportHandler,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.prepare(&job).await?;

        let Inbox { tx, mut rx } = inbox;
        let mut collector = ReportCollector::new(&job.batches);
        let batch_timeout = self.settings.batch_timeout();

        info!(
            "Dispatching {} batches for {} via {}",
            job.batches.len(),
            job.execution_id,
            self.executor.name()
        );

        let mut handles = Vec::with_capacity(job.batches.len());
        for batch in &job.batches {
            let event = ProgressEvent::new(
                &job.execution_id,
                EventKind::BatchStarted,
                format!("{} dispatched with {} cases", batch.batch_id, batch.len()),
            )
            .with_worker(batch.worker_index);
            self.forward_event(event, handler).await;

            let executor = Arc::clone(&self.executor);
            let tx = tx.clone();
            let cancel = cancel.child_token();
            let request = ExecuteBatchRequest {
                execution_id: job.execution_id.clone(),
                endpoint: job.endpoint.clone(),
                batch: batch.clone(),
                worker: job.worker.clone(),
            };

            handles.push(tokio::spawn(async move {
                let batch_id = request.batch.batch_id.clone();
                let worker_index = request.batch.worker_index;
                let lost = |reason: String| {
                    DispatchMessage::Lost(LostBatch {
                        batch_id: batch_id.clone(),
                        worker_index,
                        reason,
                    })
                };

                let message =
                    match tokio::time::timeout(batch_timeout, executor.execute_batch(request, cancel))
                        .await
                    {
                        Ok(Ok(report)) => DispatchMessage::Report(report),
                        Ok(Err(e)) => lost(e.to_string()),
                        Err(_) => lost(format!(
                            "exceeded batch timeout of {:.0}s",
                            batch_timeout.as_secs_f64()
                        )),
                    };
                // the collector may already be gone after the wait limit
                let _ = tx.send(message);
            }));
        }
        drop(tx);

        let mut outcome = DispatchOutcome {
            expected: collector.expected(),
            ..Default::default()
        };
        let mut deadline = Instant::now() + self.settings.max_wait();

        while !collector.is_complete() {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(DispatchMessage::Report(report)) => {
                        self.apply_report(&job, &mut collector, &mut outcome, report, handler).await;
                    }
                    Some(DispatchMessage::Lost(lost)) => {
                        self.apply_lost(&job, &mut collector, lost, handler).await;
                    }
                    Some(DispatchMessage::Log(event)) => {
                        self.forward_event(event, handler).await;
                    }
                    Some(DispatchMessage::Finalize(_)) => {
                        info!("Execution {} finalized externally", job.execution_id);
                        outcome.finalized_externally = true;
                        break;
                    }
                    None => break,
                },
                _ = cancel.cancelled(), if !outcome.stopped => {
                    info!("Execution {} stopped, draining in-flight reports", job.execution_id);
                    outcome.stopped = true;
                    deadline = deadline.min(Instant::now() + STOP_GRACE);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if !outcome.stopped {
                        warn!(
                            "Execution {} hit the {:.0}s wait limit",
                            job.execution_id,
                            self.settings.max_wait_secs
                        );
                        outcome.timed_out = true;
                    }
                    break;
                }
            }
        }

        // take whatever already arrived before giving up on the rest
        while let Ok(message) = rx.try_recv() {
            if let DispatchMessage::Report(report) = message {
                self.apply_report(&job, &mut collector, &mut outcome, report, handler).await;
            }
        }

        let reason = if outcome.stopped {
            "stopped before the batch reported"
        } else if outcome.timed_out {
            "no report before the wait limit"
        } else {
            "collection ended before the batch reported"
        };
        for (batch_id, worker_index) in collector.missing() {
            let lost = LostBatch {
                batch_id,
                worker_index,
                reason: reason.to_string(),
            };
            self.apply_lost(&job, &mut collector, lost, handler).await;
        }

        for handle in &handles {
            handle.abort();
        }
        join_all(handles).await;

        let (reports, lost) = collector.into_parts();
        outcome.reports = reports;
        outcome.lost = lost;

        info!(
            "Execution {}: {}/{} batches reported, {} lost, {} duplicates ignored",
            job.execution_id,
            outcome.reports.len(),
            outcome.expected,
            outcome.lost.len(),
            outcome.duplicates
        );
        Ok(outcome)
    }

    /// Send the overall outcome to the executor
    pub async fn finalize(&self, request: FinalizeRequest) -> Result<(), DispatchError> {
        self.executor.finalize(request).await
    }

    async fn apply_report(
        &self,
        job: &DispatchJob,
        collector: &mut ReportCollector,
        outcome: &mut DispatchOutcome,
        report: BatchReport,
        handler: &mut dyn ReportHandler,
    ) {
        match collector.accept_report(&report) {
            Acceptance::New => {
                handler.on_report(&report).await;
                let event = ProgressEvent::new(
                    &job.execution_id,
                    EventKind::BatchCompleted,
                    format!(
                        "{}: {} ok, {} failed in {:.1}s",
                        report.batch_id, report.completed, report.failed, report.duration_secs
                    ),
                )
                .with_worker(report.worker_index);
                self.forward_event(event, handler).await;
            }
            Acceptance::Duplicate => {
                outcome.duplicates += 1;
                debug!("Ignoring duplicate report for {}", report.batch_id);
            }
            Acceptance::Unknown => {
                warn!(
                    "Ignoring report for unknown batch {} in {}",
                    report.batch_id, job.execution_id
                );
            }
        }
    }

    async fn apply_lost(
        &self,
        job: &DispatchJob,
        collector: &mut ReportCollector,
        lost: LostBatch,
        handler: &mut dyn ReportHandler,
    ) {
        if !collector.mark_lost(&lost) {
            return;
        }
        warn!("{} lost: {}", lost.batch_id, lost.reason);
        handler.on_lost(&lost).await;
        let event = ProgressEvent::new(
            &job.execution_id,
            EventKind::BatchLost,
            format!("{}: {}", lost.batch_id, lost.reason),
        )
        .with_worker(lost.worker_index);
        self.forward_event(event, handler).await;
    }

    async fn forward_event(&self, event: ProgressEvent, handler: &mut dyn ReportHandler) {
        if let Err(e) = self.executor.log(event.clone()).await {
            debug!("Executor log call failed: {}", e);
        }
        handler.on_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::partition;
    use crate::testing::{config_with_cases, Fault, FaultyExecutor};

    #[derive(Default)]
    struct Recorder {
        reports: Vec<BatchReport>,
        lost: Vec<LostBatch>,
        events: Vec<ProgressEvent>,
    }

    #[async_trait]
    impl ReportHandler for Recorder {
        async fn on_report(&mut self, report: &BatchReport) {
            self.reports.push(report.clone());
        }

        async fn on_lost(&mut self, lost: &LostBatch) {
            self.lost.push(lost.clone());
        }

        async fn on_event(&mut self, event: ProgressEvent) {
            self.events.push(event);
        }
    }

    fn job(workers: usize) -> DispatchJob {
        let cases = config_with_cases("d", 10).test_cases().unwrap();
        DispatchJob {
            execution_id: "exec-d".to_string(),
            config_name: "d".to_string(),
            endpoint: "mock://graph-rag".to_string(),
            batches: partition(&cases, workers),
            worker: WorkerSettings::default(),
        }
    }

    fn fast() -> DispatchSettings {
        DispatchSettings {
            batch_timeout_secs: 0.2,
            platform_limit_secs: 1.0,
            max_wait_secs: 0.5,
        }
    }

    #[tokio::test]
    async fn test_all_batches_report() {
        let executor = Arc::new(FaultyExecutor::synthetic());
        let dispatcher = ParallelDispatcher::new(executor.clone(), fast());
        let mut recorder = Recorder::default();

        let outcome = dispatcher
            .run(job(5), Inbox::new(), CancellationToken::new(), &mut recorder)
            .await
            .unwrap();

        assert_eq!(outcome.expected, 5);
        assert_eq!(outcome.reports.len(), 5);
        assert!(outcome.lost.is_empty());
        assert_eq!(outcome.reported_cases(), 10);
        let workers: Vec<usize> = outcome.reports.iter().map(|r| r.worker_index).collect();
        assert_eq!(workers, vec![0, 1, 2, 3, 4]);
        assert_eq!(recorder.reports.len(), 5);
        // started + completed for each batch
        assert_eq!(executor.logged().len(), 10);
    }

    #[tokio::test]
    async fn test_hanging_batch_is_lost_not_fatal() {
        let executor = Arc::new(FaultyExecutor::synthetic().with_fault(3, Fault::Hang));
        let dispatcher = ParallelDispatcher::new(executor, fast());
        let mut recorder = Recorder::default();

        let outcome = dispatcher
            .run(job(5), Inbox::new(), CancellationToken::new(), &mut recorder)
            .await
            .unwrap();

        assert_eq!(outcome.reports.len(), 4);
        assert_eq!(outcome.lost.len(), 1);
        assert_eq!(outcome.lost[0].batch_id, "batch_3");
        assert!(outcome.lost[0].reason.contains("batch timeout"));
        assert!(!outcome.is_total_failure());
        assert_eq!(recorder.lost.len(), 1);
    }

    #[tokio::test]
    async fn test_no_reports_is_total_failure() {
        let mut executor = FaultyExecutor::synthetic();
        for worker in 0..5 {
            executor = executor.with_fault(worker, Fault::Error);
        }
        let dispatcher = ParallelDispatcher::new(Arc::new(executor), fast());
        let mut recorder = Recorder::default();

        let outcome = dispatcher
            .run(job(5), Inbox::new(), CancellationToken::new(), &mut recorder)
            .await
            .unwrap();

        assert!(outcome.is_total_failure());
        assert_eq!(outcome.lost.len(), 5);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_duplicate_report_counted_once() {
        let dispatcher = ParallelDispatcher::new(Arc::new(FaultyExecutor::synthetic()), fast());
        let job = job(2);
        let inbox = Inbox::new();
        let early = BatchReport {
            batch_id: "batch_0".to_string(),
            worker_index: 0,
            success: true,
            completed: 5,
            failed: 0,
            duration_secs: 0.1,
            error: None,
        };
        inbox.tx.send(DispatchMessage::Report(early.clone())).unwrap();
        inbox.tx.send(DispatchMessage::Report(early)).unwrap();

        let mut recorder = Recorder::default();
        let outcome = dispatcher
            .run(job, inbox, CancellationToken::new(), &mut recorder)
            .await
            .unwrap();

        assert_eq!(outcome.reports.len(), 2);
        assert_eq!(outcome.reported_cases(), 10);
        assert_eq!(recorder.reports.len(), 2);
        assert!(outcome.duplicates >= 1);
    }

    #[tokio::test]
    async fn test_rejected_preparation() {
        let executor = FaultyExecutor::synthetic().rejecting("quota exhausted");
        let dispatcher = ParallelDispatcher::new(Arc::new(executor), fast());
        let mut recorder = Recorder::default();

        let err = dispatcher
            .run(job(3), Inbox::new(), CancellationToken::new(), &mut recorder)
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::PrepareRejected("quota exhausted".to_string()));
        assert!(recorder.events.is_empty());
    }

    #[tokio::test]
    async fn test_external_finalize_ends_collection() {
        let executor = FaultyExecutor::synthetic().with_fault(1, Fault::Hang);
        let settings = DispatchSettings {
            batch_timeout_secs: 30.0,
            platform_limit_secs: 60.0,
            max_wait_secs: 30.0,
        };
        let dispatcher = ParallelDispatcher::new(Arc::new(executor), settings);
        let inbox = Inbox::new();
        let tx = inbox.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(DispatchMessage::Finalize(None));
        });

        let mut recorder = Recorder::default();
        let outcome = dispatcher
            .run(job(2), inbox, CancellationToken::new(), &mut recorder)
            .await
            .unwrap();

        assert!(outcome.finalized_externally);
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.lost.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_ends_collection_after_grace() {
        let executor = FaultyExecutor::synthetic().with_fault(0, Fault::Hang);
        let settings = DispatchSettings {
            batch_timeout_secs: 30.0,
            platform_limit_secs: 60.0,
            max_wait_secs: 30.0,
        };
        let dispatcher = ParallelDispatcher::new(Arc::new(executor), settings);
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let started = Instant::now();
        let mut recorder = Recorder::default();
        let outcome = dispatcher
            .run(job(2), Inbox::new(), cancel, &mut recorder)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(outcome.stopped);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.lost.len(), 1);
        assert!(outcome.lost[0].reason.contains("stopped"));
    }

    #[test]
    fn test_collector_accepts_late_report_after_loss() {
        let batches = job(2).batches;
        let mut collector = ReportCollector::new(&batches);
        let lost = LostBatch {
            batch_id: "batch_1".to_string(),
            worker_index: 1,
            reason: "timeout".to_string(),
        };
        assert!(collector.mark_lost(&lost));
        assert!(!collector.mark_lost(&lost));

        let late = BatchReport {
            batch_id: "batch_1".to_string(),
            worker_index: 1,
            success: true,
            completed: 5,
            failed: 0,
            duration_secs: 1.0,
            error: None,
        };
        assert_eq!(collector.accept_report(&late), Acceptance::New);
        assert_eq!(collector.accept_report(&late), Acceptance::Duplicate);
        assert_eq!(collector.missing(), vec![("batch_0".to_string(), 0)]);

        let stray = BatchReport {
            batch_id: "batch_9".to_string(),
            ..late
        };
        assert_eq!(collector.accept_report(&stray), Acceptance::Unknown);
    }

    #[test]
    fn test_settings_validation() {
        assert!(DispatchSettings::default().validate().is_ok());

        let at_limit = DispatchSettings {
            batch_timeout_secs: 3600.0,
            ..Default::default()
        };
        assert!(matches!(
            at_limit.validate(),
            Err(DispatchError::InvalidSettings(_))
        ));

        let short_wait = DispatchSettings {
            max_wait_secs: 10.0,
            ..Default::default()
        };
        assert!(short_wait.validate().is_err());
    }
}
