//! Progress events emitted during an execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted,
    ModeSelected,
    CaseCompleted,
    CaseFailed,
    BatchStarted,
    BatchCompleted,
    BatchLost,
    StopRequested,
    ExecutionFinished,
    WorkflowLog,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ExecutionStarted => "execution_started",
            EventKind::ModeSelected => "mode_selected",
            EventKind::CaseCompleted => "case_completed",
            EventKind::CaseFailed => "case_failed",
            EventKind::BatchStarted => "batch_started",
            EventKind::BatchCompleted => "batch_completed",
            EventKind::BatchLost => "batch_lost",
            EventKind::StopRequested => "stop_requested",
            EventKind::ExecutionFinished => "execution_finished",
            EventKind::WorkflowLog => "workflow_log",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "execution_started" => Some(EventKind::ExecutionStarted),
            "mode_selected" => Some(EventKind::ModeSelected),
            "case_completed" => Some(EventKind::CaseCompleted),
            "case_failed" => Some(EventKind::CaseFailed),
            "batch_started" => Some(EventKind::BatchStarted),
            "batch_completed" => Some(EventKind::BatchCompleted),
            "batch_lost" => Some(EventKind::BatchLost),
            "stop_requested" => Some(EventKind::StopRequested),
            "execution_finished" => Some(EventKind::ExecutionFinished),
            "workflow_log" => Some(EventKind::WorkflowLog),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A timestamped progress record for one execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub worker_index: Option<usize>,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(execution_id: impl Into<String>, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            timestamp: Utc::now(),
            kind,
            worker_index: None,
            message: message.into(),
        }
    }

    pub fn with_worker(mut self, worker_index: usize) -> Self {
        self.worker_index = Some(worker_index);
        self
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.kind)?;
        if let Some(worker) = self.worker_index {
            write!(f, " (worker {worker})")?;
        }
        write!(f, ": {}", self.message)
    }
}
