//! Execution record and state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Illegal execution mutations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Illegal transition for execution {execution_id}: {from} -> {to}")]
    IllegalTransition {
        execution_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error(
        "Progress for execution {execution_id} would exceed total: {completed} + {failed} > {total}"
    )]
    CounterOverflow {
        execution_id: String,
        completed: usize,
        failed: usize,
        total: usize,
    },
}

/// Execution lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "stopped" => Some(ExecutionStatus::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Stopped
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Stopped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "○",
            ExecutionStatus::Running => "▶",
            ExecutionStatus::Completed => "✓",
            ExecutionStatus::Failed => "✗",
            ExecutionStatus::Stopped => "■",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Where the test cases of an execution run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Sequential, in-process
    Local,
    /// One batch per worker through a batch executor
    ParallelWorkflow,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Local => "local",
            ExecutionMode::ParallelWorkflow => "parallel-workflow",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(ExecutionMode::Local),
            "parallel-workflow" | "parallel" | "workflow" => Some(ExecutionMode::ParallelWorkflow),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One run of a test configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub config_name: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_tests: usize,
    /// Test cases that finished successfully
    pub completed_tests: usize,
    pub failed_tests: usize,
    pub error_message: Option<String>,
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default)]
    pub worker_count: usize,
}

impl Execution {
    /// Create a pending execution with a fresh id
    pub fn new(config_name: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            config_name: config_name.into(),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            total_tests: 0,
            completed_tests: 0,
            failed_tests: 0,
            error_message: None,
            execution_mode: None,
            worker_count: 0,
        }
    }

    pub fn with_plan(mut self, total_tests: usize, mode: ExecutionMode, worker_count: usize) -> Self {
        self.total_tests = total_tests;
        self.execution_mode = Some(mode);
        self.worker_count = worker_count;
        self
    }

    /// Move to `next`, stamping start and end times
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::IllegalTransition {
                execution_id: self.execution_id.clone(),
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == ExecutionStatus::Running {
            self.start_time = Some(now);
        }
        if next.is_terminal() {
            self.end_time = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Transition to failed and record the reason
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), StateError> {
        self.transition(ExecutionStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Count one finished test case
    pub fn record_outcome(&mut self, success: bool) -> Result<(), StateError> {
        if success {
            self.record_counts(1, 0)
        } else {
            self.record_counts(0, 1)
        }
    }

    /// Add finished test cases to the counters.
    /// Counters only grow and never exceed `total_tests`.
    pub fn record_counts(&mut self, completed: usize, failed: usize) -> Result<(), StateError> {
        let new_completed = self.completed_tests + completed;
        let new_failed = self.failed_tests + failed;
        if new_completed + new_failed > self.total_tests {
            return Err(StateError::CounterOverflow {
                execution_id: self.execution_id.clone(),
                completed: new_completed,
                failed: new_failed,
                total: self.total_tests,
            });
        }
        self.completed_tests = new_completed;
        self.failed_tests = new_failed;
        Ok(())
    }

    pub fn processed(&self) -> usize {
        self.completed_tests + self.failed_tests
    }

    pub fn remaining(&self) -> usize {
        self.total_tests.saturating_sub(self.processed())
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_tests == 0 {
            0.0
        } else {
            (self.processed() as f64 / self.total_tests as f64) * 100.0
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] {}/{} done ({} failed)",
            self.status.symbol(),
            self.execution_id,
            self.config_name,
            self.processed(),
            self.total_tests,
            self.failed_tests
        )?;
        if let Some(msg) = &self.error_message {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut exec = Execution::new("cfg").with_plan(4, ExecutionMode::Local, 1);
        assert_eq!(exec.status, ExecutionStatus::Pending);

        exec.transition(ExecutionStatus::Running).unwrap();
        assert!(exec.start_time.is_some());
        assert!(exec.end_time.is_none());

        exec.transition(ExecutionStatus::Completed).unwrap();
        assert!(exec.end_time.is_some());
        assert!(exec.status.is_terminal());
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Stopped,
        ] {
            for next in [
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Completed,
                ExecutionStatus::Failed,
                ExecutionStatus::Stopped,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_pending_cannot_complete() {
        let mut exec = Execution::new("cfg");
        let err = exec.transition(ExecutionStatus::Completed).unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));
        assert_eq!(exec.status, ExecutionStatus::Pending);
    }

    #[test]
    fn test_fail_records_message() {
        let mut exec = Execution::new("cfg");
        exec.fail("empty test matrix").unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error_message.as_deref(), Some("empty test matrix"));
    }

    #[test]
    fn test_counters_monotonic_and_bounded() {
        let mut exec = Execution::new("cfg").with_plan(3, ExecutionMode::Local, 1);
        exec.transition(ExecutionStatus::Running).unwrap();

        let mut last = 0;
        for success in [true, false, true] {
            exec.record_outcome(success).unwrap();
            assert!(exec.processed() > last);
            assert!(exec.processed() <= exec.total_tests);
            last = exec.processed();
        }
        assert_eq!(exec.completed_tests, 2);
        assert_eq!(exec.failed_tests, 1);

        let err = exec.record_outcome(true).unwrap_err();
        assert!(matches!(err, StateError::CounterOverflow { .. }));
        assert_eq!(exec.processed(), 3);
    }

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!(ExecutionStatus::from_str("Stopped"), Some(ExecutionStatus::Stopped));
        assert_eq!(ExecutionStatus::from_str("unknown"), None);
        assert_eq!(
            ExecutionMode::from_str("parallel-workflow"),
            Some(ExecutionMode::ParallelWorkflow)
        );
        assert_eq!(
            serde_json::to_string(&ExecutionMode::ParallelWorkflow).unwrap(),
            "\"parallel-workflow\""
        );
    }
}
