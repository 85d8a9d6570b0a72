//! Test result models
//!
//! One `TestResult` is written per executed test case and never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TestCase;

/// Classification of a failed target-service call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    MalformedResponse,
    Rejected,
    Cancelled,
    Other,
}

impl ErrorKind {
    /// Transient failures are retried, everything else fails at once
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Connection)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(ErrorKind::Timeout),
            "connection" => Some(ErrorKind::Connection),
            "malformed_response" => Some(ErrorKind::MalformedResponse),
            "rejected" => Some(ErrorKind::Rejected),
            "cancelled" => Some(ErrorKind::Cancelled),
            "other" => Some(ErrorKind::Other),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Outcome of a single test case
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub execution_id: String,
    /// None when the case ran in local mode
    pub batch_id: Option<String>,
    pub test_case: TestCase,
    pub success: bool,
    pub response_time_secs: f64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub attempts: u32,
    pub response_chars: usize,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl TestResult {
    pub fn success(
        execution_id: impl Into<String>,
        test_case: TestCase,
        response_time_secs: f64,
        response_chars: usize,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            batch_id: None,
            test_case,
            success: true,
            response_time_secs,
            error: None,
            error_kind: None,
            attempts: 1,
            response_chars,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        execution_id: impl Into<String>,
        test_case: TestCase,
        response_time_secs: f64,
        kind: ErrorKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            batch_id: None,
            test_case,
            success: false,
            response_time_secs,
            error: Some(error.into()),
            error_kind: Some(kind),
            attempts: 1,
            response_chars: 0,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Idempotency key: the identity of the test case
    pub fn result_key(&self) -> String {
        self.test_case.key()
    }

    pub fn symbol(&self) -> &'static str {
        if self.success {
            "✓"
        } else {
            "✗"
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{:.2}s]",
            self.symbol(),
            self.test_case,
            self.response_time_secs
        )?;
        if let Some(err) = &self.error {
            write!(f, " - {err}")?;
        }
        Ok(())
    }
}
