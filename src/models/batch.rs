//! Batches and batch reports

use serde::{Deserialize, Serialize};

use super::TestCase;

/// Contiguous slice of the test matrix owned by one worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Batch {
    pub batch_id: String,
    pub worker_index: usize,
    pub test_cases: Vec<TestCase>,
}

impl Batch {
    pub fn new(worker_index: usize, test_cases: Vec<TestCase>) -> Self {
        Self {
            batch_id: batch_id_for(worker_index),
            worker_index,
            test_cases,
        }
    }

    pub fn len(&self) -> usize {
        self.test_cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.test_cases.is_empty()
    }
}

pub fn batch_id_for(worker_index: usize) -> String {
    format!("batch_{worker_index}")
}

/// What a worker sends back after running its batch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchReport {
    pub batch_id: String,
    pub worker_index: usize,
    pub success: bool,
    pub completed: usize,
    pub failed: usize,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}
