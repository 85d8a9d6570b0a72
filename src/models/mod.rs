//! Data models for A/B performance testing
//!
//! This module contains the data structures shared by the planner, the
//! execution engine, the result aggregator and the storage backends.

mod batch;
mod configuration;
mod event;
mod execution;
mod test_result;

pub use batch::{Batch, BatchReport};
pub use configuration::{
    think_mode_label, ConfigKind, TestCase, TestConfiguration, ValidationError,
};
pub use event::{EventKind, ProgressEvent};
pub use execution::{Execution, ExecutionMode, ExecutionStatus, StateError};
pub use test_result::{ErrorKind, TestResult};
