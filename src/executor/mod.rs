//! Test execution engine
//!
//! Runs executions locally case by case, or in parallel batches through a
//! batch executor. Admission and stop signals go through the registry.

mod dispatcher;
mod engine;
mod registry;
mod retry;
mod worker;

pub use dispatcher::{DispatchError, DispatchSettings};
pub use engine::{EngineSettings, ExecutionEngine};
pub use registry::{AdmissionPolicy, ExecutionRegistry};
pub use retry::RetryPolicy;
pub use worker::{CaseRunner, WorkerSettings};
