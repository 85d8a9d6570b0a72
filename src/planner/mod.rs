//! Workload planning
//!
//! Enumerates the test matrix of a configuration, estimates how long it takes
//! to run and splits it into batches that each fit under a per-batch ceiling.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::models::{Batch, ExecutionMode, TestCase, TestConfiguration, ValidationError};

/// Planner thresholds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// Expected latency of one call, used for estimation only
    pub per_request_budget_secs: u64,
    /// Estimates up to this value run locally
    pub local_ceiling_secs: u64,
    /// Target wall-clock time of one batch
    pub batch_ceiling_secs: u64,
    /// Optional upper bound on the number of workers
    pub max_workers: Option<usize>,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            per_request_budget_secs: 30,
            local_ceiling_secs: 30 * 60,
            batch_ceiling_secs: 20 * 60,
            max_workers: None,
        }
    }
}

impl PlannerSettings {
    pub fn per_request_budget(&self) -> Duration {
        Duration::from_secs(self.per_request_budget_secs)
    }

    pub fn local_ceiling(&self) -> Duration {
        Duration::from_secs(self.local_ceiling_secs)
    }

    pub fn batch_ceiling(&self) -> Duration {
        Duration::from_secs(self.batch_ceiling_secs)
    }
}

/// Output of planning a configuration
#[derive(Clone, Debug)]
pub struct Plan {
    pub config_name: String,
    pub test_cases: Vec<TestCase>,
    pub batches: Vec<Batch>,
    pub estimated_duration: Duration,
    pub mode: ExecutionMode,
}

impl Plan {
    pub fn total_tests(&self) -> usize {
        self.test_cases.len()
    }

    pub fn worker_count(&self) -> usize {
        self.batches.len()
    }

    pub fn estimated_minutes(&self) -> f64 {
        self.estimated_duration.as_secs_f64() / 60.0
    }
}

/// Turns configurations into batched plans
#[derive(Clone, Debug, Default)]
pub struct WorkloadPlanner {
    settings: PlannerSettings,
}

impl WorkloadPlanner {
    pub fn new(settings: PlannerSettings) -> Self {
        Self { settings }
    }

    /// Plan using the process-wide random source for optional shuffling
    pub fn plan(&self, config: &TestConfiguration) -> Result<Plan, ValidationError> {
        self.plan_with_rng(config, &mut rand::rng())
    }

    pub fn plan_with_rng<R: Rng + ?Sized>(
        &self,
        config: &TestConfiguration,
        rng: &mut R,
    ) -> Result<Plan, ValidationError> {
        let mut test_cases = config.test_cases()?;

        if config.randomize_order {
            test_cases.shuffle(rng);
            debug!("Shuffled {} test cases", test_cases.len());
        }

        let estimated_duration = self.estimate(test_cases.len(), config.inter_request_delay());

        let (mode, workers) = if estimated_duration <= self.settings.local_ceiling() {
            (ExecutionMode::Local, 1)
        } else {
            (
                ExecutionMode::ParallelWorkflow,
                self.worker_count(estimated_duration, test_cases.len()),
            )
        };

        let batches = partition(&test_cases, workers);

        info!(
            "Planned '{}': {} tests, ~{:.1} min, {} batch(es), mode {}",
            config.name,
            test_cases.len(),
            estimated_duration.as_secs_f64() / 60.0,
            batches.len(),
            mode
        );

        Ok(Plan {
            config_name: config.name.clone(),
            test_cases,
            batches,
            estimated_duration,
            mode,
        })
    }

    /// `n * (per_request_budget + delay)`
    pub fn estimate(&self, n: usize, delay: Duration) -> Duration {
        (self.settings.per_request_budget() + delay) * u32::try_from(n).unwrap_or(u32::MAX)
    }

    fn worker_count(&self, estimate: Duration, n: usize) -> usize {
        let ceiling_ms = self.settings.batch_ceiling().as_millis().max(1);
        let needed = estimate.as_millis().div_ceil(ceiling_ms);
        let mut workers = usize::try_from(needed).unwrap_or(usize::MAX).max(2);

        if let Some(max) = self.settings.max_workers {
            workers = workers.min(max.max(1));
        }
        workers.min(n).max(1)
    }
}

/// Split `cases` into `workers` contiguous batches whose sizes differ by at most one
pub fn partition(cases: &[TestCase], workers: usize) -> Vec<Batch> {
    let workers = workers.clamp(1, cases.len().max(1));
    let base = cases.len() / workers;
    let extra = cases.len() % workers;

    let mut batches = Vec::with_capacity(workers);
    let mut offset = 0;
    for worker_index in 0..workers {
        let size = base + usize::from(worker_index < extra);
        batches.push(Batch::new(
            worker_index,
            cases[offset..offset + size].to_vec(),
        ));
        offset += size;
    }
    batches
}
