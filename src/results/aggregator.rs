//! Execution summaries
//!
//! A summary is recomputed from the full result set every time. Results are
//! de-duplicated by test case and sorted before accumulation, so the same
//! stored results always produce the same summary regardless of the order
//! workers wrote them in.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::recommendations::{DefaultRecommendations, RecommendationPolicy};
use crate::models::{think_mode_label, TestResult};
use crate::storage::{PersistenceAdapter, StorageError};

/// Statistics for one group of results
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub count: usize,
    pub successes: usize,
    pub failures: usize,
    /// successes / count
    pub success_rate: f64,
    /// Response time over successful results only
    pub avg_response_secs: Option<f64>,
    pub min_response_secs: Option<f64>,
    pub max_response_secs: Option<f64>,
}

impl GroupStats {
    pub fn failure_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.failures as f64 / self.count as f64
        }
    }
}

#[derive(Default)]
struct Accumulator {
    count: usize,
    successes: usize,
    latencies: Vec<f64>,
}

impl Accumulator {
    fn add(&mut self, result: &TestResult) {
        self.count += 1;
        if result.success {
            self.successes += 1;
            self.latencies.push(result.response_time_secs);
        }
    }

    fn finish(&self) -> GroupStats {
        let (avg, min, max) = if self.latencies.is_empty() {
            (None, None, None)
        } else {
            let sum: f64 = self.latencies.iter().sum();
            (
                Some(sum / self.latencies.len() as f64),
                self.latencies.iter().copied().reduce(f64::min),
                self.latencies.iter().copied().reduce(f64::max),
            )
        };

        GroupStats {
            count: self.count,
            successes: self.successes,
            failures: self.count - self.successes,
            success_rate: if self.count == 0 {
                0.0
            } else {
                self.successes as f64 / self.count as f64
            },
            avg_response_secs: avg,
            min_response_secs: min,
            max_response_secs: max,
        }
    }
}

/// Execution-level view over stored results
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    /// Test cases planned for the execution
    pub expected: usize,
    /// Test cases with a stored result
    pub reported: usize,
    /// Planned test cases without a result
    pub shortfall: usize,
    pub successes: usize,
    pub failures: usize,
    /// successes / reported. Missing results are not counted.
    pub success_rate: f64,
    pub avg_response_secs: Option<f64>,
    pub min_response_secs: Option<f64>,
    pub max_response_secs: Option<f64>,
    pub by_model: BTreeMap<String, GroupStats>,
    pub by_user_type: BTreeMap<String, GroupStats>,
    pub by_think_mode: BTreeMap<String, GroupStats>,
    /// Keyed by "model | user_type | think_mode"
    pub by_combination: BTreeMap<String, GroupStats>,
    /// Failure counts by error kind
    pub errors: BTreeMap<String, usize>,
    pub recommendations: Vec<String>,
}

impl ExecutionSummary {
    pub fn has_shortfall(&self) -> bool {
        self.shortfall > 0
    }
}

/// Build a summary from raw results. `expected` is the planned test count.
pub fn summarize(
    execution_id: &str,
    expected: usize,
    results: &[TestResult],
    policy: &dyn RecommendationPolicy,
) -> ExecutionSummary {
    let mut unique: Vec<&TestResult> = Vec::with_capacity(results.len());
    let mut ordered: Vec<&TestResult> = results.iter().collect();
    // earliest write wins for a repeated key
    ordered.sort_by(|a, b| {
        a.test_case
            .cmp(&b.test_case)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
    let mut seen = HashSet::new();
    for result in ordered {
        if seen.insert(result.result_key()) {
            unique.push(result);
        }
    }

    let mut overall = Accumulator::default();
    let mut by_model: BTreeMap<String, Accumulator> = BTreeMap::new();
    let mut by_user_type: BTreeMap<String, Accumulator> = BTreeMap::new();
    let mut by_think_mode: BTreeMap<String, Accumulator> = BTreeMap::new();
    let mut by_combination: BTreeMap<String, Accumulator> = BTreeMap::new();
    let mut errors: BTreeMap<String, usize> = BTreeMap::new();

    for result in &unique {
        let case = &result.test_case;
        overall.add(result);
        by_model.entry(case.model.clone()).or_default().add(result);
        by_user_type
            .entry(case.user_type.clone())
            .or_default()
            .add(result);
        by_think_mode
            .entry(think_mode_label(case.think_mode).to_string())
            .or_default()
            .add(result);
        by_combination
            .entry(format!(
                "{} | {} | {}",
                case.model,
                case.user_type,
                think_mode_label(case.think_mode)
            ))
            .or_default()
            .add(result);

        if !result.success {
            let kind = result
                .error_kind
                .map(|k| k.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            *errors.entry(kind).or_insert(0) += 1;
        }
    }

    let finish = |groups: BTreeMap<String, Accumulator>| {
        groups
            .into_iter()
            .map(|(key, acc)| (key, acc.finish()))
            .collect::<BTreeMap<_, _>>()
    };

    let totals = overall.finish();
    let reported = unique.len();
    let mut summary = ExecutionSummary {
        execution_id: execution_id.to_string(),
        expected,
        reported,
        shortfall: expected.saturating_sub(reported),
        successes: totals.successes,
        failures: totals.failures,
        success_rate: totals.success_rate,
        avg_response_secs: totals.avg_response_secs,
        min_response_secs: totals.min_response_secs,
        max_response_secs: totals.max_response_secs,
        by_model: finish(by_model),
        by_user_type: finish(by_user_type),
        by_think_mode: finish(by_think_mode),
        by_combination: finish(by_combination),
        errors,
        recommendations: Vec::new(),
    };
    summary.recommendations = policy.recommend(&summary);
    summary
}

/// Summarizes stored executions
pub struct ResultAggregator {
    store: Arc<dyn PersistenceAdapter>,
    policy: Box<dyn RecommendationPolicy>,
}

impl ResultAggregator {
    pub fn new(store: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            store,
            policy: Box::new(DefaultRecommendations),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn RecommendationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Summary of everything stored for `execution_id`
    pub async fn aggregate(&self, execution_id: &str) -> Result<ExecutionSummary, StorageError> {
        let execution =
            self.store
                .get_execution(execution_id)
                .await?
                .ok_or_else(|| StorageError::NotFound {
                    kind: "Execution",
                    id: execution_id.to_string(),
                })?;
        let results = self.store.list_test_results(execution_id).await?;

        Ok(summarize(
            execution_id,
            execution.total_tests,
            &results,
            self.policy.as_ref(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorKind, TestCase};
    use crate::storage::DocumentStore;
    use crate::testing::twelve_case_config;

    fn results_for(cases: &[TestCase]) -> Vec<TestResult> {
        cases
            .iter()
            .enumerate()
            .map(|(i, case)| {
                if i % 4 == 3 {
                    TestResult::failure("exec", case.clone(), 60.0, ErrorKind::Timeout, "timed out")
                } else {
                    let secs = if case.model == "model-a" { 1.0 } else { 2.0 };
                    TestResult::success("exec", case.clone(), secs + i as f64 / 100.0, 120)
                }
            })
            .collect()
    }

    #[test]
    fn test_summary_counts_and_groups() {
        let cases = twelve_case_config("agg").test_cases().unwrap();
        let results = results_for(&cases);

        let summary = summarize("exec", 12, &results, &DefaultRecommendations);

        assert_eq!(summary.reported, 12);
        assert_eq!(summary.shortfall, 0);
        assert_eq!(summary.successes, 9);
        assert_eq!(summary.failures, 3);
        assert!((summary.success_rate - 0.75).abs() < 1e-9);
        assert_eq!(summary.errors.get("timeout"), Some(&3));

        let model_a = &summary.by_model["model-a"];
        assert_eq!(model_a.count, 6);
        assert!(model_a.avg_response_secs.unwrap() < 2.0);
        assert_eq!(summary.by_think_mode.len(), 2);
        assert_eq!(summary.by_combination.len(), 4);
        assert!(summary.by_combination.contains_key("model-a | business | enabled"));
    }

    #[test]
    fn test_latency_ignores_failures() {
        let cases = twelve_case_config("lat").test_cases().unwrap();
        let results = vec![
            TestResult::success("exec", cases[0].clone(), 1.5, 10),
            TestResult::failure("exec", cases[1].clone(), 60.0, ErrorKind::Timeout, "slow"),
        ];
        let summary = summarize("exec", 12, &results, &DefaultRecommendations);
        assert_eq!(summary.avg_response_secs, Some(1.5));
        assert_eq!(summary.max_response_secs, Some(1.5));
    }

    #[test]
    fn test_idempotent_and_order_independent() {
        let cases = twelve_case_config("idem").test_cases().unwrap();
        let results = results_for(&cases);
        let mut reversed = results.clone();
        reversed.reverse();

        let first = summarize("exec", 12, &results, &DefaultRecommendations);
        let second = summarize("exec", 12, &results, &DefaultRecommendations);
        let shuffled = summarize("exec", 12, &reversed, &DefaultRecommendations);

        assert_eq!(first, second);
        assert_eq!(first, shuffled);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&shuffled).unwrap()
        );
    }

    #[test]
    fn test_shortfall_does_not_inflate_success_rate() {
        let cases = twelve_case_config("short").test_cases().unwrap();
        let mut results = results_for(&cases[..8]);
        // a repeated write for the same case is counted once
        results.push(results[0].clone());

        let summary = summarize("exec", 12, &results, &DefaultRecommendations);

        assert_eq!(summary.reported, 8);
        assert_eq!(summary.shortfall, 4);
        assert!(summary.has_shortfall());
        assert!((summary.success_rate - 6.0 / 8.0).abs() < 1e-9);
        assert!(summary
            .recommendations
            .iter()
            .any(|r| r.contains("4 planned test cases have no result")));
    }

    #[test]
    fn test_empty_results() {
        let summary = summarize("exec", 5, &[], &DefaultRecommendations);
        assert_eq!(summary.reported, 0);
        assert_eq!(summary.shortfall, 5);
        assert_eq!(summary.success_rate, 0.0);
        assert!(summary.avg_response_secs.is_none());
    }

    #[tokio::test]
    async fn test_aggregate_reads_store() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn PersistenceAdapter> = Arc::new(DocumentStore::open(dir.path()).unwrap());
        let execution = crate::models::Execution::new("agg")
            .with_plan(12, crate::models::ExecutionMode::Local, 1);
        store.save_execution(&execution).await.unwrap();

        let cases = twelve_case_config("agg").test_cases().unwrap();
        for case in &cases[..6] {
            let result = TestResult::success(&execution.execution_id, case.clone(), 1.0, 10);
            store.save_test_result(&result).await.unwrap();
        }

        let aggregator = ResultAggregator::new(store.clone());
        let summary = aggregator.aggregate(&execution.execution_id).await.unwrap();
        assert_eq!(summary.expected, 12);
        assert_eq!(summary.reported, 6);
        assert_eq!(summary.shortfall, 6);
        assert_eq!(summary, aggregator.aggregate(&execution.execution_id).await.unwrap());

        assert!(matches!(
            aggregator.aggregate("missing").await,
            Err(StorageError::NotFound { .. })
        ));
    }
}
