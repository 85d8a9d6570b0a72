//! Recommendation rules
//!
//! A policy turns computed statistics into an ordered list of short
//! findings. Rules are plain comparisons; ties go to the name that sorts
//! first.

use std::collections::BTreeMap;

use super::aggregator::{ExecutionSummary, GroupStats};

/// Statistics in, ordered findings out
pub trait RecommendationPolicy: Send + Sync {
    fn recommend(&self, summary: &ExecutionSummary) -> Vec<String>;
}

/// Built-in rule set
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRecommendations;

impl RecommendationPolicy for DefaultRecommendations {
    fn recommend(&self, summary: &ExecutionSummary) -> Vec<String> {
        let mut recommendations = Vec::new();

        if let Some((model, avg)) = fastest(&summary.by_model) {
            recommendations.push(format!("Best performing model: {model} (avg {avg:.2}s)"));
        }

        if let Some((model, stats)) = highest_failure_rate(&summary.by_model) {
            recommendations.push(format!(
                "Highest failure rate: {} ({:.1}% of {} tests failed)",
                model,
                stats.failure_rate() * 100.0,
                stats.count
            ));
        }

        if summary.by_user_type.len() > 1 {
            if let Some((user_type, avg)) = fastest(&summary.by_user_type) {
                recommendations.push(format!("Fastest user type: {user_type} (avg {avg:.2}s)"));
            }
        }

        let enabled = average(&summary.by_think_mode, "enabled");
        let disabled = average(&summary.by_think_mode, "disabled");
        if let (Some(enabled), Some(disabled)) = (enabled, disabled) {
            if enabled < disabled {
                recommendations.push(format!(
                    "Think mode is faster (avg {enabled:.2}s vs {disabled:.2}s)"
                ));
            } else {
                recommendations.push(format!(
                    "Regular mode is faster (avg {disabled:.2}s vs {enabled:.2}s)"
                ));
            }
        }

        if summary.shortfall > 0 {
            recommendations.push(format!(
                "{} planned test cases have no result; rates cover the {} reported results only",
                summary.shortfall, summary.reported
            ));
        }

        recommendations
    }
}

fn average(groups: &BTreeMap<String, GroupStats>, key: &str) -> Option<f64> {
    groups.get(key).and_then(|g| g.avg_response_secs)
}

/// Lowest average response time. BTreeMap order breaks ties by name.
fn fastest(groups: &BTreeMap<String, GroupStats>) -> Option<(&str, f64)> {
    let mut best: Option<(&str, f64)> = None;
    for (name, stats) in groups {
        if let Some(avg) = stats.avg_response_secs {
            if best.map_or(true, |(_, b)| avg < b) {
                best = Some((name.as_str(), avg));
            }
        }
    }
    best
}

/// Group with the highest failure rate, if any group failed at all
fn highest_failure_rate(groups: &BTreeMap<String, GroupStats>) -> Option<(&str, &GroupStats)> {
    let mut worst: Option<(&str, &GroupStats)> = None;
    for (name, stats) in groups.iter().filter(|(_, s)| s.failures > 0) {
        if worst.map_or(true, |(_, w)| stats.failure_rate() > w.failure_rate()) {
            worst = Some((name.as_str(), stats));
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(count: usize, failures: usize, avg: Option<f64>) -> GroupStats {
        GroupStats {
            count,
            successes: count - failures,
            failures,
            success_rate: (count - failures) as f64 / count as f64,
            avg_response_secs: avg,
            min_response_secs: avg,
            max_response_secs: avg,
        }
    }

    fn summary() -> ExecutionSummary {
        let mut summary = ExecutionSummary::default();
        summary
            .by_model
            .insert("gemini-2.0-flash".into(), stats(10, 0, Some(2.0)));
        summary
            .by_model
            .insert("gemini-2.5-pro".into(), stats(10, 3, Some(6.5)));
        summary
            .by_user_type
            .insert("business".into(), stats(10, 1, Some(3.0)));
        summary
            .by_user_type
            .insert("technical".into(), stats(10, 2, Some(4.0)));
        summary
            .by_think_mode
            .insert("enabled".into(), stats(10, 2, Some(7.0)));
        summary
            .by_think_mode
            .insert("disabled".into(), stats(10, 1, Some(2.5)));
        summary
    }

    #[test]
    fn test_default_rules_in_order() {
        let recommendations = DefaultRecommendations.recommend(&summary());
        assert_eq!(
            recommendations,
            vec![
                "Best performing model: gemini-2.0-flash (avg 2.00s)".to_string(),
                "Highest failure rate: gemini-2.5-pro (30.0% of 10 tests failed)".to_string(),
                "Fastest user type: business (avg 3.00s)".to_string(),
                "Regular mode is faster (avg 2.50s vs 7.00s)".to_string(),
            ]
        );
    }

    #[test]
    fn test_ties_go_to_first_name() {
        let mut summary = ExecutionSummary::default();
        summary.by_model.insert("b-model".into(), stats(4, 0, Some(1.0)));
        summary.by_model.insert("a-model".into(), stats(4, 0, Some(1.0)));

        let recommendations = DefaultRecommendations.recommend(&summary);
        assert_eq!(recommendations[0], "Best performing model: a-model (avg 1.00s)");
    }

    #[test]
    fn test_no_statistics_no_findings() {
        assert!(DefaultRecommendations
            .recommend(&ExecutionSummary::default())
            .is_empty());
    }
}
