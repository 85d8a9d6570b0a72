//! Output formatters
//!
//! Table, JSON and one-line summary renderings of executions, plans,
//! configurations and result summaries.

use serde::Serialize;

use crate::models::{
    EventKind, Execution, ExecutionStatus, ProgressEvent, TestConfiguration, TestResult,
};
use crate::planner::Plan;
use crate::results::{ExecutionSummary, GroupStats};

const WIDTH: usize = 76;

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    fn json<T: Serialize + ?Sized>(&self, value: &T) -> Option<String> {
        match self.format {
            OutputFormat::Json => Some(serde_json::to_string(value).unwrap_or_default()),
            OutputFormat::JsonPretty => Some(serde_json::to_string_pretty(value).unwrap_or_default()),
            _ => None,
        }
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if self.colorize {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    fn rate(&self, rate: f64) -> String {
        let text = format!("{:5.1}%", rate * 100.0);
        if rate >= 0.9 {
            self.paint(&text, "32")
        } else if rate >= 0.5 {
            self.paint(&text, "33")
        } else {
            self.paint(&text, "31")
        }
    }

    /// Status label padded to `width` before coloring
    fn status(&self, status: ExecutionStatus, width: usize) -> String {
        let text = format!("{:width$}", format!("{} {}", status.symbol(), status));
        match status {
            ExecutionStatus::Completed => self.paint(&text, "32"),
            ExecutionStatus::Failed => self.paint(&text, "31"),
            ExecutionStatus::Stopped => self.paint(&text, "33"),
            _ => text,
        }
    }

    /// Format a single test result
    pub fn format_result(&self, result: &TestResult) -> String {
        if let Some(json) = self.json(result) {
            return json;
        }
        let symbol = if result.success {
            self.paint("✓", "32")
        } else {
            self.paint("✗", "31")
        };
        match self.format {
            OutputFormat::Summary => format!(
                "{} {} ({:.2}s)",
                symbol, result.test_case.model, result.response_time_secs
            ),
            _ => {
                let mut line = format!(
                    "{} {:24} {:10} {:8} #{:<2} [{:>7.2}s] {}",
                    symbol,
                    truncate(&result.test_case.model, 24),
                    truncate(&result.test_case.user_type, 10),
                    result.test_case.think_mode_label(),
                    result.test_case.repetition,
                    result.response_time_secs,
                    truncate(&result.test_case.question, 40)
                );
                if let Some(error) = &result.error {
                    line.push_str(&format!("\n    {}", truncate(error, WIDTH - 4)));
                }
                line
            }
        }
    }

    /// Format one execution record
    pub fn format_execution(&self, execution: &Execution) -> String {
        if let Some(json) = self.json(execution) {
            return json;
        }
        if self.format == OutputFormat::Summary {
            return execution.to_string();
        }

        let mut output = String::new();
        output.push_str(&format!("\n╔{}╗\n", "═".repeat(WIDTH - 2)));
        output.push_str(&boxed(&format!("Execution {}", execution.execution_id)));
        output.push_str(&format!("╠{}╣\n", "═".repeat(WIDTH - 2)));
        output.push_str(&boxed(&format!("Configuration: {}", execution.config_name)));
        output.push_str(&boxed(&format!(
            "Status:        {} {}",
            execution.status.symbol(),
            execution.status
        )));
        output.push_str(&boxed(&format!(
            "Mode:          {} ({} worker(s))",
            execution
                .execution_mode
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".to_string()),
            execution.worker_count
        )));
        output.push_str(&boxed(&format!(
            "Progress:      {}/{} ({:.1}%), {} ok, {} failed",
            execution.processed(),
            execution.total_tests,
            execution.progress_percent(),
            execution.completed_tests,
            execution.failed_tests
        )));
        output.push_str(&boxed(&format!(
            "Created:       {}",
            execution.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        )));
        if let Some(duration) = execution.duration_secs() {
            output.push_str(&boxed(&format!("Duration:      {duration:.1}s")));
        }
        if let Some(error) = &execution.error_message {
            output.push_str(&boxed(&format!("Error:         {error}")));
        }
        output.push_str(&format!("╚{}╝\n", "═".repeat(WIDTH - 2)));
        output
    }

    /// Format a list of executions
    pub fn format_executions(&self, executions: &[Execution]) -> String {
        if let Some(json) = self.json(executions) {
            return json;
        }
        if self.format == OutputFormat::Summary {
            return executions
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n");
        }

        let mut output = String::new();
        output.push_str("\n┌──────────────────────────────────────┬──────────────────┬──────────────┬─────────┐\n");
        output.push_str("│ Execution                            │ Configuration    │ Status       │ Done    │\n");
        output.push_str("├──────────────────────────────────────┼──────────────────┼──────────────┼─────────┤\n");
        for execution in executions {
            output.push_str(&format!(
                "│ {:36} │ {:16} │ {} │ {:>7} │\n",
                execution.execution_id,
                truncate(&execution.config_name, 16),
                self.status(execution.status, 12),
                format!("{}/{}", execution.processed(), execution.total_tests)
            ));
        }
        output.push_str("└──────────────────────────────────────┴──────────────────┴──────────────┴─────────┘\n");
        output
    }

    /// Format an execution summary
    pub fn format_summary(&self, summary: &ExecutionSummary) -> String {
        if let Some(json) = self.json(summary) {
            return json;
        }
        if self.format == OutputFormat::Summary {
            return format!(
                "{}: {}/{} reported, {} ok ({}), shortfall {}",
                summary.execution_id,
                summary.reported,
                summary.expected,
                summary.successes,
                self.rate(summary.success_rate).trim(),
                summary.shortfall
            );
        }

        let mut output = String::new();
        output.push_str(&format!("\n{}\n", "═".repeat(WIDTH)));
        output.push_str(&format!(" Results: {}\n", summary.execution_id));
        output.push_str(&format!("{}\n", "═".repeat(WIDTH)));
        output.push_str(&format!(
            " Reported: {}/{} | Success: {} | Failed: {} | Rate: {}\n",
            summary.reported,
            summary.expected,
            summary.successes,
            summary.failures,
            self.rate(summary.success_rate)
        ));
        if let Some(avg) = summary.avg_response_secs {
            output.push_str(&format!(
                " Response time: avg {:.2}s, min {:.2}s, max {:.2}s\n",
                avg,
                summary.min_response_secs.unwrap_or(avg),
                summary.max_response_secs.unwrap_or(avg)
            ));
        }
        if summary.has_shortfall() {
            output.push_str(&format!(
                " {}\n",
                self.paint(
                    &format!("Shortfall: {} planned test cases without a result", summary.shortfall),
                    "33"
                )
            ));
        }

        for (title, groups) in [
            ("By model", &summary.by_model),
            ("By user type", &summary.by_user_type),
            ("By think mode", &summary.by_think_mode),
        ] {
            output.push_str(&format!("\n {title}:\n"));
            output.push_str(&format!(" {}\n", "─".repeat(WIDTH - 2)));
            for (name, stats) in groups {
                output.push_str(&self.group_line(name, stats));
            }
        }

        if !summary.errors.is_empty() {
            output.push_str("\n Errors:\n");
            for (kind, count) in &summary.errors {
                output.push_str(&format!("   {kind:20} {count}\n"));
            }
        }

        if !summary.recommendations.is_empty() {
            output.push_str("\n Recommendations:\n");
            for recommendation in &summary.recommendations {
                output.push_str(&format!("   - {recommendation}\n"));
            }
        }
        output
    }

    fn group_line(&self, name: &str, stats: &GroupStats) -> String {
        let filled = ((stats.success_rate * 20.0).round() as usize).min(20);
        let avg = stats
            .avg_response_secs
            .map(|a| format!("{a:6.2}s"))
            .unwrap_or_else(|| "     -".to_string());
        format!(
            " {:28} {}{} {} {:>4} tests avg {}\n",
            truncate(name, 28),
            "█".repeat(filled),
            "░".repeat(20 - filled),
            self.rate(stats.success_rate),
            stats.count,
            avg
        )
    }

    /// Format a workload plan
    pub fn format_plan(&self, plan: &Plan) -> String {
        #[derive(Serialize)]
        struct PlanJson<'a> {
            config_name: &'a str,
            total_tests: usize,
            estimated_minutes: f64,
            mode: String,
            batch_sizes: Vec<usize>,
        }

        let json = PlanJson {
            config_name: &plan.config_name,
            total_tests: plan.total_tests(),
            estimated_minutes: plan.estimated_minutes(),
            mode: plan.mode.to_string(),
            batch_sizes: plan.batches.iter().map(|b| b.len()).collect(),
        };
        if let Some(json) = self.json(&json) {
            return json;
        }

        let mut output = format!(
            "Plan for '{}': {} tests, ~{:.1} min, mode {}\n",
            plan.config_name,
            plan.total_tests(),
            plan.estimated_minutes(),
            plan.mode
        );
        if self.format == OutputFormat::Table {
            for batch in &plan.batches {
                output.push_str(&format!(
                    "  {:10} worker {:2}: {} cases\n",
                    batch.batch_id,
                    batch.worker_index,
                    batch.len()
                ));
            }
        }
        output
    }

    /// Format one configuration
    pub fn format_configuration(&self, config: &TestConfiguration) -> String {
        if let Some(json) = self.json(config) {
            return json;
        }

        let mut output = format!("{} ({})\n", config.name, config.kind);
        if !config.description.is_empty() {
            output.push_str(&format!("  {}\n", config.description));
        }
        output.push_str(&format!("  Models:      {}\n", config.models.join(", ")));
        output.push_str(&format!("  User types:  {}\n", config.user_types.join(", ")));
        output.push_str(&format!(
            "  Think mode:  {}\n",
            config
                .think_mode_options
                .iter()
                .map(|t| crate::models::think_mode_label(*t))
                .collect::<Vec<_>>()
                .join(", ")
        ));
        output.push_str(&format!(
            "  Questions:   {} x {} repetition(s)\n",
            config.questions.len(),
            config.questions_per_combination
        ));
        output.push_str(&format!(
            "  Delay:       {:.1}s{}\n",
            config.delay_between_tests_secs,
            if config.randomize_order { ", randomized" } else { "" }
        ));
        if self.format == OutputFormat::Table {
            for (i, question) in config.questions.iter().enumerate() {
                output.push_str(&format!("    {:2}. {}\n", i + 1, question));
            }
        }
        output
    }

    /// Format a list of configurations
    pub fn format_configurations(&self, configs: &[TestConfiguration]) -> String {
        if let Some(json) = self.json(configs) {
            return json;
        }

        let mut output = String::new();
        output.push_str(&format!(
            "{:32} {:24} {:>7} {:>6}\n",
            "NAME", "KIND", "MODELS", "TESTS"
        ));
        for config in configs {
            let tests = config
                .test_cases()
                .map(|c| c.len().to_string())
                .unwrap_or_else(|_| "invalid".to_string());
            output.push_str(&format!(
                "{:32} {:24} {:>7} {:>6}\n",
                truncate(&config.name, 32),
                config.kind,
                config.models.len(),
                tests
            ));
        }
        output
    }

    /// Format the progress log of an execution, one event per line
    pub fn format_events(&self, events: &[ProgressEvent]) -> String {
        if let Some(json) = self.json(events) {
            return json;
        }

        let mut output = String::new();
        for event in events {
            let line = event.to_string();
            let line = match event.kind {
                EventKind::CaseFailed | EventKind::BatchLost => self.paint(&line, "31"),
                EventKind::StopRequested => self.paint(&line, "33"),
                _ => line,
            };
            output.push_str(&line);
            output.push('\n');
        }
        output
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn boxed(line: &str) -> String {
    format!("║ {:<width$} ║\n", truncate(line, WIDTH - 4), width = WIDTH - 4)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
