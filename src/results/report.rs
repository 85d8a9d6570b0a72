//! Result export
//!
//! Writes an execution's summary and raw results to JSON, or its raw results
//! to CSV with one row per test case.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

use super::aggregator::ExecutionSummary;
use crate::models::{Execution, TestResult};

/// Export format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_str)
    }
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    execution: &'a Execution,
    summary: &'a ExecutionSummary,
    results: &'a [TestResult],
}

/// Write `results` (and, for JSON, the execution and summary) to `path`
pub fn export(
    execution: &Execution,
    summary: &ExecutionSummary,
    results: &[TestResult],
    path: &Path,
    format: ExportFormat,
) -> Result<()> {
    match format {
        ExportFormat::Json => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let document = ExportDocument {
                execution,
                summary,
                results,
            };
            serde_json::to_writer_pretty(BufWriter::new(file), &document)?;
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_path(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;

            writer.write_record([
                "execution_id",
                "batch_id",
                "model",
                "user_type",
                "think_mode",
                "question",
                "repetition",
                "success",
                "response_time_secs",
                "response_chars",
                "attempts",
                "error_kind",
                "error",
                "timestamp",
            ])?;

            for result in results {
                let case = &result.test_case;
                writer.write_record([
                    result.execution_id.clone(),
                    result.batch_id.clone().unwrap_or_default(),
                    case.model.clone(),
                    case.user_type.clone(),
                    case.think_mode.to_string(),
                    case.question.clone(),
                    case.repetition.to_string(),
                    result.success.to_string(),
                    format!("{:.3}", result.response_time_secs),
                    result.response_chars.to_string(),
                    result.attempts.to_string(),
                    result
                        .error_kind
                        .map(|k| k.as_str().to_string())
                        .unwrap_or_default(),
                    result.error.clone().unwrap_or_default(),
                    result.timestamp.to_rfc3339(),
                ])?;
            }
            writer.flush()?;
        }
    }

    info!(
        "Exported {} results of {} to {}",
        results.len(),
        execution.execution_id,
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorKind;
    use crate::results::{summarize, DefaultRecommendations};
    use crate::testing::twelve_case_config;

    fn fixture() -> (Execution, Vec<TestResult>) {
        let execution = Execution::new("export");
        let cases = twelve_case_config("export").test_cases().unwrap();
        let results = vec![
            TestResult::success(&execution.execution_id, cases[0].clone(), 1.25, 300),
            TestResult::failure(
                &execution.execution_id,
                cases[1].clone(),
                0.1,
                ErrorKind::MalformedResponse,
                "missing \"response\", field",
            ),
        ];
        (execution, results)
    }

    #[test]
    fn test_export_format() {
        assert_eq!(ExportFormat::from_str("JSON"), Some(ExportFormat::Json));
        assert_eq!(
            ExportFormat::from_extension(Path::new("out/results.csv")),
            Some(ExportFormat::Csv)
        );
        assert!(ExportFormat::from_str("xml").is_none());
    }

    #[test]
    fn test_csv_export_quotes_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let (execution, results) = fixture();
        let summary = summarize(&execution.execution_id, 12, &results, &DefaultRecommendations);

        export(&execution, &summary, &results, &path, ExportFormat::Csv).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][7], "true");
        assert_eq!(&rows[1][11], "malformed_response");
        assert_eq!(&rows[1][12], "missing \"response\", field");
    }

    #[test]
    fn test_json_export_contains_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let (execution, results) = fixture();
        let summary = summarize(&execution.execution_id, 12, &results, &DefaultRecommendations);

        export(&execution, &summary, &results, &path, ExportFormat::Json).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["summary"]["shortfall"], 10);
        assert_eq!(value["results"].as_array().unwrap().len(), 2);
        assert_eq!(value["execution"]["config_name"], "export");
    }
}
