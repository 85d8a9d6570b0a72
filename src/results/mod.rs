//! Result analysis
//!
//! Summaries, recommendations and export of stored test results.

mod aggregator;
mod recommendations;
mod report;

pub use aggregator::{summarize, ExecutionSummary, GroupStats, ResultAggregator};
pub use recommendations::DefaultRecommendations;
pub use report::{export, ExportFormat};
