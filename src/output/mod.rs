//! Output formatting module
//!
//! Terminal and JSON renderings for executions, plans and summaries.

mod formatter;

pub use formatter::{OutputFormat, ResultFormatter};
