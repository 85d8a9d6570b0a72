//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};

/// A/B performance test orchestrator for Graph-RAG chat services
#[derive(Parser, Debug)]
#[command(name = "abperf")]
#[command(version = "0.1.0")]
#[command(about = "Run A/B performance tests across models, user types and think modes")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Output format (table, json, json-pretty, summary)
    #[arg(short, long, global = true, default_value = "table")]
    pub format: String,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage test configurations
    Config(ConfigArgs),

    /// Show the execution plan of a configuration
    Plan(PlanArgs),

    /// Run a configuration
    Run(RunArgs),

    /// Inspect stored executions
    Executions(ExecutionsArgs),

    /// Summarize and export the results of an execution
    Results(ResultsArgs),

    /// Delete old executions
    Cleanup(CleanupArgs),

    /// Show environment configuration
    Env,
}

/// Arguments for configuration management
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// List stored configurations
    List,

    /// Show a configuration
    Show {
        /// Configuration name
        name: String,
    },

    /// Create a configuration from a built-in template
    Create {
        /// Template (model_comparison, think_mode_comparison, user_type_comparison,
        /// comprehensive, or a question category)
        template: String,

        /// Store under this name instead of the template name
        #[arg(short, long)]
        name: Option<String>,

        /// Override the delay between calls in seconds
        #[arg(long)]
        delay: Option<f64>,
    },

    /// Import a configuration from a JSON or YAML file
    Import {
        /// File to import
        file: String,

        /// Replace an existing configuration with the same name
        #[arg(long)]
        force: bool,
    },

    /// Delete a configuration
    Delete {
        /// Configuration name
        name: String,
    },

    /// Store every built-in template
    GenerateDefaults {
        /// Replace existing configurations
        #[arg(long)]
        force: bool,
    },

    /// List the model catalogue
    Models,

    /// Write an example configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "abperf.yaml")]
        output: String,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Arguments for the plan command
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Configuration name
    pub name: String,
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Configuration name
    pub name: String,

    /// Print progress events while running
    #[arg(short, long)]
    pub watch: bool,

    /// Export results to this file when the run ends (.json or .csv)
    #[arg(short, long)]
    pub export: Option<String>,
}

/// Arguments for execution inspection
#[derive(Parser, Debug)]
pub struct ExecutionsArgs {
    #[command(subcommand)]
    pub action: ExecutionsAction,
}

#[derive(Subcommand, Debug)]
pub enum ExecutionsAction {
    /// List recent executions
    List {
        /// Maximum number of executions
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one execution
    Show {
        /// Execution id
        id: String,
    },

    /// Delete an execution with its results and events
    Delete {
        /// Execution id
        id: String,
    },

    /// Show the progress log of an execution
    Events {
        /// Execution id
        id: String,
    },
}

/// Arguments for the results command
#[derive(Parser, Debug)]
pub struct ResultsArgs {
    /// Execution id
    pub id: String,

    /// Print every raw result
    #[arg(long)]
    pub raw: bool,

    /// Export to file (.json or .csv)
    #[arg(short, long)]
    pub export: Option<String>,

    /// Export format when the file extension is not enough (json, csv)
    #[arg(long)]
    pub export_format: Option<String>,
}

/// Arguments for the cleanup command
#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// Delete executions older than this many days
    #[arg(short, long, default_value = "30")]
    pub days: u32,
}
