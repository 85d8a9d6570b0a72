//! abperf - A/B performance testing for Graph-RAG chat services
//!
//! Runs a matrix of models, user types, think modes and questions against a
//! chat endpoint, records every call, and summarizes latency and success
//! rates per dimension.
//!
//! ## Features
//!
//! - Local mode for small matrices, parallel batches for large ones
//! - Retry with backoff for transient service errors
//! - SQLite or JSON document storage
//! - Built-in configuration templates
//! - Summaries with recommendations, JSON and CSV export
//!
//! ## Usage
//!
//! ```bash
//! # Store the built-in templates
//! abperf config generate-defaults
//!
//! # Inspect the plan of a configuration
//! abperf plan model_comparison
//!
//! # Run it and follow progress
//! abperf run model_comparison --watch
//!
//! # Summarize and export
//! abperf results <execution-id> --export results.csv
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

mod cli;
mod config;
mod executor;
mod http;
mod models;
mod output;
mod planner;
mod results;
mod storage;
mod utils;
mod workflow;

#[cfg(test)]
mod testing;

use cli::Args;
use config::{templates, AppConfig, ConfigFile, EnvConfig};
use executor::{CaseRunner, ExecutionEngine, ExecutionRegistry};
use http::GraphRagClient;
use models::TestConfiguration;
use output::{OutputFormat, ResultFormatter};
use planner::WorkloadPlanner;
use results::{export, ExportFormat, ResultAggregator};
use storage::PersistenceAdapter;
use utils::logger::{init_logger, LogLevel};
use workflow::LocalWorkflowExecutor;

/// Loaded settings plus the opened store, shared by every command
struct App {
    config: AppConfig,
    seeds: Vec<TestConfiguration>,
    store: Arc<dyn PersistenceAdapter>,
    formatter: ResultFormatter,
}

impl App {
    fn engine(&self) -> Result<Arc<ExecutionEngine>> {
        let service = Arc::new(GraphRagClient::new(&self.config.service_url)?);
        let registry = Arc::new(ExecutionRegistry::new(
            self.config.admission.max_concurrent,
            self.config.admission.policy,
        ));
        let runner = CaseRunner::new(
            service.clone(),
            self.store.clone(),
            self.config.worker.clone(),
        );
        let mut executor = LocalWorkflowExecutor::new(runner);
        if let Some(max_workers) = self.config.planner.max_workers {
            executor = executor.with_max_workers(max_workers);
        }
        let executor = Arc::new(executor);

        let engine = ExecutionEngine::new(self.store.clone(), service, executor, registry)
            .with_planner(WorkloadPlanner::new(self.config.planner.clone()))
            .with_settings(self.config.engine_settings());
        Ok(Arc::new(engine))
    }

    async fn configuration(&self, name: &str) -> Result<TestConfiguration> {
        self.store
            .get_configuration(name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Configuration not found: {name}"))
    }

    /// Store seed configurations from the config file that are not stored yet
    async fn seed_configurations(&self) -> Result<()> {
        for config in &self.seeds {
            if self.store.get_configuration(&config.name).await?.is_none() {
                self.store.save_configuration(config).await?;
                info!("Seeded configuration {}", config.name);
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env = EnvConfig::load();

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        env.log
            .as_deref()
            .and_then(LogLevel::from_str)
            .unwrap_or(LogLevel::Info)
    };
    init_logger(level);

    if let cli::Command::Env = args.command {
        env.print_summary();
        println!();
        config::env::print_env_help();
        return Ok(());
    }

    let config_path = args.config.clone().or_else(|| env.config_file.clone());
    let file = ConfigFile::load_or_default(config_path.as_deref().map(Path::new))?;
    let mut config = file.app;
    env.apply(&mut config)?;
    config.validate().context("Invalid configuration")?;

    let format = OutputFormat::from_str(&args.format)
        .ok_or_else(|| anyhow::anyhow!("Unknown output format: {}", args.format))?;
    let mut formatter = ResultFormatter::new(format);
    if args.no_color {
        formatter = formatter.no_color();
    }

    let store = storage::open_store(&config.storage)?;
    let app = App {
        config,
        seeds: file.configurations,
        store,
        formatter,
    };
    app.seed_configurations().await?;

    match args.command {
        cli::Command::Config(config_args) => manage_config(&app, config_args).await?,
        cli::Command::Plan(plan_args) => show_plan(&app, plan_args).await?,
        cli::Command::Run(run_args) => run_configuration(&app, run_args).await?,
        cli::Command::Executions(executions_args) => {
            manage_executions(&app, executions_args).await?
        }
        cli::Command::Results(results_args) => show_results(&app, results_args).await?,
        cli::Command::Cleanup(cleanup_args) => cleanup(&app, cleanup_args).await?,
        cli::Command::Env => {}
    }

    Ok(())
}

async fn manage_config(app: &App, args: cli::ConfigArgs) -> Result<()> {
    match args.action {
        cli::ConfigAction::List => {
            let configs = app.store.list_configurations().await?;
            if configs.is_empty() {
                println!("No configurations stored. Try `abperf config generate-defaults`.");
            } else {
                println!("{}", app.formatter.format_configurations(&configs));
            }
        }

        cli::ConfigAction::Show { name } => {
            let config = app.configuration(&name).await?;
            println!("{}", app.formatter.format_configuration(&config));
        }

        cli::ConfigAction::Create {
            template,
            name,
            delay,
        } => {
            let mut config = templates::by_name(&template, &mut rand::rng())
                .ok_or_else(|| anyhow::anyhow!("Unknown template: {template}"))?;
            if let Some(name) = name {
                config.name = name;
            }
            if let Some(delay) = delay {
                config.delay_between_tests_secs = delay;
            }
            config.validate()?;

            if app.store.get_configuration(&config.name).await?.is_some() {
                anyhow::bail!(
                    "Configuration already exists: {}. Delete it first or pick another --name.",
                    config.name
                );
            }
            app.store.save_configuration(&config).await?;
            println!("✓ Configuration created: {}", config.name);
        }

        cli::ConfigAction::Import { file, force } => {
            let config = TestConfiguration::load(&file)?;
            if !force && app.store.get_configuration(&config.name).await?.is_some() {
                anyhow::bail!(
                    "Configuration already exists: {}. Use --force to replace it.",
                    config.name
                );
            }
            app.store.save_configuration(&config).await?;
            println!("✓ Configuration imported: {} ({file})", config.name);
        }

        cli::ConfigAction::Delete { name } => {
            if app.store.delete_configuration(&name).await? {
                println!("✓ Configuration deleted: {name}");
            } else {
                anyhow::bail!("Configuration not found: {name}");
            }
        }

        cli::ConfigAction::GenerateDefaults { force } => {
            let mut created = 0;
            for config in templates::default_templates(&mut rand::rng()) {
                if !force && app.store.get_configuration(&config.name).await?.is_some() {
                    println!("  - {} (exists, skipped)", config.name);
                    continue;
                }
                let tests = config.test_cases()?.len();
                app.store.save_configuration(&config).await?;
                println!("  ✓ {} ({} tests)", config.name, tests);
                created += 1;
            }
            println!("\n{created} configuration(s) stored");
        }

        cli::ConfigAction::Models => {
            println!("{:24} {:24} THINK MODE", "ID", "NAME");
            for model in templates::MODEL_CATALOGUE {
                let think = if model.supports_think_mode { "yes" } else { "no" };
                println!("{:24} {:24} {}", model.id, model.name, think);
            }
        }

        cli::ConfigAction::Init { output, force } => {
            let path = Path::new(&output);
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {output}. Use --force to overwrite."
                );
            }

            ConfigFile::example().save(path)?;
            println!("✓ Configuration file created: {output}");
            println!("\nEdit the file to customize your settings.");
        }
    }

    Ok(())
}

async fn show_plan(app: &App, args: cli::PlanArgs) -> Result<()> {
    let config = app.configuration(&args.name).await?;
    let plan = WorkloadPlanner::new(app.config.planner.clone()).plan(&config)?;
    println!("{}", app.formatter.format_plan(&plan));
    Ok(())
}

async fn run_configuration(app: &App, args: cli::RunArgs) -> Result<()> {
    let engine = app.engine()?;

    let watcher = if args.watch {
        let mut events = engine.subscribe();
        Some(tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                eprintln!("{event}");
            }
        }))
    } else {
        None
    };

    let prepared = engine.prepare(&args.name).await?;
    let execution_id = prepared.execution_id().to_string();
    info!("Execution {} prepared for {}", execution_id, args.name);

    let run = engine.execute(prepared);
    tokio::pin!(run);

    let mut stopping = false;
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            signal = tokio::signal::ctrl_c(), if !stopping => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                warn!("Stopping execution {}", execution_id);
                stopping = true;
                engine.stop(&execution_id).await;
            }
        }
    };

    if let Some(watcher) = watcher {
        watcher.abort();
    }

    let execution = outcome?;
    println!("{}", app.formatter.format_execution(&execution));

    let summary = ResultAggregator::new(app.store.clone())
        .aggregate(&execution.execution_id)
        .await?;
    println!("{}", app.formatter.format_summary(&summary));

    if let Some(path) = args.export {
        let path = PathBuf::from(path);
        let format = export_format(&path, None)?;
        let results = app.store.list_test_results(&execution.execution_id).await?;
        export(&execution, &summary, &results, &path, format)?;
        println!("✓ Results exported to {}", path.display());
    }

    Ok(())
}

async fn manage_executions(app: &App, args: cli::ExecutionsArgs) -> Result<()> {
    match args.action {
        cli::ExecutionsAction::List { limit } => {
            let executions = app.store.list_executions(limit).await?;
            if executions.is_empty() {
                println!("No executions found.");
            } else {
                println!("{}", app.formatter.format_executions(&executions));
            }
        }

        cli::ExecutionsAction::Show { id } => {
            let execution = app
                .store
                .get_execution(&id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Execution not found: {id}"))?;
            println!("{}", app.formatter.format_execution(&execution));
        }

        cli::ExecutionsAction::Delete { id } => {
            if app.store.delete_execution(&id).await? {
                println!("✓ Execution deleted: {id}");
            } else {
                anyhow::bail!("Execution not found: {id}");
            }
        }

        cli::ExecutionsAction::Events { id } => {
            let events = app.store.list_events(&id).await?;
            if events.is_empty() {
                println!("No events recorded for {id}.");
            } else {
                print!("{}", app.formatter.format_events(&events));
            }
        }
    }

    Ok(())
}

async fn show_results(app: &App, args: cli::ResultsArgs) -> Result<()> {
    let execution = app
        .store
        .get_execution(&args.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Execution not found: {}", args.id))?;
    let summary = ResultAggregator::new(app.store.clone())
        .aggregate(&args.id)
        .await?;

    println!("{}", app.formatter.format_summary(&summary));

    if args.raw || args.export.is_some() {
        let results = app.store.list_test_results(&args.id).await?;

        if args.raw {
            for result in &results {
                println!("{}", app.formatter.format_result(result));
            }
        }

        if let Some(path) = args.export {
            let path = PathBuf::from(path);
            let format = export_format(&path, args.export_format.as_deref())?;
            export(&execution, &summary, &results, &path, format)?;
            println!("✓ Results exported to {}", path.display());
        }
    }

    Ok(())
}

async fn cleanup(app: &App, args: cli::CleanupArgs) -> Result<()> {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(args.days));
    let removed = app.store.cleanup_before(cutoff).await?;
    println!(
        "✓ Removed {removed} execution(s) created before {}",
        cutoff.format("%Y-%m-%d %H:%M")
    );
    Ok(())
}

fn export_format(path: &Path, explicit: Option<&str>) -> Result<ExportFormat> {
    match explicit {
        Some(name) => ExportFormat::from_str(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown export format: {name}")),
        None => ExportFormat::from_extension(path).ok_or_else(|| {
            anyhow::anyhow!(
                "Cannot infer export format from {}; use a .json or .csv extension",
                path.display()
            )
        }),
    }
}
