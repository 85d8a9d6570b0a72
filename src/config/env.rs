//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;
use std::path::PathBuf;

use super::AppConfig;
use crate::storage::StorageBackend;

/// Environment variable prefix
const ENV_PREFIX: &str = "ABPERF";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Target service from ABPERF_SERVICE_URL
    pub service_url: Option<String>,
    /// Per-call timeout in seconds from ABPERF_TIMEOUT
    pub timeout: Option<f64>,
    /// Local execution limit from ABPERF_MAX_CONCURRENT
    pub max_concurrent: Option<usize>,
    /// Storage backend from ABPERF_BACKEND
    pub backend: Option<String>,
    /// Data directory from ABPERF_DATA_DIR
    pub data_dir: Option<String>,
    /// Config file from ABPERF_CONFIG
    pub config_file: Option<String>,
    /// Log level from ABPERF_LOG
    pub log: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            service_url: get_env("SERVICE_URL"),
            timeout: get_env_parse("TIMEOUT"),
            max_concurrent: get_env_parse("MAX_CONCURRENT"),
            backend: get_env("BACKEND"),
            data_dir: get_env("DATA_DIR"),
            config_file: get_env("CONFIG"),
            log: get_env("LOG"),
        }
    }

    /// Override `config` with every variable that is set
    pub fn apply(&self, config: &mut AppConfig) -> anyhow::Result<()> {
        if let Some(url) = &self.service_url {
            config.service_url = url.clone();
        }
        if let Some(timeout) = self.timeout {
            config.worker.request_timeout_secs = timeout;
        }
        if let Some(max) = self.max_concurrent {
            config.admission.max_concurrent = max;
        }
        if let Some(backend) = &self.backend {
            config.storage.backend = StorageBackend::from_str(backend).ok_or_else(|| {
                anyhow::anyhow!("Unknown storage backend in {ENV_PREFIX}_BACKEND: {backend}")
            })?;
        }
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {}_SERVICE_URL:    {:?}", ENV_PREFIX, self.service_url);
        println!("  {}_TIMEOUT:        {:?}", ENV_PREFIX, self.timeout);
        println!("  {}_MAX_CONCURRENT: {:?}", ENV_PREFIX, self.max_concurrent);
        println!("  {}_BACKEND:        {:?}", ENV_PREFIX, self.backend);
        println!("  {}_DATA_DIR:       {:?}", ENV_PREFIX, self.data_dir);
        println!("  {}_CONFIG:         {:?}", ENV_PREFIX, self.config_file);
        println!("  {}_LOG:            {:?}", ENV_PREFIX, self.log);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Print all ABPERF environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_SERVICE_URL     Base URL of the service under test");
    println!("  {ENV_PREFIX}_TIMEOUT         Per-call timeout in seconds");
    println!("  {ENV_PREFIX}_MAX_CONCURRENT  Local executions allowed at once");
    println!("  {ENV_PREFIX}_BACKEND         Storage backend (sqlite, document)");
    println!("  {ENV_PREFIX}_DATA_DIR        Storage directory");
    println!("  {ENV_PREFIX}_CONFIG          Path to configuration file");
    println!("  {ENV_PREFIX}_LOG             Log level (error, warn, info, debug, trace)");
    println!("  RUST_LOG                Full tracing filter, overrides {ENV_PREFIX}_LOG");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_SERVICE_URL=http://localhost:8000");
    println!("  export {ENV_PREFIX}_BACKEND=document");
    println!("  abperf run model_comparison");
}
