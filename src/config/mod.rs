//! Configuration module
//!
//! Application settings, the configuration file, environment overrides and
//! the built-in test configuration templates.

pub mod env;
pub mod file;
pub mod templates;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::executor::{AdmissionPolicy, DispatchSettings, EngineSettings, WorkerSettings};
use crate::planner::PlannerSettings;
use crate::storage::StorageConfig;

pub use env::EnvConfig;
pub use file::ConfigFile;

/// Concurrency gate for local executions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Local executions allowed to run at once
    pub max_concurrent: usize,
    pub policy: AdmissionPolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            policy: AdmissionPolicy::Queue,
        }
    }
}

/// Application configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base URL of the service under test
    pub service_url: String,

    /// Per-call timeout and retry policy
    pub worker: WorkerSettings,

    /// Planner ceilings
    pub planner: PlannerSettings,

    /// Parallel dispatch time limits
    pub dispatch: DispatchSettings,

    pub admission: AdmissionConfig,

    pub storage: StorageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:8000".to_string(),
            worker: WorkerSettings::default(),
            planner: PlannerSettings::default(),
            dispatch: DispatchSettings::default(),
            admission: AdmissionConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reject settings that cannot work together
    pub fn validate(&self) -> Result<()> {
        if self.service_url.trim().is_empty() {
            anyhow::bail!("service_url must not be empty");
        }
        if !(self.worker.request_timeout_secs.is_finite() && self.worker.request_timeout_secs > 0.0)
        {
            anyhow::bail!(
                "worker.request_timeout_secs must be positive (got {})",
                self.worker.request_timeout_secs
            );
        }

        self.dispatch.validate()?;

        if self.planner.batch_ceiling_secs as f64 > self.dispatch.batch_timeout_secs {
            anyhow::bail!(
                "planner.batch_ceiling_secs ({}) exceeds dispatch.batch_timeout_secs ({})",
                self.planner.batch_ceiling_secs,
                self.dispatch.batch_timeout_secs
            );
        }
        if self.planner.per_request_budget_secs == 0 {
            anyhow::bail!("planner.per_request_budget_secs must be positive");
        }
        if self.planner.max_workers == Some(0) {
            anyhow::bail!("planner.max_workers must be positive when set");
        }
        if self.admission.max_concurrent == 0 {
            anyhow::bail!("admission.max_concurrent must be positive");
        }

        Ok(())
    }

    /// Engine settings derived from this configuration
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            worker: self.worker.clone(),
            dispatch: self.dispatch.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.service_url, "http://localhost:8000");
        assert_eq!(config.admission.max_concurrent, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_timeout_must_stay_below_platform_limit() {
        let mut config = AppConfig::default();
        config.dispatch.batch_timeout_secs = config.dispatch.platform_limit_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batch_ceiling_above_timeout_rejected() {
        let mut config = AppConfig::default();
        config.planner.batch_ceiling_secs = 3500;
        config.dispatch.max_wait_secs = 3500.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_ceiling_secs"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = AppConfig::default();
        config.admission.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: AppConfig = serde_yaml::from_str(
            "service_url: http://rag.internal:9000\nadmission:\n  policy: reject\n",
        )
        .unwrap();
        assert_eq!(config.service_url, "http://rag.internal:9000");
        assert_eq!(config.admission.policy, AdmissionPolicy::Reject);
        assert_eq!(config.admission.max_concurrent, 2);
        assert_eq!(config.planner, PlannerSettings::default());
        assert!(config.validate().is_ok());
    }
}
