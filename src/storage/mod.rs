//! Persistence backends
//!
//! Executions, raw test results, progress events and configurations are
//! stored through the `PersistenceAdapter` contract. Two interchangeable
//! backends exist: an embedded SQLite database and a directory of JSON
//! documents. The backend is picked once at startup.

mod document;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::models::{Execution, ProgressEvent, TestConfiguration, TestResult};

pub use document::DocumentStore;
pub use sqlite::SqliteStore;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Read/write contract shared by every backend
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Insert or replace an execution record
    async fn save_execution(&self, execution: &Execution) -> Result<(), StorageError>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, StorageError>;

    /// Most recent first
    async fn list_executions(&self, limit: usize) -> Result<Vec<Execution>, StorageError>;

    /// Update status, timing and counters of an existing execution.
    /// Stored counters never decrease.
    async fn update_execution_progress(&self, execution: &Execution) -> Result<(), StorageError>;

    /// Append a result. Returns false when a result with the same key
    /// already exists for the execution.
    async fn save_test_result(&self, result: &TestResult) -> Result<bool, StorageError>;

    /// Results in write order
    async fn list_test_results(&self, execution_id: &str) -> Result<Vec<TestResult>, StorageError>;

    async fn save_configuration(&self, config: &TestConfiguration) -> Result<(), StorageError>;

    async fn get_configuration(&self, name: &str)
        -> Result<Option<TestConfiguration>, StorageError>;

    /// Sorted by name
    async fn list_configurations(&self) -> Result<Vec<TestConfiguration>, StorageError>;

    async fn delete_configuration(&self, name: &str) -> Result<bool, StorageError>;

    /// Delete an execution with its results and events
    async fn delete_execution(&self, execution_id: &str) -> Result<bool, StorageError>;

    async fn save_event(&self, event: &ProgressEvent) -> Result<(), StorageError>;

    async fn list_events(&self, execution_id: &str) -> Result<Vec<ProgressEvent>, StorageError>;

    /// Delete executions created before `cutoff`, returning how many were removed
    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;
}

/// Available backends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Document,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Sqlite => "sqlite",
            StorageBackend::Document => "document",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" | "sql" => Some(StorageBackend::Sqlite),
            "document" | "documents" | "json" => Some(StorageBackend::Document),
            _ => None,
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: default_data_dir(),
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("abperf")
}

/// Open the configured backend
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn PersistenceAdapter>, StorageError> {
    std::fs::create_dir_all(&config.data_dir)?;

    let store: Arc<dyn PersistenceAdapter> = match config.backend {
        StorageBackend::Sqlite => Arc::new(SqliteStore::open(config.data_dir.join("abperf.db"))?),
        StorageBackend::Document => Arc::new(DocumentStore::open(config.data_dir.join("documents"))?),
    };

    info!(
        "Using {} storage in {}",
        store.backend_name(),
        config.data_dir.display()
    );
    Ok(store)
}

/// Reject keys that are unsafe as file names or ids
fn check_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ErrorKind, EventKind, ExecutionMode, ExecutionStatus, TestCase,
    };
    use crate::testing::twelve_case_config;
    use chrono::Duration;

    fn result_for(execution_id: &str, case: TestCase, success: bool) -> TestResult {
        if success {
            TestResult::success(execution_id, case, 1.25, 300)
        } else {
            TestResult::failure(execution_id, case, 60.0, ErrorKind::Timeout, "timed out")
        }
    }

    /// Exercise the full contract against one backend
    async fn exercise_contract(store: &dyn PersistenceAdapter) {
        // configurations
        let config = twelve_case_config("contract");
        store.save_configuration(&config).await.unwrap();
        store
            .save_configuration(&twelve_case_config("another"))
            .await
            .unwrap();
        let loaded = store.get_configuration("contract").await.unwrap().unwrap();
        assert_eq!(loaded.models, config.models);
        let names: Vec<String> = store
            .list_configurations()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["another", "contract"]);
        assert!(store.delete_configuration("another").await.unwrap());
        assert!(!store.delete_configuration("another").await.unwrap());
        assert!(store.get_configuration("another").await.unwrap().is_none());

        // executions
        let mut exec = Execution::new("contract").with_plan(12, ExecutionMode::Local, 1);
        store.save_execution(&exec).await.unwrap();
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.record_counts(2, 1).unwrap();
        store.update_execution_progress(&exec).await.unwrap();

        let stored = store.get_execution(&exec.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);
        assert_eq!(stored.completed_tests, 2);
        assert_eq!(stored.failed_tests, 1);
        assert_eq!(stored.execution_mode, Some(ExecutionMode::Local));
        assert!(stored.start_time.is_some());

        // stored counters never go backwards
        let mut stale = exec.clone();
        stale.completed_tests = 0;
        store.update_execution_progress(&stale).await.unwrap();
        let stored = store.get_execution(&exec.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.completed_tests, 2);

        let missing = Execution::new("contract");
        assert!(matches!(
            store.update_execution_progress(&missing).await,
            Err(StorageError::NotFound { .. })
        ));

        // results: write order kept, duplicates ignored
        let cases = config.test_cases().unwrap();
        for (i, case) in cases.iter().take(3).enumerate() {
            let saved = store
                .save_test_result(&result_for(&exec.execution_id, case.clone(), i != 1))
                .await
                .unwrap();
            assert!(saved);
        }
        let duplicate = result_for(&exec.execution_id, cases[0].clone(), false);
        assert!(!store.save_test_result(&duplicate).await.unwrap());

        let results = store.list_test_results(&exec.execution_id).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].test_case, cases[0]);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(results[1].error_kind, Some(ErrorKind::Timeout));
        assert_eq!(results[2].test_case, cases[2]);

        // events
        store
            .save_event(&ProgressEvent::new(
                &exec.execution_id,
                EventKind::ExecutionStarted,
                "started",
            ))
            .await
            .unwrap();
        store
            .save_event(
                &ProgressEvent::new(&exec.execution_id, EventKind::BatchCompleted, "done")
                    .with_worker(2),
            )
            .await
            .unwrap();
        let events = store.list_events(&exec.execution_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].worker_index, Some(2));

        // listing, newest first
        let mut newer = Execution::new("contract");
        newer.created_at = exec.created_at + Duration::seconds(5);
        store.save_execution(&newer).await.unwrap();
        let listed = store.list_executions(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].execution_id, newer.execution_id);
        assert_eq!(store.list_executions(1).await.unwrap().len(), 1);

        // cleanup removes old executions with their results
        let mut old = Execution::new("contract");
        old.created_at = Utc::now() - Duration::days(45);
        store.save_execution(&old).await.unwrap();
        store
            .save_test_result(&result_for(&old.execution_id, cases[0].clone(), true))
            .await
            .unwrap();
        let removed = store
            .cleanup_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_execution(&old.execution_id).await.unwrap().is_none());
        assert!(store.list_test_results(&old.execution_id).await.unwrap().is_empty());

        // delete
        assert!(store.delete_execution(&exec.execution_id).await.unwrap());
        assert!(store.get_execution(&exec.execution_id).await.unwrap().is_none());
        assert!(store.list_test_results(&exec.execution_id).await.unwrap().is_empty());
        assert!(store.list_events(&exec.execution_id).await.unwrap().is_empty());
        assert!(!store.delete_execution(&exec.execution_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).unwrap();
        exercise_contract(&store).await;
    }

    #[tokio::test]
    async fn test_document_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path().join("docs")).unwrap();
        exercise_contract(&store).await;
    }

    #[tokio::test]
    async fn test_open_store_by_backend() {
        let dir = tempfile::tempdir().unwrap();
        for backend in [StorageBackend::Sqlite, StorageBackend::Document] {
            let config = StorageConfig {
                backend,
                data_dir: dir.path().to_path_buf(),
            };
            let store = open_store(&config).unwrap();
            assert_eq!(store.backend_name(), backend.as_str());
        }
    }

    #[test]
    fn test_check_key() {
        assert!(check_key("3f2a1c9e-7b7d-4c1e-9d7e-1a2b3c4d5e6f").is_ok());
        assert!(check_key("model_comparison").is_ok());
        assert!(check_key("../secret").is_err());
        assert!(check_key("a/b").is_err());
        assert!(check_key("").is_err());
    }
}
