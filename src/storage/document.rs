//! JSON document backend
//!
//! Layout under the base directory:
//!
//! ```text
//! configurations/<name>.json
//! executions/<execution_id>.json
//! results/<execution_id>.jsonl
//! events/<execution_id>.jsonl
//! ```
//!
//! Results and events are append-only JSON lines. File access runs on the
//! blocking pool behind a single lock, which also guards the per-execution
//! set of known result keys.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::{check_key, PersistenceAdapter, StorageError};
use crate::models::{Execution, ProgressEvent, TestConfiguration, TestResult};

const CONFIGURATIONS: &str = "configurations";
const EXECUTIONS: &str = "executions";
const RESULTS: &str = "results";
const EVENTS: &str = "events";

/// Document storage in a directory tree
pub struct DocumentStore {
    inner: Arc<Mutex<Documents>>,
}

struct Documents {
    base_dir: PathBuf,
    /// Result keys already written, per execution
    known_keys: HashMap<String, HashSet<String>>,
}

impl DocumentStore {
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        for collection in [CONFIGURATIONS, EXECUTIONS, RESULTS, EVENTS] {
            fs::create_dir_all(base_dir.join(collection))?;
        }
        debug!("Opened document store at {}", base_dir.display());

        Ok(Self {
            inner: Arc::new(Mutex::new(Documents {
                base_dir,
                known_keys: HashMap::new(),
            })),
        })
    }

    /// Run `f` against the document tree on the blocking pool
    async fn with_docs<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Documents) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| StorageError::Task("document store mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

impl Documents {
    fn document_path(&self, collection: &str, id: &str, ext: &str) -> Result<PathBuf, StorageError> {
        check_key(id)?;
        Ok(self.base_dir.join(collection).join(format!("{id}.{ext}")))
    }

    fn execution_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        self.document_path(EXECUTIONS, id, "json")
    }

    fn configuration_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        self.document_path(CONFIGURATIONS, name, "json")
    }

    fn results_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        self.document_path(RESULTS, id, "jsonl")
    }

    fn events_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        self.document_path(EVENTS, id, "jsonl")
    }

    fn list_documents<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>, StorageError> {
        let dir = self.base_dir.join(collection);
        let mut docs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match read_document(&path) {
                    Ok(doc) => docs.push(doc),
                    Err(e) => warn!("Skipping unreadable document {}: {}", path.display(), e),
                }
            }
        }
        Ok(docs)
    }

    fn remove_execution_files(&mut self, execution_id: &str) -> Result<bool, StorageError> {
        self.known_keys.remove(execution_id);
        let existed = remove_if_exists(&self.execution_path(execution_id)?)?;
        remove_if_exists(&self.results_path(execution_id)?)?;
        remove_if_exists(&self.events_path(execution_id)?)?;
        Ok(existed)
    }

    /// Append `result` unless its key is already stored. The key is only
    /// remembered once the line is on disk.
    fn append_result(&mut self, result: &TestResult) -> Result<bool, StorageError> {
        let path = self.results_path(&result.execution_id)?;

        if !self.known_keys.contains_key(&result.execution_id) {
            let existing: Vec<TestResult> = read_lines(&path)?;
            self.known_keys.insert(
                result.execution_id.clone(),
                existing.iter().map(|r| r.result_key()).collect(),
            );
        }

        let key = result.result_key();
        if self
            .known_keys
            .get(&result.execution_id)
            .is_some_and(|keys| keys.contains(&key))
        {
            debug!("Ignoring duplicate result for {}", result.test_case);
            return Ok(false);
        }

        append_line(&path, result)?;
        self.known_keys
            .entry(result.execution_id.clone())
            .or_default()
            .insert(key);
        Ok(true)
    }
}

/// Write to a temporary file, then rename over the target
fn write_document<T: Serialize>(path: &Path, doc: &T) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, doc)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    if path.exists() {
        read_document(path).map(Some)
    } else {
        Ok(None)
    }
}

fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<(), StorageError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, record)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl PersistenceAdapter for DocumentStore {
    fn backend_name(&self) -> &'static str {
        "document"
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), StorageError> {
        let execution = execution.clone();
        self.with_docs(move |docs| {
            write_document(&docs.execution_path(&execution.execution_id)?, &execution)
        })
        .await
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, StorageError> {
        let id = execution_id.to_string();
        self.with_docs(move |docs| read_optional(&docs.execution_path(&id)?))
            .await
    }

    async fn list_executions(&self, limit: usize) -> Result<Vec<Execution>, StorageError> {
        self.with_docs(move |docs| {
            let mut executions: Vec<Execution> = docs.list_documents(EXECUTIONS)?;
            executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            executions.truncate(limit);
            Ok(executions)
        })
        .await
    }

    async fn update_execution_progress(&self, execution: &Execution) -> Result<(), StorageError> {
        let execution = execution.clone();
        self.with_docs(move |docs| {
            let path = docs.execution_path(&execution.execution_id)?;
            let stored: Execution = read_optional(&path)?.ok_or_else(|| StorageError::NotFound {
                kind: "Execution",
                id: execution.execution_id.clone(),
            })?;

            let mut updated = execution;
            updated.created_at = stored.created_at;
            updated.config_name = stored.config_name;
            updated.completed_tests = updated.completed_tests.max(stored.completed_tests);
            updated.failed_tests = updated.failed_tests.max(stored.failed_tests);
            write_document(&path, &updated)
        })
        .await
    }

    async fn save_test_result(&self, result: &TestResult) -> Result<bool, StorageError> {
        let result = result.clone();
        self.with_docs(move |docs| docs.append_result(&result)).await
    }

    async fn list_test_results(&self, execution_id: &str) -> Result<Vec<TestResult>, StorageError> {
        let id = execution_id.to_string();
        self.with_docs(move |docs| read_lines(&docs.results_path(&id)?))
            .await
    }

    async fn save_configuration(&self, config: &TestConfiguration) -> Result<(), StorageError> {
        let config = config.clone();
        self.with_docs(move |docs| write_document(&docs.configuration_path(&config.name)?, &config))
            .await
    }

    async fn get_configuration(
        &self,
        name: &str,
    ) -> Result<Option<TestConfiguration>, StorageError> {
        let name = name.to_string();
        self.with_docs(move |docs| read_optional(&docs.configuration_path(&name)?))
            .await
    }

    async fn list_configurations(&self) -> Result<Vec<TestConfiguration>, StorageError> {
        self.with_docs(|docs| {
            let mut configs: Vec<TestConfiguration> = docs.list_documents(CONFIGURATIONS)?;
            configs.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(configs)
        })
        .await
    }

    async fn delete_configuration(&self, name: &str) -> Result<bool, StorageError> {
        let name = name.to_string();
        self.with_docs(move |docs| remove_if_exists(&docs.configuration_path(&name)?))
            .await
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<bool, StorageError> {
        let id = execution_id.to_string();
        self.with_docs(move |docs| docs.remove_execution_files(&id))
            .await
    }

    async fn save_event(&self, event: &ProgressEvent) -> Result<(), StorageError> {
        let event = event.clone();
        self.with_docs(move |docs| append_line(&docs.events_path(&event.execution_id)?, &event))
            .await
    }

    async fn list_events(&self, execution_id: &str) -> Result<Vec<ProgressEvent>, StorageError> {
        let id = execution_id.to_string();
        self.with_docs(move |docs| read_lines(&docs.events_path(&id)?))
            .await
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        self.with_docs(move |docs| {
            let executions: Vec<Execution> = docs.list_documents(EXECUTIONS)?;
            let mut removed = 0;
            for execution in executions.iter().filter(|e| e.created_at < cutoff) {
                if docs.remove_execution_files(&execution.execution_id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_case;

    #[tokio::test]
    async fn test_duplicates_ignored_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let result = TestResult::success("exec-1", sample_case(), 0.8, 10);

        let store = DocumentStore::open(dir.path()).unwrap();
        assert!(store.save_test_result(&result).await.unwrap());

        // a fresh instance rebuilds its key set from disk
        let reopened = DocumentStore::open(dir.path()).unwrap();
        assert!(!reopened.save_test_result(&result).await.unwrap());
        assert_eq!(reopened.list_test_results("exec-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_append_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let cases = crate::testing::twelve_case_config("retry").test_cases().unwrap();
        let first = TestResult::success("exec-2", cases[0].clone(), 1.0, 10);
        let second = TestResult::success("exec-2", cases[1].clone(), 1.0, 10);
        assert!(store.save_test_result(&first).await.unwrap());

        // make the results file unwritable
        let path = dir.path().join(RESULTS).join("exec-2.jsonl");
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        assert!(store.save_test_result(&second).await.is_err());

        fs::remove_dir(&path).unwrap();
        assert!(store.save_test_result(&second).await.unwrap());

        let stored = store.list_test_results("exec-2").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].result_key(), second.result_key());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get_execution("../../etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_documents_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(EXECUTIONS).join("broken.json"), "{not json").unwrap();
        store.save_execution(&Execution::new("cfg")).await.unwrap();

        assert_eq!(store.list_executions(10).await.unwrap().len(), 1);
    }
}
