//! Embedded SQLite backend

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{check_key, PersistenceAdapter, StorageError};
use crate::models::{
    ErrorKind, EventKind, Execution, ExecutionMode, ExecutionStatus, ProgressEvent, TestCase,
    TestConfiguration, TestResult,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS executions (
    execution_id TEXT PRIMARY KEY,
    config_name TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    start_time TEXT,
    end_time TEXT,
    total_tests INTEGER NOT NULL DEFAULT 0,
    completed_tests INTEGER NOT NULL DEFAULT 0,
    failed_tests INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    execution_mode TEXT,
    worker_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_executions_created ON executions(created_at);

CREATE TABLE IF NOT EXISTS test_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT NOT NULL,
    result_key TEXT NOT NULL,
    batch_id TEXT,
    model TEXT NOT NULL,
    user_type TEXT NOT NULL,
    think_mode INTEGER NOT NULL,
    question TEXT NOT NULL,
    repetition INTEGER NOT NULL,
    success INTEGER NOT NULL,
    response_time REAL NOT NULL,
    error TEXT,
    error_kind TEXT,
    attempts INTEGER NOT NULL,
    response_chars INTEGER NOT NULL,
    metadata TEXT,
    timestamp TEXT NOT NULL,
    UNIQUE(execution_id, result_key)
);

CREATE TABLE IF NOT EXISTS progress_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL,
    worker_index INTEGER,
    message TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_execution ON progress_events(execution_id);

CREATE TABLE IF NOT EXISTS configurations (
    name TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

/// SQLite storage behind a single shared connection
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened SQLite store at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Task("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    s.as_deref().map(parse_ts).transpose()
}

/// Raw execution row, converted outside the rusqlite closure
struct ExecutionRow {
    execution_id: String,
    config_name: String,
    status: String,
    created_at: String,
    start_time: Option<String>,
    end_time: Option<String>,
    total_tests: i64,
    completed_tests: i64,
    failed_tests: i64,
    error_message: Option<String>,
    execution_mode: Option<String>,
    worker_count: i64,
}

const EXECUTION_COLUMNS: &str = "execution_id, config_name, status, created_at, start_time, \
    end_time, total_tests, completed_tests, failed_tests, error_message, execution_mode, worker_count";

impl ExecutionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            execution_id: row.get(0)?,
            config_name: row.get(1)?,
            status: row.get(2)?,
            created_at: row.get(3)?,
            start_time: row.get(4)?,
            end_time: row.get(5)?,
            total_tests: row.get(6)?,
            completed_tests: row.get(7)?,
            failed_tests: row.get(8)?,
            error_message: row.get(9)?,
            execution_mode: row.get(10)?,
            worker_count: row.get(11)?,
        })
    }

    fn into_execution(self) -> Result<Execution, StorageError> {
        let status = ExecutionStatus::from_str(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("status '{}'", self.status)))?;
        let execution_mode = match self.execution_mode {
            Some(mode) => Some(
                ExecutionMode::from_str(&mode)
                    .ok_or_else(|| StorageError::Corrupt(format!("execution mode '{mode}'")))?,
            ),
            None => None,
        };

        Ok(Execution {
            execution_id: self.execution_id,
            config_name: self.config_name,
            status,
            created_at: parse_ts(&self.created_at)?,
            start_time: parse_opt_ts(self.start_time)?,
            end_time: parse_opt_ts(self.end_time)?,
            total_tests: self.total_tests.max(0) as usize,
            completed_tests: self.completed_tests.max(0) as usize,
            failed_tests: self.failed_tests.max(0) as usize,
            error_message: self.error_message,
            execution_mode,
            worker_count: self.worker_count.max(0) as usize,
        })
    }
}

struct ResultRow {
    execution_id: String,
    batch_id: Option<String>,
    model: String,
    user_type: String,
    think_mode: bool,
    question: String,
    repetition: i64,
    success: bool,
    response_time: f64,
    error: Option<String>,
    error_kind: Option<String>,
    attempts: i64,
    response_chars: i64,
    metadata: Option<String>,
    timestamp: String,
}

impl ResultRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            execution_id: row.get(0)?,
            batch_id: row.get(1)?,
            model: row.get(2)?,
            user_type: row.get(3)?,
            think_mode: row.get(4)?,
            question: row.get(5)?,
            repetition: row.get(6)?,
            success: row.get(7)?,
            response_time: row.get(8)?,
            error: row.get(9)?,
            error_kind: row.get(10)?,
            attempts: row.get(11)?,
            response_chars: row.get(12)?,
            metadata: row.get(13)?,
            timestamp: row.get(14)?,
        })
    }

    fn into_result(self) -> Result<TestResult, StorageError> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(TestResult {
            execution_id: self.execution_id,
            batch_id: self.batch_id,
            test_case: TestCase {
                model: self.model,
                user_type: self.user_type,
                think_mode: self.think_mode,
                question: self.question,
                repetition: self.repetition.max(0) as u32,
            },
            success: self.success,
            response_time_secs: self.response_time,
            error: self.error,
            error_kind: self.error_kind.as_deref().and_then(ErrorKind::from_str),
            attempts: self.attempts.max(0) as u32,
            response_chars: self.response_chars.max(0) as usize,
            metadata,
            timestamp: parse_ts(&self.timestamp)?,
        })
    }
}

fn delete_execution_rows(conn: &Connection, execution_id: &str) -> Result<bool, StorageError> {
    conn.execute(
        "DELETE FROM test_results WHERE execution_id = ?1",
        params![execution_id],
    )?;
    conn.execute(
        "DELETE FROM progress_events WHERE execution_id = ?1",
        params![execution_id],
    )?;
    let removed = conn.execute(
        "DELETE FROM executions WHERE execution_id = ?1",
        params![execution_id],
    )?;
    Ok(removed > 0)
}

#[async_trait]
impl PersistenceAdapter for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), StorageError> {
        check_key(&execution.execution_id)?;
        let e = execution.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO executions ({EXECUTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    e.execution_id,
                    e.config_name,
                    e.status.as_str(),
                    ts(&e.created_at),
                    e.start_time.as_ref().map(ts),
                    e.end_time.as_ref().map(ts),
                    e.total_tests as i64,
                    e.completed_tests as i64,
                    e.failed_tests as i64,
                    e.error_message,
                    e.execution_mode.map(|m| m.as_str()),
                    e.worker_count as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, StorageError> {
        let id = execution_id.to_string();
        let row = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?1"),
                        params![id],
                        ExecutionRow::from_row,
                    )
                    .optional()?)
            })
            .await?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    async fn list_executions(&self, limit: usize) -> Result<Vec<Execution>, StorageError> {
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions ORDER BY created_at DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(params![limit as i64], ExecutionRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    async fn update_execution_progress(&self, execution: &Execution) -> Result<(), StorageError> {
        let e = execution.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE executions SET
                    status = ?2,
                    start_time = ?3,
                    end_time = ?4,
                    total_tests = ?5,
                    completed_tests = MAX(completed_tests, ?6),
                    failed_tests = MAX(failed_tests, ?7),
                    error_message = ?8,
                    execution_mode = ?9,
                    worker_count = ?10
                 WHERE execution_id = ?1",
                params![
                    e.execution_id,
                    e.status.as_str(),
                    e.start_time.as_ref().map(ts),
                    e.end_time.as_ref().map(ts),
                    e.total_tests as i64,
                    e.completed_tests as i64,
                    e.failed_tests as i64,
                    e.error_message,
                    e.execution_mode.map(|m| m.as_str()),
                    e.worker_count as i64,
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound {
                    kind: "Execution",
                    id: e.execution_id,
                });
            }
            Ok(())
        })
        .await
    }

    async fn save_test_result(&self, result: &TestResult) -> Result<bool, StorageError> {
        let r = result.clone();
        let key = result.result_key();
        let metadata = r.metadata.as_ref().map(serde_json::to_string).transpose()?;
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO test_results (
                    execution_id, result_key, batch_id, model, user_type, think_mode, question,
                    repetition, success, response_time, error, error_kind, attempts,
                    response_chars, metadata, timestamp
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    r.execution_id,
                    key,
                    r.batch_id,
                    r.test_case.model,
                    r.test_case.user_type,
                    r.test_case.think_mode,
                    r.test_case.question,
                    r.test_case.repetition as i64,
                    r.success,
                    r.response_time_secs,
                    r.error,
                    r.error_kind.map(|k| k.as_str()),
                    r.attempts as i64,
                    r.response_chars as i64,
                    metadata,
                    ts(&r.timestamp),
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn list_test_results(&self, execution_id: &str) -> Result<Vec<TestResult>, StorageError> {
        let id = execution_id.to_string();
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT execution_id, batch_id, model, user_type, think_mode, question,
                            repetition, success, response_time, error, error_kind, attempts,
                            response_chars, metadata, timestamp
                     FROM test_results WHERE execution_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(params![id], ResultRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(ResultRow::into_result).collect()
    }

    async fn save_configuration(&self, config: &TestConfiguration) -> Result<(), StorageError> {
        check_key(&config.name)?;
        let name = config.name.clone();
        let created_at = ts(&config.created_at);
        let body = serde_json::to_string(config)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO configurations (name, body, created_at) VALUES (?1, ?2, ?3)",
                params![name, body, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_configuration(
        &self,
        name: &str,
    ) -> Result<Option<TestConfiguration>, StorageError> {
        let name = name.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT body FROM configurations WHERE name = ?1",
                        params![name],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(body.as_deref().map(serde_json::from_str).transpose()?)
    }

    async fn list_configurations(&self) -> Result<Vec<TestConfiguration>, StorageError> {
        let bodies: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT body FROM configurations ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .await?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StorageError::from))
            .collect()
    }

    async fn delete_configuration(&self, name: &str) -> Result<bool, StorageError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM configurations WHERE name = ?1", params![name])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<bool, StorageError> {
        let id = execution_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = delete_execution_rows(&tx, &id)?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn save_event(&self, event: &ProgressEvent) -> Result<(), StorageError> {
        let ev = event.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO progress_events (execution_id, timestamp, kind, worker_index, message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    ev.execution_id,
                    ts(&ev.timestamp),
                    ev.kind.as_str(),
                    ev.worker_index.map(|w| w as i64),
                    ev.message,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_events(&self, execution_id: &str) -> Result<Vec<ProgressEvent>, StorageError> {
        let id = execution_id.to_string();
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT execution_id, timestamp, kind, worker_index, message
                     FROM progress_events WHERE execution_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(params![id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(execution_id, timestamp, kind, worker_index, message)| {
                Ok(ProgressEvent {
                    execution_id,
                    timestamp: parse_ts(&timestamp)?,
                    kind: EventKind::from_str(&kind)
                        .ok_or_else(|| StorageError::Corrupt(format!("event kind '{kind}'")))?,
                    worker_index: worker_index.map(|w| w.max(0) as usize),
                    message,
                })
            })
            .collect()
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff = ts(&cutoff);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let ids: Vec<String> = {
                let mut stmt =
                    tx.prepare("SELECT execution_id FROM executions WHERE created_at < ?1")?;
                let ids = stmt
                    .query_map(params![cutoff], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                ids
            };
            for id in &ids {
                delete_execution_rows(&tx, id)?;
            }
            tx.commit()?;
            Ok(ids.len())
        })
        .await
    }
}
