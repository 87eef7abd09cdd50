//! Task-status storage for pipeline jobs.
//!
//! [`TaskStore`] is the sink/source the orchestrator reports progress
//! through. Two implementations are provided:
//! - [`LibSqlTaskStore`]: libSQL-backed, persistent across restarts
//! - [`MemoryTaskStore`]: in-process, used by tests and one-shot runs
//!
//! **Cancellation rule:** `update_progress` never modifies a record whose
//! status is already `cancelled`, so a job that keeps running after a cancel
//! request stays hidden behind the cancelled status.

mod memory;
mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use clearkg_shared::{ClearKgError, PipelineRequest, Result, TaskRecord, TaskStatus};
use libsql::{Connection, Database, params};
use serde_json::Value;

pub use memory::MemoryTaskStore;

/// Task-status sink contract used by the orchestrator.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace a full record.
    async fn save(&self, record: &TaskRecord) -> Result<()>;

    /// Fetch a record by id.
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Set progress and status (and message, when given) on an existing
    /// record. Missing or cancelled records are left untouched.
    async fn update_progress(
        &self,
        task_id: &str,
        progress: f32,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<()>;

    /// Move a `pending` or `running` record to `cancelled` with `message`.
    /// Returns `false` when the record is missing or already terminal.
    async fn cancel(&self, task_id: &str, message: &str) -> Result<bool>;

    /// Move a record that is not `cancelled` to `done` at 100 with `result`.
    /// Returns `false` when the record is missing or was cancelled.
    async fn complete(&self, task_id: &str, message: &str, result: &Value) -> Result<bool>;

    /// List records, newest first, optionally filtered by status.
    async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskRecord>>;
}

/// Timestamps are stored in a fixed-width format so they sort lexically.
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Primary storage handle wrapping a libSQL database.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl LibSqlTaskStore {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ClearKgError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ClearKgError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ClearKgError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ClearKgError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }
}

const TASK_COLUMNS: &str =
    "task_id, kind, status, progress, message, request_json, result_json, created_at, updated_at";

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn save(&self, record: &TaskRecord) -> Result<()> {
        let request_json = serde_json::to_string(&record.request)
            .map_err(|e| ClearKgError::Storage(format!("encode request: {e}")))?;
        let result_json = record
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ClearKgError::Storage(format!("encode result: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO tasks (task_id, kind, status, progress, message, request_json, result_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(task_id) DO UPDATE SET
                   kind = excluded.kind,
                   status = excluded.status,
                   progress = excluded.progress,
                   message = excluded.message,
                   request_json = excluded.request_json,
                   result_json = excluded.result_json,
                   updated_at = excluded.updated_at",
                params![
                    record.task_id.as_str(),
                    record.kind.as_str(),
                    record.status.as_str(),
                    f64::from(record.progress),
                    record.message.as_deref(),
                    request_json.as_str(),
                    result_json.as_deref(),
                    timestamp(&record.created_at),
                    timestamp(&record.updated_at),
                ],
            )
            .await
            .map_err(|e| ClearKgError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id],
            )
            .await
            .map_err(|e| ClearKgError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ClearKgError::Storage(e.to_string())),
        }
    }

    async fn update_progress(
        &self,
        task_id: &str,
        progress: f32,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let now = timestamp(&Utc::now());
        self.conn
            .execute(
                "UPDATE tasks SET
                   progress = ?1,
                   status = ?2,
                   message = COALESCE(?3, message),
                   updated_at = ?4
                 WHERE task_id = ?5 AND status != 'cancelled'",
                params![
                    f64::from(progress),
                    status.as_str(),
                    message,
                    now.as_str(),
                    task_id
                ],
            )
            .await
            .map_err(|e| ClearKgError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn cancel(&self, task_id: &str, message: &str) -> Result<bool> {
        let now = timestamp(&Utc::now());
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'cancelled', message = ?1, updated_at = ?2
                 WHERE task_id = ?3 AND status IN ('pending', 'running')",
                params![message, now.as_str(), task_id],
            )
            .await
            .map_err(|e| ClearKgError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    async fn complete(&self, task_id: &str, message: &str, result: &Value) -> Result<bool> {
        let result_json = serde_json::to_string(result)
            .map_err(|e| ClearKgError::Storage(format!("encode result: {e}")))?;
        let now = timestamp(&Utc::now());
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'done', progress = 100.0, message = ?1,
                   result_json = ?2, updated_at = ?3
                 WHERE task_id = ?4 AND status != 'cancelled'",
                params![message, result_json.as_str(), now.as_str(), task_id],
            )
            .await
            .map_err(|e| ClearKgError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskRecord>> {
        let status = status.map(|s| s.as_str());
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE (?1 IS NULL OR status = ?1)
                     ORDER BY created_at DESC, task_id DESC
                     LIMIT ?2"
                ),
                params![status, limit as i64],
            )
            .await
            .map_err(|e| ClearKgError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_task(&row)?);
        }
        Ok(results)
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ClearKgError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`TaskRecord`].
fn row_to_task(row: &libsql::Row) -> Result<TaskRecord> {
    let storage_err = |e: libsql::Error| ClearKgError::Storage(e.to_string());

    let status: String = row.get(2).map_err(storage_err)?;
    let request_json: String = row.get(5).map_err(storage_err)?;
    let request: PipelineRequest = serde_json::from_str(&request_json)
        .map_err(|e| ClearKgError::Storage(format!("decode request: {e}")))?;
    let result = match row.get::<String>(6).ok() {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| ClearKgError::Storage(format!("decode result: {e}")))?,
        ),
        None => None,
    };
    let created_at: String = row.get(7).map_err(storage_err)?;
    let updated_at: String = row.get(8).map_err(storage_err)?;

    Ok(TaskRecord {
        task_id: row.get::<String>(0).map_err(storage_err)?,
        kind: row.get::<String>(1).map_err(storage_err)?,
        status: status.parse().map_err(ClearKgError::Storage)?,
        progress: row.get::<f64>(3).map_err(storage_err)? as f32,
        message: row.get::<String>(4).ok(),
        request,
        result,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
