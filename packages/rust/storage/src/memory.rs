//! In-process task store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use clearkg_shared::{Result, TaskRecord, TaskStatus};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::TaskStore;

/// Keeps task records in a mutex-guarded map. Records are lost when the
/// process exits.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    records: Mutex<HashMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save(&self, record: &TaskRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.records.lock().await.get(task_id).cloned())
    }

    async fn update_progress(
        &self,
        task_id: &str,
        progress: f32,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(task_id) else {
            return Ok(());
        };
        if record.status == TaskStatus::Cancelled {
            return Ok(());
        }
        record.progress = progress;
        record.status = status;
        if let Some(message) = message {
            record.message = Some(message.to_string());
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel(&self, task_id: &str, message: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(task_id) else {
            return Ok(false);
        };
        if !record.status.is_active() {
            return Ok(false);
        }
        record.status = TaskStatus::Cancelled;
        record.message = Some(message.to_string());
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete(&self, task_id: &str, message: &str, result: &Value) -> Result<bool> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(task_id) else {
            return Ok(false);
        };
        if record.status == TaskStatus::Cancelled {
            return Ok(false);
        }
        record.status = TaskStatus::Done;
        record.progress = 100.0;
        record.message = Some(message.to_string());
        record.result = Some(result.clone());
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskRecord>> {
        let records = self.records.lock().await;
        let mut out: Vec<TaskRecord> = records
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.task_id.cmp(&a.task_id))
        });
        out.truncate(limit);
        Ok(out)
    }
}
