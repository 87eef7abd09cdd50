//! Pipeline task records tracked by the task-status sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record kind written for knowledge-graph update jobs.
pub const UPDATE_TASK_KIND: &str = "update_content";

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for task identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new time-sortable task identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a pipeline task.
///
/// `pending → running → {done, error, cancelled}`; `cancelled` may also be
/// entered directly from `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the task can still be cancelled.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / record
// ---------------------------------------------------------------------------

/// Payload that triggers a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    /// Dataset name; falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(default, rename = "trajectoryLen", skip_serializing_if = "Option::is_none")]
    pub trajectory_len: Option<u32>,
    #[serde(default, rename = "trajectoryNum", skip_serializing_if = "Option::is_none")]
    pub trajectory_num: Option<u32>,
    /// Upstream SDKG build task this run follows (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdkg_task_id: Option<String>,
    /// Upstream imputation task this run follows (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impute_task_id: Option<String>,
    /// Suggested step ordering. Logged only; stages always run in fixed order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<String>>,
    /// Ignore the subgraph checkpoint and regenerate every subgraph.
    #[serde(default)]
    pub fresh: bool,
}

/// A persisted task-status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: TaskStatus,
    pub progress: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub request: PipelineRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh `pending` record for an update job.
    pub fn pending(task_id: &TaskId, request: PipelineRequest) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            kind: UPDATE_TASK_KIND.to_string(),
            status: TaskStatus::Pending,
            progress: 0.0,
            message: Some("content update task created".into()),
            request,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_roundtrip() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().expect("parse TaskId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn status_parse_and_activity() {
        assert_eq!("running".parse::<TaskStatus>(), Ok(TaskStatus::Running));
        assert!("paused".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Pending.is_active());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Done.is_terminal());
    }

    #[test]
    fn request_accepts_wire_names() {
        let req: PipelineRequest = serde_json::from_str(
            r#"{"dataset":"demo-us","trajectoryLen":100,"steps":["subgraph","segments"]}"#,
        )
        .expect("parse request");
        assert_eq!(req.dataset.as_deref(), Some("demo-us"));
        assert_eq!(req.trajectory_len, Some(100));
        assert_eq!(req.trajectory_num, None);
        assert!(!req.fresh);
    }

    #[test]
    fn pending_record_serializes() {
        let record = TaskRecord::pending(&TaskId::new(), PipelineRequest::default());
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["type"], UPDATE_TASK_KIND);
        assert_eq!(json["status"], "pending");
        assert_eq!(json["progress"], 0.0);
        assert!(json.get("result").is_none());
    }
}
