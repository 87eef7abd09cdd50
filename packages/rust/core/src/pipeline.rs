//! Pipeline Orchestrator: segments → graph → subgraphs, with progress
//! reported to a [`TaskStore`].
//!
//! Each stage reports progress on its own 0–100 scale; [`StageProgress`]
//! maps it into the stage's slice of the task's overall 0–100 range.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use clearkg_shared::{
    AppConfig, ClearKgError, PipelineRequest, Result, TaskId, TaskRecord, TaskStatus,
};
use clearkg_storage::TaskStore;

use crate::artifacts::OutputLayout;
use crate::graph::{self, GraphOptions, GraphStats};
use crate::segments;
use crate::subgraph::{self, SubgraphOptions};
use crate::worker::WorkerPool;

/// Overall progress slice owned by each stage.
pub const SEGMENTS_RANGE: (f32, f32) = (0.0, 30.0);
pub const GRAPH_RANGE: (f32, f32) = (35.0, 75.0);
pub const SUBGRAPH_RANGE: (f32, f32) = (75.0, 100.0);

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// `progress` is a percentage on the caller's scale.
    fn update(&self, progress: f32, message: &str);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn update(&self, _progress: f32, _message: &str) {}
}

/// Maps a stage's local 0–100 progress into `[start, end]` of its parent.
pub struct StageProgress<'a> {
    inner: &'a dyn ProgressReporter,
    start: f32,
    end: f32,
}

impl<'a> StageProgress<'a> {
    pub fn new(inner: &'a dyn ProgressReporter, (start, end): (f32, f32)) -> Self {
        Self { inner, start, end }
    }
}

impl ProgressReporter for StageProgress<'_> {
    fn update(&self, progress: f32, message: &str) {
        let local = progress.clamp(0.0, 100.0) / 100.0;
        self.inner
            .update(self.start + local * (self.end - self.start), message);
    }
}

/// Outcome of one successful stage.
#[derive(Debug, Clone)]
pub struct StageReport {
    /// Human-readable summary.
    pub message: String,
    /// Files and directories the stage wrote.
    pub outputs: Vec<PathBuf>,
    /// Graph statistics (Graph Assembler only).
    pub stats: Option<GraphStats>,
}

/// Result of a full pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub dataset: String,
    pub stages: Vec<StageReport>,
    pub output_files: Vec<String>,
    pub stats: Option<GraphStats>,
}

// ---------------------------------------------------------------------------
// Stage sequencing
// ---------------------------------------------------------------------------

/// Run the three stages in fixed order, stopping at the first failure.
///
/// `request.steps` is logged but never reorders the stages.
#[instrument(skip_all, fields(dataset = tracing::field::Empty))]
pub fn run_stages(
    config: &AppConfig,
    request: &PipelineRequest,
    progress: &dyn ProgressReporter,
    cancel: &AtomicBool,
) -> Result<PipelineOutcome> {
    let dataset = request
        .dataset
        .clone()
        .unwrap_or_else(|| config.defaults.dataset.clone());
    tracing::Span::current().record("dataset", dataset.as_str());

    if let Some(steps) = &request.steps {
        info!(?steps, "requested step order ignored, stages run in fixed order");
    }

    progress.update(0.0, "start CLEAR content update");

    let inputs = config.resolve_inputs(&dataset, request.trajectory_len, request.trajectory_num)?;
    let layout = OutputLayout::new(&inputs.output_dir);

    let segments = segments::extract_segments(
        &inputs.points,
        &inputs.knowledge_units,
        &layout,
        &StageProgress::new(progress, SEGMENTS_RANGE),
    )
    .map_err(|e| e.in_stage("CSV conversion failed"))?;
    info!(message = %segments.message, "segment stage done");

    let graph_opts = GraphOptions {
        dedupe_links: config.graph.dedupe_links,
        max_related: config.graph.max_related,
    };
    let graph = graph::assemble_graph(
        &inputs,
        &layout,
        &graph_opts,
        &StageProgress::new(progress, GRAPH_RANGE),
    )
    .map_err(|e| e.in_stage("SDKG conversion failed"))?;
    info!(message = %graph.message, "graph stage done");

    let subgraph_opts = SubgraphOptions {
        max_level: config.subgraph.max_level,
        resume: config.subgraph.resume && !request.fresh,
        cooperative_cancellation: config.pipeline.cooperative_cancellation,
    };
    let subgraphs = subgraph::precompute_subgraphs(
        &layout,
        &subgraph_opts,
        &StageProgress::new(progress, SUBGRAPH_RANGE),
        cancel,
    )
    .map_err(|e| e.in_stage("Subgraph generation failed"))?;
    info!(message = %subgraphs.message, "subgraph stage done");

    let stats = graph.stats.clone();
    Ok(PipelineOutcome {
        dataset,
        stages: vec![segments, graph, subgraphs],
        output_files: layout.output_files(),
        stats,
    })
}

// ---------------------------------------------------------------------------
// Task-store progress
// ---------------------------------------------------------------------------

/// Writes progress to the task store from a blocking worker thread.
///
/// Progress is clamped so it never decreases. Store failures are logged and
/// do not interrupt the job.
pub struct StoreProgress {
    store: Arc<dyn TaskStore>,
    runtime: Handle,
    task_id: String,
    last: Mutex<f32>,
}

impl StoreProgress {
    pub fn new(store: Arc<dyn TaskStore>, runtime: Handle, task_id: impl Into<String>) -> Self {
        Self {
            store,
            runtime,
            task_id: task_id.into(),
            last: Mutex::new(0.0),
        }
    }

    /// Last progress value written.
    pub fn current(&self) -> f32 {
        self.last.lock().map(|p| *p).unwrap_or(0.0)
    }

    fn write(&self, progress: f32, status: TaskStatus, message: &str) {
        let result = self.runtime.block_on(self.store.update_progress(
            &self.task_id,
            progress,
            status,
            Some(message),
        ));
        if let Err(e) = result {
            warn!(task_id = %self.task_id, error = %e, "failed to record progress");
        }
    }

    /// Mark the task failed, keeping its last progress.
    pub fn fail(&self, message: &str) {
        self.write(self.current(), TaskStatus::Error, message);
    }

    /// [`fail`](Self::fail) for async callers.
    pub async fn record_failure(&self, message: &str) {
        let result = self
            .store
            .update_progress(&self.task_id, self.current(), TaskStatus::Error, Some(message))
            .await;
        if let Err(e) = result {
            warn!(task_id = %self.task_id, error = %e, "failed to record failure");
        }
    }
}

impl ProgressReporter for StoreProgress {
    fn update(&self, progress: f32, message: &str) {
        let progress = {
            let Ok(mut last) = self.last.lock() else {
                return;
            };
            *last = last.max(progress.clamp(0.0, 100.0));
            *last
        };
        self.write(progress, TaskStatus::Running, message);
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

type CancelFlags = Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>;

/// Accepts pipeline requests and runs them as background jobs.
pub struct Pipeline {
    config: Arc<AppConfig>,
    store: Arc<dyn TaskStore>,
    workers: WorkerPool,
    cancels: CancelFlags,
}

impl Pipeline {
    pub fn new(config: AppConfig, store: Arc<dyn TaskStore>) -> Self {
        let workers = WorkerPool::new(config.pipeline.max_workers);
        Self {
            config: Arc::new(config),
            store,
            workers,
            cancels: Arc::default(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Save a `pending` record and dispatch the job.
    ///
    /// The returned handle resolves when the job finishes; drop it to run
    /// fire-and-forget. A panicking job leaves the task in `error`.
    pub async fn submit(&self, request: PipelineRequest) -> Result<(TaskRecord, JoinHandle<()>)> {
        let task_id = TaskId::new();
        let record = TaskRecord::pending(&task_id, request.clone());
        self.store.save(&record).await?;

        let flag = Arc::new(AtomicBool::new(false));
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.insert(record.task_id.clone(), flag.clone());
        }

        let runtime = Handle::current();
        let progress = Arc::new(StoreProgress::new(
            self.store.clone(),
            runtime.clone(),
            &record.task_id,
        ));
        let job = Job {
            task_id: record.task_id.clone(),
            request,
            config: self.config.clone(),
            store: self.store.clone(),
            runtime,
            cancel: flag,
            progress: progress.clone(),
        };
        info!(task_id = %record.task_id, "pipeline task submitted");
        let worker = self.workers.spawn(move || job.run());

        let task_id = record.task_id.clone();
        let cancels = self.cancels.clone();
        let handle = tokio::spawn(async move {
            let failure = match worker.await {
                Ok(Ok(())) => None,
                Ok(Err(reason)) => Some(reason),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                error!(task_id = %task_id, %reason, "pipeline panicked");
                progress.record_failure(&format!("update failed: {reason}")).await;
            }
            if let Ok(mut cancels) = cancels.lock() {
                cancels.remove(&task_id);
            }
        });

        Ok((record, handle))
    }

    /// Mark a pending or running task cancelled and raise its cancel flag.
    /// Tasks in a terminal state are returned unchanged.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskRecord> {
        let changed = self.store.cancel(task_id, "task cancelled").await?;
        let record = self.status(task_id).await?;
        if !changed {
            return Ok(record);
        }

        if let Ok(cancels) = self.cancels.lock() {
            if let Some(flag) = cancels.get(task_id) {
                flag.store(true, Ordering::Relaxed);
            }
        }
        info!(task_id, "task marked as cancelled");
        Ok(record)
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskRecord> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| ClearKgError::TaskNotFound(task_id.to_string()))
    }

    pub async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskRecord>> {
        self.store.list(status, limit).await
    }
}

const COMPLETED_MESSAGE: &str = "CLEAR content update completed";

/// Everything one background job owns.
struct Job {
    task_id: String,
    request: PipelineRequest,
    config: Arc<AppConfig>,
    store: Arc<dyn TaskStore>,
    runtime: Handle,
    cancel: Arc<AtomicBool>,
    progress: Arc<StoreProgress>,
}

impl Job {
    fn run(self) {
        let progress: &StoreProgress = &self.progress;
        match run_stages(&self.config, &self.request, progress, &self.cancel) {
            Ok(outcome) => self.complete(outcome),
            Err(ClearKgError::Cancelled) => {
                info!(task_id = %self.task_id, "pipeline stopped after cancellation");
            }
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "pipeline failed");
                progress.fail(&e.to_string());
            }
        }
    }

    /// Record the result unless the task was cancelled meanwhile.
    fn complete(&self, outcome: PipelineOutcome) {
        let result = json!({
            "status": "success",
            "message": COMPLETED_MESSAGE,
            "output_files": outcome.output_files,
            "stats": outcome.stats,
            "stages": outcome.stages.iter().map(|s| s.message.as_str()).collect::<Vec<_>>(),
        });
        let recorded = self
            .runtime
            .block_on(self.store.complete(&self.task_id, COMPLETED_MESSAGE, &result));

        match recorded {
            Ok(true) => info!(task_id = %self.task_id, dataset = %outcome.dataset, "pipeline complete"),
            Ok(false) => info!(task_id = %self.task_id, "task cancelled, result not recorded"),
            Err(e) => warn!(task_id = %self.task_id, error = %e, "failed to record result"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use clearkg_storage::MemoryTaskStore;

    /// Collects every update for inspection.
    #[derive(Default)]
    struct Recording(Mutex<Vec<(f32, String)>>);

    impl ProgressReporter for Recording {
        fn update(&self, progress: f32, message: &str) {
            self.0.lock().unwrap().push((progress, message.to_string()));
        }
    }

    #[test]
    fn stage_progress_maps_into_range() {
        let rec = Recording::default();
        let stage = StageProgress::new(&rec, GRAPH_RANGE);
        stage.update(0.0, "a");
        stage.update(12.5, "b");
        stage.update(100.0, "c");
        stage.update(250.0, "d");
        let values: Vec<f32> = rec.0.lock().unwrap().iter().map(|(p, _)| *p).collect();
        assert_eq!(values, vec![35.0, 40.0, 75.0, 75.0]);
    }

    #[test]
    fn stages_run_in_order_with_monotonic_progress() {
        let (tmp, config) = test_support::dataset_config();
        let rec = Recording::default();
        let request = PipelineRequest {
            steps: Some(vec!["subgraph".into(), "segments".into()]),
            ..Default::default()
        };

        let outcome = run_stages(&config, &request, &rec, &AtomicBool::new(false)).unwrap();
        assert_eq!(outcome.stages.len(), 3);
        assert_eq!(outcome.stages[0].message, "Conversion Complete: 1 segments");
        assert_eq!(outcome.stats.as_ref().unwrap().total_nodes, 7);

        let updates = rec.0.lock().unwrap();
        assert!(updates.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(updates.first().unwrap().1, "start CLEAR content update");
        assert_eq!(updates.last().unwrap().0, 100.0);
        let graph_start = updates
            .iter()
            .find(|(_, m)| m == "Start converting SDKG to knowledge graph")
            .unwrap();
        assert_eq!(graph_start.0, 35.0);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn failing_stage_stops_later_stages() {
        let (tmp, config) = test_support::dataset_config();
        let inputs = config.resolve_inputs("fixture", None, None).unwrap();
        std::fs::remove_file(&inputs.behavior_graph).unwrap();

        let err = run_stages(&config, &PipelineRequest::default(), &SilentProgress, &AtomicBool::new(false))
            .unwrap_err();
        assert!(err.to_string().contains("SDKG conversion failed"));
        let layout = OutputLayout::new(&inputs.output_dir);
        assert!(layout.segments_file().exists());
        assert!(!layout.catalog_file().exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submitted_job_finishes_done() {
        let (tmp, config) = test_support::dataset_config();
        let store = Arc::new(MemoryTaskStore::new());
        let pipeline = Pipeline::new(config, store.clone());

        let (record, handle) = pipeline.submit(PipelineRequest::default()).await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        handle.await.unwrap();

        let done = pipeline.status(&record.task_id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.progress, 100.0);
        let result = done.result.unwrap();
        assert_eq!(result["status"], "success");
        assert_eq!(result["output_files"].as_array().unwrap().len(), 4);
        assert_eq!(result["stats"]["total_links"], 10);

        let listed = pipeline.list(Some(TaskStatus::Done), 10).await.unwrap();
        assert_eq!(listed.len(), 1);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_job_keeps_progress_and_reports_error() {
        let (tmp, mut config) = test_support::dataset_config();
        config.defaults.dataset = "nope".into();
        let pipeline = Pipeline::new(config, Arc::new(MemoryTaskStore::new()));

        let (record, handle) = pipeline.submit(PipelineRequest::default()).await.unwrap();
        handle.await.unwrap();

        let failed = pipeline.status(&record.task_id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(failed.progress, 0.0);
        assert!(failed.message.unwrap().contains("unknown dataset: nope"));
        assert!(failed.result.is_none());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_hides_further_progress() {
        let store = Arc::new(MemoryTaskStore::new());
        let pipeline = Pipeline::new(AppConfig::default(), store.clone());

        let pending = TaskRecord::pending(&TaskId::new(), PipelineRequest::default());
        store.save(&pending).await.unwrap();

        let cancelled = pipeline.cancel(&pending.task_id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let progress = StoreProgress::new(store.clone(), Handle::current(), &pending.task_id);
        tokio::task::spawn_blocking(move || progress.update(50.0, "still running"))
            .await
            .unwrap();
        let after = pipeline.status(&pending.task_id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Cancelled);
        assert_eq!(after.progress, 0.0);

        // Terminal records stay as they are.
        let again = pipeline.cancel(&pending.task_id).await.unwrap();
        assert_eq!(again.message.as_deref(), Some("task cancelled"));

        let err = pipeline.cancel("missing").await.unwrap_err();
        assert!(matches!(err, ClearKgError::TaskNotFound(_)));
    }

    /// How [`Interfering`] disturbs the job.
    enum Interference {
        /// Cancel the task right before the job records `done`.
        CancelBeforeDone,
        /// Panic on the first `running` update.
        PanicOnRunning,
    }

    /// Wraps a store and disturbs the job once.
    struct Interfering {
        inner: MemoryTaskStore,
        mode: Interference,
        fired: AtomicBool,
    }

    impl Interfering {
        fn new(mode: Interference) -> Self {
            Self {
                inner: MemoryTaskStore::new(),
                mode,
                fired: AtomicBool::new(false),
            }
        }

        fn fire(&self) -> bool {
            !self.fired.swap(true, Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TaskStore for Interfering {
        async fn save(&self, record: &TaskRecord) -> Result<()> {
            self.inner.save(record).await
        }

        async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
            self.inner.get(task_id).await
        }

        async fn update_progress(
            &self,
            task_id: &str,
            progress: f32,
            status: TaskStatus,
            message: Option<&str>,
        ) -> Result<()> {
            if matches!(self.mode, Interference::PanicOnRunning)
                && status == TaskStatus::Running
                && self.fire()
            {
                panic!("store unavailable");
            }
            self.inner.update_progress(task_id, progress, status, message).await
        }

        async fn cancel(&self, task_id: &str, message: &str) -> Result<bool> {
            self.inner.cancel(task_id, message).await
        }

        async fn complete(&self, task_id: &str, message: &str, result: &serde_json::Value) -> Result<bool> {
            if matches!(self.mode, Interference::CancelBeforeDone) && self.fire() {
                assert!(self.inner.cancel(task_id, "task cancelled").await?);
            }
            self.inner.complete(task_id, message, result).await
        }

        async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskRecord>> {
            self.inner.list(status, limit).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_racing_completion_wins() {
        let (tmp, config) = test_support::dataset_config();
        let store = Arc::new(Interfering::new(Interference::CancelBeforeDone));
        let pipeline = Pipeline::new(config, store.clone());

        let (record, handle) = pipeline.submit(PipelineRequest::default()).await.unwrap();
        handle.await.unwrap();

        let finished = pipeline.status(&record.task_id).await.unwrap();
        assert!(store.fired.load(Ordering::SeqCst));
        assert_eq!(finished.status, TaskStatus::Cancelled);
        assert_eq!(finished.message.as_deref(), Some("task cancelled"));
        assert!(finished.result.is_none());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_leaves_failed_task_alone() {
        let store = Arc::new(MemoryTaskStore::new());
        let pipeline = Pipeline::new(AppConfig::default(), store.clone());
        let record = TaskRecord::pending(&TaskId::new(), PipelineRequest::default());
        store.save(&record).await.unwrap();
        store
            .update_progress(&record.task_id, 40.0, TaskStatus::Error, Some("boom"))
            .await
            .unwrap();

        let after = pipeline.cancel(&record.task_id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Error);
        assert_eq!(after.message.as_deref(), Some("boom"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_job_is_recorded_as_error() {
        let (tmp, config) = test_support::dataset_config();
        let store = Arc::new(Interfering::new(Interference::PanicOnRunning));
        let pipeline = Pipeline::new(config, store.clone());

        let (record, handle) = pipeline.submit(PipelineRequest::default()).await.unwrap();
        handle.await.unwrap();

        let failed = pipeline.status(&record.task_id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(failed.message.as_deref(), Some("update failed: store unavailable"));
        assert!(failed.result.is_none());
        assert!(pipeline.cancels.lock().unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn store_progress_never_decreases() {
        let store = Arc::new(MemoryTaskStore::new());
        let record = TaskRecord::pending(&TaskId::new(), PipelineRequest::default());
        store.save(&record).await.unwrap();

        let progress = StoreProgress::new(store.clone(), Handle::current(), &record.task_id);
        tokio::task::spawn_blocking(move || {
            progress.update(40.0, "forward");
            progress.update(20.0, "backward");
            progress.fail("boom");
        })
        .await
        .unwrap();

        let found = store.get(&record.task_id).await.unwrap().unwrap();
        assert_eq!(found.progress, 40.0);
        assert_eq!(found.status, TaskStatus::Error);
        assert_eq!(found.message.as_deref(), Some("boom"));
    }
}
