//! Shared types, error model, and configuration for the CLEAR
//! knowledge-graph pipeline.
//!
//! This crate is the foundation depended on by all other clearkg crates.
//! It provides:
//! - [`ClearKgError`]: the unified error type
//! - Graph types ([`Node`], [`Link`], [`GraphIndex`], [`SubgraphRecord`], [`Checkpoint`])
//! - Task types ([`TaskRecord`], [`TaskStatus`], [`PipelineRequest`])
//! - Configuration ([`AppConfig`], [`DatasetInputs`], config loading)

pub mod config;
pub mod error;
pub mod task;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DatasetConfig, DatasetInputs, DefaultsConfig, GraphConfig, PipelineConfig,
    SubgraphConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{ClearKgError, Result};
pub use task::{PipelineRequest, TaskId, TaskRecord, TaskStatus, UPDATE_TASK_KIND};
pub use types::{
    BehaviorEstimator, CatalogEntry, Checkpoint, ExplanationComposer, FailedNode, GraphIndex,
    IndexNode, Link, MethodSelector, Node, NodeKind, NodeType, RelatedNode, SegmentContext,
    SegmentDetail, SegmentRecord, SubgraphCatalog, SubgraphLink, SubgraphNode, SubgraphRecord,
    TrackPoint,
};
